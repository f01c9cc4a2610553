//! One-shot catch-up of a chat.

use anyhow::{Context, Result};
use seq_client::{ChatClient, ClientConfig};
use seq_types::ChatId;

/// Run the sync command.
pub async fn run(config: ClientConfig, chat: &ChatId) -> Result<()> {
    let client = ChatClient::open(config).await?;
    let applied = client
        .sync_chat(chat)
        .await
        .with_context(|| format!("Failed to sync chat {chat}"))?;

    for message in &applied {
        println!("#{} {}: {}", message.seq_num, message.sender_id, message.content);
    }

    let cursor = client.merger().cursor(chat).await?;
    println!();
    println!("{} new message(s), cursor at {}", applied.len(), cursor);
    Ok(())
}
