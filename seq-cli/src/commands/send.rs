//! Append a message.

use anyhow::{Context, Result};
use seq_client::{ChatClient, ClientConfig};
use seq_types::ChatId;

/// Run the send command.
pub async fn run(config: ClientConfig, chat: &ChatId, text: &str) -> Result<()> {
    let client = ChatClient::open(config).await?;
    let message = client
        .send(chat, text)
        .await
        .context("Failed to send message")?;

    println!("sent #{} ({})", message.seq_num, message.id);
    Ok(())
}
