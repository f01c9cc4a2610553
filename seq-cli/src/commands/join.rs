//! Join a chat through the participant hook.

use anyhow::{Context, Result};
use seq_client::{ClientConfig, HttpChatApi};
use seq_types::ChatId;

/// Run the join command.
pub async fn run(config: ClientConfig, chat: &ChatId) -> Result<()> {
    let api = HttpChatApi::new(config.server_url, config.user_id);
    api.add_participant(chat, &api.user_id())
        .await
        .context("Failed to join chat")?;

    println!("joined {chat} as {}", api.user_id());
    Ok(())
}
