//! Show persisted cursors.

use anyhow::Result;
use seq_client::{ChatClient, ClientConfig};

/// Run the cursor command.
pub async fn run(config: ClientConfig) -> Result<()> {
    let dir = config.cursor_dir.clone();
    let client = ChatClient::open(config).await?;
    let cursors = client.cursors().await?;

    println!("Device: {}", client.device_id());
    println!("Store:  {}", dir.display());
    println!();

    if cursors.is_empty() {
        println!("No cursors yet. Run 'chatseq watch' or 'chatseq sync <chat>'.");
        return Ok(());
    }
    for (chat, seq) in cursors {
        println!("  {chat}  {seq}");
    }
    Ok(())
}
