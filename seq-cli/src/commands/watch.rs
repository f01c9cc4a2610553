//! Follow chats live until Ctrl-C.

use anyhow::{bail, Result};
use seq_client::{ChatClient, ClientConfig, WsTransport};
use seq_core::{CoordinatorEvent, RecoveryOutcome};
use seq_types::ChatId;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

/// Run the watch command.
pub async fn run(mut config: ClientConfig, chats: Vec<ChatId>, notifications: bool) -> Result<()> {
    if !chats.is_empty() {
        config.chats = chats;
    }
    config.notifications |= notifications;
    if config.chats.is_empty() && !config.notifications {
        bail!("Nothing to watch: pass chat ids or list them under `chats` in the config file");
    }

    let client = ChatClient::open(config).await?;
    let mut applied = client.merger().subscribe();
    let coordinator = client.watch(Arc::new(WsTransport::new()));
    let mut events = coordinator.events();
    let mut notices = coordinator.notifications();

    println!(
        "Watching {} chat(s) as device {}. Ctrl-C to stop.",
        client.config().chats.len(),
        client.device_id()
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            message = applied.recv() => match message {
                Ok(m) => println!("[{}] #{} {}: {}", m.chat_id, m.seq_num, m.sender_id, m.content),
                Err(RecvError::Lagged(n)) => println!("(skipped {n} messages in the display)"),
                Err(RecvError::Closed) => break,
            },
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            notice = notices.recv(), if client.config().notifications => {
                if let Ok(p) = notice {
                    println!("(notification) chat {} has #{}", p.chat_id, p.seq_num);
                }
            }
        }
    }

    coordinator.shutdown().await?;
    for (chat, seq) in client.cursors().await? {
        println!("cursor {chat} at {seq}");
    }
    Ok(())
}

fn print_event(event: &CoordinatorEvent) {
    match event {
        CoordinatorEvent::Connected => println!("-- connected"),
        CoordinatorEvent::Subscribed => println!("-- live"),
        CoordinatorEvent::Recovery { session } => {
            let verdict = match session.outcome {
                RecoveryOutcome::RecoveredViaBroker => format!("recovered {} from broker", session.replayed),
                RecoveryOutcome::BrokerRecoveryFailed => "history gone, syncing".to_string(),
                RecoveryOutcome::NotApplicable => "new subscription".to_string(),
            };
            println!("-- {}: {verdict}", session.chat_id);
        }
        CoordinatorEvent::ConnectionFailed { attempt, error } => {
            println!("-- connection failed (attempt {attempt}): {error}")
        }
        CoordinatorEvent::Disconnected { reason } => println!("-- disconnected: {reason}"),
        CoordinatorEvent::GaveUp { attempts } => println!("-- gave up after {attempts} attempts"),
        CoordinatorEvent::FallbackAbandoned { chat_id, error } => {
            println!("-- {chat_id} may be out of sync: {error}")
        }
    }
}
