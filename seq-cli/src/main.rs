//! # chatseq
//!
//! Command-line client for chatseq.
//!
//! ## Commands
//!
//! - `send`: Append a message to a chat
//! - `sync`: One-shot catch-up of a chat through the sync endpoint
//! - `watch`: Stay subscribed and print messages as they are applied
//! - `cursor`: Show this device's persisted cursors
//! - `join`: Add yourself to a chat
//!
//! ## Example
//!
//! ```bash
//! # Join a chat and post to it
//! chatseq --server http://localhost:8080 --user $ME join $CHAT
//! chatseq --server http://localhost:8080 --user $ME send $CHAT "hello"
//!
//! # Follow chats listed in chatseq.toml until Ctrl-C
//! chatseq watch
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use seq_client::ClientConfig;
use seq_types::{ChatId, UserId};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{cursor, join, send, sync, watch};

/// Command-line client for chatseq.
#[derive(Parser, Debug)]
#[command(name = "chatseq")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Client configuration file
    #[arg(long, short, global = true, default_value = "chatseq.toml")]
    config: PathBuf,

    /// Server URL, overriding the config file
    #[arg(long, global = true)]
    server: Option<String>,

    /// Caller identity, overriding the config file
    #[arg(long, global = true)]
    user: Option<UserId>,

    /// Directory for cursor files, overriding the config file
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Append a message to a chat
    Send {
        /// Chat to post to
        chat: ChatId,

        /// Message text
        text: String,
    },

    /// Catch a chat up through the sync endpoint and print new messages
    Sync {
        /// Chat to sync
        chat: ChatId,
    },

    /// Stay subscribed and print messages until Ctrl-C
    Watch {
        /// Chats to follow (default: the chats in the config file)
        chats: Vec<ChatId>,

        /// Also print user-channel notifications
        #[arg(long)]
        notifications: bool,
    },

    /// Show persisted cursors of this device
    Cursor,

    /// Add yourself to a chat
    Join {
        /// Chat to join
        chat: ChatId,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Send { chat, text } => send::run(config, &chat, &text).await?,
        Commands::Sync { chat } => sync::run(config, &chat).await?,
        Commands::Watch { chats, notifications } => {
            watch::run(config, chats, notifications).await?;
        }
        Commands::Cursor => cursor::run(config).await?,
        Commands::Join { chat } => join::run(config, &chat).await?,
    }

    Ok(())
}

/// Config file values, with command-line overrides applied.
///
/// Without a config file both `--server` and `--user` are required.
fn load_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = if cli.config.exists() {
        ClientConfig::from_file(&cli.config)
            .with_context(|| format!("Failed to load {}", cli.config.display()))?
    } else {
        let server = cli
            .server
            .clone()
            .context("No config file found; pass --server and --user")?;
        let user = cli.user.context("No config file found; pass --user")?;
        ClientConfig::new(server, user)
    };

    if let Some(server) = &cli.server {
        config.server_url = server.clone();
    }
    if let Some(user) = cli.user {
        config.user_id = user;
    }
    if let Some(dir) = &cli.data_dir {
        config.cursor_dir = dir.clone();
    }
    config.validate()?;
    Ok(config)
}
