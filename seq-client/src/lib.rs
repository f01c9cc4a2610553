//! # chatseq-client
//!
//! Client library for chatseq: keeps a device's copy of its chats complete
//! and free of duplicates across disconnects.
//!
//! ## Features
//!
//! - **Recovery Coordinator**: reconnects with capped exponential backoff,
//!   resumes broker subscriptions from the persisted cursor and falls back to
//!   the sync endpoint when the broker cannot replay.
//! - **Cursor Store**: per-device, per-chat high-water marks, written
//!   durably before a message counts as applied.
//! - **Merge/Dedup**: every delivery path (live, replay, fallback, gap fill)
//!   goes through one layer that applies each message at most once.
//! - **Transport Abstraction**: WebSocket broker transport plus a mock for
//!   tests.
//!
//! ## Example
//!
//! ```ignore
//! use chatseq_client::{ChatClient, ClientConfig, WsTransport};
//!
//! let client = ChatClient::open(ClientConfig::from_file(path)?).await?;
//! let coordinator = client.watch(Arc::new(WsTransport::new()));
//!
//! let mut applied = client.merger().subscribe();
//! while let Ok(message) = applied.recv().await {
//!     println!("{}: {}", message.seq_num, message.content);
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod cursor_store;
pub mod merge;
pub mod transport;

pub use api::{ApiClientError, ChatApi, HttpChatApi, MemoryChatApi, CALLER_HEADER};
pub use client::{ChatClient, ClientError};
pub use config::{ClientConfig, ConfigError, RetryConfig};
pub use coordinator::{CoordinatorError, CoordinatorHandle, CoordinatorSettings, RecoveryCoordinator};
pub use cursor_store::{CursorStore, CursorStoreError, FileCursorStore, MemoryCursorStore};
pub use merge::Merger;
pub use transport::{BrokerTransport, MockTransport, TransportError, WsTransport};
