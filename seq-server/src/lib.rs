//! # chatseq-server
//!
//! Server side of chatseq: per-chat message sequencing, fan-out and the
//! endpoints clients recover through.
//!
//! This crate implements a server that:
//! - Assigns every committed message a strictly increasing `seq_num` per chat
//! - Publishes each committed message to its `chat:` and `user:` channels
//! - Keeps bounded per-channel history so reconnecting clients can replay
//! - Serves cursor-based catch-up pages when replay is not enough
//!
//! ## Architecture
//!
//! ```text
//!  POST /chats/{id}/messages       GET /chats/{id}/messages/sync
//!            │                                  ▲
//!        ┌───▼──────────────────────────────────┴───┐
//!        │               ChatServer                 │
//!        │  ┌──────────────────┐   ┌─────────────┐  │
//!        │  │ SQLite (seq,     │──►│ Publisher   │  │
//!        │  │ messages)        │   │ (queue)     │  │
//!        │  └──────────────────┘   └──────┬──────┘  │
//!        │                         ┌──────▼──────┐  │
//!        │                         │ MemoryBroker│  │
//!        │                         │ (history)   │  │
//!        │                         └──────┬──────┘  │
//!        └────────────────────────────────┼─────────┘
//!                                         ▼
//!                                GET /ws (subscribe,
//!                                replay, live)
//! ```
//!
//! The store is the single source of truth. Publishing and broker history
//! are best-effort: a client that misses a publication finds it through the
//! sync endpoint.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod broker;
pub mod config;
pub mod error;
pub mod http;
pub mod limits;
pub mod publisher;
pub mod server;
pub mod storage;
pub mod sweeper;

pub use config::Config;
pub use error::{ApiError, ServerError, StorageError};
pub use server::{ChatServer, ServerMetrics};
