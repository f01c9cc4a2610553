//! # seq-types
//!
//! Wire format and identity types for chatseq message sequencing.
//!
//! This crate provides the foundational types used across all chatseq crates:
//! - [`ChatId`], [`UserId`], [`DeviceId`], [`MessageId`], [`SeqNum`] - Identity and ordering types
//! - [`Channel`] - Broker channel naming (`chat:{id}`, `user:{id}`)
//! - [`ChatMessage`], [`SyncPage`], [`Publication`] - REST and broker payloads
//! - [`ClientFrame`], [`ServerFrame`] - Broker WebSocket frames
//! - [`SeqError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod channel;
mod error;
mod ids;
mod messages;

pub use channel::Channel;
pub use error::SeqError;
pub use ids::{ChatId, DeviceId, MessageId, SeqNum, UserId};
pub use messages::{
    ChatMessage, ClientFrame, EventKind, NewMessage, Publication, ServerFrame, SubscribeAck,
    SubscribeRequest, SyncPage, DEFAULT_SYNC_LIMIT, MAX_SYNC_LIMIT,
};
