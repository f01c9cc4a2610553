//! Sequence store for chatseq-server.
//!
//! Durable messages per chat, with `seq_num` assigned in the same transaction
//! as the insert, plus the participant table the endpoints authorize against.

mod sqlite;

pub use sqlite::SqliteStore;

use crate::error::StorageError;
use async_trait::async_trait;
use seq_types::{ChatId, ChatMessage, MessageId, SeqNum, UserId};

/// Request to append a message.
#[derive(Debug, Clone)]
pub struct AppendRequest {
    /// Stable id; re-appending it returns the original commit.
    pub id: MessageId,
    /// Target chat.
    pub chat_id: ChatId,
    /// Author.
    pub sender_id: UserId,
    /// Message body.
    pub content: String,
    /// Commit time (unix milliseconds).
    pub created_at: i64,
}

/// Result of an append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    /// A new `seq_num` was assigned and the message committed.
    Committed(ChatMessage),
    /// The id was already committed to this chat; nothing changed.
    Existing(ChatMessage),
}

impl AppendOutcome {
    /// The committed message either way.
    pub fn message(&self) -> &ChatMessage {
        match self {
            Self::Committed(m) | Self::Existing(m) => m,
        }
    }

    /// Whether this call created the message.
    pub fn is_new(&self) -> bool {
        matches!(self, Self::Committed(_))
    }
}

/// Trait for sequence store backends.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Commit a message and assign it the next `seq_num` of its chat.
    ///
    /// Assignment and insert are one transaction: a failed append consumes
    /// no number, and concurrent appends to one chat never share a number.
    async fn append(&self, req: AppendRequest) -> Result<AppendOutcome, StorageError>;

    /// Messages of a chat with `seq_num > after`, ascending, at most `limit`.
    ///
    /// Pure read; safe to repeat.
    async fn messages_after(
        &self,
        chat_id: &ChatId,
        after: SeqNum,
        limit: u32,
    ) -> Result<Vec<ChatMessage>, StorageError>;

    /// Add a participant. Returns false if already present.
    async fn add_participant(&self, chat_id: &ChatId, user_id: &UserId) -> Result<bool, StorageError>;

    /// Whether a user participates in a chat.
    async fn is_participant(&self, chat_id: &ChatId, user_id: &UserId) -> Result<bool, StorageError>;

    /// All participants of a chat.
    async fn participants(&self, chat_id: &ChatId) -> Result<Vec<UserId>, StorageError>;

    /// Cheap round trip to the backing database.
    async fn ping(&self) -> Result<(), StorageError>;
}
