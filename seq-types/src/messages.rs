//! Wire messages for chatseq.
//!
//! REST bodies ([`ChatMessage`], [`NewMessage`], [`SyncPage`]), broker
//! publications ([`Publication`]) and the WebSocket frames that carry
//! subscriptions ([`ClientFrame`], [`ServerFrame`]). Everything is JSON.

use serde::{Deserialize, Serialize};

use crate::{Channel, ChatId, MessageId, SeqError, SeqNum, UserId};

/// Page size used by the sync endpoint when the caller gives none.
pub const DEFAULT_SYNC_LIMIT: u32 = 100;

/// Largest page the sync endpoint will return.
pub const MAX_SYNC_LIMIT: u32 = 1000;

/// A committed chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Stable unique identifier.
    pub id: MessageId,
    /// Chat this message belongs to.
    pub chat_id: ChatId,
    /// Store-assigned ordinal, strictly increasing per chat.
    pub seq_num: SeqNum,
    /// Author.
    pub sender_id: UserId,
    /// Message body.
    pub content: String,
    /// Commit time (unix milliseconds).
    pub created_at: i64,
    /// Last edit time (unix milliseconds), if ever edited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
    /// Soft-delete flag.
    #[serde(default)]
    pub deleted: bool,
}

/// Body of an append request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    /// Client-chosen id; re-sending the same id returns the original commit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    /// Message body.
    pub content: String,
}

impl NewMessage {
    /// A new message with a freshly generated id.
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            id: Some(MessageId::new()),
            content: content.into(),
        }
    }
}

/// Response of the cursor-based sync endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncPage {
    /// Messages with `seq_num > after_seq`, ascending.
    pub messages: Vec<ChatMessage>,
    /// Whether another page is available after this one.
    pub has_more: bool,
}

/// Kind of event carried by a publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A message was committed to the sequence store.
    MessageCreated,
}

/// One broker publication per committed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publication {
    /// Event discriminator.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Chat the event belongs to.
    pub chat_id: ChatId,
    /// Ordinal of the message inside its chat.
    pub seq_num: SeqNum,
    /// The committed message.
    pub data: ChatMessage,
}

impl Publication {
    /// Wrap a freshly committed message.
    pub fn message_created(message: ChatMessage) -> Self {
        Self {
            kind: EventKind::MessageCreated,
            chat_id: message.chat_id,
            seq_num: message.seq_num,
            data: message,
        }
    }
}

/// A single channel subscription inside a subscribe frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    /// Channel to join.
    pub channel: Channel,
    /// Resume position: replay everything published after it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    /// Ask the broker to replay from `offset`.
    #[serde(default)]
    pub recover: bool,
}

/// Broker answer for one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeAck {
    /// Channel this answer is about.
    pub channel: Channel,
    /// Whether the requested replay was fully covered by broker history.
    pub recovered: bool,
    /// Number of replayed publications that follow this ack on the stream.
    pub replayed: u32,
    /// Highest position the channel has published so far.
    pub head: u64,
    /// Set when the subscription was refused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Frames sent by the client over the broker WebSocket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Join one or more channels.
    Subscribe {
        /// Requested subscriptions.
        subscriptions: Vec<SubscribeRequest>,
    },
    /// Keepalive.
    Ping,
}

/// Frames sent by the server over the broker WebSocket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Answer to a subscribe frame, one ack per requested channel.
    SubscribeAck {
        /// Per-channel answers.
        acks: Vec<SubscribeAck>,
    },
    /// A replayed or live publication.
    Publication {
        /// Channel it was published on.
        channel: Channel,
        /// Broker position on that channel.
        offset: u64,
        /// The event itself.
        publication: Publication,
    },
    /// Keepalive answer.
    Pong,
    /// Connection-level failure; the server closes after sending it.
    Error {
        /// Human-readable reason.
        message: String,
    },
}

macro_rules! json_frame {
    ($ty:ty) => {
        impl $ty {
            /// Serialize to a JSON text frame.
            pub fn to_json(&self) -> Result<String, SeqError> {
                serde_json::to_string(self).map_err(SeqError::Serialization)
            }

            /// Deserialize from a JSON text frame.
            pub fn from_json(text: &str) -> Result<Self, SeqError> {
                serde_json::from_str(text).map_err(SeqError::Deserialization)
            }
        }
    };
}

json_frame!(ClientFrame);
json_frame!(ServerFrame);
