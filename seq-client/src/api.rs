//! Chat API client: append and cursor-based sync over HTTP.
//!
//! [`HttpChatApi`] talks to chatseq-server with reqwest. [`MemoryChatApi`]
//! is an in-process stand-in with the same paging semantics, for tests and
//! demos that need a sync endpoint without a server.

use async_trait::async_trait;
use seq_types::{ChatId, ChatMessage, MessageId, NewMessage, SeqNum, SyncPage, UserId};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Header carrying the caller identity.
pub const CALLER_HEADER: &str = "x-user-id";

/// Errors from the chat API.
#[derive(Debug, Error)]
pub enum ApiClientError {
    /// Network or decoding failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with an error status.
    #[error("server returned {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Error text from the body.
        message: String,
    },

    /// The request did not finish in time.
    #[error("request timed out")]
    Timeout,
}

impl ApiClientError {
    /// Whether retrying the same request can succeed.
    ///
    /// Network failures, timeouts, 429 and 5xx are transient. Any other 4xx
    /// (access denied, bad request) will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) | Self::Timeout => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
        }
    }
}

/// The server operations a client needs.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Append a message; returns the committed message with its `seq_num`.
    async fn send(&self, chat_id: &ChatId, message: &NewMessage) -> Result<ChatMessage, ApiClientError>;

    /// One page of messages with `seq_num > after_seq`, ascending.
    async fn sync(&self, chat_id: &ChatId, after_seq: SeqNum, limit: u32) -> Result<SyncPage, ApiClientError>;
}

/// HTTP implementation of [`ChatApi`].
#[derive(Debug, Clone)]
pub struct HttpChatApi {
    client: reqwest::Client,
    base_url: String,
    user_id: UserId,
}

impl HttpChatApi {
    /// Client for the server at `base_url` (e.g. `http://localhost:8080`),
    /// acting as `user_id`.
    pub fn new(base_url: impl Into<String>, user_id: UserId) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            user_id,
        }
    }

    /// Caller identity sent with every request.
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Add `user_id` to a chat through the participant hook.
    pub async fn add_participant(&self, chat_id: &ChatId, user_id: &UserId) -> Result<(), ApiClientError> {
        let response = self
            .client
            .put(format!("{}/chats/{chat_id}/participants/{user_id}", self.base_url))
            .send()
            .await?;
        check(response).await.map(|_| ())
    }
}

/// Turn an error status into [`ApiClientError::Status`].
async fn check(response: reqwest::Response) -> Result<reqwest::Response, ApiClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response
        .json::<serde_json::Value>()
        .await
        .ok()
        .and_then(|body| body.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| status.to_string());
    Err(ApiClientError::Status {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn send(&self, chat_id: &ChatId, message: &NewMessage) -> Result<ChatMessage, ApiClientError> {
        let response = self
            .client
            .post(format!("{}/chats/{chat_id}/messages", self.base_url))
            .header(CALLER_HEADER, self.user_id.to_string())
            .json(message)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn sync(&self, chat_id: &ChatId, after_seq: SeqNum, limit: u32) -> Result<SyncPage, ApiClientError> {
        let response = self
            .client
            .get(format!("{}/chats/{chat_id}/messages/sync", self.base_url))
            .header(CALLER_HEADER, self.user_id.to_string())
            .query(&[("after_seq", after_seq.value()), ("limit", u64::from(limit))])
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }
}

/// In-process [`ChatApi`] with server paging semantics.
#[derive(Debug, Default)]
pub struct MemoryChatApi {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    chats: HashMap<ChatId, Vec<ChatMessage>>,
    sync_failures: Vec<u16>,
    sync_calls: usize,
}

impl MemoryChatApi {
    /// Create an empty API.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Commit `count` messages to `chat_id`, returning them.
    pub fn seed(&self, chat_id: ChatId, count: usize) -> Vec<ChatMessage> {
        (0..count)
            .map(|i| self.commit(chat_id, UserId::new(), format!("message {i}"), None))
            .collect()
    }

    /// Commit one message, assigning the next `seq_num`.
    pub fn commit(&self, chat_id: ChatId, sender_id: UserId, content: String, id: Option<MessageId>) -> ChatMessage {
        let mut inner = self.lock();
        let log = inner.chats.entry(chat_id).or_default();
        let seq = log.last().map(|m| m.seq_num.next()).unwrap_or(SeqNum::new(1));
        let message = ChatMessage {
            id: id.unwrap_or_default(),
            chat_id,
            seq_num: seq,
            sender_id,
            content,
            created_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0),
            updated_at: None,
            deleted: false,
        };
        log.push(message.clone());
        message
    }

    /// Make the next sync calls fail with these statuses, in order.
    pub fn fail_syncs(&self, statuses: &[u16]) {
        self.lock().sync_failures.extend_from_slice(statuses);
    }

    /// Number of sync calls made, failed ones included.
    pub fn sync_calls(&self) -> usize {
        self.lock().sync_calls
    }
}

#[async_trait]
impl ChatApi for MemoryChatApi {
    async fn send(&self, chat_id: &ChatId, message: &NewMessage) -> Result<ChatMessage, ApiClientError> {
        if let Some(id) = message.id {
            let inner = self.lock();
            let existing = inner
                .chats
                .get(chat_id)
                .and_then(|log| log.iter().find(|m| m.id == id).cloned());
            if let Some(existing) = existing {
                return Ok(existing);
            }
        }
        Ok(self.commit(*chat_id, UserId::new(), message.content.clone(), message.id))
    }

    async fn sync(&self, chat_id: &ChatId, after_seq: SeqNum, limit: u32) -> Result<SyncPage, ApiClientError> {
        let mut inner = self.lock();
        inner.sync_calls += 1;
        if !inner.sync_failures.is_empty() {
            let status = inner.sync_failures.remove(0);
            return Err(ApiClientError::Status {
                status,
                message: "injected failure".into(),
            });
        }

        let limit = limit.max(1) as usize;
        let mut messages: Vec<ChatMessage> = inner
            .chats
            .get(chat_id)
            .map(|log| log.iter().filter(|m| m.seq_num > after_seq).cloned().collect())
            .unwrap_or_default();
        let has_more = messages.len() > limit;
        messages.truncate(limit);
        Ok(SyncPage { messages, has_more })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses() {
        let status = |status| ApiClientError::Status {
            status,
            message: String::new(),
        };
        assert!(status(500).is_retryable());
        assert!(status(503).is_retryable());
        assert!(status(429).is_retryable());
        assert!(!status(403).is_retryable());
        assert!(!status(400).is_retryable());
        assert!(ApiClientError::Timeout.is_retryable());
    }

    #[test]
    fn http_api_trims_base_url() {
        let api = HttpChatApi::new("http://localhost:8080/", UserId::new());
        assert_eq!(api.base_url, "http://localhost:8080");
    }

    #[tokio::test]
    async fn memory_api_pages() {
        let api = MemoryChatApi::new();
        let chat = ChatId::new();
        api.seed(chat, 5);

        let page = api.sync(&chat, SeqNum::zero(), 2).await.unwrap();
        assert_eq!(page.messages.last().map(|m| m.seq_num), Some(SeqNum::new(2)));
        assert!(page.has_more);

        let page = api.sync(&chat, SeqNum::new(4), 2).await.unwrap();
        assert_eq!(page.messages.len(), 1);
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn memory_api_send_is_idempotent_by_id() {
        let api = MemoryChatApi::new();
        let chat = ChatId::new();
        let message = NewMessage::new("hello");

        let first = api.send(&chat, &message).await.unwrap();
        let second = api.send(&chat, &message).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(api.sync(&chat, SeqNum::zero(), 10).await.unwrap().messages.len(), 1);
    }

    #[tokio::test]
    async fn memory_api_injected_failures() {
        let api = MemoryChatApi::new();
        let chat = ChatId::new();
        api.fail_syncs(&[503, 403]);

        let err = api.sync(&chat, SeqNum::zero(), 10).await.unwrap_err();
        assert!(err.is_retryable());
        let err = api.sync(&chat, SeqNum::zero(), 10).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(api.sync(&chat, SeqNum::zero(), 10).await.is_ok());
        assert_eq!(api.sync_calls(), 3);
    }
}
