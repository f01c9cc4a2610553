//! ChatClient - the application-facing entry point.
//!
//! Bundles the chat API, the device's cursor store and the merge layer, and
//! starts recovery coordinators over a broker transport.
//!
//! ```text
//! Application → ChatClient ─ send / sync_chat ─→ ChatApi → Sync Endpoint
//!                    │
//!                    └─ watch ─→ RecoveryCoordinator → BrokerTransport
//!                                       ↓
//!                               Merger → CursorStore
//! ```
//!
//! # Example
//!
//! ```ignore
//! use chatseq_client::{ChatClient, ClientConfig, WsTransport};
//!
//! let client = ChatClient::open(ClientConfig::from_file(path)?).await?;
//! client.send(&chat_id, "hello").await?;
//!
//! let coordinator = client.watch(Arc::new(WsTransport::new()));
//! let mut applied = client.merger().subscribe();
//! ```

use crate::api::{ApiClientError, ChatApi, HttpChatApi};
use crate::config::ClientConfig;
use crate::coordinator::{CoordinatorHandle, CoordinatorSettings, RecoveryCoordinator};
use crate::cursor_store::{CursorStore, CursorStoreError, FileCursorStore};
use crate::merge::Merger;
use crate::transport::BrokerTransport;
use seq_types::{ChatId, ChatMessage, DeviceId, NewMessage, SeqNum};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Chat API error.
    #[error("api error: {0}")]
    Api(#[from] ApiClientError),

    /// Cursor store error.
    #[error("cursor store error: {0}")]
    CursorStore(#[from] CursorStoreError),
}

/// One device's view of the chats it follows.
pub struct ChatClient<A> {
    config: ClientConfig,
    device_id: DeviceId,
    api: Arc<A>,
    merger: Arc<Merger>,
}

impl ChatClient<HttpChatApi> {
    /// Open the client described by `config`, with file-backed cursors in
    /// `config.cursor_dir`.
    pub async fn open(config: ClientConfig) -> Result<Self, ClientError> {
        let device_id = match config.device_id {
            Some(device_id) => device_id,
            None => FileCursorStore::load_or_create_device_id(&config.cursor_dir).await?,
        };
        let cursors = FileCursorStore::open(&config.cursor_dir, &device_id).await?;
        tracing::debug!(device = %device_id, path = %cursors.path().display(), "cursor store opened");

        let api = HttpChatApi::new(config.server_url.clone(), config.user_id);
        Ok(Self::new(config, device_id, Arc::new(api), Arc::new(cursors)))
    }
}

impl<A: ChatApi + 'static> ChatClient<A> {
    /// Assemble a client from its parts.
    pub fn new(config: ClientConfig, device_id: DeviceId, api: Arc<A>, cursors: Arc<dyn CursorStore>) -> Self {
        Self {
            config,
            device_id,
            api,
            merger: Arc::new(Merger::new(cursors)),
        }
    }

    /// This device.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Configuration in use.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The merge layer every delivery path goes through.
    pub fn merger(&self) -> &Arc<Merger> {
        &self.merger
    }

    /// Append a message to a chat.
    ///
    /// The message carries a client-generated id, so a retry after a lost
    /// response returns the original commit instead of a second message.
    /// Retries follow the retry policy, bounded by the fallback ceiling.
    pub async fn send(&self, chat_id: &ChatId, content: &str) -> Result<ChatMessage, ClientError> {
        let message = NewMessage::new(content);
        let policy = self.config.retry.policy();
        let attempts = self.config.retry.fallback_ceiling.max(1);

        let mut attempt = 1;
        loop {
            let result = tokio::time::timeout(policy.attempt_timeout, self.api.send(chat_id, &message))
                .await
                .unwrap_or(Err(ApiClientError::Timeout));
            match result {
                Ok(committed) => {
                    tracing::debug!(%chat_id, seq = %committed.seq_num, id = %committed.id, "message sent");
                    return Ok(committed);
                }
                Err(e) if e.is_retryable() && attempt < attempts => {
                    tracing::debug!(%chat_id, attempt, error = %e, "send failed; retrying");
                    tokio::time::sleep(policy.delay_for(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// One-shot catch-up of a chat through the sync endpoint.
    ///
    /// Pages from the persisted cursor until the server has nothing more and
    /// returns the messages that were newly applied.
    pub async fn sync_chat(&self, chat_id: &ChatId) -> Result<Vec<ChatMessage>, ClientError> {
        let mut after = self.merger.cursor(chat_id).await?;
        let mut applied = Vec::new();

        loop {
            let page = self.api.sync(chat_id, after, self.config.page_size).await?;
            for message in page.messages {
                let seq = message.seq_num;
                if self.merger.apply(message.clone()).await?.applied() {
                    applied.push(message);
                }
                after = after.max(seq);
            }
            if !page.has_more {
                break;
            }
        }

        tracing::info!(%chat_id, applied = applied.len(), cursor = %after, "chat synced");
        Ok(applied)
    }

    /// Persisted cursors of this device.
    pub async fn cursors(&self) -> Result<BTreeMap<ChatId, SeqNum>, ClientError> {
        Ok(self.merger.cursor_store().entries().await?)
    }

    /// Start a recovery coordinator for the configured chats over `transport`.
    pub fn watch<T: BrokerTransport + 'static>(&self, transport: Arc<T>) -> CoordinatorHandle {
        RecoveryCoordinator::spawn(
            CoordinatorSettings::from_config(&self.config),
            transport,
            Arc::clone(&self.api),
            Arc::clone(&self.merger),
        )
    }
}
