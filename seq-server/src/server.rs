//! Main ChatServer coordination.
//!
//! ChatServer owns the sequence store, the broker, the publisher and the
//! append limits, and implements the operations the HTTP and WebSocket
//! handlers expose: append, sync and subscribe authorization.

use crate::broker::Broker;
use crate::config::Config;
use crate::error::ApiError;
use crate::limits::RateLimits;
use crate::publisher::EventPublisher;
use crate::storage::{AppendOutcome, AppendRequest, MessageStore};
use dashmap::DashMap;
use seq_types::{Channel, ChatId, NewMessage, SeqNum, SyncPage, UserId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Operational metrics for monitoring server activity.
///
/// All counters are monotonically increasing (reset only on restart).
/// Plain `AtomicU64` counters, bumped with relaxed ordering.
#[derive(Debug, Default)]
pub struct ServerMetrics {
    /// Messages committed.
    pub appends_total: AtomicU64,
    /// Appends answered with an already committed message.
    pub idempotent_replays_total: AtomicU64,
    /// Channel publications that reached the broker.
    pub publishes_total: AtomicU64,
    /// Channel publications dropped or rejected.
    pub publish_failures: AtomicU64,
    /// Sync endpoint calls served.
    pub sync_requests_total: AtomicU64,
    /// Messages returned by the sync endpoint.
    pub messages_served_total: AtomicU64,
    /// Broker WebSocket sessions accepted.
    pub broker_sessions_total: AtomicU64,
    /// Subscriptions acknowledged.
    pub subscriptions_total: AtomicU64,
    /// Subscriptions answered with `recovered = true`.
    pub recoveries_total: AtomicU64,
    /// Sessions dropped for lagging behind live traffic.
    pub lagged_disconnects_total: AtomicU64,
    /// Appends rejected by rate limits.
    pub rate_limit_hits: AtomicU64,
}

/// Identity and start time of a live broker session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Authenticated caller.
    pub user_id: UserId,
    /// Unix seconds when the session opened.
    pub connected_at: u64,
}

/// Main chat server.
pub struct ChatServer {
    config: Config,
    store: Arc<dyn MessageStore>,
    broker: Arc<dyn Broker>,
    publisher: EventPublisher,
    rate_limits: RateLimits,
    metrics: Arc<ServerMetrics>,
    sessions: DashMap<u64, SessionInfo>,
    next_session: AtomicU64,
}

impl std::fmt::Debug for ChatServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatServer")
            .field("config", &self.config)
            .field("rate_limits", &self.rate_limits)
            .field("metrics", &self.metrics)
            .field("sessions_count", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

impl ChatServer {
    /// Create a server and start its publish worker.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(config: Config, store: Arc<dyn MessageStore>, broker: Arc<dyn Broker>) -> Self {
        let rate_limits = RateLimits::new(&config.limits);
        let metrics = Arc::new(ServerMetrics::default());
        let (publisher, _worker) = EventPublisher::spawn(
            Arc::clone(&broker),
            Arc::clone(&metrics),
            config.broker.channel_capacity,
        );
        Self {
            config,
            store,
            broker,
            publisher,
            rate_limits,
            metrics,
            sessions: DashMap::new(),
            next_session: AtomicU64::new(1),
        }
    }

    /// Get the server configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get access to the sequence store.
    pub fn store(&self) -> &dyn MessageStore {
        self.store.as_ref()
    }

    /// Get access to the broker.
    pub fn broker(&self) -> &dyn Broker {
        self.broker.as_ref()
    }

    /// Get a clone of the broker Arc for background tasks.
    pub fn broker_arc(&self) -> Arc<dyn Broker> {
        Arc::clone(&self.broker)
    }

    /// Get access to the rate limiters.
    pub fn rate_limits(&self) -> &RateLimits {
        &self.rate_limits
    }

    /// Get access to the operational metrics.
    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    /// Commit a message and queue its fan-out.
    ///
    /// The caller gets the committed message as soon as the store commits;
    /// fan-out happens afterwards and cannot fail the append. Re-sending an
    /// id already committed to this chat returns the original and publishes
    /// nothing.
    pub async fn append(
        &self,
        caller: &UserId,
        chat_id: &ChatId,
        message: NewMessage,
    ) -> Result<AppendOutcome, ApiError> {
        if message.content.trim().is_empty() {
            return Err(ApiError::BadRequest("content must not be empty".into()));
        }
        let max = self.config.storage.max_content_len;
        if message.content.len() > max {
            return Err(ApiError::BadRequest(format!(
                "content exceeds {max} bytes"
            )));
        }

        self.require_participant(chat_id, caller).await?;

        if let Err(e) = self.rate_limits.check_append(caller) {
            self.metrics.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(user = %caller, error = %e, "append rate limited");
            return Err(e.into());
        }

        let outcome = self
            .store
            .append(AppendRequest {
                id: message.id.unwrap_or_default(),
                chat_id: *chat_id,
                sender_id: *caller,
                content: message.content,
                created_at: now_millis(),
            })
            .await?;

        match &outcome {
            AppendOutcome::Committed(committed) => {
                self.metrics.appends_total.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(chat_id = %chat_id, seq = %committed.seq_num, "message committed");

                // Recipients are best-effort too: a lookup failure only
                // skips the user channels.
                let recipients = match self.store.participants(chat_id).await {
                    Ok(users) => users,
                    Err(e) => {
                        tracing::warn!(chat_id = %chat_id, error = %e, "participant lookup failed");
                        Vec::new()
                    }
                };
                self.publisher.publish(committed.clone(), recipients);
            }
            AppendOutcome::Existing(existing) => {
                self.metrics
                    .idempotent_replays_total
                    .fetch_add(1, Ordering::Relaxed);
                tracing::debug!(chat_id = %chat_id, seq = %existing.seq_num, "idempotent append replay");
            }
        }

        Ok(outcome)
    }

    /// Messages after `after_seq`, ascending, one page.
    ///
    /// `has_more` is exact: one extra row is fetched to decide it.
    pub async fn sync(
        &self,
        caller: &UserId,
        chat_id: &ChatId,
        after_seq: SeqNum,
        limit: Option<u32>,
    ) -> Result<SyncPage, ApiError> {
        self.require_participant(chat_id, caller).await?;

        let limit = self.config.sync.clamp(limit);
        let mut messages = self
            .store
            .messages_after(chat_id, after_seq, limit.saturating_add(1))
            .await?;
        let has_more = messages.len() > limit as usize;
        messages.truncate(limit as usize);

        self.metrics.sync_requests_total.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .messages_served_total
            .fetch_add(messages.len() as u64, Ordering::Relaxed);
        tracing::debug!(
            chat_id = %chat_id,
            after = %after_seq,
            returned = messages.len(),
            has_more,
            "sync page served"
        );

        Ok(SyncPage { messages, has_more })
    }

    /// Add a participant to a chat. Returns false if already present.
    pub async fn add_participant(&self, chat_id: &ChatId, user_id: &UserId) -> Result<bool, ApiError> {
        let added = self.store.add_participant(chat_id, user_id).await?;
        if added {
            tracing::info!(chat_id = %chat_id, user = %user_id, "participant added");
        }
        Ok(added)
    }

    /// Whether `caller` may subscribe to `channel`.
    pub async fn authorize_channel(&self, caller: &UserId, channel: &Channel) -> Result<(), ApiError> {
        match channel {
            Channel::Chat(chat_id) => self.require_participant(chat_id, caller).await,
            Channel::User(user_id) if user_id == caller => Ok(()),
            Channel::User(_) => Err(ApiError::AccessDenied),
        }
    }

    async fn require_participant(&self, chat_id: &ChatId, user_id: &UserId) -> Result<(), ApiError> {
        if self.store.is_participant(chat_id, user_id).await? {
            Ok(())
        } else {
            Err(ApiError::AccessDenied)
        }
    }

    /// Register a broker session and return its id.
    pub fn register_session(&self, user_id: UserId) -> u64 {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let connected_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.sessions.insert(id, SessionInfo { user_id, connected_at });
        self.metrics.broker_sessions_total.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(session = id, user = %user_id, total = self.sessions.len(), "broker session opened");
        id
    }

    /// Forget a broker session.
    pub fn unregister_session(&self, id: u64) {
        if let Some((_, info)) = self.sessions.remove(&id) {
            tracing::debug!(session = id, user = %info.user_id, "broker session closed");
        }
    }

    /// Number of open broker sessions.
    pub fn total_sessions(&self) -> usize {
        self.sessions.len()
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
