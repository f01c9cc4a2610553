//! Merge/dedup layer bound to the cursor store.
//!
//! Live publications, broker replay and fallback pages all funnel through
//! [`Merger::apply`] or [`Merger::apply_bounded`]. A message that advances
//! the cursor is only accepted after the advance reached the cursor store;
//! if persisting fails the message is not applied and can be delivered
//! again later.
//!
//! The persisted cursor never passes a `seq_num` that has not been applied.
//! Live traffic that runs ahead of an unfilled range is applied to the
//! working set while the cursor stays at the last point with nothing
//! missing below it.

use crate::cursor_store::{CursorStore, CursorStoreError};
use seq_core::{ChatLog, MergeOutcome};
use seq_types::{ChatId, ChatMessage, SeqNum};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

/// Applied-message fan-out buffer.
const APPLIED_BUFFER: usize = 1024;

/// Per-chat working sets over a shared cursor store.
pub struct Merger {
    cursors: Arc<dyn CursorStore>,
    logs: Mutex<HashMap<ChatId, ChatLog>>,
    applied: broadcast::Sender<ChatMessage>,
}

impl std::fmt::Debug for Merger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Merger")
            .field("subscribers", &self.applied.receiver_count())
            .finish_non_exhaustive()
    }
}

impl Merger {
    /// Create a merger persisting through `cursors`.
    pub fn new(cursors: Arc<dyn CursorStore>) -> Self {
        let (applied, _) = broadcast::channel(APPLIED_BUFFER);
        Self {
            cursors,
            logs: Mutex::new(HashMap::new()),
            applied,
        }
    }

    /// The cursor store this merger advances.
    pub fn cursor_store(&self) -> &Arc<dyn CursorStore> {
        &self.cursors
    }

    /// Offer a message whose predecessors are all applied, e.g. the next
    /// entry of an ascending sync page. Applies it at most once.
    pub async fn apply(&self, message: ChatMessage) -> Result<MergeOutcome, CursorStoreError> {
        let seq = message.seq_num;
        self.apply_bounded(message, seq).await
    }

    /// Offer a message and let the cursor move no further than `durable`.
    ///
    /// `durable` is the highest `seq_num` with nothing unapplied at or below
    /// it once this message is in. It may lie above the message itself when
    /// the message closes a gap in front of buffered values.
    pub async fn apply_bounded(
        &self,
        message: ChatMessage,
        durable: SeqNum,
    ) -> Result<MergeOutcome, CursorStoreError> {
        let chat_id = message.chat_id;
        let seq = message.seq_num;
        let mut logs = self.logs.lock().await;
        let log = logs.entry(chat_id).or_default();

        let cursor = self.cursors.get(&chat_id).await?;
        let outcome = log.classify(&message, cursor);
        if outcome == MergeOutcome::Duplicate {
            tracing::trace!(%chat_id, %seq, "duplicate dropped");
            return Ok(outcome);
        }
        if durable > cursor {
            self.cursors.advance(&chat_id, durable).await?;
        } else if outcome == MergeOutcome::Advanced {
            tracing::trace!(%chat_id, %seq, %cursor, "applied ahead of an open gap");
        }

        log.insert(message.clone());
        // Nobody listening is fine.
        let _ = self.applied.send(message);
        tracing::trace!(%chat_id, %seq, ?outcome, "message applied");
        Ok(outcome)
    }

    /// Move the cursor up to `through` once everything below it is settled.
    /// Never moves it backwards.
    pub async fn settle(&self, chat_id: &ChatId, through: SeqNum) -> Result<(), CursorStoreError> {
        let _logs = self.logs.lock().await;
        if through > self.cursors.get(chat_id).await? {
            self.cursors.advance(chat_id, through).await?;
        }
        Ok(())
    }

    /// Applied messages of a chat in ascending `seq_num` order.
    pub async fn messages(&self, chat_id: &ChatId) -> Vec<ChatMessage> {
        self.logs
            .lock()
            .await
            .get(chat_id)
            .map(ChatLog::to_vec)
            .unwrap_or_default()
    }

    /// Number of applied messages of a chat.
    pub async fn applied_count(&self, chat_id: &ChatId) -> usize {
        self.logs.lock().await.get(chat_id).map_or(0, ChatLog::len)
    }

    /// Persisted cursor of a chat, zero if none.
    pub async fn cursor(&self, chat_id: &ChatId) -> Result<SeqNum, CursorStoreError> {
        self.cursors.get(chat_id).await
    }

    /// Stream of newly applied messages, in application order.
    pub fn subscribe(&self) -> broadcast::Receiver<ChatMessage> {
        self.applied.subscribe()
    }
}
