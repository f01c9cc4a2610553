//! Per-connection recovery bookkeeping.
//!
//! Each subscribe attempt produces one [`RecoverySession`] per chat channel,
//! recording the offset the client resumed from and what the broker made of
//! it. Sessions live only until the subscription settles.

use seq_types::{ChatId, SeqNum, SubscribeAck};

/// What the broker did with a resume offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Broker history covered the gap; missed events follow the ack.
    RecoveredViaBroker,
    /// The offset fell outside the bounded history; fetch via the sync endpoint.
    BrokerRecoveryFailed,
    /// First subscribe for this chat on this device; nothing to recover.
    NotApplicable,
}

/// Recovery state for one chat during one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoverySession {
    /// Chat being recovered.
    pub chat_id: ChatId,
    /// Cursor value at subscribe time, `None` for a fresh subscribe.
    pub requested_offset: Option<SeqNum>,
    /// Broker verdict.
    pub outcome: RecoveryOutcome,
    /// Replayed publications that follow the ack on the stream.
    pub replayed: u32,
}

impl RecoverySession {
    /// Interpret a subscribe ack for a chat channel.
    ///
    /// A refused subscription (ack carries an error) is treated like a failed
    /// recovery when an offset was requested, so the sync endpoint gets a
    /// chance to report the real problem.
    pub fn from_ack(chat_id: ChatId, requested_offset: Option<SeqNum>, ack: &SubscribeAck) -> Self {
        let outcome = match requested_offset {
            None => RecoveryOutcome::NotApplicable,
            Some(_) if ack.error.is_none() && ack.recovered => RecoveryOutcome::RecoveredViaBroker,
            Some(_) => RecoveryOutcome::BrokerRecoveryFailed,
        };
        let replayed = match outcome {
            RecoveryOutcome::RecoveredViaBroker => ack.replayed,
            _ => 0,
        };
        Self {
            chat_id,
            requested_offset,
            outcome,
            replayed,
        }
    }

    /// Whether this chat needs a sync-endpoint catch-up.
    pub fn needs_fallback(&self) -> bool {
        self.outcome == RecoveryOutcome::BrokerRecoveryFailed
    }

    /// Whether replayed publications are still expected for this chat.
    pub fn awaits_replay(&self) -> bool {
        self.outcome == RecoveryOutcome::RecoveredViaBroker && self.replayed > 0
    }
}
