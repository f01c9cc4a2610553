//! Merge/dedup working set for one chat.
//!
//! Messages reach a client along three paths: live publications, broker
//! replay after a reconnect, and sync-endpoint fallback pages. The paths can
//! overlap and interleave. [`ChatLog`] accepts each message at most once and
//! always exposes the set sorted by `seq_num`.
//!
//! A message is accepted when it is above the cursor, or when its `id` has
//! not been seen yet (a backfill below the cursor, e.g. a gap being filled).
//! In both cases an id or `seq_num` already present in the working set is a
//! duplicate.

use std::collections::{BTreeMap, HashSet};

use seq_types::{ChatMessage, MessageId, SeqNum};

/// Result of offering a message to a [`ChatLog`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// New message above the cursor.
    Advanced,
    /// New message at or below the cursor; cursor unchanged.
    Backfilled,
    /// Already applied; nothing changes.
    Duplicate,
}

impl MergeOutcome {
    /// Whether the message was added to the working set.
    pub fn applied(self) -> bool {
        !matches!(self, Self::Duplicate)
    }
}

/// Applied messages of a single chat, keyed by `seq_num`.
#[derive(Debug, Clone, Default)]
pub struct ChatLog {
    by_seq: BTreeMap<SeqNum, ChatMessage>,
    seen: HashSet<MessageId>,
}

impl ChatLog {
    /// Create an empty working set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify `message` against the working set and the persisted cursor,
    /// without changing anything.
    pub fn classify(&self, message: &ChatMessage, cursor: SeqNum) -> MergeOutcome {
        if self.seen.contains(&message.id) || self.by_seq.contains_key(&message.seq_num) {
            return MergeOutcome::Duplicate;
        }
        if message.seq_num > cursor {
            MergeOutcome::Advanced
        } else {
            MergeOutcome::Backfilled
        }
    }

    /// Apply `message` if it is new.
    pub fn apply(&mut self, message: ChatMessage, cursor: SeqNum) -> MergeOutcome {
        let outcome = self.classify(&message, cursor);
        if outcome.applied() {
            self.insert(message);
        }
        outcome
    }

    /// Insert without classification. Callers must have classified first.
    pub fn insert(&mut self, message: ChatMessage) {
        self.seen.insert(message.id);
        self.by_seq.insert(message.seq_num, message);
    }

    /// Applied messages in ascending `seq_num` order.
    pub fn iter(&self) -> impl Iterator<Item = &ChatMessage> {
        self.by_seq.values()
    }

    /// Applied messages in ascending `seq_num` order, cloned.
    pub fn to_vec(&self) -> Vec<ChatMessage> {
        self.by_seq.values().cloned().collect()
    }

    /// Number of applied messages.
    pub fn len(&self) -> usize {
        self.by_seq.len()
    }

    /// Whether nothing has been applied.
    pub fn is_empty(&self) -> bool {
        self.by_seq.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seq_types::{ChatId, UserId};

    fn message(chat: ChatId, seq: u64) -> ChatMessage {
        ChatMessage {
            id: MessageId::new(),
            chat_id: chat,
            seq_num: SeqNum::new(seq),
            sender_id: UserId::new(),
            content: format!("m{seq}"),
            created_at: 0,
            updated_at: None,
            deleted: false,
        }
    }

    fn seqs(log: &ChatLog) -> Vec<u64> {
        log.iter().map(|m| m.seq_num.value()).collect()
    }

    #[test]
    fn applies_above_cursor() {
        let chat = ChatId::new();
        let mut log = ChatLog::new();
        assert_eq!(log.apply(message(chat, 1), SeqNum::zero()), MergeOutcome::Advanced);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn same_message_twice_is_duplicate() {
        let chat = ChatId::new();
        let mut log = ChatLog::new();
        let m = message(chat, 5);
        assert!(log.apply(m.clone(), SeqNum::new(4)).applied());
        assert_eq!(log.apply(m, SeqNum::new(5)), MergeOutcome::Duplicate);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn duplicate_even_when_cursor_lags() {
        // Cursor persistence failed after the first apply.
        let chat = ChatId::new();
        let mut log = ChatLog::new();
        let m = message(chat, 5);
        log.apply(m.clone(), SeqNum::new(4));
        assert_eq!(log.apply(m, SeqNum::new(4)), MergeOutcome::Duplicate);
    }

    #[test]
    fn below_cursor_unseen_is_backfilled() {
        let chat = ChatId::new();
        let mut log = ChatLog::new();
        assert_eq!(log.apply(message(chat, 3), SeqNum::new(10)), MergeOutcome::Backfilled);
        assert_eq!(seqs(&log), vec![3]);
    }

    #[test]
    fn occupied_seq_slot_is_duplicate() {
        let chat = ChatId::new();
        let mut log = ChatLog::new();
        log.apply(message(chat, 7), SeqNum::zero());
        // Different id, same seq: cannot both be committed messages.
        assert_eq!(log.apply(message(chat, 7), SeqNum::zero()), MergeOutcome::Duplicate);
    }

    #[test]
    fn out_of_order_arrivals_are_sorted() {
        let chat = ChatId::new();
        let mut log = ChatLog::new();
        for seq in [4, 1, 3, 2] {
            log.apply(message(chat, seq), SeqNum::zero());
        }
        assert_eq!(seqs(&log), vec![1, 2, 3, 4]);
    }

    #[test]
    fn replay_and_fallback_overlap_yield_each_once() {
        let chat = ChatId::new();
        let committed: Vec<_> = (5..=10).map(|s| message(chat, s)).collect();
        let mut log = ChatLog::new();
        let mut cursor = SeqNum::new(4);

        // Broker replay 5-8 interleaved with a fallback page 5-10.
        let replay = committed[0..4].iter();
        let fallback = committed.iter();
        for m in replay.zip(fallback.clone()).flat_map(|(a, b)| [a, b]).chain(fallback.skip(4)) {
            if log.apply(m.clone(), cursor) == MergeOutcome::Advanced {
                cursor = cursor.max(m.seq_num);
            }
        }

        assert_eq!(seqs(&log), vec![5, 6, 7, 8, 9, 10]);
        assert_eq!(cursor, SeqNum::new(10));
    }

    #[test]
    fn classify_does_not_mutate() {
        let chat = ChatId::new();
        let log = ChatLog::new();
        let m = message(chat, 1);
        assert_eq!(log.classify(&m, SeqNum::zero()), MergeOutcome::Advanced);
        assert!(log.is_empty());
    }
}
