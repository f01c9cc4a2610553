//! Sequence gap tracking for live traffic.
//!
//! `seq_num` values are assigned densely per chat, but gaps are permitted and
//! publishes may be dropped. The tracker keeps the highest contiguous
//! `seq_num` applied plus the set of applied values beyond it. A non-empty
//! set means something between the contiguous point and the highest value
//! has not arrived yet; the client fills it from the sync endpoint and then
//! acknowledges the range, whether or not the store had anything there.

use std::collections::BTreeSet;

use seq_types::SeqNum;

/// Tracks applied `seq_num` values of one chat and detects gaps.
#[derive(Debug, Clone, Default)]
pub struct GapTracker {
    /// Applied values above the contiguous point.
    ahead: BTreeSet<u64>,
    /// Highest value with no gap below it.
    contiguous: u64,
}

impl GapTracker {
    /// Start tracking from a persisted cursor.
    pub fn with_cursor(cursor: SeqNum) -> Self {
        Self {
            ahead: BTreeSet::new(),
            contiguous: cursor.value(),
        }
    }

    /// Record an applied `seq_num`.
    pub fn received(&mut self, seq: SeqNum) {
        let value = seq.value();
        if value > self.contiguous {
            self.ahead.insert(value);
            self.update_contiguous();
        }
    }

    /// Highest value with no gap below it.
    pub fn contiguous(&self) -> SeqNum {
        SeqNum::new(self.contiguous)
    }

    /// Highest value recorded.
    pub fn highest(&self) -> SeqNum {
        SeqNum::new(self.ahead.last().copied().unwrap_or(self.contiguous))
    }

    /// Whether a gap is open.
    pub fn has_gaps(&self) -> bool {
        !self.ahead.is_empty()
    }

    /// The contiguous point as it would be once `seq` is recorded.
    ///
    /// A durable cursor may move this far and no further: everything at or
    /// below it has been applied or settled.
    pub fn contiguous_with(&self, seq: SeqNum) -> SeqNum {
        let mut next = seq.value();
        if next != self.contiguous + 1 {
            return self.contiguous();
        }
        while self.ahead.contains(&(next + 1)) {
            next += 1;
        }
        SeqNum::new(next)
    }

    /// Treat everything up to `seq` as settled.
    pub fn acknowledge_up_to(&mut self, seq: SeqNum) {
        let value = seq.value();
        self.ahead.retain(|&v| v > value);
        if value > self.contiguous {
            self.contiguous = value;
        }
        self.update_contiguous();
    }

    fn update_contiguous(&mut self) {
        let mut next = self.contiguous + 1;
        while self.ahead.remove(&next) {
            self.contiguous = next;
            next += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: u64) -> SeqNum {
        SeqNum::new(v)
    }

    #[test]
    fn contiguous_stream_has_no_gaps() {
        let mut t = GapTracker::with_cursor(s(10));
        for v in 11..=15 {
            t.received(s(v));
        }
        assert!(!t.has_gaps());
        assert_eq!(t.contiguous(), s(15));
        assert_eq!(t.highest(), s(15));
    }

    #[test]
    fn skipped_seq_opens_gap() {
        let mut t = GapTracker::with_cursor(s(10));
        t.received(s(11));
        t.received(s(14));
        assert!(t.has_gaps());
        assert_eq!(t.contiguous(), s(11));
        assert_eq!(t.highest(), s(14));
    }

    #[test]
    fn late_arrival_closes_gap() {
        let mut t = GapTracker::with_cursor(s(0));
        t.received(s(1));
        t.received(s(3));
        t.received(s(2));
        assert!(!t.has_gaps());
        assert_eq!(t.contiguous(), s(3));
    }

    #[test]
    fn values_at_or_below_contiguous_are_ignored() {
        let mut t = GapTracker::with_cursor(s(5));
        t.received(s(3));
        t.received(s(5));
        assert!(!t.has_gaps());
        assert_eq!(t.contiguous(), s(5));
    }

    #[test]
    fn acknowledge_settles_permanent_gap() {
        let mut t = GapTracker::with_cursor(s(0));
        t.received(s(1));
        t.received(s(4));
        t.received(s(5));
        t.acknowledge_up_to(s(4));
        assert!(!t.has_gaps());
        assert_eq!(t.contiguous(), s(5));
    }

    #[test]
    fn acknowledge_keeps_values_beyond() {
        let mut t = GapTracker::with_cursor(s(0));
        t.received(s(2));
        t.received(s(9));
        t.acknowledge_up_to(s(3));
        assert_eq!(t.contiguous(), s(3));
        assert!(t.has_gaps());
        assert_eq!(t.highest(), s(9));
    }

    #[test]
    fn durable_point_stops_below_a_gap() {
        let mut t = GapTracker::with_cursor(s(2));
        // 3..=10 not yet fetched.
        assert_eq!(t.contiguous_with(s(11)), s(2));
        t.received(s(11));
        assert_eq!(t.contiguous_with(s(12)), s(2));
    }

    #[test]
    fn durable_point_runs_through_buffered_values() {
        let mut t = GapTracker::with_cursor(s(0));
        t.received(s(1));
        t.received(s(3));
        t.received(s(4));
        assert_eq!(t.contiguous_with(s(2)), s(4));
        t.received(s(2));
        assert_eq!(t.contiguous(), s(4));
        assert_eq!(t.contiguous_with(s(5)), s(5));
    }

    #[test]
    fn durable_point_ignores_old_values() {
        let t = GapTracker::with_cursor(s(7));
        assert_eq!(t.contiguous_with(s(3)), s(7));
    }
}
