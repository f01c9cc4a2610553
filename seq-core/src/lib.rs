//! # seq-core
//!
//! Pure logic for chatseq recovery (no I/O, instant tests).
//!
//! This crate implements the recovery state machine and the bookkeeping
//! algorithms a client needs to observe every chat message exactly once,
//! without any network or disk I/O.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. This enables:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic behavior (same input → same output)
//! - Easy reasoning about state transitions
//!
//! The actual I/O (WebSocket, REST, cursor files) is performed by
//! `seq-client`, which interprets the actions produced by these state machines.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod gaps;
pub mod merge;
pub mod recovery;
pub mod retry;
pub mod state;

pub use gaps::GapTracker;
pub use merge::{ChatLog, MergeOutcome};
pub use recovery::{RecoveryOutcome, RecoverySession};
pub use retry::{equal_jitter, no_jitter, JitterFn, RetryPolicy};
pub use state::{Action, ConnectionState, CoordinatorEvent, Event, SyncStatus};
