//! Recovery state machine for chatseq.
//!
//! This module provides a pure, side-effect-free state machine for the
//! connect → subscribe → recover lifecycle. The state machine takes events as
//! input and produces a new state plus a list of actions to execute.
//!
//! The actual I/O (WebSocket, sync endpoint, timers) is performed by
//! seq-client, not by this module. This enables instant unit testing without
//! network mocks.
//!
//! ```text
//! Disconnected → Connecting → Connected → Subscribing ─┬─→ Subscribed
//!      ↑                                               ├─→ Recovering ──→ Subscribed
//!      └──────────── transport lost (any state) ───────┴─→ ApiFallback ─→ Subscribed
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use seq_types::{ChatId, SeqNum};

use crate::recovery::{RecoveryOutcome, RecoverySession};
use crate::retry::RetryPolicy;

/// Per-chat freshness signal for the UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncStatus {
    /// Everything committed up to the last sync has been applied.
    #[default]
    InSync,
    /// Replay or fallback sync in progress.
    Recovering,
    /// Fallback sync kept failing past the retry ceiling.
    MayBeOutOfSync,
}

/// Recovery state machine - NO I/O, just state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport. `attempt` counts consecutive failed cycles.
    Disconnected {
        /// Consecutive failed connection cycles.
        attempt: u32,
    },
    /// Transport connect in progress.
    Connecting {
        /// Consecutive failed connection cycles before this one.
        attempt: u32,
    },
    /// Transport up, subscribe not yet sent.
    Connected {
        /// Consecutive failed connection cycles before this one.
        attempt: u32,
    },
    /// Subscribe sent, waiting for the ack.
    Subscribing {
        /// Consecutive failed connection cycles before this one.
        attempt: u32,
    },
    /// Broker recovered every chat; replayed publications still arriving.
    Recovering {
        /// Replayed publications still expected, per chat.
        replays: BTreeMap<ChatId, u32>,
    },
    /// Broker could not recover some chats; sync-endpoint catch-up running.
    ApiFallback {
        /// Chats whose fallback has not completed.
        pending: BTreeSet<ChatId>,
        /// Replayed publications still expected for the other chats.
        replays: BTreeMap<ChatId, u32>,
    },
    /// Steady state: live traffic only.
    Subscribed,
    /// Shut down on request. Terminal.
    Stopped,
}

impl ConnectionState {
    /// Create a new state machine in the Disconnected state.
    pub fn new() -> Self {
        Self::Disconnected { attempt: 0 }
    }

    /// Process an event and return the new state plus actions to execute.
    ///
    /// This is a pure function - no side effects. The caller (seq-client)
    /// is responsible for executing the returned actions.
    pub fn on_event(self, event: Event, policy: &RetryPolicy) -> (Self, Vec<Action>) {
        match (self, event) {
            (Self::Stopped, _) => (Self::Stopped, vec![]),
            (_, Event::StopRequested) => (
                Self::Stopped,
                vec![
                    Action::CancelRetryTimer,
                    Action::CancelAttemptTimer,
                    Action::CancelFallbacks,
                    Action::CloseTransport,
                ],
            ),

            // From Disconnected
            (Self::Disconnected { attempt }, Event::Start | Event::RetryTimerFired) => (
                Self::Connecting { attempt },
                vec![Action::StartAttemptTimer, Action::Connect],
            ),

            // Connecting → Connected → Subscribing
            (Self::Connecting { attempt }, Event::ConnectSucceeded) => (
                Self::Connected { attempt },
                vec![Action::EmitEvent(CoordinatorEvent::Connected), Action::Subscribe],
            ),
            (Self::Connected { attempt }, Event::SubscribeSent) => {
                (Self::Subscribing { attempt }, vec![])
            }
            (Self::Subscribing { .. }, Event::SubscribeAcked { sessions }) => settle(sessions),

            // Failures before the subscription settled
            (
                Self::Connecting { attempt } | Self::Connected { attempt } | Self::Subscribing { attempt },
                Event::ConnectFailed { error }
                | Event::SubscribeFailed { error }
                | Event::TransportLost { reason: error },
            ) => retry_later(attempt, error, policy),
            (
                Self::Connecting { attempt } | Self::Connected { attempt } | Self::Subscribing { attempt },
                Event::AttemptTimedOut,
            ) => retry_later(attempt, "connection attempt timed out".into(), policy),

            // Transport lost after the subscription settled
            (
                Self::Recovering { .. } | Self::ApiFallback { .. } | Self::Subscribed,
                Event::TransportLost { reason },
            ) => (
                Self::Disconnected { attempt: 1 },
                vec![
                    Action::CancelFallbacks,
                    Action::CloseTransport,
                    Action::EmitEvent(CoordinatorEvent::Disconnected { reason }),
                    Action::StartRetryTimer {
                        delay: policy.delay_for(1),
                    },
                ],
            ),

            // Replay accounting
            (Self::Recovering { mut replays }, Event::ReplayReceived { chat_id }) => {
                let mut actions = Vec::new();
                count_replay(&mut replays, chat_id, &mut actions);
                (finish(BTreeSet::new(), replays, &mut actions), actions)
            }
            (Self::ApiFallback { pending, mut replays }, Event::ReplayReceived { chat_id }) => {
                let mut actions = Vec::new();
                count_replay(&mut replays, chat_id, &mut actions);
                (finish(pending, replays, &mut actions), actions)
            }

            // Fallback outcomes
            (Self::ApiFallback { mut pending, replays }, Event::FallbackCompleted { chat_id, .. }) => {
                pending.remove(&chat_id);
                let mut actions = vec![Action::SetStatus {
                    chat_id,
                    status: SyncStatus::InSync,
                }];
                (finish(pending, replays, &mut actions), actions)
            }
            (Self::ApiFallback { mut pending, replays }, Event::FallbackAbandoned { chat_id, error }) => {
                pending.remove(&chat_id);
                let mut actions = vec![
                    Action::SetStatus {
                        chat_id,
                        status: SyncStatus::MayBeOutOfSync,
                    },
                    Action::EmitEvent(CoordinatorEvent::FallbackAbandoned { chat_id, error }),
                ];
                (finish(pending, replays, &mut actions), actions)
            }
            (state @ (Self::Recovering { .. } | Self::Subscribed), Event::FallbackCompleted { chat_id, .. }) => (
                state,
                vec![Action::SetStatus {
                    chat_id,
                    status: SyncStatus::InSync,
                }],
            ),
            (state @ (Self::Recovering { .. } | Self::Subscribed), Event::FallbackAbandoned { chat_id, error }) => (
                state,
                vec![
                    Action::SetStatus {
                        chat_id,
                        status: SyncStatus::MayBeOutOfSync,
                    },
                    Action::EmitEvent(CoordinatorEvent::FallbackAbandoned { chat_id, error }),
                ],
            ),
            (
                state @ (Self::Recovering { .. } | Self::ApiFallback { .. } | Self::Subscribed),
                Event::FallbackExhausted { chat_id },
            ) => (
                state,
                vec![Action::SetStatus {
                    chat_id,
                    status: SyncStatus::MayBeOutOfSync,
                }],
            ),

            // Gap in live traffic
            (Self::ApiFallback { pending, replays }, Event::GapDetected { chat_id })
                if pending.contains(&chat_id) =>
            {
                (Self::ApiFallback { pending, replays }, vec![])
            }
            (
                state @ (Self::Recovering { .. } | Self::ApiFallback { .. } | Self::Subscribed),
                Event::GapDetected { chat_id },
            ) => (
                state,
                vec![
                    Action::SetStatus {
                        chat_id,
                        status: SyncStatus::Recovering,
                    },
                    Action::StartFallback { chat_id },
                ],
            ),

            // Invalid transitions - stay in current state
            (state, _) => (state, vec![]),
        }
    }

    /// Whether the subscription has been acknowledged.
    pub fn is_online(&self) -> bool {
        matches!(
            self,
            Self::Recovering { .. } | Self::ApiFallback { .. } | Self::Subscribed
        )
    }

    /// Whether the transport should be read.
    pub fn has_transport(&self) -> bool {
        matches!(self, Self::Connected { .. } | Self::Subscribing { .. }) || self.is_online()
    }

    /// Short state name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Disconnected { .. } => "disconnected",
            Self::Connecting { .. } => "connecting",
            Self::Connected { .. } => "connected",
            Self::Subscribing { .. } => "subscribing",
            Self::Recovering { .. } => "recovering",
            Self::ApiFallback { .. } => "api_fallback",
            Self::Subscribed => "subscribed",
            Self::Stopped => "stopped",
        }
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

fn retry_later(attempt: u32, error: String, policy: &RetryPolicy) -> (ConnectionState, Vec<Action>) {
    let next = attempt.saturating_add(1);
    let mut actions = vec![
        Action::CancelAttemptTimer,
        Action::CloseTransport,
        Action::EmitEvent(CoordinatorEvent::ConnectionFailed {
            attempt: next,
            error,
        }),
    ];
    if policy.is_exhausted(next) {
        actions.push(Action::EmitEvent(CoordinatorEvent::GaveUp { attempts: next }));
    } else {
        actions.push(Action::StartRetryTimer {
            delay: policy.delay_for(next),
        });
    }
    (ConnectionState::Disconnected { attempt: next }, actions)
}

fn settle(sessions: Vec<RecoverySession>) -> (ConnectionState, Vec<Action>) {
    let mut actions = vec![Action::CancelAttemptTimer];
    let mut pending = BTreeSet::new();
    let mut replays = BTreeMap::new();

    for session in sessions {
        let chat_id = session.chat_id;
        if session.needs_fallback() {
            pending.insert(chat_id);
            actions.push(Action::SetStatus {
                chat_id,
                status: SyncStatus::Recovering,
            });
            actions.push(Action::StartFallback { chat_id });
        } else if session.awaits_replay() {
            replays.insert(chat_id, session.replayed);
            actions.push(Action::SetStatus {
                chat_id,
                status: SyncStatus::Recovering,
            });
        } else if session.outcome == RecoveryOutcome::RecoveredViaBroker {
            actions.push(Action::SetStatus {
                chat_id,
                status: SyncStatus::InSync,
            });
        }
        actions.push(Action::EmitEvent(CoordinatorEvent::Recovery { session }));
    }

    let state = finish(pending, replays, &mut actions);
    (state, actions)
}

fn count_replay(replays: &mut BTreeMap<ChatId, u32>, chat_id: ChatId, actions: &mut Vec<Action>) {
    if let Some(remaining) = replays.get_mut(&chat_id) {
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            replays.remove(&chat_id);
            actions.push(Action::SetStatus {
                chat_id,
                status: SyncStatus::InSync,
            });
        }
    }
}

fn finish(
    pending: BTreeSet<ChatId>,
    replays: BTreeMap<ChatId, u32>,
    actions: &mut Vec<Action>,
) -> ConnectionState {
    if !pending.is_empty() {
        ConnectionState::ApiFallback { pending, replays }
    } else if !replays.is_empty() {
        ConnectionState::Recovering { replays }
    } else {
        actions.push(Action::EmitEvent(CoordinatorEvent::Subscribed));
        ConnectionState::Subscribed
    }
}

/// Events that drive the recovery lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Begin connecting.
    Start,
    /// Backoff delay elapsed.
    RetryTimerFired,
    /// Transport connected.
    ConnectSucceeded,
    /// Transport connect failed.
    ConnectFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// Subscribe frame written to the transport.
    SubscribeSent,
    /// Subscribe ack received and interpreted.
    SubscribeAcked {
        /// One session per requested chat channel.
        sessions: Vec<RecoverySession>,
    },
    /// Subscribe could not be sent or was rejected as a whole.
    SubscribeFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// Per-cycle deadline elapsed before the subscription settled.
    AttemptTimedOut,
    /// A publication arrived on a chat channel after the ack.
    ReplayReceived {
        /// Chat the publication belongs to.
        chat_id: ChatId,
    },
    /// Live traffic skipped past the contiguous point.
    GapDetected {
        /// Chat with the gap.
        chat_id: ChatId,
    },
    /// A fallback loop drained the sync endpoint.
    FallbackCompleted {
        /// Chat that caught up.
        chat_id: ChatId,
        /// Highest `seq_num` covered by the fallback.
        through: SeqNum,
    },
    /// A fallback loop passed the retry ceiling and keeps retrying.
    FallbackExhausted {
        /// Chat that may be stale.
        chat_id: ChatId,
    },
    /// A fallback loop hit a non-retryable error and stopped.
    FallbackAbandoned {
        /// Chat that may be stale.
        chat_id: ChatId,
        /// Error message describing the failure.
        error: String,
    },
    /// Transport closed or failed.
    TransportLost {
        /// Reason for disconnection.
        reason: String,
    },
    /// Shut down the coordinator.
    StopRequested,
}

/// Actions to be executed by seq-client.
///
/// These are instructions, not side effects. seq-client interprets these and
/// performs the actual I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Open the broker transport.
    Connect,
    /// Send a subscribe frame with persisted cursors as resume offsets.
    Subscribe,
    /// Arm the per-cycle deadline.
    StartAttemptTimer,
    /// Disarm the per-cycle deadline.
    CancelAttemptTimer,
    /// Arm the reconnect timer.
    StartRetryTimer {
        /// Delay before reconnecting.
        delay: Duration,
    },
    /// Disarm the reconnect timer.
    CancelRetryTimer,
    /// Start a sync-endpoint catch-up loop for a chat.
    StartFallback {
        /// Chat to catch up.
        chat_id: ChatId,
    },
    /// Abort every running catch-up loop.
    CancelFallbacks,
    /// Close the broker transport.
    CloseTransport,
    /// Publish a per-chat status.
    SetStatus {
        /// Chat the status is about.
        chat_id: ChatId,
        /// New status.
        status: SyncStatus,
    },
    /// Emit an event to the application.
    EmitEvent(CoordinatorEvent),
}

/// Events emitted to the application layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorEvent {
    /// Transport connected.
    Connected,
    /// Subscription settled; only live traffic from now on.
    Subscribed,
    /// Broker verdict for one chat.
    Recovery {
        /// The recovery session for that chat.
        session: RecoverySession,
    },
    /// Connection cycle failed.
    ConnectionFailed {
        /// Consecutive failures so far.
        attempt: u32,
        /// Error message describing the failure.
        error: String,
    },
    /// Transport lost after the subscription settled.
    Disconnected {
        /// Reason for disconnection.
        reason: String,
    },
    /// Retry policy exhausted; no further reconnects until restarted.
    GaveUp {
        /// Consecutive failures.
        attempts: u32,
    },
    /// A chat's fallback stopped on a non-retryable error.
    FallbackAbandoned {
        /// Chat that may be stale.
        chat_id: ChatId,
        /// Error message describing the failure.
        error: String,
    },
}
