//! Recovery coordinator: runs the connection state machine against real I/O.
//!
//! One task owns the [`ConnectionState`] and is its only writer. Everything
//! that can happen, such as frames from the broker, timer expiries, connect
//! results and fallback outcomes, arrives on that task's inbox or transport
//! and is turned into an [`Event`]. The actions the state machine returns are
//! executed here. Timers and connect attempts carry the cycle they belong to,
//! and fallback loops a generation, so results from an abandoned cycle are
//! dropped instead of being applied to a newer one.

use crate::api::{ApiClientError, ChatApi};
use crate::config::ClientConfig;
use crate::merge::Merger;
use crate::transport::BrokerTransport;
use seq_core::{
    Action, ConnectionState, CoordinatorEvent, Event, GapTracker, RecoverySession, RetryPolicy, SyncStatus,
};
use seq_types::{Channel, ChatId, ClientFrame, Publication, SeqNum, ServerFrame, SubscribeAck, SubscribeRequest, UserId};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Inbox depth for timer, connect and fallback results.
const INBOX_CAPACITY: usize = 64;

/// Event fan-out buffer.
const EVENT_BUFFER: usize = 256;

/// Coordinator errors.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// The coordinator task is gone.
    #[error("coordinator stopped")]
    Stopped,

    /// The coordinator task panicked or was cancelled.
    #[error("coordinator task failed: {0}")]
    Task(String),
}

/// What the coordinator needs to know about its environment.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Broker WebSocket URL.
    pub broker_url: String,
    /// Chats to keep in sync.
    pub chats: Vec<ChatId>,
    /// Local user.
    pub user_id: UserId,
    /// Also subscribe to `user:{user_id}` and forward its publications.
    pub notifications: bool,
    /// Backoff for reconnects and fallback pages.
    pub policy: RetryPolicy,
    /// Consecutive fallback failures before a chat is flagged.
    pub fallback_ceiling: u32,
    /// Fallback page size.
    pub page_size: u32,
}

impl CoordinatorSettings {
    /// Settings from a client configuration.
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            broker_url: config.broker_url(),
            chats: config.chats.clone(),
            user_id: config.user_id,
            notifications: config.notifications,
            policy: config.retry.policy(),
            fallback_ceiling: config.retry.fallback_ceiling,
            page_size: config.page_size,
        }
    }
}

/// Handle to a running coordinator.
#[derive(Debug)]
pub struct CoordinatorHandle {
    shutdown: Option<oneshot::Sender<()>>,
    state: watch::Receiver<ConnectionState>,
    status: watch::Receiver<BTreeMap<ChatId, SyncStatus>>,
    events: broadcast::Sender<CoordinatorEvent>,
    notifications: broadcast::Sender<Publication>,
    task: JoinHandle<()>,
}

impl CoordinatorHandle {
    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Watch the connection state.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Watch per-chat sync status.
    pub fn watch_status(&self) -> watch::Receiver<BTreeMap<ChatId, SyncStatus>> {
        self.status.clone()
    }

    /// Current status of one chat.
    pub fn status(&self, chat_id: &ChatId) -> Option<SyncStatus> {
        self.status.borrow().get(chat_id).copied()
    }

    /// Lifecycle events from now on.
    pub fn events(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    /// Publications from the user notification channel.
    pub fn notifications(&self) -> broadcast::Receiver<Publication> {
        self.notifications.subscribe()
    }

    /// Wait until the connection state satisfies `predicate`.
    pub async fn wait_for_state<F>(&self, predicate: F) -> Result<ConnectionState, CoordinatorError>
    where
        F: FnMut(&ConnectionState) -> bool,
    {
        let mut state = self.state.clone();
        let matched = state
            .wait_for(predicate)
            .await
            .map_err(|_| CoordinatorError::Stopped)?;
        Ok(matched.clone())
    }

    /// Stop the coordinator and wait for it to wind down.
    pub async fn shutdown(mut self) -> Result<(), CoordinatorError> {
        if let Some(shutdown) = self.shutdown.take() {
            // The task may already be gone; joining reports that.
            let _ = shutdown.send(());
        }
        (&mut self.task)
            .await
            .map_err(|e| CoordinatorError::Task(e.to_string()))
    }
}

enum Inbox {
    Core(Event),
    Connected { cycle: u64, result: Result<(), String> },
    AttemptTimeout { cycle: u64 },
    Fallback { generation: u64, event: Event },
}

enum Step {
    Stop,
    Inbox(Inbox),
    Frame(Result<ServerFrame, crate::transport::TransportError>),
}

/// The coordinator loop. Create it with [`RecoveryCoordinator::spawn`].
pub struct RecoveryCoordinator<T, A> {
    settings: CoordinatorSettings,
    transport: Arc<T>,
    api: Arc<A>,
    merger: Arc<Merger>,
    state: ConnectionState,
    inbox_tx: mpsc::Sender<Inbox>,
    inbox_rx: mpsc::Receiver<Inbox>,
    cycle: u64,
    connect_task: Option<JoinHandle<()>>,
    attempt_timer: Option<JoinHandle<()>>,
    retry_timer: Option<JoinHandle<()>>,
    fallbacks: HashMap<ChatId, JoinHandle<()>>,
    fallback_generation: u64,
    gaps: HashMap<ChatId, GapTracker>,
    requested: HashMap<ChatId, Option<SeqNum>>,
    state_tx: watch::Sender<ConnectionState>,
    status_tx: watch::Sender<BTreeMap<ChatId, SyncStatus>>,
    events_tx: broadcast::Sender<CoordinatorEvent>,
    notifications_tx: broadcast::Sender<Publication>,
}

impl<T, A> RecoveryCoordinator<T, A>
where
    T: BrokerTransport + 'static,
    A: ChatApi + 'static,
{
    /// Start a coordinator task. Must be called inside a Tokio runtime.
    pub fn spawn(settings: CoordinatorSettings, transport: Arc<T>, api: Arc<A>, merger: Arc<Merger>) -> CoordinatorHandle {
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::new());
        let initial = settings
            .chats
            .iter()
            .map(|chat| (*chat, SyncStatus::InSync))
            .collect();
        let (status_tx, status_rx) = watch::channel(initial);
        let (events_tx, _) = broadcast::channel(EVENT_BUFFER);
        let (notifications_tx, _) = broadcast::channel(EVENT_BUFFER);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let coordinator = Self {
            settings,
            transport,
            api,
            merger,
            state: ConnectionState::new(),
            inbox_tx,
            inbox_rx,
            cycle: 0,
            connect_task: None,
            attempt_timer: None,
            retry_timer: None,
            fallbacks: HashMap::new(),
            fallback_generation: 0,
            gaps: HashMap::new(),
            requested: HashMap::new(),
            state_tx,
            status_tx,
            events_tx: events_tx.clone(),
            notifications_tx: notifications_tx.clone(),
        };
        let task = tokio::spawn(coordinator.run(shutdown_rx));

        CoordinatorHandle {
            shutdown: Some(shutdown_tx),
            state: state_rx,
            status: status_rx,
            events: events_tx,
            notifications: notifications_tx,
            task,
        }
    }

    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        tracing::info!(chats = self.settings.chats.len(), "recovery coordinator started");
        self.dispatch(Event::Start).await;

        while self.state != ConnectionState::Stopped {
            let reading = self.state.has_transport();
            let step = tokio::select! {
                biased;
                _ = &mut shutdown => Step::Stop,
                Some(message) = self.inbox_rx.recv() => Step::Inbox(message),
                frame = self.transport.recv(), if reading => Step::Frame(frame),
                else => Step::Stop,
            };

            match step {
                Step::Stop => self.dispatch(Event::StopRequested).await,
                Step::Inbox(message) => self.handle_inbox(message).await,
                Step::Frame(Ok(frame)) => self.handle_frame(frame).await,
                Step::Frame(Err(e)) => {
                    self.dispatch(Event::TransportLost { reason: e.to_string() })
                        .await
                }
            }
        }

        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        tracing::info!("recovery coordinator stopped");
    }

    /// Feed one event to the state machine and run everything it asks for.
    async fn dispatch(&mut self, event: Event) {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            let before = self.state.name();
            let (next, actions) = std::mem::take(&mut self.state).on_event(event, &self.settings.policy);
            self.state = next;
            if before != self.state.name() {
                tracing::debug!(from = before, to = self.state.name(), "state transition");
            }
            self.state_tx.send_replace(self.state.clone());

            for action in actions {
                if let Some(follow_up) = self.execute(action).await {
                    queue.push_back(follow_up);
                }
            }
        }
    }

    async fn execute(&mut self, action: Action) -> Option<Event> {
        match action {
            Action::StartAttemptTimer => {
                self.cycle += 1;
                let cycle = self.cycle;
                let timeout = self.settings.policy.attempt_timeout;
                let inbox = self.inbox_tx.clone();
                replace_task(
                    &mut self.attempt_timer,
                    tokio::spawn(async move {
                        tokio::time::sleep(timeout).await;
                        let _ = inbox.send(Inbox::AttemptTimeout { cycle }).await;
                    }),
                );
            }
            Action::CancelAttemptTimer => cancel_task(&mut self.attempt_timer),
            Action::Connect => {
                let cycle = self.cycle;
                let url = self.settings.broker_url.clone();
                let transport = Arc::clone(&self.transport);
                let inbox = self.inbox_tx.clone();
                replace_task(
                    &mut self.connect_task,
                    tokio::spawn(async move {
                        let result = transport.connect(&url).await.map_err(|e| e.to_string());
                        let _ = inbox.send(Inbox::Connected { cycle, result }).await;
                    }),
                );
            }
            Action::Subscribe => return Some(self.subscribe().await),
            Action::StartRetryTimer { delay } => {
                tracing::debug!(?delay, "reconnect scheduled");
                let inbox = self.inbox_tx.clone();
                replace_task(
                    &mut self.retry_timer,
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = inbox.send(Inbox::Core(Event::RetryTimerFired)).await;
                    }),
                );
            }
            Action::CancelRetryTimer => cancel_task(&mut self.retry_timer),
            Action::StartFallback { chat_id } => self.start_fallback(chat_id).await,
            Action::CancelFallbacks => {
                for (_, task) in self.fallbacks.drain() {
                    task.abort();
                }
                self.fallback_generation += 1;
            }
            Action::CloseTransport => {
                cancel_task(&mut self.connect_task);
                if let Err(e) = self.transport.close().await {
                    tracing::debug!(error = %e, "transport close failed");
                }
            }
            Action::SetStatus { chat_id, status } => {
                let changed = self.status_tx.send_if_modified(|statuses| {
                    statuses.insert(chat_id, status) != Some(status)
                });
                if changed {
                    match status {
                        SyncStatus::MayBeOutOfSync => {
                            tracing::warn!(%chat_id, "chat may be out of sync")
                        }
                        _ => tracing::debug!(%chat_id, ?status, "sync status"),
                    }
                }
            }
            Action::EmitEvent(event) => {
                log_event(&event);
                // No subscribers is fine.
                let _ = self.events_tx.send(event);
            }
        }
        None
    }

    async fn subscribe(&mut self) -> Event {
        self.requested.clear();
        let mut subscriptions = Vec::with_capacity(self.settings.chats.len() + 1);

        for chat_id in self.settings.chats.clone() {
            let offset = match self.merger.cursor_store().lookup(&chat_id).await {
                Ok(offset) => offset,
                Err(e) => {
                    return Event::SubscribeFailed {
                        error: format!("cursor lookup: {e}"),
                    }
                }
            };
            self.requested.insert(chat_id, offset);
            subscriptions.push(SubscribeRequest {
                channel: Channel::Chat(chat_id),
                offset: offset.map(|seq| seq.value()),
                recover: offset.is_some(),
            });
        }
        if self.settings.notifications {
            subscriptions.push(SubscribeRequest {
                channel: Channel::User(self.settings.user_id),
                offset: None,
                recover: false,
            });
        }

        match self.transport.send(ClientFrame::Subscribe { subscriptions }).await {
            Ok(()) => Event::SubscribeSent,
            Err(e) => Event::SubscribeFailed { error: e.to_string() },
        }
    }

    async fn handle_inbox(&mut self, message: Inbox) {
        match message {
            Inbox::Core(event) => self.dispatch(event).await,
            Inbox::Connected { cycle, result } if cycle == self.cycle => {
                self.connect_task = None;
                let event = match result {
                    Ok(()) => Event::ConnectSucceeded,
                    Err(error) => Event::ConnectFailed { error },
                };
                self.dispatch(event).await;
            }
            Inbox::AttemptTimeout { cycle } if cycle == self.cycle => {
                self.attempt_timer = None;
                self.dispatch(Event::AttemptTimedOut).await;
            }
            Inbox::Connected { .. } | Inbox::AttemptTimeout { .. } => {
                tracing::trace!("dropping result of an abandoned cycle");
            }
            Inbox::Fallback { generation, event } if generation == self.fallback_generation => {
                match &event {
                    Event::FallbackCompleted { chat_id, through } => {
                        self.fallbacks.remove(chat_id);
                        let settled = match self.gaps.get_mut(chat_id) {
                            Some(tracker) => {
                                tracker.acknowledge_up_to(*through);
                                tracker.contiguous()
                            }
                            None => *through,
                        };
                        // Live traffic applied during the fallback is covered now.
                        if let Err(e) = self.merger.settle(chat_id, settled).await {
                            tracing::warn!(%chat_id, %settled, error = %e, "failed to persist cursor");
                        }
                    }
                    Event::FallbackAbandoned { chat_id, .. } => {
                        self.fallbacks.remove(chat_id);
                    }
                    _ => {}
                }
                self.dispatch(event).await;
            }
            Inbox::Fallback { .. } => {
                tracing::trace!("dropping result of a cancelled fallback");
            }
        }
    }

    async fn handle_frame(&mut self, frame: ServerFrame) {
        match frame {
            ServerFrame::SubscribeAck { acks } => self.handle_acks(acks).await,
            ServerFrame::Publication {
                channel: Channel::Chat(chat_id),
                publication,
                ..
            } if self.requested.contains_key(&chat_id) => self.apply_live(chat_id, publication).await,
            ServerFrame::Publication {
                channel: Channel::User(_),
                publication,
                ..
            } => {
                let _ = self.notifications_tx.send(publication);
            }
            ServerFrame::Publication { channel, .. } => {
                tracing::debug!(%channel, "publication for an unknown channel");
            }
            ServerFrame::Pong => tracing::trace!("pong"),
            ServerFrame::Error { message } => {
                self.dispatch(Event::TransportLost { reason: message }).await
            }
        }
    }

    async fn handle_acks(&mut self, acks: Vec<SubscribeAck>) {
        if !matches!(self.state, ConnectionState::Subscribing { .. }) {
            tracing::debug!(state = self.state.name(), "ignoring unexpected subscribe ack");
            return;
        }

        let mut sessions = Vec::new();
        for ack in acks {
            if let Some(error) = &ack.error {
                tracing::warn!(channel = %ack.channel, %error, "subscription refused");
            }
            let Channel::Chat(chat_id) = ack.channel else {
                continue;
            };
            let Some(&requested) = self.requested.get(&chat_id) else {
                continue;
            };

            let start = match requested {
                Some(offset) => offset,
                // Fresh subscribe: resume from here next time.
                None if ack.error.is_none() => {
                    match self
                        .merger
                        .cursor_store()
                        .ensure(&chat_id, SeqNum::new(ack.head))
                        .await
                    {
                        Ok(seq) => seq,
                        Err(e) => {
                            tracing::warn!(%chat_id, error = %e, "could not create cursor");
                            SeqNum::new(ack.head)
                        }
                    }
                }
                None => SeqNum::zero(),
            };
            self.gaps.insert(chat_id, GapTracker::with_cursor(start));

            let session = RecoverySession::from_ack(chat_id, requested, &ack);
            tracing::debug!(
                %chat_id,
                offset = ?requested,
                outcome = ?session.outcome,
                replayed = session.replayed,
                "subscription acknowledged"
            );
            sessions.push(session);
        }

        self.dispatch(Event::SubscribeAcked { sessions }).await;
    }

    async fn apply_live(&mut self, chat_id: ChatId, publication: Publication) {
        let seq = publication.seq_num;
        let tracker = self
            .gaps
            .entry(chat_id)
            .or_insert_with(|| GapTracker::with_cursor(SeqNum::new(seq.value().saturating_sub(1))));
        // An unfilled range below `seq` keeps the durable cursor where it is.
        let durable = tracker.contiguous_with(seq);
        if let Err(e) = self.merger.apply_bounded(publication.data, durable).await {
            // Not delivered; reconnecting resumes from the durable cursor.
            tracing::warn!(%chat_id, %seq, error = %e, "failed to persist cursor");
            self.dispatch(Event::TransportLost {
                reason: format!("cursor store: {e}"),
            })
            .await;
            return;
        }

        self.dispatch(Event::ReplayReceived { chat_id }).await;

        let tracker = self
            .gaps
            .entry(chat_id)
            .or_insert_with(|| GapTracker::with_cursor(durable));
        tracker.received(seq);
        if tracker.has_gaps() && self.state.is_online() && !self.fallbacks.contains_key(&chat_id) {
            tracing::debug!(
                %chat_id,
                contiguous = %tracker.contiguous(),
                highest = %tracker.highest(),
                "gap in live traffic"
            );
            self.dispatch(Event::GapDetected { chat_id }).await;
        }
    }

    async fn start_fallback(&mut self, chat_id: ChatId) {
        if self.fallbacks.get(&chat_id).is_some_and(|task| !task.is_finished()) {
            return;
        }

        let cursor = self.merger.cursor(&chat_id).await.unwrap_or_default();
        let from = self
            .gaps
            .get(&chat_id)
            .map_or(cursor, |tracker| tracker.contiguous().min(cursor));

        tracing::info!(%chat_id, after = %from, "starting fallback sync");
        let fallback = Fallback {
            chat_id,
            api: Arc::clone(&self.api),
            merger: Arc::clone(&self.merger),
            policy: self.settings.policy,
            ceiling: self.settings.fallback_ceiling.max(1),
            page_size: self.settings.page_size.max(1),
            inbox: self.inbox_tx.clone(),
            generation: self.fallback_generation,
        };
        self.fallbacks.insert(chat_id, tokio::spawn(fallback.run(from)));
    }
}

/// One chat's sync-endpoint catch-up loop.
struct Fallback<A> {
    chat_id: ChatId,
    api: Arc<A>,
    merger: Arc<Merger>,
    policy: RetryPolicy,
    ceiling: u32,
    page_size: u32,
    inbox: mpsc::Sender<Inbox>,
    generation: u64,
}

impl<A: ChatApi> Fallback<A> {
    /// Pages are fetched and applied strictly one after another.
    async fn run(self, from: SeqNum) {
        let chat_id = self.chat_id;
        let mut after = from;
        let mut failures: u32 = 0;

        loop {
            let result = tokio::time::timeout(
                self.policy.attempt_timeout,
                self.api.sync(&chat_id, after, self.page_size),
            )
            .await
            .unwrap_or(Err(ApiClientError::Timeout));

            let error = match result {
                Ok(page) => match self.apply_page(&page.messages, &mut after).await {
                    Ok(()) if page.has_more => {
                        failures = 0;
                        continue;
                    }
                    Ok(()) => {
                        tracing::info!(%chat_id, through = %after, "fallback sync complete");
                        self.report(Event::FallbackCompleted { chat_id, through: after })
                            .await;
                        return;
                    }
                    Err(error) => error,
                },
                Err(e) if !e.is_retryable() => {
                    tracing::warn!(%chat_id, error = %e, "fallback sync abandoned");
                    self.report(Event::FallbackAbandoned {
                        chat_id,
                        error: e.to_string(),
                    })
                    .await;
                    return;
                }
                Err(e) => e.to_string(),
            };

            failures = failures.saturating_add(1);
            if failures == self.ceiling {
                tracing::warn!(%chat_id, failures, error = %error, "fallback sync keeps failing");
                self.report(Event::FallbackExhausted { chat_id }).await;
            } else {
                tracing::debug!(%chat_id, failures, error = %error, "fallback page failed; retrying");
            }
            tokio::time::sleep(self.policy.delay_for(failures)).await;
        }
    }

    async fn apply_page(&self, messages: &[seq_types::ChatMessage], after: &mut SeqNum) -> Result<(), String> {
        for message in messages {
            let seq = message.seq_num;
            self.merger
                .apply(message.clone())
                .await
                .map_err(|e| format!("cursor store: {e}"))?;
            *after = (*after).max(seq);
        }
        Ok(())
    }

    async fn report(&self, event: Event) {
        // The coordinator may be shutting down.
        let _ = self
            .inbox
            .send(Inbox::Fallback {
                generation: self.generation,
                event,
            })
            .await;
    }
}

fn replace_task(slot: &mut Option<JoinHandle<()>>, task: JoinHandle<()>) {
    if let Some(previous) = slot.replace(task) {
        previous.abort();
    }
}

fn cancel_task(slot: &mut Option<JoinHandle<()>>) {
    if let Some(task) = slot.take() {
        task.abort();
    }
}

fn log_event(event: &CoordinatorEvent) {
    match event {
        CoordinatorEvent::Connected => tracing::info!("connected to broker"),
        CoordinatorEvent::Subscribed => tracing::info!("subscribed; live traffic only"),
        CoordinatorEvent::Recovery { session } => tracing::info!(
            chat_id = %session.chat_id,
            outcome = ?session.outcome,
            replayed = session.replayed,
            "recovery outcome"
        ),
        CoordinatorEvent::ConnectionFailed { attempt, error } => {
            tracing::warn!(attempt, %error, "connection attempt failed")
        }
        CoordinatorEvent::Disconnected { reason } => tracing::warn!(%reason, "disconnected"),
        CoordinatorEvent::GaveUp { attempts } => {
            tracing::error!(attempts, "giving up on reconnecting")
        }
        CoordinatorEvent::FallbackAbandoned { chat_id, error } => {
            tracing::warn!(%chat_id, %error, "fallback abandoned")
        }
    }
}
