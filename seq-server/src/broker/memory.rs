//! In-process broker with bounded per-channel history.

use super::{Broker, BrokerError, Delivery, Subscription};
use crate::config::BrokerConfig;
use async_trait::async_trait;
use seq_types::{Channel, Publication, SubscribeAck, SubscribeRequest};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

struct ChannelState {
    /// Retained publications by position.
    history: BTreeMap<u64, (Instant, Publication)>,
    /// Highest position published.
    head: u64,
    /// Positions at or below this were never seen by this broker instance.
    floor: Option<u64>,
    /// Highest position dropped from history.
    evicted_through: u64,
    sender: broadcast::Sender<Delivery>,
}

impl ChannelState {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            history: BTreeMap::new(),
            head: 0,
            floor: None,
            evicted_through: 0,
            sender,
        }
    }

    fn record(&mut self, position: u64, at: Instant, publication: Publication) {
        self.floor = match self.floor {
            None => Some(position - 1),
            Some(floor) if position == floor => Some(floor - 1),
            keep => keep,
        };
        self.history.insert(position, (at, publication));
        self.head = self.head.max(position);
    }

    fn evict(&mut self, max_events: usize, max_age: Duration, now: Instant) -> usize {
        let mut evicted = 0;
        while self.history.len() > max_events {
            if let Some((position, _)) = self.history.pop_first() {
                self.evicted_through = self.evicted_through.max(position);
                evicted += 1;
            }
        }
        while let Some((&position, (at, _))) = self.history.first_key_value() {
            if now.saturating_duration_since(*at) <= max_age {
                break;
            }
            self.history.pop_first();
            self.evicted_through = self.evicted_through.max(position);
            evicted += 1;
        }
        evicted
    }

    /// Complete replay after `offset` is possible iff this broker saw
    /// everything after `offset` and evicted none of it.
    fn can_recover(&self, offset: u64) -> bool {
        self.floor.is_some_and(|floor| offset >= floor) && offset >= self.evicted_through
    }
}

/// In-process broker.
///
/// All channel state sits behind one mutex. Subscribing snapshots history and
/// attaches to the live feed under that lock, and publishing records history
/// and sends live under it too, so a new subscriber sees each publication
/// exactly once: either in its replay or on its live feed.
pub struct MemoryBroker {
    max_events: usize,
    max_age: Duration,
    capacity: usize,
    channels: Mutex<HashMap<Channel, ChannelState>>,
    closed: AtomicBool,
}

impl MemoryBroker {
    /// Create a broker with the configured history bounds.
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            max_events: config.history_size,
            max_age: config.history_ttl(),
            capacity: config.channel_capacity.max(1),
            channels: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Stop accepting publications.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<Channel, ChannelState>> {
        self.channels.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("max_events", &self.max_events)
            .field("max_age", &self.max_age)
            .field("channels", &self.channel_count())
            .finish()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(
        &self,
        channel: Channel,
        position: Option<u64>,
        publication: Publication,
    ) -> Result<u64, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }

        let now = Instant::now();
        let mut channels = self.channels();
        let state = channels
            .entry(channel)
            .or_insert_with(|| ChannelState::new(self.capacity));

        let position = position.unwrap_or(state.head + 1);
        if position == 0 {
            return Err(BrokerError::Rejected {
                channel,
                reason: "position 0 is reserved".into(),
            });
        }

        state.record(position, now, publication.clone());
        state.evict(self.max_events, self.max_age, now);

        // No receivers is not an error: history still serves later subscribers.
        let _ = state.sender.send(Delivery {
            channel,
            offset: position,
            publication,
        });

        Ok(position)
    }

    async fn subscribe(&self, request: &SubscribeRequest) -> Result<Subscription, BrokerError> {
        let now = Instant::now();
        let mut channels = self.channels();
        let state = channels
            .entry(request.channel)
            .or_insert_with(|| ChannelState::new(self.capacity));

        state.evict(self.max_events, self.max_age, now);
        let live = state.sender.subscribe();

        let (recovered, replay) = match (request.recover, request.offset) {
            (true, Some(offset)) if state.can_recover(offset) => {
                let replay: Vec<Delivery> = state
                    .history
                    .range(offset.saturating_add(1)..)
                    .map(|(&position, (_, publication))| Delivery {
                        channel: request.channel,
                        offset: position,
                        publication: publication.clone(),
                    })
                    .collect();
                (true, replay)
            }
            _ => (false, Vec::new()),
        };

        Ok(Subscription {
            ack: SubscribeAck {
                channel: request.channel,
                recovered,
                replayed: replay.len() as u32,
                head: state.head,
                error: None,
            },
            replay,
            live,
        })
    }

    async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut channels = self.channels();
        let mut evicted = 0;
        for state in channels.values_mut() {
            evicted += state.evict(self.max_events, self.max_age, now);
        }
        // Forgetting an idle channel only makes its next recovery fall back.
        channels.retain(|_, state| !state.history.is_empty() || state.sender.receiver_count() > 0);
        evicted
    }

    fn channel_count(&self) -> usize {
        self.channels().len()
    }
}
