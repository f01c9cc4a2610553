//! Broker channels: fan-out with bounded replay history.
//!
//! A channel fans publications out to its current subscribers in publish
//! order and keeps a bounded history, `(max_events, max_age)`, from which a
//! subscriber can ask for replay after a position. The subscribe answer says
//! whether that replay is complete (`recovered`).
//!
//! History is a performance optimization only. The sequence store stays
//! authoritative, and a client told `recovered = false` catches up from it.

mod memory;

pub use memory::MemoryBroker;

use async_trait::async_trait;
use seq_types::{Channel, Publication, ServerFrame, SubscribeAck, SubscribeRequest};
use tokio::sync::broadcast;

/// One publication at a position on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Channel it was published on.
    pub channel: Channel,
    /// Position on that channel.
    pub offset: u64,
    /// The event.
    pub publication: Publication,
}

impl Delivery {
    /// Wire frame for this delivery.
    pub fn to_frame(&self) -> ServerFrame {
        ServerFrame::Publication {
            channel: self.channel,
            offset: self.offset,
            publication: self.publication.clone(),
        }
    }
}

/// A fresh subscription: the ack, the replay that follows it, and the live
/// feed that continues after the replay without overlap or hole.
#[derive(Debug)]
pub struct Subscription {
    /// Subscribe answer.
    pub ack: SubscribeAck,
    /// Publications after the requested offset, ascending. Empty unless recovered.
    pub replay: Vec<Delivery>,
    /// Live publications from the moment of subscribing.
    pub live: broadcast::Receiver<Delivery>,
}

/// Broker errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// The broker no longer accepts publications.
    #[error("broker is shut down")]
    Closed,
    /// Publication rejected.
    #[error("publish rejected on {channel}: {reason}")]
    Rejected {
        /// Target channel.
        channel: Channel,
        /// Why.
        reason: String,
    },
}

/// Trait for broker backends.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish on a channel.
    ///
    /// `position` pins the broker position (chat channels use `seq_num`);
    /// `None` takes the next position of the channel. Returns the position used.
    async fn publish(
        &self,
        channel: Channel,
        position: Option<u64>,
        publication: Publication,
    ) -> Result<u64, BrokerError>;

    /// Join a channel, optionally replaying from `request.offset`.
    async fn subscribe(&self, request: &SubscribeRequest) -> Result<Subscription, BrokerError>;

    /// Drop history older than `max_age`. Returns the number of evicted publications.
    async fn sweep(&self) -> usize;

    /// Number of channels with state.
    fn channel_count(&self) -> usize;
}
