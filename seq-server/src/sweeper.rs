//! Background sweeper for broker history and limiter state.
//!
//! Publishing evicts history on the channel it touches; idle channels are
//! only aged out here. Each pass also drops channels nobody listens to and
//! shrinks the append limiter.

use crate::broker::Broker;
use crate::config::SweeperConfig;
use crate::limits::RateLimits;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

/// Spawn the sweeper task.
///
/// Returns a handle that can be used to abort the task.
pub fn spawn_sweeper(
    broker: Arc<dyn Broker>,
    rate_limits: RateLimits,
    config: SweeperConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if !config.enabled {
            tracing::info!("Sweeper disabled");
            return;
        }

        let interval_secs = config.interval_secs.max(1);
        tracing::info!("Sweeper started (interval: {}s)", interval_secs);

        let mut timer = interval(Duration::from_secs(interval_secs));

        loop {
            timer.tick().await;
            sweep_once(broker.as_ref(), &rate_limits).await;
        }
    })
}

/// Run one sweep pass. Returns the number of evicted publications.
pub async fn sweep_once(broker: &dyn Broker, rate_limits: &RateLimits) -> usize {
    let evicted = broker.sweep().await;
    rate_limits.shrink();

    if evicted > 0 {
        tracing::info!(
            evicted,
            channels = broker.channel_count(),
            "Sweeper: aged out broker history"
        );
    } else {
        tracing::debug!(channels = broker.channel_count(), "Sweeper: nothing to evict");
    }
    evicted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::config::{BrokerConfig, LimitsConfig};
    use seq_types::{Channel, ChatId, ChatMessage, MessageId, Publication, SeqNum, UserId};

    fn publication(chat: ChatId, seq: u64) -> Publication {
        Publication::message_created(ChatMessage {
            id: MessageId::new(),
            chat_id: chat,
            seq_num: SeqNum::new(seq),
            sender_id: UserId::new(),
            content: "x".into(),
            created_at: 0,
            updated_at: None,
            deleted: false,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_ages_out_idle_channels() {
        let broker = MemoryBroker::new(&BrokerConfig {
            history_ttl_secs: 60,
            ..BrokerConfig::default()
        });
        let limits = RateLimits::new(&LimitsConfig::default());
        let chat = ChatId::new();
        for seq in 1..=3 {
            broker
                .publish(Channel::Chat(chat), Some(seq), publication(chat, seq))
                .await
                .unwrap();
        }

        assert_eq!(sweep_once(&broker, &limits).await, 0);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(sweep_once(&broker, &limits).await, 3);
    }

    #[tokio::test]
    async fn sweeper_disabled() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new(&BrokerConfig::default()));
        let config = SweeperConfig {
            interval_secs: 1,
            enabled: false,
        };

        let handle = spawn_sweeper(broker, RateLimits::new(&LimitsConfig::default()), config);

        // Task should complete immediately when disabled
        tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .expect("Task should complete when disabled")
            .expect("Task should not panic");
    }
}
