//! Event publisher: fan-out of committed messages to the broker.
//!
//! Handlers hand a committed message to [`EventPublisher::publish`] and return
//! to the writer immediately. A single worker drains the queue in order and
//! publishes each message to its `chat:` channel (position = `seq_num`) and
//! to the `user:` channel of every recipient.
//!
//! Publishing is best-effort. A full queue or a broker error is logged and
//! counted, never retried, and never touches the committed message: clients
//! that miss the publication recover it through replay or the sync endpoint.

use crate::broker::Broker;
use crate::server::ServerMetrics;
use seq_types::{Channel, ChatMessage, Publication, UserId};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A committed message waiting for fan-out.
#[derive(Debug, Clone)]
pub struct PublishJob {
    /// The committed message.
    pub message: ChatMessage,
    /// Users whose notification channel should receive it.
    pub recipients: Vec<UserId>,
}

/// Handle for queueing publications.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: mpsc::Sender<PublishJob>,
    metrics: Arc<ServerMetrics>,
}

impl EventPublisher {
    /// Start the publish worker. Must be called inside a Tokio runtime.
    ///
    /// The worker stops once every handle has been dropped.
    pub fn spawn(
        broker: Arc<dyn Broker>,
        metrics: Arc<ServerMetrics>,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<PublishJob>(capacity.max(1));
        let worker_metrics = Arc::clone(&metrics);
        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                publish_job(broker.as_ref(), &worker_metrics, job).await;
            }
            tracing::debug!("publisher worker stopped");
        });
        (Self { tx, metrics }, handle)
    }

    /// Queue a committed message for fan-out. Never blocks, never fails.
    pub fn publish(&self, message: ChatMessage, recipients: Vec<UserId>) {
        let chat_id = message.chat_id;
        let seq = message.seq_num;
        if let Err(e) = self.tx.try_send(PublishJob { message, recipients }) {
            self.metrics.publish_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(%chat_id, %seq, error = %e, "publish dropped; clients will recover");
        }
    }
}

/// Publish one job to every channel it targets.
///
/// Returns the number of channels that failed.
pub async fn publish_job(broker: &dyn Broker, metrics: &ServerMetrics, job: PublishJob) -> usize {
    let chat_id = job.message.chat_id;
    let seq = job.message.seq_num;
    let publication = Publication::message_created(job.message);

    let targets = std::iter::once((Channel::Chat(chat_id), Some(seq.value())))
        .chain(job.recipients.into_iter().map(|user| (Channel::User(user), None)));

    let mut failures = 0;
    for (channel, position) in targets {
        match broker.publish(channel, position, publication.clone()).await {
            Ok(offset) => {
                metrics.publishes_total.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(%channel, offset, "published");
            }
            Err(e) => {
                failures += 1;
                metrics.publish_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%channel, %chat_id, %seq, error = %e, "publish failed; clients will recover");
            }
        }
    }
    failures
}
