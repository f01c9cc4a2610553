//! Mock transport for testing.
//!
//! Captures sent frames, replays scripted server frames, and can answer
//! subscribe frames through a responder so tests decide what the broker
//! recovered. Failures and disconnects can be injected at any point.

use super::{BrokerTransport, TransportError};
use async_trait::async_trait;
use seq_types::{ClientFrame, ServerFrame, SubscribeRequest};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

type Responder = Box<dyn Fn(&[SubscribeRequest]) -> Vec<ServerFrame> + Send>;

/// Mock transport for testing.
#[derive(Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct MockTransportInner {
    connected: bool,
    connected_address: Option<String>,
    connect_count: usize,
    sent_frames: Vec<ClientFrame>,
    receive_queue: VecDeque<ServerFrame>,
    responder: Option<Responder>,
    fail_next_connect: Option<String>,
    fail_next_send: Option<String>,
    pending_disconnect: Option<String>,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("MockTransport")
            .field("connected", &inner.connected)
            .field("connect_count", &inner.connect_count)
            .field("sent_frames", &inner.sent_frames.len())
            .field("queued", &inner.receive_queue.len())
            .finish()
    }
}

impl MockTransport {
    /// Create a new mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockTransportInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue a frame to be returned by `recv()`.
    pub fn queue_frame(&self, frame: ServerFrame) {
        self.lock().receive_queue.push_back(frame);
        self.notify.notify_one();
    }

    /// Answer every subscribe frame with the frames `responder` returns.
    pub fn set_subscribe_responder<F>(&self, responder: F)
    where
        F: Fn(&[SubscribeRequest]) -> Vec<ServerFrame> + Send + 'static,
    {
        self.lock().responder = Some(Box::new(responder));
    }

    /// Get all frames that were sent.
    pub fn sent_frames(&self) -> Vec<ClientFrame> {
        self.lock().sent_frames.clone()
    }

    /// Subscription lists of every subscribe frame sent, oldest first.
    pub fn subscribe_requests(&self) -> Vec<Vec<SubscribeRequest>> {
        self.lock()
            .sent_frames
            .iter()
            .filter_map(|frame| match frame {
                ClientFrame::Subscribe { subscriptions } => Some(subscriptions.clone()),
                ClientFrame::Ping => None,
            })
            .collect()
    }

    /// Get the address that was last connected to.
    pub fn connected_address(&self) -> Option<String> {
        self.lock().connected_address.clone()
    }

    /// Number of successful connects.
    pub fn connect_count(&self) -> usize {
        self.lock().connect_count
    }

    /// Cause the next connect() to fail with the given error.
    pub fn fail_next_connect(&self, error: &str) {
        self.lock().fail_next_connect = Some(error.to_string());
    }

    /// Cause the next send() to fail with the given error.
    pub fn fail_next_send(&self, error: &str) {
        self.lock().fail_next_send = Some(error.to_string());
    }

    /// Drop the connection: the pending or next `recv()` fails.
    pub fn disconnect(&self, reason: &str) {
        {
            let mut inner = self.lock();
            inner.pending_disconnect = Some(reason.to_string());
            inner.receive_queue.clear();
        }
        self.notify.notify_one();
    }
}

impl Clone for MockTransport {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            notify: Arc::clone(&self.notify),
        }
    }
}

#[async_trait]
impl BrokerTransport for MockTransport {
    async fn connect(&self, address: &str) -> Result<(), TransportError> {
        let mut inner = self.lock();

        if let Some(error) = inner.fail_next_connect.take() {
            return Err(TransportError::ConnectionFailed(error));
        }

        inner.connected = true;
        inner.connect_count += 1;
        inner.pending_disconnect = None;
        inner.connected_address = Some(address.to_string());
        Ok(())
    }

    async fn send(&self, frame: ClientFrame) -> Result<(), TransportError> {
        let replies = {
            let mut inner = self.lock();

            if !inner.connected {
                return Err(TransportError::NotConnected);
            }
            if let Some(error) = inner.fail_next_send.take() {
                return Err(TransportError::SendFailed(error));
            }

            let replies = match (&frame, &inner.responder) {
                (ClientFrame::Subscribe { subscriptions }, Some(responder)) => responder(subscriptions),
                (ClientFrame::Ping, _) => vec![ServerFrame::Pong],
                _ => Vec::new(),
            };
            inner.sent_frames.push(frame);
            inner.receive_queue.extend(replies.iter().cloned());
            replies
        };
        if !replies.is_empty() {
            self.notify.notify_one();
        }
        Ok(())
    }

    async fn recv(&self) -> Result<ServerFrame, TransportError> {
        loop {
            {
                let mut inner = self.lock();
                if let Some(reason) = inner.pending_disconnect.take() {
                    inner.connected = false;
                    return Err(TransportError::ReceiveFailed(reason));
                }
                if !inner.connected {
                    return Err(TransportError::NotConnected);
                }
                if let Some(frame) = inner.receive_queue.pop_front() {
                    return Ok(frame);
                }
            }
            self.notify.notified().await;
        }
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut inner = self.lock();
        inner.connected = false;
        inner.receive_queue.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seq_types::{Channel, ChatId, SubscribeAck};
    use std::time::Duration;

    // ===========================================
    // MockTransport Basic Tests
    // ===========================================

    #[tokio::test]
    async fn mock_transport_connects() {
        let transport = MockTransport::new();
        assert!(!transport.is_connected());

        transport.connect("ws://broker").await.unwrap();

        assert!(transport.is_connected());
        assert_eq!(transport.connected_address(), Some("ws://broker".to_string()));
        assert_eq!(transport.connect_count(), 1);
    }

    #[tokio::test]
    async fn mock_transport_records_sent_frames() {
        let transport = MockTransport::new();
        transport.connect("ws://broker").await.unwrap();

        transport.send(ClientFrame::Ping).await.unwrap();

        assert_eq!(transport.sent_frames(), vec![ClientFrame::Ping]);
        assert_eq!(transport.recv().await.unwrap(), ServerFrame::Pong);
    }

    #[tokio::test]
    async fn mock_transport_responder_answers_subscribe() {
        let transport = MockTransport::new();
        transport.set_subscribe_responder(|subs| {
            vec![ServerFrame::SubscribeAck {
                acks: subs
                    .iter()
                    .map(|s| SubscribeAck {
                        channel: s.channel,
                        recovered: true,
                        replayed: 0,
                        head: 0,
                        error: None,
                    })
                    .collect(),
            }]
        });
        transport.connect("ws://broker").await.unwrap();

        let channel = Channel::Chat(ChatId::new());
        transport
            .send(ClientFrame::Subscribe {
                subscriptions: vec![SubscribeRequest {
                    channel,
                    offset: Some(3),
                    recover: true,
                }],
            })
            .await
            .unwrap();

        match transport.recv().await.unwrap() {
            ServerFrame::SubscribeAck { acks } => assert_eq!(acks[0].channel, channel),
            other => panic!("unexpected frame: {other:?}"),
        }
        assert_eq!(transport.subscribe_requests()[0][0].offset, Some(3));
    }

    #[tokio::test]
    async fn mock_transport_recv_waits_for_frames() {
        let transport = MockTransport::new();
        transport.connect("ws://broker").await.unwrap();

        let pending = tokio::time::timeout(Duration::from_millis(20), transport.recv()).await;
        assert!(pending.is_err());

        let feeder = transport.clone();
        tokio::spawn(async move { feeder.queue_frame(ServerFrame::Pong) });
        assert_eq!(transport.recv().await.unwrap(), ServerFrame::Pong);
    }

    #[tokio::test]
    async fn mock_transport_disconnect_fails_recv() {
        let transport = MockTransport::new();
        transport.connect("ws://broker").await.unwrap();

        transport.disconnect("cable cut");

        assert!(matches!(
            transport.recv().await,
            Err(TransportError::ReceiveFailed(reason)) if reason == "cable cut"
        ));
        assert!(!transport.is_connected());
    }

    // ===========================================
    // Failure injection
    // ===========================================

    #[tokio::test]
    async fn mock_transport_fail_next_connect() {
        let transport = MockTransport::new();
        transport.fail_next_connect("refused");

        assert!(matches!(
            transport.connect("ws://broker").await,
            Err(TransportError::ConnectionFailed(_))
        ));
        // Only the next one fails.
        transport.connect("ws://broker").await.unwrap();
    }

    #[tokio::test]
    async fn mock_transport_send_requires_connection() {
        let transport = MockTransport::new();
        assert!(matches!(
            transport.send(ClientFrame::Ping).await,
            Err(TransportError::NotConnected)
        ));

        transport.connect("ws://broker").await.unwrap();
        transport.fail_next_send("broken pipe");
        assert!(matches!(
            transport.send(ClientFrame::Ping).await,
            Err(TransportError::SendFailed(_))
        ));
    }
}
