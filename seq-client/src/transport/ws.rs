//! WebSocket transport using tokio-tungstenite.
//!
//! A reader task decodes incoming frames into a channel, so `recv()` is a
//! plain channel receive and stays cancel-safe.

use super::{BrokerTransport, TransportError};
use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use seq_types::{ClientFrame, ServerFrame};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Inbound = Result<ServerFrame, TransportError>;

/// Decoded frames buffered ahead of `recv()`.
const INBOUND_BUFFER: usize = 256;

/// WebSocket transport for the broker gateway.
#[derive(Default)]
pub struct WsTransport {
    sink: Mutex<Option<SplitSink<WsStream, Message>>>,
    frames: Mutex<Option<mpsc::Receiver<Inbound>>>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
    connected: Arc<AtomicBool>,
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport")
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl WsTransport {
    /// Create a disconnected transport.
    pub fn new() -> Self {
        Self::default()
    }

    fn abort_reader(&self) {
        let handle = self
            .reader
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

#[async_trait]
impl BrokerTransport for WsTransport {
    async fn connect(&self, url: &str) -> Result<(), TransportError> {
        self.close().await?;

        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let (sink, mut source) = stream.split();
        let (tx, rx) = mpsc::channel::<Inbound>(INBOUND_BUFFER);

        let connected = Arc::clone(&self.connected);
        connected.store(true, Ordering::SeqCst);
        let reader = tokio::spawn(async move {
            while let Some(message) = source.next().await {
                let inbound = match message {
                    Ok(Message::Text(text)) => {
                        ServerFrame::from_json(&text).map_err(|e| TransportError::Protocol(e.to_string()))
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => Err(TransportError::ReceiveFailed(e.to_string())),
                };
                let fatal = inbound.is_err();
                if tx.send(inbound).await.is_err() || fatal {
                    break;
                }
            }
            connected.store(false, Ordering::SeqCst);
            let _ = tx.send(Err(TransportError::ConnectionClosed)).await;
        });

        *self.sink.lock().await = Some(sink);
        *self.frames.lock().await = Some(rx);
        *self
            .reader
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(reader);
        tracing::debug!(%url, "broker transport connected");
        Ok(())
    }

    async fn send(&self, frame: ClientFrame) -> Result<(), TransportError> {
        let text = frame
            .to_json()
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        let mut sink = self.sink.lock().await;
        let sink = sink.as_mut().ok_or(TransportError::NotConnected)?;
        sink.send(Message::Text(text))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn recv(&self) -> Result<ServerFrame, TransportError> {
        let mut frames = self.frames.lock().await;
        let frames = frames.as_mut().ok_or(TransportError::NotConnected)?;
        frames.recv().await.unwrap_or(Err(TransportError::ConnectionClosed))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        self.abort_reader();
        self.frames.lock().await.take();
        if let Some(mut sink) = self.sink.lock().await.take() {
            // The peer may already be gone.
            let _ = sink.close().await;
        }
        Ok(())
    }
}
