//! Broker transport abstraction for chatseq.
//!
//! The recovery coordinator talks to the broker through [`BrokerTransport`]:
//! - `connect()` opens the broker session
//! - `send()` writes a client frame (subscribe, ping)
//! - `recv()` yields the next server frame
//! - `close()` tears the session down
//!
//! `recv()` must be cancel-safe: the coordinator polls it inside
//! `tokio::select!` alongside timers and fallback results.
//!
//! # Example
//!
//! ```ignore
//! let transport = WsTransport::new();
//! transport.connect("ws://localhost:8080/ws?user_id=...").await?;
//! transport.send(ClientFrame::Ping).await?;
//! let frame = transport.recv().await?;
//! ```

mod mock;
mod ws;

pub use mock::MockTransport;
pub use ws::WsTransport;

use async_trait::async_trait;
use seq_types::{ClientFrame, ServerFrame};
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Not connected.
    #[error("not connected")]
    NotConnected,

    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Receive failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// A frame could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Transport for the broker WebSocket protocol.
///
/// Implementations handle the underlying connection mechanism
/// (WebSocket, mock, etc).
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Connect to the broker at `url`, replacing any previous session.
    async fn connect(&self, url: &str) -> Result<(), TransportError>;

    /// Send a frame over the connection.
    async fn send(&self, frame: ClientFrame) -> Result<(), TransportError>;

    /// Receive the next frame.
    ///
    /// Blocks until a frame is available or the connection closes.
    async fn recv(&self) -> Result<ServerFrame, TransportError>;

    /// Check if currently connected.
    fn is_connected(&self) -> bool;

    /// Close the connection. Closing a closed transport is a no-op.
    async fn close(&self) -> Result<(), TransportError>;
}
