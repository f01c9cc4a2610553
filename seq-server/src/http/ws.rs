//! Broker WebSocket gateway.
//!
//! One session per socket. Frames leave through a single writer task so the
//! ack, the replayed publications and the live feed of a channel reach the
//! client in that order. A subscriber that falls behind its live buffer gets
//! an `Error` frame and the socket is closed; it resumes by subscribing again.

use crate::broker::Delivery;
use crate::error::ApiError;
use crate::server::ChatServer;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::Query;
use axum::response::{IntoResponse, Response};
use axum::Extension;
use futures_util::{SinkExt, StreamExt};
use seq_types::{Channel, ClientFrame, ServerFrame, SubscribeAck, SubscribeRequest, UserId};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Frames buffered between the session and its writer.
const OUTBOUND_BUFFER: usize = 256;

/// Query string of the WebSocket upgrade.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Caller identity, set by the external auth layer.
    pub user_id: String,
}

/// `GET /ws?user_id=`
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Extension(server): Extension<Arc<ChatServer>>,
    Query(query): Query<WsQuery>,
) -> Response {
    let user_id: UserId = match query.user_id.parse() {
        Ok(id) => id,
        Err(_) => return ApiError::Unauthenticated.into_response(),
    };
    ws.on_upgrade(move |socket| run_session(server, socket, user_id))
}

async fn run_session(server: Arc<ChatServer>, socket: WebSocket, user_id: UserId) {
    let session_id = server.register_session(user_id);
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerFrame>(OUTBOUND_BUFFER);

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let closing = matches!(frame, ServerFrame::Error { .. });
            let text = match frame.to_json() {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(error = %e, "dropping unencodable frame");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
            if closing {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    });

    let mut forwarders: HashMap<Channel, JoinHandle<()>> = HashMap::new();

    loop {
        tokio::select! {
            _ = &mut writer => break,
            incoming = stream.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::debug!(session = session_id, error = %e, "socket read failed");
                        break;
                    }
                };

                let sent = match ClientFrame::from_json(&text) {
                    Ok(ClientFrame::Ping) => out_tx.send(ServerFrame::Pong).await.is_ok(),
                    Ok(ClientFrame::Subscribe { subscriptions }) => {
                        subscribe(&server, &user_id, subscriptions, &out_tx, &mut forwarders).await
                    }
                    Err(e) => {
                        tracing::debug!(session = session_id, error = %e, "malformed client frame");
                        let _ = out_tx
                            .send(ServerFrame::Error { message: format!("malformed frame: {e}") })
                            .await;
                        true
                    }
                };
                if !sent {
                    break;
                }
            }
        }
    }

    for (_, forwarder) in forwarders {
        forwarder.abort();
    }
    drop(out_tx);
    writer.abort();
    server.unregister_session(session_id);
}

/// Answer one subscribe frame. Returns false once the writer is gone.
async fn subscribe(
    server: &Arc<ChatServer>,
    user_id: &UserId,
    requests: Vec<SubscribeRequest>,
    out: &mpsc::Sender<ServerFrame>,
    forwarders: &mut HashMap<Channel, JoinHandle<()>>,
) -> bool {
    let mut acks = Vec::with_capacity(requests.len());
    let mut accepted = Vec::new();

    for request in &requests {
        let refused = |reason: String| SubscribeAck {
            channel: request.channel,
            recovered: false,
            replayed: 0,
            head: 0,
            error: Some(reason),
        };

        if let Err(e) = server.authorize_channel(user_id, &request.channel).await {
            acks.push(refused(e.to_string()));
            continue;
        }
        match server.broker().subscribe(request).await {
            Ok(subscription) => {
                let metrics = server.metrics();
                metrics.subscriptions_total.fetch_add(1, Ordering::Relaxed);
                if subscription.ack.recovered {
                    metrics.recoveries_total.fetch_add(1, Ordering::Relaxed);
                }
                tracing::debug!(
                    channel = %request.channel,
                    offset = ?request.offset,
                    recovered = subscription.ack.recovered,
                    replayed = subscription.ack.replayed,
                    "subscribed"
                );
                acks.push(subscription.ack.clone());
                accepted.push(subscription);
            }
            Err(e) => acks.push(refused(e.to_string())),
        }
    }

    if out.send(ServerFrame::SubscribeAck { acks }).await.is_err() {
        return false;
    }

    for subscription in accepted {
        let channel = subscription.ack.channel;
        if let Some(previous) = forwarders.remove(&channel) {
            previous.abort();
        }
        for delivery in &subscription.replay {
            if out.send(delivery.to_frame()).await.is_err() {
                return false;
            }
        }
        let forwarder = spawn_forwarder(Arc::clone(server), channel, subscription.live, out.clone());
        forwarders.insert(channel, forwarder);
    }
    true
}

fn spawn_forwarder(
    server: Arc<ChatServer>,
    channel: Channel,
    mut live: broadcast::Receiver<Delivery>,
    out: mpsc::Sender<ServerFrame>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match live.recv().await {
                Ok(delivery) => {
                    if out.send(delivery.to_frame()).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    server
                        .metrics()
                        .lagged_disconnects_total
                        .fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(%channel, skipped, "subscriber lagged; closing session");
                    let _ = out
                        .send(ServerFrame::Error {
                            message: format!("lagged behind {channel} by {skipped} publications"),
                        })
                        .await;
                    break;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
