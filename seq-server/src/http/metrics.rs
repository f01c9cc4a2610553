//! Prometheus metrics endpoint.

use crate::server::{ChatServer, ServerMetrics};
use axum::{http::header::CONTENT_TYPE, response::IntoResponse, Extension};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Prometheus metrics handler.
pub async fn metrics_handler(Extension(server): Extension<Arc<ChatServer>>) -> impl IntoResponse {
    let body = render(
        server.metrics(),
        server.total_sessions(),
        server.broker().channel_count(),
        server.rate_limits().user_keys_count(),
    );
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

fn render(m: &ServerMetrics, sessions: usize, channels: usize, limited_users: usize) -> String {
    // Counters are monotonic since startup.
    let appends = m.appends_total.load(Ordering::Relaxed);
    let replays = m.idempotent_replays_total.load(Ordering::Relaxed);
    let publishes = m.publishes_total.load(Ordering::Relaxed);
    let publish_failures = m.publish_failures.load(Ordering::Relaxed);
    let syncs = m.sync_requests_total.load(Ordering::Relaxed);
    let served = m.messages_served_total.load(Ordering::Relaxed);
    let sessions_total = m.broker_sessions_total.load(Ordering::Relaxed);
    let subscriptions = m.subscriptions_total.load(Ordering::Relaxed);
    let recoveries = m.recoveries_total.load(Ordering::Relaxed);
    let lagged = m.lagged_disconnects_total.load(Ordering::Relaxed);
    let rate_limits = m.rate_limit_hits.load(Ordering::Relaxed);

    format!(
        r#"# HELP chatseq_sessions_active Open broker WebSocket sessions
# TYPE chatseq_sessions_active gauge
chatseq_sessions_active {sessions}

# HELP chatseq_channels_active Broker channels holding state
# TYPE chatseq_channels_active gauge
chatseq_channels_active {channels}

# HELP chatseq_rate_limited_users Users tracked by the append limiter
# TYPE chatseq_rate_limited_users gauge
chatseq_rate_limited_users {limited_users}

# HELP chatseq_info Server information
# TYPE chatseq_info gauge
chatseq_info{{version="{version}"}} 1

# HELP chatseq_appends_total Messages committed
# TYPE chatseq_appends_total counter
chatseq_appends_total {appends}

# HELP chatseq_idempotent_replays_total Appends answered with an existing message
# TYPE chatseq_idempotent_replays_total counter
chatseq_idempotent_replays_total {replays}

# HELP chatseq_publishes_total Channel publications delivered to the broker
# TYPE chatseq_publishes_total counter
chatseq_publishes_total {publishes}

# HELP chatseq_publish_failures_total Channel publications dropped or rejected
# TYPE chatseq_publish_failures_total counter
chatseq_publish_failures_total {publish_failures}

# HELP chatseq_sync_requests_total Sync endpoint calls served
# TYPE chatseq_sync_requests_total counter
chatseq_sync_requests_total {syncs}

# HELP chatseq_messages_served_total Messages returned by the sync endpoint
# TYPE chatseq_messages_served_total counter
chatseq_messages_served_total {served}

# HELP chatseq_broker_sessions_total Broker sessions accepted
# TYPE chatseq_broker_sessions_total counter
chatseq_broker_sessions_total {sessions_total}

# HELP chatseq_subscriptions_total Channel subscriptions acknowledged
# TYPE chatseq_subscriptions_total counter
chatseq_subscriptions_total {subscriptions}

# HELP chatseq_recoveries_total Subscriptions recovered from broker history
# TYPE chatseq_recoveries_total counter
chatseq_recoveries_total {recoveries}

# HELP chatseq_lagged_disconnects_total Sessions dropped for lagging
# TYPE chatseq_lagged_disconnects_total counter
chatseq_lagged_disconnects_total {lagged}

# HELP chatseq_rate_limit_hits_total Appends rejected by rate limits
# TYPE chatseq_rate_limit_hits_total counter
chatseq_rate_limit_hits_total {rate_limits}
"#,
        version = env!("CARGO_PKG_VERSION"),
    )
}
