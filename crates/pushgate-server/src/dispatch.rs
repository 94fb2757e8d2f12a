//! Addressed delivery: resolve an identity (and event) to connections and
//! write one frame to each.

use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use futures::future::join_all;
use metrics::counter;
use tracing::{debug, info, warn};

use crate::errors::ApiError;
use crate::metrics::{DISPATCH_DELIVERIES_TOTAL, DISPATCH_FAILURES_TOTAL, DISPATCH_REQUESTS_TOTAL};
use crate::protocol::{DispatchReport, SendRequest};
use crate::server::AppState;
use crate::transport::TransportError;
use crate::websocket::binder::Binder;
use crate::websocket::connection::EventConnection;

/// Deliver `message` to every connection of `identity` that wants `event`.
///
/// Writes run concurrently, each bounded by `write_timeout`. A connection
/// whose write fails or times out is unregistered and closed; the others are
/// unaffected, and closing it happens in the background so the report is
/// ready once every write has settled. An identity with no connections
/// yields an empty report.
pub async fn dispatch(
    binder: &Binder,
    identity: &str,
    event: Option<&str>,
    message: &str,
    write_timeout: Duration,
) -> DispatchReport {
    let targets = binder.lookup(identity, event);
    if targets.is_empty() {
        debug!(user_id = identity, event, "no matching connections");
        return DispatchReport::default();
    }

    let writes = targets
        .iter()
        .map(|conn| deliver(conn, message, write_timeout));
    let results = join_all(writes).await;

    let mut report = DispatchReport {
        matched: targets.len(),
        ..DispatchReport::default()
    };
    for (conn, result) in targets.iter().zip(results) {
        match result {
            Ok(()) => report.delivered += 1,
            Err(e) => {
                report.failed += 1;
                warn!(conn_id = %conn.id, user_id = identity, error = %e, "delivery failed, dropping connection");
                let _ = binder.unregister_connection(conn);
                // Closing waits on the writer; keep it off the response path.
                let conn = conn.clone();
                let _ = tokio::spawn(async move { conn.close().await });
            }
        }
    }
    report
}

async fn deliver(
    conn: &Arc<EventConnection>,
    message: &str,
    write_timeout: Duration,
) -> Result<(), TransportError> {
    tokio::time::timeout(write_timeout, conn.send_text(message))
        .await
        .map_err(|_| TransportError::Timeout(write_timeout))?
}

/// POST {send_path}
pub async fn dispatch_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<DispatchReport>, ApiError> {
    let request: SendRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request(format!("invalid send request: {e}")))?;
    if request.user_id.trim().is_empty() {
        return Err(ApiError::bad_request("userId is required"));
    }

    counter!(DISPATCH_REQUESTS_TOTAL).increment(1);
    let report = dispatch(
        &state.binder,
        &request.user_id,
        request.event.as_deref(),
        &request.message,
        state.config.write_timeout,
    )
    .await;
    counter!(DISPATCH_DELIVERIES_TOTAL).increment(report.delivered as u64);
    counter!(DISPATCH_FAILURES_TOTAL).increment(report.failed as u64);

    info!(
        user_id = %request.user_id,
        event = request.event.as_deref(),
        matched = report.matched,
        delivered = report.delivered,
        failed = report.failed,
        "dispatched message"
    );
    Ok(Json(report))
}
