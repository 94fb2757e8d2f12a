//! Ingress: WebSocket upgrade handler and the per-connection session.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::http::header::ORIGIN;
use axum::response::Response;
use metrics::{counter, gauge, histogram};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::binder::Binder;
use super::connection::EventConnection;
use super::heartbeat::{HeartbeatResult, run_heartbeat};
use crate::config::ServerConfig;
use crate::errors::ApiError;
use crate::ids::{ConnectionId, Identity};
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
};
use crate::protocol::{ClientFrame, EstablishedData, PROTOCOL_VERSION, ServerFrame};
use crate::server::AppState;
use crate::transport::{self, Frame, FrameSink, FrameSource, TransportError};

/// Query parameters of the upgrade request.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct IngressParams {
    /// Identity the connection belongs to.
    #[serde(rename = "userId", alias = "user_id", alias = "identity")]
    pub user_id: Option<String>,
    /// Comma-separated initial subscriptions.
    pub events: Option<String>,
}

/// Split a comma list into trimmed, non-empty, de-duplicated event names.
pub fn parse_events(raw: Option<&str>) -> Vec<String> {
    let mut events: Vec<String> = Vec::new();
    for event in raw.unwrap_or_default().split(',').map(str::trim) {
        if !event.is_empty() && !events.iter().any(|e| e == event) {
            events.push(event.to_owned());
        }
    }
    events
}

/// Decide whether an upgrade request may proceed.
///
/// Returns the identity and initial events on success.
pub fn admit(
    params: &IngressParams,
    headers: &HeaderMap,
    config: &ServerConfig,
    binder: &Binder,
) -> Result<(Identity, Vec<String>), ApiError> {
    let origin = headers
        .get(ORIGIN)
        .map(|v| v.to_str().unwrap_or_default());
    if !config.origin_allowed(origin) {
        return Err(ApiError::forbidden("origin not allowed"));
    }

    let user_id = params
        .user_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::bad_request("userId is required"))?;

    if binder.connection_count() >= config.max_connections {
        return Err(ApiError::service_unavailable("connection limit reached"));
    }

    Ok((Identity::new(user_id), parse_events(params.events.as_deref())))
}

/// GET {ws_path}
pub async fn ingress_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<IngressParams>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Response, ApiError> {
    let (identity, events) = admit(&params, &headers, &state.config, &state.binder)?;
    let ctx = SessionContext::from_state(&state);
    let shutdown = state.shutdown.clone();
    let config = &state.config;

    Ok(ws
        .read_buffer_size(config.read_buffer_size)
        .write_buffer_size(config.write_buffer_size)
        .max_message_size(config.max_message_size)
        .on_failed_upgrade(|e| warn!(error = %e, "websocket upgrade failed"))
        .on_upgrade(move |socket| {
            shutdown.track(async move {
                let (sink, source) = transport::websocket::split(socket);
                let _ = run_session(
                    Box::new(sink),
                    source,
                    ConnectionId::generate(),
                    identity,
                    events,
                    ctx,
                )
                .await;
            })
        }))
}

/// What a session needs from the server.
#[derive(Clone)]
pub struct SessionContext {
    /// Registry the session registers into.
    pub binder: Arc<Binder>,
    /// Ping interval.
    pub heartbeat_interval: Duration,
    /// Silence tolerated before the session is dropped.
    pub heartbeat_timeout: Duration,
    /// Server-wide shutdown signal.
    pub shutdown: CancellationToken,
}

impl SessionContext {
    fn from_state(state: &AppState) -> Self {
        Self {
            binder: state.binder.clone(),
            heartbeat_interval: state.config.heartbeat_interval,
            heartbeat_timeout: state.config.heartbeat_timeout,
            shutdown: state.shutdown.token(),
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client closed the connection or the stream ended.
    ClientClosed,
    /// Reading or writing the transport failed.
    TransportError,
    /// The client stopped answering pings.
    HeartbeatTimeout,
    /// The server is shutting down.
    Shutdown,
    /// The connection was closed from outside, e.g. after a failed delivery.
    Evicted,
}

impl SessionEnd {
    fn as_str(self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::TransportError => "transport_error",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::Shutdown => "shutdown",
            Self::Evicted => "evicted",
        }
    }
}

/// Unregisters the connection when the session ends, however it ends.
struct RegistrationGuard {
    binder: Arc<Binder>,
    conn: Arc<EventConnection>,
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        let _ = self.binder.unregister_connection(&self.conn);
        gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    }
}

/// Serve one connection from registration to teardown.
#[instrument(skip_all, fields(conn_id = %conn_id, user_id = %identity))]
pub async fn run_session<S: FrameSource>(
    sink: Box<dyn FrameSink>,
    mut source: S,
    conn_id: ConnectionId,
    identity: Identity,
    events: Vec<String>,
    ctx: SessionContext,
) -> SessionEnd {
    let conn = Arc::new(EventConnection::new(conn_id, identity, events, sink));
    let stale = ctx.binder.register(conn.clone());
    let guard = RegistrationGuard {
        binder: ctx.binder.clone(),
        conn: conn.clone(),
    };
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
    if let Some(stale) = stale {
        stale.close().await;
    }
    info!(events = ?conn.events(), "client connected");

    let heartbeat_cancel = CancellationToken::new();
    let _heartbeat_guard = heartbeat_cancel.clone().drop_guard();
    let mut heartbeat = tokio::spawn(run_heartbeat(
        conn.clone(),
        ctx.heartbeat_interval,
        ctx.heartbeat_timeout,
        heartbeat_cancel,
    ));

    let end = match send_established(&conn).await {
        Err(e) => {
            debug!(error = %e, "failed to send connection.established");
            SessionEnd::TransportError
        }
        Ok(()) => loop {
            tokio::select! {
                frame = source.next_frame() => {
                    if let Some(end) = handle_frame(&conn, frame).await {
                        break end;
                    }
                }
                result = &mut heartbeat => {
                    break match result {
                        Ok(HeartbeatResult::TimedOut) => SessionEnd::HeartbeatTimeout,
                        Ok(HeartbeatResult::Cancelled) => SessionEnd::Shutdown,
                        Ok(HeartbeatResult::SendFailed) | Err(_) => SessionEnd::TransportError,
                    };
                }
                () = ctx.shutdown.cancelled() => break SessionEnd::Shutdown,
                () = conn.closed() => break SessionEnd::Evicted,
            }
        },
    };

    heartbeat.abort();
    drop(guard);
    conn.close().await;

    counter!(WS_DISCONNECTIONS_TOTAL, "reason" => end.as_str()).increment(1);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(conn.age().as_secs_f64());
    info!(reason = end.as_str(), "client disconnected");
    end
}

async fn send_established(conn: &EventConnection) -> Result<(), TransportError> {
    let frame = ServerFrame::Established {
        version: PROTOCOL_VERSION,
        data: EstablishedData {
            connection_id: conn.id.clone(),
            user_id: conn.owner.clone(),
            events: conn.events(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        },
    };
    conn.send_text(&frame.to_json()).await
}

/// Handle one read result. `Some` ends the session.
async fn handle_frame(
    conn: &EventConnection,
    frame: Option<Result<Frame, TransportError>>,
) -> Option<SessionEnd> {
    let text = match frame {
        None | Some(Ok(Frame::Close)) => return Some(SessionEnd::ClientClosed),
        Some(Err(e)) => {
            debug!(error = %e, "read failed");
            return Some(SessionEnd::TransportError);
        }
        Some(Ok(Frame::Ping(_) | Frame::Pong(_))) => {
            conn.mark_alive();
            return None;
        }
        Some(Ok(Frame::Text(text))) => text,
        Some(Ok(Frame::Binary(data))) => match String::from_utf8(data.to_vec()) {
            Ok(text) => text,
            Err(_) => {
                conn.mark_alive();
                let reply = ServerFrame::Error {
                    message: "binary frames must be UTF-8 JSON".into(),
                };
                return reply_or_end(conn, &reply).await;
            }
        },
    };

    conn.mark_alive();
    let reply = control_reply(conn, &text);
    reply_or_end(conn, &reply).await
}

/// Apply a control frame and build the reply.
fn control_reply(conn: &EventConnection, text: &str) -> ServerFrame {
    match serde_json::from_str::<ClientFrame>(text) {
        Ok(ClientFrame::Subscribe { events }) => {
            conn.subscribe(&events);
            debug!(?events, "subscribed");
            ServerFrame::Subscriptions {
                events: conn.events(),
            }
        }
        Ok(ClientFrame::Unsubscribe { events }) => {
            conn.unsubscribe(&events);
            debug!(?events, "unsubscribed");
            ServerFrame::Subscriptions {
                events: conn.events(),
            }
        }
        Ok(ClientFrame::Ping) => ServerFrame::Pong,
        Err(e) => ServerFrame::Error {
            message: format!("invalid control frame: {e}"),
        },
    }
}

async fn reply_or_end(conn: &EventConnection, reply: &ServerFrame) -> Option<SessionEnd> {
    match conn.send_text(&reply.to_json()).await {
        Ok(()) => None,
        Err(TransportError::Closed) => Some(SessionEnd::Evicted),
        Err(e) => {
            debug!(error = %e, "reply failed");
            Some(SessionEnd::TransportError)
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use axum::http::HeaderValue;
    use tokio::task::JoinHandle;

    use super::*;
    use crate::transport::memory::{self, MemoryPeer};

    fn context(binder: &Arc<Binder>) -> SessionContext {
        SessionContext {
            binder: binder.clone(),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            shutdown: CancellationToken::new(),
        }
    }

    async fn start(
        ctx: SessionContext,
        id: &str,
        events: &[&str],
    ) -> (JoinHandle<SessionEnd>, MemoryPeer) {
        let (sink, source, mut peer) = memory::pair();
        let handle = tokio::spawn(run_session(
            Box::new(sink),
            source,
            ConnectionId::new(id),
            Identity::new("alice"),
            events.iter().map(|e| (*e).to_owned()).collect(),
            ctx,
        ));
        let established = peer.recv_text().await.unwrap();
        let v: serde_json::Value = serde_json::from_str(&established).unwrap();
        assert_eq!(v["type"], "connection.established");
        (handle, peer)
    }

    fn reply(text: &str) -> serde_json::Value {
        serde_json::from_str(text).unwrap()
    }

    #[test]
    fn parse_events_trims_and_dedups() {
        assert_eq!(
            parse_events(Some(" alerts, billing,,alerts ")),
            vec!["alerts", "billing"]
        );
        assert!(parse_events(None).is_empty());
        assert!(parse_events(Some("")).is_empty());
    }

    #[test]
    fn admit_requires_identity() {
        let binder = Binder::new();
        let config = ServerConfig::default();
        let params = IngressParams::default();
        assert_matches!(
            admit(&params, &HeaderMap::new(), &config, &binder),
            Err(ApiError::BadRequest(_))
        );

        let params = IngressParams {
            user_id: Some("  ".into()),
            events: None,
        };
        assert_matches!(
            admit(&params, &HeaderMap::new(), &config, &binder),
            Err(ApiError::BadRequest(_))
        );
    }

    #[test]
    fn admit_returns_identity_and_events() {
        let binder = Binder::new();
        let params = IngressParams {
            user_id: Some("alice".into()),
            events: Some("alerts,billing".into()),
        };
        let (identity, events) =
            admit(&params, &HeaderMap::new(), &ServerConfig::default(), &binder).unwrap();
        assert_eq!(identity.as_str(), "alice");
        assert_eq!(events, vec!["alerts", "billing"]);
    }

    #[test]
    fn admit_enforces_origin_policy() {
        let binder = Binder::new();
        let config = ServerConfig {
            allowed_origins: vec!["https://app.example".into()],
            ..ServerConfig::default()
        };
        let params = IngressParams {
            user_id: Some("alice".into()),
            events: None,
        };
        let mut headers = HeaderMap::new();
        let _ = headers.insert(ORIGIN, HeaderValue::from_static("https://evil.example"));
        assert_matches!(
            admit(&params, &headers, &config, &binder),
            Err(ApiError::Forbidden(_))
        );
    }

    #[tokio::test]
    async fn admit_enforces_connection_limit() {
        let binder = Arc::new(Binder::new());
        let (_handle, _peer) = start(context(&binder), "c1", &[]).await;
        let config = ServerConfig {
            max_connections: 1,
            ..ServerConfig::default()
        };
        let params = IngressParams {
            user_id: Some("bob".into()),
            events: None,
        };
        assert_matches!(
            admit(&params, &HeaderMap::new(), &config, &binder),
            Err(ApiError::ServiceUnavailable(_))
        );
    }

    #[tokio::test]
    async fn session_registers_and_unregisters_on_close() {
        let binder = Arc::new(Binder::new());
        let (handle, peer) = start(context(&binder), "c1", &["alerts"]).await;
        assert!(binder.contains("c1"));
        assert_eq!(binder.lookup("alice", Some("alerts")).len(), 1);

        peer.send_frame(Frame::Close);
        assert_eq!(handle.await.unwrap(), SessionEnd::ClientClosed);
        assert!(!binder.contains("c1"));
        assert_eq!(binder.identity_count(), 0);
    }

    #[tokio::test]
    async fn established_frame_carries_connection_details() {
        let binder = Arc::new(Binder::new());
        let (sink, source, mut peer) = memory::pair();
        let _handle = tokio::spawn(run_session(
            Box::new(sink),
            source,
            ConnectionId::new("c9"),
            Identity::new("alice"),
            vec!["alerts".into()],
            context(&binder),
        ));
        let v = reply(&peer.recv_text().await.unwrap());
        assert_eq!(v["version"], PROTOCOL_VERSION);
        assert_eq!(v["data"]["connectionId"], "c9");
        assert_eq!(v["data"]["userId"], "alice");
        assert_eq!(v["data"]["events"], serde_json::json!(["alerts"]));
    }

    #[tokio::test]
    async fn hang_up_ends_session() {
        let binder = Arc::new(Binder::new());
        let (handle, mut peer) = start(context(&binder), "c1", &[]).await;
        peer.hang_up();
        assert_eq!(handle.await.unwrap(), SessionEnd::ClientClosed);
        assert_eq!(binder.connection_count(), 0);
    }

    #[tokio::test]
    async fn read_error_ends_session() {
        let binder = Arc::new(Binder::new());
        let (handle, peer) = start(context(&binder), "c1", &[]).await;
        peer.inject_read_error("connection reset");
        assert_eq!(handle.await.unwrap(), SessionEnd::TransportError);
        assert!(!binder.contains("c1"));
    }

    #[tokio::test]
    async fn subscribe_frames_change_routing() {
        let binder = Arc::new(Binder::new());
        let (handle, mut peer) = start(context(&binder), "c1", &["alerts"]).await;

        peer.send_text(r#"{"type":"subscribe","events":["billing"]}"#);
        let v = reply(&peer.recv_text().await.unwrap());
        assert_eq!(v["type"], "subscriptions");
        assert_eq!(v["events"], serde_json::json!(["alerts", "billing"]));
        assert_eq!(binder.lookup("alice", Some("billing")).len(), 1);

        peer.send_text(r#"{"type":"unsubscribe","events":["alerts"]}"#);
        let v = reply(&peer.recv_text().await.unwrap());
        assert_eq!(v["events"], serde_json::json!(["billing"]));
        assert!(binder.lookup("alice", Some("alerts")).is_empty());

        peer.send_frame(Frame::Close);
        assert_eq!(handle.await.unwrap(), SessionEnd::ClientClosed);
    }

    #[tokio::test]
    async fn ping_and_bad_frames_get_replies() {
        let binder = Arc::new(Binder::new());
        let (_handle, mut peer) = start(context(&binder), "c1", &[]).await;

        peer.send_text(r#"{"type":"ping"}"#);
        assert_eq!(reply(&peer.recv_text().await.unwrap())["type"], "pong");

        peer.send_text("not json");
        let v = reply(&peer.recv_text().await.unwrap());
        assert_eq!(v["type"], "error");
        assert!(v["message"].as_str().unwrap().contains("invalid control frame"));

        peer.send_frame(Frame::Binary(bytes::Bytes::from_static(&[0xff, 0xfe])));
        assert_eq!(reply(&peer.recv_text().await.unwrap())["type"], "error");

        peer.send_frame(Frame::Binary(bytes::Bytes::from_static(br#"{"type":"ping"}"#)));
        assert_eq!(reply(&peer.recv_text().await.unwrap())["type"], "pong");
        assert!(binder.contains("c1"));
    }

    #[tokio::test]
    async fn shutdown_ends_session() {
        let binder = Arc::new(Binder::new());
        let ctx = context(&binder);
        let shutdown = ctx.shutdown.clone();
        let (handle, _peer) = start(ctx, "c1", &[]).await;
        shutdown.cancel();
        assert_eq!(handle.await.unwrap(), SessionEnd::Shutdown);
        assert_eq!(binder.connection_count(), 0);
    }

    #[tokio::test]
    async fn external_close_evicts_session() {
        let binder = Arc::new(Binder::new());
        let (handle, _peer) = start(context(&binder), "c1", &[]).await;
        let conn = binder.lookup("alice", None).remove(0);
        let _ = binder.unregister("c1");
        conn.close().await;
        assert_eq!(handle.await.unwrap(), SessionEnd::Evicted);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_client_times_out() {
        let binder = Arc::new(Binder::new());
        let ctx = SessionContext {
            heartbeat_interval: Duration::from_millis(50),
            heartbeat_timeout: Duration::from_millis(100),
            ..context(&binder)
        };
        let (handle, _peer) = start(ctx, "c1", &[]).await;
        assert_eq!(handle.await.unwrap(), SessionEnd::HeartbeatTimeout);
        assert!(!binder.contains("c1"));
    }

    #[tokio::test]
    async fn aborted_session_still_unregisters() {
        let binder = Arc::new(Binder::new());
        let (handle, _peer) = start(context(&binder), "c1", &[]).await;
        handle.abort();
        let _ = handle.await;
        assert!(!binder.contains("c1"));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_transport_ends_session_via_heartbeat() {
        let binder = Arc::new(Binder::new());
        let ctx = SessionContext {
            heartbeat_interval: Duration::from_millis(50),
            heartbeat_timeout: Duration::from_millis(100),
            ..context(&binder)
        };
        let (handle, peer) = start(ctx, "c1", &[]).await;
        peer.stall_writes();

        let end = tokio::time::timeout(Duration::from_secs(600), handle)
            .await
            .expect("session never ended")
            .unwrap();
        assert!(
            matches!(end, SessionEnd::HeartbeatTimeout | SessionEnd::TransportError),
            "unexpected end {end:?}"
        );
        assert!(!binder.contains("c1"));
    }

    #[tokio::test]
    async fn replaced_registration_is_closed_and_new_one_kept() {
        let binder = Arc::new(Binder::new());
        let (first, _first_peer) = start(context(&binder), "dup", &[]).await;
        let (_second, _second_peer) = start(context(&binder), "dup", &[]).await;

        assert_eq!(first.await.unwrap(), SessionEnd::Evicted);
        assert!(binder.contains("dup"));
        assert_eq!(binder.connection_count(), 1);
    }
}
