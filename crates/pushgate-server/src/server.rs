//! `PushServer`: axum router, listener and shared state.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::response::Json;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::{HEALTH_PATH, METRICS_PATH, ServerConfig};
use crate::dispatch::dispatch_handler;
use crate::errors::ServerError;
use crate::health::{self, HealthResponse};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::binder::Binder;
use crate::websocket::ingress::ingress_handler;

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Connection registry shared by ingress and dispatch.
    pub binder: Arc<Binder>,
    /// Validated configuration.
    pub config: Arc<ServerConfig>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle rendered by `/metrics`.
    pub metrics: PrometheusHandle,
}

/// The push server. Owns the one registry both handlers use.
pub struct PushServer {
    config: Arc<ServerConfig>,
    binder: Arc<Binder>,
    shutdown: Arc<ShutdownCoordinator>,
    metrics: PrometheusHandle,
    start_time: Instant,
}

impl PushServer {
    /// Validate `config` and create a server.
    ///
    /// An invalid configuration is reported as [`ServerError::Config`].
    pub fn new(config: ServerConfig, metrics: PrometheusHandle) -> Result<Self, ServerError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            binder: Arc::new(Binder::new()),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            metrics,
            start_time: Instant::now(),
        })
    }

    /// Build the axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            binder: self.binder.clone(),
            config: self.config.clone(),
            shutdown: self.shutdown.clone(),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route(&self.config.ws_path, get(ingress_handler))
            .route(&self.config.send_path, post(dispatch_handler))
            .route(HEALTH_PATH, get(health_handler))
            .route(METRICS_PATH, get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Bind and serve in a background task until shutdown is signalled.
    ///
    /// Returns the bound address (useful with port `0`) and the serve task.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>), ServerError> {
        let listener =
            TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let addr = listener.local_addr()?;
        let app = self.router();
        let token = self.shutdown.token();

        info!(
            %addr,
            ws_path = %self.config.ws_path,
            send_path = %self.config.send_path,
            "push server listening"
        );
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await });
            if let Err(e) = serve.await {
                error!(error = %e, "server terminated with error");
            }
        });
        Ok((addr, handle))
    }

    /// The connection registry.
    pub fn binder(&self) -> &Arc<Binder> {
        &self.binder
    }

    /// The shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// The validated configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.shutdown.is_shutting_down(),
        state.binder.connection_count(),
        state.binder.identity_count(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> String {
    crate::metrics::render(&state.metrics)
}
