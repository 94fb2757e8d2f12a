//! # pushgate-server
//!
//! Push-messaging server over persistent WebSocket connections.
//!
//! - Ingress: clients connect to the WebSocket route with an identity and
//!   optional event subscriptions, and stay registered until they go away
//! - Dispatch: an HTTP POST addresses a message to an identity, optionally
//!   scoped to an event, and it is written to every matching connection
//! - [`websocket::binder::Binder`] is the registry both sides share
//! - Heartbeat, graceful shutdown, `/health` and Prometheus `/metrics`

#![deny(unsafe_code)]

pub mod config;
pub mod dispatch;
pub mod errors;
pub mod health;
pub mod ids;
pub mod metrics;
pub mod protocol;
pub mod server;
pub mod shutdown;
pub mod transport;
pub mod websocket;

pub use config::ServerConfig;
pub use errors::{ApiError, ConfigError, ServerError};
pub use server::PushServer;
