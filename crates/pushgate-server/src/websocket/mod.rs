//! WebSocket connections: registry, liveness, and the ingress session.

pub mod binder;
pub mod connection;
pub mod heartbeat;
pub mod ingress;
