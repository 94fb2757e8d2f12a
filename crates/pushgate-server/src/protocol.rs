//! Wire schema for client control frames, server frames and the send API.

use serde::{Deserialize, Serialize};

use crate::ids::{ConnectionId, Identity};

/// Version advertised in `connection.established`.
pub const PROTOCOL_VERSION: u32 = 1;

/// Control frame sent by a connected client.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    /// Add event subscriptions.
    Subscribe {
        /// Event names to add.
        events: Vec<String>,
    },
    /// Remove event subscriptions.
    Unsubscribe {
        /// Event names to remove.
        events: Vec<String>,
    },
    /// Application-level ping, answered with `pong`.
    Ping,
}

/// Frame written by the server outside of dispatched messages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    /// First frame on every connection.
    #[serde(rename = "connection.established")]
    Established {
        /// Protocol version.
        version: u32,
        /// Connection details.
        data: EstablishedData,
    },
    /// Subscriptions after a subscribe/unsubscribe.
    #[serde(rename = "subscriptions")]
    Subscriptions {
        /// Current event set, sorted. Empty means every event.
        events: Vec<String>,
    },
    /// Reply to a client `ping`.
    #[serde(rename = "pong")]
    Pong,
    /// A control frame could not be handled.
    #[serde(rename = "error")]
    Error {
        /// Human-readable reason.
        message: String,
    },
}

/// Payload of [`ServerFrame::Established`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EstablishedData {
    /// Server-assigned connection id.
    pub connection_id: ConnectionId,
    /// Identity the connection is bound to.
    pub user_id: Identity,
    /// Initial subscriptions.
    pub events: Vec<String>,
    /// RFC 3339 server time.
    pub timestamp: String,
}

impl ServerFrame {
    /// Serialize to a JSON text frame body.
    pub fn to_json(&self) -> String {
        // Only strings and integers; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Body of `POST {send_path}`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    /// Target identity.
    #[serde(alias = "user_id")]
    pub user_id: String,
    /// Optional event scope. Absent, `""` and `"*"` address every connection.
    #[serde(default)]
    pub event: Option<String>,
    /// Text delivered verbatim as one frame.
    pub message: String,
}

/// Delivery summary returned by the send endpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReport {
    /// Connections selected by the lookup.
    pub matched: usize,
    /// Writes that completed.
    pub delivered: usize,
    /// Writes that failed or timed out.
    pub failed: usize,
}
