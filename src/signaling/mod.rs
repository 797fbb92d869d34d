// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Realtime signaling channel.
//!
//! A small bidirectional control plane that tells other devices on the same
//! budget "something changed, go pull". It never carries budget data, plain
//! or encrypted; receivers fetch through the normal encrypted cloud path.
//!
//! ```text
//!                 connect()            open             drop / missed heartbeats
//! Disconnected ─────────────► Connecting ────► Connected ─────────────────────┐
//!      ▲                          ▲                │ clean close               │
//!      │ disconnect()             │ backoff        ▼                           ▼
//!      └──────────────────────────┴───────── Reconnecting ──(attempts > max)──► Error
//! ```

mod channel;
mod message;
mod transport;

pub use channel::{SignalingChannel, SignalingHandle};
pub use message::{SignalMessage, SignalMetadata, SignalType, MAX_METADATA_LEN};
pub use transport::{Frame, SignalSink, SignalSocket, SignalStream, SignalTransport, WsTransport};

use serde::Serialize;
use thiserror::Error;

/// Sent in the metadata of the initial `connected` signal.
pub const PROTOCOL_VERSION: &str = "2.0";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalError {
    #[error("signaling connect failed: {0}")]
    Connect(String),

    #[error("signal send failed: {0}")]
    Send(String),

    #[error("signaling channel is not connected")]
    NotConnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Reconnecting = 3,
    Error = 4,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Channel status. Always replaced as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalStatus {
    pub status: ConnectionState,
    pub is_connected: bool,
    /// Epoch millis of the last pong
    pub last_heartbeat: Option<i64>,
    pub reconnect_attempts: u32,
    pub error: Option<String>,
}

impl Default for SignalStatus {
    fn default() -> Self {
        Self {
            status: ConnectionState::Disconnected,
            is_connected: false,
            last_heartbeat: None,
            reconnect_attempts: 0,
            error: None,
        }
    }
}
