//! Session server types.

use std::fmt;

use nerfhub_proto::MessageKind;
use serde::Serialize;

/// Identifier of one client connection, unique per server instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Configuration for the session server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Successive ports tried by `start` before giving up.
    pub port_attempts: u16,
    /// Largest accepted incoming frame.
    pub max_frame_bytes: usize,
    /// Rebroadcast client GUI updates under a `gui/<id>` replay slot.
    pub mirror_gui_updates: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port_attempts: 500,
            max_frame_bytes: 8 * 1024 * 1024,
            mirror_gui_updates: true,
        }
    }
}

impl ServerConfig {
    /// Build from the `viewer` and `session` config sections.
    pub fn from_config(config: &nerfhub_core::Config) -> Self {
        Self {
            port_attempts: config.viewer.port_attempts.max(1),
            max_frame_bytes: config.session.max_frame_bytes,
            ..Self::default()
        }
    }
}

/// Point-in-time server statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStats {
    pub live_sessions: usize,
    pub total_connections: u64,
    pub buffered_slots: usize,
}

/// Session server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("No free port on {host} in {first_port}..{first_port}+{attempts}: {reason}")]
    Bind {
        host: String,
        first_port: u16,
        attempts: u16,
        reason: String,
    },

    #[error("Session server already started on {addr}")]
    AlreadyStarted { addr: std::net::SocketAddr },

    #[error("Session server is already binding")]
    Starting,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A handler invocation that failed. Logged, never propagated.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Handler for {kind} failed on session {session_id}: {reason}")]
    Failed {
        kind: MessageKind,
        session_id: SessionId,
        reason: String,
    },

    #[error("Handler for {kind} panicked on session {session_id}")]
    Panicked {
        kind: MessageKind,
        session_id: SessionId,
    },
}
