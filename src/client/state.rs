//! Upstream connection state machine.
//!
//! ```text
//!  Disconnected ──► Connecting ──► Connected
//!       ▲               │              │
//!       └───────────────┴──────────────┘
//! ```

use std::time::Instant;

use crate::error::{StreamError, StreamResult};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No link. Initial and terminal state.
    #[default]
    Disconnected,

    /// Dialing and handshaking.
    Connecting,

    /// Identified to the relay; commands are being served.
    Connected {
        since: Instant,
    },
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected { .. } => write!(f, "Connected"),
        }
    }
}

impl ConnectionState {
    #[cfg(test)]
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected)
    }

    /// Time spent in `Connected`, if connected.
    pub fn connected_for(&self) -> Option<std::time::Duration> {
        match self {
            Self::Connected { since } => Some(since.elapsed()),
            _ => None,
        }
    }

    /// Valid from `Disconnected` only. Anything else means a connection
    /// attempt is already under way.
    pub fn begin_connect(&mut self) -> StreamResult<()> {
        match self {
            Self::Disconnected => {
                *self = Self::Connecting;
                Ok(())
            }
            other => Err(StreamError::Protocol(format!("cannot connect while {}", other))),
        }
    }

    /// Valid from `Connecting`, once the handshake has been sent.
    pub fn complete_connect(&mut self) -> StreamResult<()> {
        match self {
            Self::Connecting => {
                *self = Self::Connected {
                    since: Instant::now(),
                };
                Ok(())
            }
            other => Err(StreamError::Protocol(format!(
                "cannot complete connect while {}",
                other
            ))),
        }
    }

    /// Back to `Disconnected` from anywhere.
    pub fn disconnect(&mut self) {
        *self = Self::Disconnected;
    }
}
