//! Public types for the client link.

use std::time::Duration;

use devgate_protocol::constants::{CLOSE_ABNORMAL, DEFAULT_RECONNECT_INTERVAL};

/// Connection state of a [`ReconnectingClient`](crate::ReconnectingClient).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport open sequence in progress (also the initial state).
    Connecting,
    /// Transport open, frames may be sent.
    Open,
    /// Close frame sent, waiting for the transport to finish.
    Closing,
    /// Transport closed; a reconnect follows unless the owner closed the client.
    Closed,
}

/// A frame exchanged over the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl From<String> for Frame {
    fn from(text: String) -> Self {
        Frame::Text(text)
    }
}

impl From<&str> for Frame {
    fn from(text: &str) -> Self {
        Frame::Text(text.to_string())
    }
}

impl From<Vec<u8>> for Frame {
    fn from(data: Vec<u8>) -> Self {
        Frame::Binary(data)
    }
}

/// Information reported by the transport when it opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// HTTP status of the upgrade response (101 for WebSocket).
    pub status: u16,
    /// Negotiated subprotocol, if any.
    pub protocol: Option<String>,
}

/// Why a transport closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
    /// `true` when the peer initiated the close.
    pub remote: bool,
}

impl CloseInfo {
    /// A close without a close handshake (refused, reset, dropped).
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self {
            code: CLOSE_ABNORMAL,
            reason: reason.into(),
            remote: false,
        }
    }
}

/// Reconnect policy: a fixed pause between attempts, retried forever.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Pause before each reconnect attempt.
    pub interval: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RECONNECT_INTERVAL,
        }
    }
}

impl ReconnectConfig {
    /// Builds a config, falling back to the default for a zero interval.
    pub fn with_interval(interval: Duration) -> Self {
        if interval.is_zero() {
            Self::default()
        } else {
            Self { interval }
        }
    }
}
