use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::envelope::ProtocolError;

/// Time to wait for a pong response (or any incoming message).
///
/// Acts as a read deadline: if nothing arrives within this window the
/// connection is considered dead and torn down.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(60);

/// How often to send pings.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(5);

/// Maximum message size in bytes (16 MB).
pub const WS_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Time allowed for the peer to acknowledge a close frame.
pub const WS_CLOSE_WAIT: Duration = Duration::from_secs(5);

/// Default pause between reconnect attempts.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

/// Close code used when a connection ends without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Close code for an orderly shutdown.
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code sent to a device whose identity could not be resolved.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Method identifier carried in the `methodName` field of an [`Envelope`].
///
/// The set is closed: names outside it are reported as unknown by the
/// router and dropped without affecting the connection.
///
/// [`Envelope`]: crate::envelope::Envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MethodName {
    /// Liveness notification, carries no meaningful body.
    Heartbeat,
    /// Event raised by a device (door opened, face captured, ...).
    DeviceEvent,
    /// Periodic status report from a device.
    DeviceStatus,
    /// Command addressed to a single device.
    DeviceCommand,
    /// Message to fan out to every connected device.
    Broadcast,
}

impl MethodName {
    /// Every recognized method, in declaration order.
    pub const ALL: [MethodName; 5] = [
        MethodName::Heartbeat,
        MethodName::DeviceEvent,
        MethodName::DeviceStatus,
        MethodName::DeviceCommand,
        MethodName::Broadcast,
    ];

    /// Wire name of the method.
    pub fn as_str(self) -> &'static str {
        match self {
            MethodName::Heartbeat => "HEARTBEAT",
            MethodName::DeviceEvent => "DEVICE_EVENT",
            MethodName::DeviceStatus => "DEVICE_STATUS",
            MethodName::DeviceCommand => "DEVICE_COMMAND",
            MethodName::Broadcast => "BROADCAST",
        }
    }
}

impl fmt::Display for MethodName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MethodName {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MethodName::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownMethod(s.to_string()))
    }
}
