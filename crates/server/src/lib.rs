//! WebSocket server for devices.
//!
//! Accepts one connection per device at `/{prefix}/{deviceId}`, resolves the
//! device, its supplier configuration and supplier handler through external
//! collaborators, and keeps every active [`DeviceSession`] in a shared
//! [`DeviceSessionRegistry`] for broadcast and targeted delivery.

mod connection;
pub mod directory;
pub mod memory;
pub mod registry;
mod server;
pub mod session;

pub use connection::{SendError, Sender};
pub use directory::{
    Collaborators, DeviceDirectory, DeviceMessageHandler, LookupError, LookupFuture, SupplierConfigStore,
    SupplierFactory,
};
pub use memory::InMemoryDirectory;
pub use registry::{BroadcastReport, DeviceSessionRegistry, SessionRecord};
pub use server::{DeviceServer, ServerConfig};
pub use session::{DeviceSession, SessionError, SessionState};

/// Send buffer capacity per device connection.
pub const SEND_BUFFER_SIZE: usize = 1024;

/// Errors produced by the device server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no device route for path {0}")]
    UnknownPath(String),
}
