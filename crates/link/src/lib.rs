//! Auto-reconnecting client link.
//!
//! Wraps a [`FrameTransport`] in a connection state machine that reopens
//! the transport at a fixed interval whenever it closes, until the owner
//! closes the client. Lifecycle notifications go to a [`ClientHandler`];
//! [`RoutedHandler`] plugs the envelope router in as the message hook.

pub mod client;
pub mod handler;
mod pumps;
pub(crate) mod reconnection;
pub mod transport;
pub mod types;
pub mod ws_transport;

#[cfg(test)]
pub(crate) mod mock;

pub use client::{ClientError, ReconnectingClient};
pub use handler::{CallbackFuture, ClientHandler, RoutedHandler};
pub use transport::{FrameTransport, OpenFuture, Outbound, TransportError, TransportEvent, TransportLink};
pub use types::{CloseInfo, ConnectionState, Frame, Handshake, ReconnectConfig};
pub use ws_transport::{WsTransport, WsTransportConfig};

/// Capacity of the outbound and inbound frame buffers of one link.
pub const LINK_BUFFER_SIZE: usize = 1024;
