//! Transport boundary.
//!
//! The client never touches sockets directly. A [`FrameTransport`] opens
//! one connection per call and hands back a [`TransportLink`]: a sender for
//! outbound frames and a receiver of [`TransportEvent`]s. Every link ends
//! with exactly one [`TransportEvent::Closed`] (or the event channel
//! closing, which the client treats as an abnormal close).

use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;

use crate::types::{CloseInfo, Frame, Handshake};

/// Errors surfaced by a transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    /// Nothing accepted the connection, or the server answered the upgrade
    /// with a non-101 status.
    #[error("connection refused: {0}")]
    Refused(String),

    #[error("no message within {0:?}, connection considered dead")]
    PongTimeout(std::time::Duration),
}

/// Requests sent to an open link.
#[derive(Debug)]
pub enum Outbound {
    Frame(Frame),
    /// Start the close handshake.
    Close,
}

/// Notifications delivered by an open link.
#[derive(Debug)]
pub enum TransportEvent {
    Message(Frame),
    /// A fault on the link. Always followed by the link closing.
    Error(TransportError),
    Closed(CloseInfo),
}

/// One open connection.
#[derive(Debug)]
pub struct TransportLink {
    pub handshake: Handshake,
    pub outbound: mpsc::Sender<Outbound>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// A boxed future returned by [`FrameTransport::open`].
pub type OpenFuture<'a> = Pin<Box<dyn Future<Output = Result<TransportLink, TransportError>> + Send + 'a>>;

/// Opens duplex frame connections.
///
/// Each call to [`open`](FrameTransport::open) starts a fresh connection;
/// the client calls it again for every reconnect attempt.
pub trait FrameTransport: Send + Sync + 'static {
    fn open(&self) -> OpenFuture<'_>;
}
