//! Lifecycle callbacks for a [`ReconnectingClient`](crate::ReconnectingClient).

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, info, warn};

use devgate_protocol::router::{self, MethodHandler};

use crate::transport::TransportError;
use crate::types::{CloseInfo, Handshake};

/// A boxed future returned by callback methods.
pub type CallbackFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Owner-supplied reactions to connection events.
///
/// Callbacks for one client run one at a time, in event order, on the
/// client's own task. A panicking callback is caught and logged by the
/// client; it never stops the reconnect loop.
pub trait ClientHandler: Send + Sync + 'static {
    /// Called after the transport opened and the attempt counter was reset.
    fn on_open<'a>(&'a self, handshake: &'a Handshake) -> CallbackFuture<'a>;

    /// Called for every inbound text frame.
    fn on_message(&self, text: String) -> CallbackFuture<'_>;

    /// Called when a transport fault occurs. A close always follows.
    fn on_error<'a>(&'a self, err: &'a TransportError) -> CallbackFuture<'a>;

    /// Called for every inbound binary frame.
    fn on_binary(&self, data: Vec<u8>) -> CallbackFuture<'_> {
        Box::pin(async move {
            debug!(len = data.len(), "binary frame received but not handled, dropping");
        })
    }

    /// Called once the transport is closed, before any reconnect attempt.
    fn on_close<'a>(&'a self, info: &'a CloseInfo) -> CallbackFuture<'a> {
        let _ = info;
        Box::pin(async {})
    }

    /// Called before the client pauses for reconnect attempt `attempt`.
    fn on_reconnecting(&self, attempt: u32, delay: Duration) -> CallbackFuture<'_> {
        let _ = (attempt, delay);
        Box::pin(async {})
    }
}

/// [`ClientHandler`] that routes every text frame through the envelope
/// router to a [`MethodHandler`].
pub struct RoutedHandler<M> {
    methods: M,
}

impl<M: MethodHandler + 'static> RoutedHandler<M> {
    pub fn new(methods: M) -> Self {
        Self { methods }
    }

    /// The method hooks behind this handler.
    pub fn methods(&self) -> &M {
        &self.methods
    }
}

impl<M: MethodHandler + 'static> ClientHandler for RoutedHandler<M> {
    fn on_open<'a>(&'a self, handshake: &'a Handshake) -> CallbackFuture<'a> {
        Box::pin(async move {
            info!(status = handshake.status, "link open");
        })
    }

    fn on_message(&self, text: String) -> CallbackFuture<'_> {
        Box::pin(async move {
            router::dispatch(&self.methods, &text).await;
        })
    }

    fn on_error<'a>(&'a self, err: &'a TransportError) -> CallbackFuture<'a> {
        Box::pin(async move {
            warn!(error = %err, "link error, connection will close");
        })
    }
}
