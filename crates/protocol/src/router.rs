//! Method routing for inbound text frames.
//!
//! A frame is decoded into an [`Envelope`], its method name is resolved
//! against [`MethodName`], and the matching [`MethodHandler`] hook runs.
//! Nothing in here fails the caller: malformed frames, unknown methods and
//! handler errors all come back as a [`DispatchOutcome`] after being logged,
//! so one bad message never takes a connection down.

use std::future::Future;
use std::pin::Pin;

use tracing::{debug, error, trace, warn};

use crate::constants::MethodName;
use crate::envelope::{Envelope, ProtocolError};

/// A boxed future returned by handler hooks.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>>;

/// Errors a handler hook may report back to the router.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("method {0} is not handled here")]
    Unsupported(MethodName),

    #[error("invalid body: {0}")]
    InvalidBody(#[from] serde_json::Error),

    #[error("{0}")]
    Failed(String),
}

/// Result of routing one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The hook for this method ran and succeeded.
    Handled(MethodName),
    /// The frame was not a valid envelope.
    Malformed,
    /// The envelope named a method outside [`MethodName`].
    UnknownMethod,
    /// The method is known but the handler does not implement it.
    Unsupported(MethodName),
    /// The hook ran and returned an error.
    Failed(MethodName),
}

impl DispatchOutcome {
    pub fn is_handled(&self) -> bool {
        matches!(self, DispatchOutcome::Handled(_))
    }
}

/// Per-method hooks invoked by [`dispatch`].
///
/// Implementors carry their own dispatch context (a session's supplier
/// handler, a registry, ...). Hooks default to [`HandlerError::Unsupported`]
/// except `on_heartbeat`, which succeeds silently, so a handler only needs
/// to override what it cares about. Handlers that treat every method the
/// same way override [`MethodHandler::route`] instead.
pub trait MethodHandler: Send + Sync {
    /// Selects the hook bound to `method`.
    fn route(&self, method: MethodName, msg: Envelope) -> HandlerFuture<'_> {
        match method {
            MethodName::Heartbeat => self.on_heartbeat(msg),
            MethodName::DeviceEvent => self.on_device_event(msg),
            MethodName::DeviceStatus => self.on_device_status(msg),
            MethodName::DeviceCommand => self.on_device_command(msg),
            MethodName::Broadcast => self.on_broadcast(msg),
        }
    }

    /// Called for `HEARTBEAT`.
    fn on_heartbeat(&self, msg: Envelope) -> HandlerFuture<'_> {
        let _ = msg;
        Box::pin(async { Ok(()) })
    }

    /// Called for `DEVICE_EVENT`.
    fn on_device_event(&self, msg: Envelope) -> HandlerFuture<'_> {
        let _ = msg;
        unsupported(MethodName::DeviceEvent)
    }

    /// Called for `DEVICE_STATUS`.
    fn on_device_status(&self, msg: Envelope) -> HandlerFuture<'_> {
        let _ = msg;
        unsupported(MethodName::DeviceStatus)
    }

    /// Called for `DEVICE_COMMAND`.
    fn on_device_command(&self, msg: Envelope) -> HandlerFuture<'_> {
        let _ = msg;
        unsupported(MethodName::DeviceCommand)
    }

    /// Called for `BROADCAST`.
    fn on_broadcast(&self, msg: Envelope) -> HandlerFuture<'_> {
        let _ = msg;
        unsupported(MethodName::Broadcast)
    }
}

fn unsupported<'a>(method: MethodName) -> HandlerFuture<'a> {
    Box::pin(async move { Err(HandlerError::Unsupported(method)) })
}

/// Decodes a text frame and resolves its method.
pub fn decode(text: &str) -> Result<(MethodName, Envelope), ProtocolError> {
    let msg = Envelope::from_json(text)?;
    let method = msg.method()?;
    Ok((method, msg))
}

/// Routes a text frame to `handler`.
pub async fn dispatch<H: MethodHandler + ?Sized>(handler: &H, text: &str) -> DispatchOutcome {
    let (method, msg) = match decode(text) {
        Ok(decoded) => decoded,
        Err(ProtocolError::Malformed(e)) => {
            warn!("dropping malformed envelope: {e}");
            return DispatchOutcome::Malformed;
        }
        Err(ProtocolError::UnknownMethod(name)) => {
            warn!(method = %name, "dropping envelope with unknown method");
            return DispatchOutcome::UnknownMethod;
        }
    };

    trace!(%method, "dispatching envelope");

    match handler.route(method, msg).await {
        Ok(()) => DispatchOutcome::Handled(method),
        Err(HandlerError::Unsupported(m)) => {
            debug!(method = %m, "no hook for method, dropping");
            DispatchOutcome::Unsupported(m)
        }
        Err(e) => {
            error!(%method, error = %e, "handler failed");
            DispatchOutcome::Failed(method)
        }
    }
}
