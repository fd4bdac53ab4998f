//! Connection driver: the open → serve → close → pause → reopen cycle.
//!
//! One driver task runs per client. It owns the event loop of whatever link
//! is current, so every callback of a client runs on this task, in order.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use futures_util::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use devgate_protocol::constants::{CLOSE_NORMAL, WS_CLOSE_WAIT};

use crate::handler::{CallbackFuture, ClientHandler};
use crate::transport::{FrameTransport, Outbound, TransportEvent, TransportLink};
use crate::types::{CloseInfo, ConnectionState, Frame, ReconnectConfig};

/// State shared between a client handle and its driver task.
pub(crate) struct Shared<T, H> {
    pub(crate) transport: T,
    pub(crate) handler: H,
    pub(crate) config: ReconnectConfig,
    pub(crate) state: watch::Sender<ConnectionState>,
    /// Reconnect attempts since the last successful open.
    pub(crate) attempts: AtomicU32,
    /// Outbound side of the current link, present only while open.
    pub(crate) outbound: std::sync::Mutex<Option<mpsc::Sender<Outbound>>>,
    /// Cancelled once by the owner; never reset.
    pub(crate) cancel: CancellationToken,
}

impl<T, H> Shared<T, H> {
    pub(crate) fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            trace!(from = ?previous, to = ?state, "connection state changed");
        }
    }

    fn set_outbound(&self, tx: Option<mpsc::Sender<Outbound>>) {
        if let Ok(mut guard) = self.outbound.lock() {
            *guard = tx;
        }
    }
}

/// Runs a handler callback, logging instead of propagating a panic.
///
/// The callback is invoked inside the guarded future, so a panic raised
/// while building its future is caught the same as one raised while
/// polling it.
async fn guarded<'a>(callback: &'static str, make: impl FnOnce() -> CallbackFuture<'a>) {
    let fut = async move { make().await };
    if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
        let detail = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".into());
        error!(callback, %detail, "client handler panicked");
    }
}

/// Drives the connection until the owner cancels.
///
/// Every close, including a failed open, is followed by one reconnect
/// attempt after `config.interval`. There is no retry ceiling.
pub(crate) async fn drive<T: FrameTransport, H: ClientHandler>(shared: Arc<Shared<T, H>>) {
    loop {
        shared.set_state(ConnectionState::Connecting);

        let opened = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            res = shared.transport.open() => res,
        };

        let close = match opened {
            Ok(link) => run_link(&shared, link).await,
            Err(e) => {
                warn!(error = %e, "transport open failed");
                guarded("on_error", || shared.handler.on_error(&e)).await;
                CloseInfo::abnormal(e.to_string())
            }
        };

        shared.set_outbound(None);
        shared.set_state(ConnectionState::Closed);
        info!(code = close.code, reason = %close.reason, remote = close.remote, "connection closed");
        guarded("on_close", || shared.handler.on_close(&close)).await;

        if shared.cancel.is_cancelled() {
            break;
        }

        let attempt = shared.attempts.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        let delay = shared.config.interval;
        info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
        guarded("on_reconnecting", || shared.handler.on_reconnecting(attempt, delay)).await;

        tokio::select! {
            _ = shared.cancel.cancelled() => {
                debug!(attempt, "reconnect cancelled");
                break;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }

    shared.set_outbound(None);
    shared.set_state(ConnectionState::Closed);
    debug!("connection driver stopped");
}

/// Serves one open link until it closes. Returns why it closed.
async fn run_link<T: FrameTransport, H: ClientHandler>(shared: &Shared<T, H>, link: TransportLink) -> CloseInfo {
    let TransportLink {
        handshake,
        outbound,
        mut events,
    } = link;

    // Reset before on_open so the handler never sees a stale count.
    shared.attempts.store(0, Ordering::SeqCst);
    shared.set_outbound(Some(outbound.clone()));
    shared.set_state(ConnectionState::Open);
    info!(status = handshake.status, "connection open");
    guarded("on_open", || shared.handler.on_open(&handshake)).await;

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => {
                let fallback = CloseInfo {
                    code: CLOSE_NORMAL,
                    reason: "closed by owner".into(),
                    remote: false,
                };
                return close_link(shared, &outbound, &mut events, fallback).await;
            }

            event = events.recv() => {
                match event {
                    Some(TransportEvent::Message(Frame::Text(text))) => {
                        guarded("on_message", || shared.handler.on_message(text)).await;
                    }
                    Some(TransportEvent::Message(Frame::Binary(data))) => {
                        guarded("on_binary", || shared.handler.on_binary(data)).await;
                    }
                    Some(TransportEvent::Error(e)) => {
                        warn!(error = %e, "transport error");
                        guarded("on_error", || shared.handler.on_error(&e)).await;
                        let fallback = CloseInfo::abnormal(e.to_string());
                        return close_link(shared, &outbound, &mut events, fallback).await;
                    }
                    Some(TransportEvent::Closed(info)) => return info,
                    None => return CloseInfo::abnormal("transport dropped the link"),
                }
            }
        }
    }
}

/// Requests a close and waits (bounded) for the transport to confirm it.
async fn close_link<T, H>(
    shared: &Shared<T, H>,
    outbound: &mpsc::Sender<Outbound>,
    events: &mut mpsc::Receiver<TransportEvent>,
    fallback: CloseInfo,
) -> CloseInfo {
    shared.set_state(ConnectionState::Closing);
    shared.set_outbound(None);

    let confirm = async {
        let _ = outbound.send(Outbound::Close).await;
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Closed(info) => return Some(info),
                other => trace!(?other, "dropping event while closing"),
            }
        }
        None
    };

    match tokio::time::timeout(WS_CLOSE_WAIT, confirm).await {
        Ok(Some(info)) => info,
        Ok(None) => fallback,
        Err(_) => {
            warn!("transport did not confirm close in time");
            fallback
        }
    }
}
