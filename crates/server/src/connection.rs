//! Device connection plumbing: read/write pumps, ping/pong, send buffering.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::Utf8Bytes;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use devgate_protocol::constants::{
    CLOSE_POLICY_VIOLATION, WS_CLOSE_WAIT, WS_MAX_MESSAGE_SIZE, WS_PING_PERIOD, WS_PONG_WAIT,
};

use crate::session::DeviceSession;

/// Handle for sending frames to one connected device.
///
/// Cloneable and cheap; wraps an `mpsc::Sender`.
#[derive(Clone)]
pub struct Sender {
    tx: mpsc::Sender<WsMessage>,
}

impl Sender {
    pub(crate) fn new(tx: mpsc::Sender<WsMessage>) -> Self {
        Self { tx }
    }

    /// Queues a text frame.
    ///
    /// Fails if the buffer is full or the device disconnected.
    pub fn send_text(&self, text: &str) -> Result<(), SendError> {
        self.tx
            .try_send(WsMessage::Text(text.to_owned().into()))
            .map_err(|_| {
                warn!("send buffer full or closed, dropping message");
                SendError
            })
    }

    /// Queues a binary frame.
    pub fn send_binary(&self, data: Vec<u8>) -> Result<(), SendError> {
        self.tx
            .try_send(WsMessage::Binary(data.into()))
            .map_err(|_| SendError)
    }

    /// Starts the close handshake. Best effort: a full or closed buffer is
    /// ignored, the connection is going away either way.
    pub fn close(&self, code: u16, reason: &'static str) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: Utf8Bytes::from_static(reason),
        };
        let _ = self.tx.try_send(WsMessage::Close(Some(frame)));
    }

    /// Returns `true` while the write pump is still running.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

impl std::fmt::Debug for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sender")
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Error returned when the send buffer is full or the connection closed.
#[derive(Debug, thiserror::Error)]
#[error("send failed: buffer full or connection closed")]
pub struct SendError;

/// Serves one upgraded device connection until it closes.
///
/// The session is resolved first; a session that fails to resolve gets a
/// policy-violation close. The read pump then feeds the session until the
/// connection ends, after which the session is closed (and unregistered).
pub(crate) async fn run_connection<S>(
    ws_stream: S,
    rx: mpsc::Receiver<WsMessage>,
    sender: Sender,
    mut session: DeviceSession,
    cancel: CancellationToken,
) where
    S: futures_util::Stream<Item = Result<WsMessage, tungstenite::Error>>
        + futures_util::Sink<WsMessage, Error = tungstenite::Error>
        + Send
        + 'static,
{
    let (ws_sink, ws_stream) = ws_stream.split();
    let writer = tokio::spawn(write_pump(ws_sink, rx, cancel.clone()));

    if let Err(e) = session.establish().await {
        warn!(device = %session.device_id(), "session setup failed, closing connection: {e}");
        sender.close(CLOSE_POLICY_VIOLATION, "device setup failed");
    }

    read_pump(ws_stream, &sender, &mut session, &cancel).await;

    // When the read pump exits, stop the write pump too.
    cancel.cancel();
    session.on_close().await;
    let _ = writer.await;
    info!(device = %session.device_id(), "device disconnected");
}

/// Write pump: drains the send channel and sends WS pings.
async fn write_pump<S>(mut sink: S, mut rx: mpsc::Receiver<WsMessage>, cancel: CancellationToken)
where
    S: futures_util::Sink<WsMessage, Error = tungstenite::Error> + Send + Unpin,
{
    let mut ping_interval = tokio::time::interval(WS_PING_PERIOD);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping_interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            msg = rx.recv() => {
                match msg {
                    Some(ws_msg) => {
                        let closing = matches!(ws_msg, WsMessage::Close(_));
                        if let Err(e) = sink.send(ws_msg).await {
                            error!("write pump send error: {e}");
                            break;
                        }
                        if closing {
                            // The read pump ends on the peer's reply; don't wait forever for it.
                            let _ = tokio::time::timeout(WS_CLOSE_WAIT, cancel.cancelled()).await;
                            cancel.cancel();
                            break;
                        }
                    }
                    None => break,
                }
            }

            _ = ping_interval.tick() => {
                if let Err(e) = sink.send(WsMessage::Ping(Vec::new().into())).await {
                    error!("write pump ping error: {e}");
                    break;
                }
            }
        }
    }

    // Best-effort close frame.
    let _ = sink.close().await;
}

/// Read pump: reads WS frames and feeds text frames to the session.
async fn read_pump<S>(mut stream: S, sender: &Sender, session: &mut DeviceSession, cancel: &CancellationToken)
where
    S: futures_util::Stream<Item = Result<WsMessage, tungstenite::Error>> + Send + Unpin,
{
    let pong_deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(pong_deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            () = &mut pong_deadline => {
                session.on_error(&"pong timeout");
                break;
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(ws_msg)) => {
                        pong_deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);

                        match ws_msg {
                            WsMessage::Text(text) => {
                                if text.len() > WS_MAX_MESSAGE_SIZE {
                                    error!("message exceeds max size ({} > {})", text.len(), WS_MAX_MESSAGE_SIZE);
                                    continue;
                                }
                                session.on_message(text.as_str()).await;
                            }
                            WsMessage::Binary(data) => {
                                debug!(device = %session.device_id(), len = data.len(), "binary frame from device ignored");
                            }
                            WsMessage::Ping(data) => {
                                let _ = sender.tx.try_send(WsMessage::Pong(data));
                            }
                            WsMessage::Pong(_) => trace!("received pong"),
                            WsMessage::Close(frame) => {
                                debug!(device = %session.device_id(), ?frame, "received close frame");
                                break;
                            }
                            WsMessage::Frame(_) => {}
                        }
                    }
                    Some(Err(e)) => {
                        session.on_error(&e);
                        break;
                    }
                    None => break,
                }
            }
        }
    }
}
