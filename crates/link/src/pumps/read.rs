//! WebSocket read pump: turns incoming frames into transport events.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use devgate_protocol::constants::{CLOSE_ABNORMAL, WS_PONG_WAIT};

use crate::transport::{TransportError, TransportEvent};
use crate::types::{CloseInfo, Frame};

/// Close code reported when the peer sent a close frame without a status.
const CLOSE_NO_STATUS: u16 = 1005;

/// Reads frames from the WebSocket and forwards them as [`TransportEvent`]s.
///
/// Any incoming frame resets the pong deadline; if nothing arrives within
/// [`WS_PONG_WAIT`] the link is reported dead. The pump always finishes by
/// emitting exactly one [`TransportEvent::Closed`] and cancelling `cancel`
/// so the write pump stops too.
pub(crate) async fn read_pump<S>(
    mut read: S,
    events: mpsc::Sender<TransportEvent>,
    control: mpsc::Sender<tungstenite::Message>,
    local_close: Arc<AtomicBool>,
    max_message_size: usize,
    cancel: CancellationToken,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    let pong_deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(pong_deadline);

    let close = loop {
        tokio::select! {
            _ = cancel.cancelled() => break CloseInfo::abnormal("link cancelled"),

            () = &mut pong_deadline => {
                warn!("pong timeout, connection dead, closing");
                let _ = events.send(TransportEvent::Error(TransportError::PongTimeout(WS_PONG_WAIT))).await;
                break CloseInfo::abnormal("pong timeout");
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        pong_deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);

                        let frame = match msg {
                            tungstenite::Message::Text(text) => Frame::Text(text.to_string()),
                            tungstenite::Message::Binary(data) => Frame::Binary(data.to_vec()),
                            tungstenite::Message::Ping(data) => {
                                trace!("received ping, sending pong");
                                let _ = control.send(tungstenite::Message::Pong(data)).await;
                                continue;
                            }
                            tungstenite::Message::Pong(_) => {
                                trace!("received pong");
                                continue;
                            }
                            tungstenite::Message::Close(frame) => {
                                let remote = !local_close.load(Ordering::SeqCst);
                                break match frame {
                                    Some(f) => CloseInfo {
                                        code: u16::from(f.code),
                                        reason: f.reason.to_string(),
                                        remote,
                                    },
                                    None => CloseInfo {
                                        code: CLOSE_NO_STATUS,
                                        reason: String::new(),
                                        remote,
                                    },
                                };
                            }
                            tungstenite::Message::Frame(_) => continue,
                        };

                        let size = match &frame {
                            Frame::Text(t) => t.len(),
                            Frame::Binary(b) => b.len(),
                        };
                        if size > max_message_size {
                            warn!("message too large ({size} bytes), dropping");
                            continue;
                        }

                        if events.send(TransportEvent::Message(frame)).await.is_err() {
                            debug!("link owner gone, stopping read pump");
                            break CloseInfo::abnormal("link dropped");
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket read error: {e}");
                        let reason = e.to_string();
                        let _ = events.send(TransportEvent::Error(TransportError::Ws(e))).await;
                        break CloseInfo::abnormal(reason);
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        break CloseInfo {
                            code: CLOSE_ABNORMAL,
                            reason: "stream ended".into(),
                            remote: true,
                        };
                    }
                }
            }
        }
    };

    cancel.cancel();
    debug!(code = close.code, reason = %close.reason, remote = close.remote, "link closed");
    let _ = events.send(TransportEvent::Closed(close)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

    type WsItem = Result<tungstenite::Message, tungstenite::Error>;

    struct Harness {
        events: mpsc::Receiver<TransportEvent>,
        control: mpsc::Receiver<tungstenite::Message>,
    }

    async fn run<S>(stream: S, local_close: bool) -> Harness
    where
        S: StreamExt<Item = WsItem> + Unpin,
    {
        let (ev_tx, ev_rx) = mpsc::channel(16);
        let (ctrl_tx, ctrl_rx) = mpsc::channel(16);
        read_pump(
            stream,
            ev_tx,
            ctrl_tx,
            Arc::new(AtomicBool::new(local_close)),
            1024,
            CancellationToken::new(),
        )
        .await;
        Harness {
            events: ev_rx,
            control: ctrl_rx,
        }
    }

    #[tokio::test]
    async fn forwards_frames_then_reports_stream_end() {
        let frames: Vec<WsItem> = vec![
            Ok(tungstenite::Message::Text("one".into())),
            Ok(tungstenite::Message::Binary(vec![7u8].into())),
        ];
        let mut h = run(stream::iter(frames), false).await;

        assert!(matches!(
            h.events.recv().await,
            Some(TransportEvent::Message(Frame::Text(ref t))) if t == "one"
        ));
        assert!(matches!(
            h.events.recv().await,
            Some(TransportEvent::Message(Frame::Binary(ref b))) if b == &[7]
        ));
        match h.events.recv().await {
            Some(TransportEvent::Closed(info)) => {
                assert_eq!(info.code, CLOSE_ABNORMAL);
                assert!(info.remote);
            }
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn remote_close_frame_is_reported() {
        let frames: Vec<WsItem> = vec![Ok(tungstenite::Message::Close(Some(CloseFrame {
            code: CloseCode::Away,
            reason: "bye".into(),
        })))];
        let mut h = run(stream::iter(frames), false).await;

        match h.events.recv().await {
            Some(TransportEvent::Closed(info)) => {
                assert_eq!(info.code, 1001);
                assert_eq!(info.reason, "bye");
                assert!(info.remote);
            }
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_reply_after_local_close_is_not_remote() {
        let frames: Vec<WsItem> = vec![Ok(tungstenite::Message::Close(None))];
        let mut h = run(stream::iter(frames), true).await;

        match h.events.recv().await {
            Some(TransportEvent::Closed(info)) => {
                assert_eq!(info.code, CLOSE_NO_STATUS);
                assert!(!info.remote);
            }
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ping_is_answered_on_control_channel() {
        let frames: Vec<WsItem> = vec![Ok(tungstenite::Message::Ping(vec![1u8].into()))];
        let mut h = run(stream::iter(frames), false).await;

        assert!(matches!(h.control.recv().await, Some(tungstenite::Message::Pong(_))));
        assert!(matches!(h.events.recv().await, Some(TransportEvent::Closed(_))));
    }

    #[tokio::test]
    async fn oversized_message_is_dropped() {
        let huge = "x".repeat(2048);
        let frames: Vec<WsItem> = vec![Ok(tungstenite::Message::Text(huge.into()))];
        let mut h = run(stream::iter(frames), false).await;

        assert!(matches!(h.events.recv().await, Some(TransportEvent::Closed(_))));
    }

    #[tokio::test]
    async fn read_error_is_reported_before_close() {
        let frames: Vec<WsItem> = vec![Err(tungstenite::Error::ConnectionClosed)];
        let mut h = run(stream::iter(frames), false).await;

        assert!(matches!(h.events.recv().await, Some(TransportEvent::Error(_))));
        match h.events.recv().await {
            Some(TransportEvent::Closed(info)) => assert_eq!(info.code, CLOSE_ABNORMAL),
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn silence_trips_pong_deadline() {
        tokio::time::pause();

        let mut h = run(stream::pending::<WsItem>(), false).await;

        assert!(matches!(
            h.events.recv().await,
            Some(TransportEvent::Error(TransportError::PongTimeout(_)))
        ));
        assert!(matches!(h.events.recv().await, Some(TransportEvent::Closed(_))));
    }
}
