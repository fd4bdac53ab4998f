//! WebSocket write pump: serialises outbound frames and keepalive pings.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use devgate_protocol::constants::WS_PING_PERIOD;

use crate::transport::Outbound;
use crate::types::Frame;

/// Writes frames to the WebSocket.
///
/// `control` carries pong replies queued by the read pump. `local_close`
/// is raised before the close frame goes out so the read pump can tell a
/// local close from a remote one.
pub(crate) async fn write_pump<S>(
    mut write: S,
    mut outbound: mpsc::Receiver<Outbound>,
    mut control: mpsc::Receiver<tungstenite::Message>,
    local_close: Arc<AtomicBool>,
    cancel: CancellationToken,
) where
    S: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    let mut ping = tokio::time::interval(WS_PING_PERIOD);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await; // Skip immediate first tick.

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            out = outbound.recv() => {
                match out {
                    Some(Outbound::Frame(frame)) => {
                        let msg = match frame {
                            Frame::Text(text) => tungstenite::Message::Text(text.into()),
                            Frame::Binary(data) => tungstenite::Message::Binary(data.into()),
                        };
                        if let Err(e) = write.send(msg).await {
                            error!("WebSocket write error: {e}");
                            break;
                        }
                    }
                    // Explicit close, or the owner dropped the link.
                    Some(Outbound::Close) | None => {
                        debug!("sending close frame");
                        local_close.store(true, Ordering::SeqCst);
                        let frame = CloseFrame {
                            code: CloseCode::Normal,
                            reason: tungstenite::Utf8Bytes::from_static("closing"),
                        };
                        let _ = write.send(tungstenite::Message::Close(Some(frame))).await;
                        return;
                    }
                }
            }

            Some(msg) = control.recv() => {
                if let Err(e) = write.send(msg).await {
                    error!("WebSocket control write error: {e}");
                    break;
                }
            }

            _ = ping.tick() => {
                if let Err(e) = write.send(tungstenite::Message::Ping(Vec::new().into())).await {
                    error!("WebSocket ping error: {e}");
                    break;
                }
            }
        }
    }

    let _ = write.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::sink;

    fn capture_sink(
        tx: mpsc::Sender<tungstenite::Message>,
    ) -> impl futures_util::Sink<tungstenite::Message, Error = tungstenite::Error> + Unpin {
        Box::pin(sink::unfold(tx, |tx, msg: tungstenite::Message| async move {
            let _ = tx.send(msg).await;
            Ok::<_, tungstenite::Error>(tx)
        }))
    }

    #[tokio::test]
    async fn write_pump_sends_frames_then_close() {
        let (sink_tx, mut sink_rx) = mpsc::channel(16);
        let (out_tx, out_rx) = mpsc::channel(16);
        let (_ctrl_tx, ctrl_rx) = mpsc::channel(16);
        let local_close = Arc::new(AtomicBool::new(false));

        let handle = tokio::spawn(write_pump(
            capture_sink(sink_tx),
            out_rx,
            ctrl_rx,
            local_close.clone(),
            CancellationToken::new(),
        ));

        out_tx.send(Outbound::Frame(Frame::Text("hello".into()))).await.unwrap();
        out_tx.send(Outbound::Frame(Frame::Binary(vec![1, 2, 3]))).await.unwrap();
        out_tx.send(Outbound::Close).await.unwrap();
        handle.await.unwrap();

        match sink_rx.recv().await {
            Some(tungstenite::Message::Text(t)) => assert_eq!(t.as_str(), "hello"),
            other => panic!("expected text, got {other:?}"),
        }
        match sink_rx.recv().await {
            Some(tungstenite::Message::Binary(b)) => assert_eq!(b.to_vec(), vec![1, 2, 3]),
            other => panic!("expected binary, got {other:?}"),
        }
        match sink_rx.recv().await {
            Some(tungstenite::Message::Close(Some(f))) => assert_eq!(f.code, CloseCode::Normal),
            other => panic!("expected close, got {other:?}"),
        }
        assert!(local_close.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn write_pump_forwards_control_frames() {
        let (sink_tx, mut sink_rx) = mpsc::channel(16);
        let (_out_tx, out_rx) = mpsc::channel(16);
        let (ctrl_tx, ctrl_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(write_pump(
            capture_sink(sink_tx),
            out_rx,
            ctrl_rx,
            Arc::new(AtomicBool::new(false)),
            cancel.clone(),
        ));

        ctrl_tx
            .send(tungstenite::Message::Pong(vec![9].into()))
            .await
            .unwrap();
        let msg = sink_rx.recv().await;
        assert!(matches!(msg, Some(tungstenite::Message::Pong(_))));

        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .expect("should stop")
            .expect("no panic");
    }
}
