//! WebSocket implementation of [`FrameTransport`] over tokio-tungstenite.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use devgate_protocol::constants::WS_MAX_MESSAGE_SIZE;

use crate::LINK_BUFFER_SIZE;
use crate::transport::{FrameTransport, OpenFuture, TransportError, TransportLink};
use crate::types::Handshake;

/// Settings for [`WsTransport`].
#[derive(Debug, Clone)]
pub struct WsTransportConfig {
    /// `ws://` or `wss://` URL to connect to.
    pub url: String,
    /// Largest accepted message, in bytes.
    pub max_message_size: usize,
}

impl WsTransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_message_size: WS_MAX_MESSAGE_SIZE,
        }
    }
}

/// Opens WebSocket connections to a fixed URL.
///
/// Every open spawns a read pump and a write pump for the new socket; both
/// stop when the socket closes or the [`TransportLink`] is dropped.
#[derive(Debug, Clone)]
pub struct WsTransport {
    config: WsTransportConfig,
}

impl WsTransport {
    pub fn new(config: WsTransportConfig) -> Self {
        Self { config }
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }
}

impl FrameTransport for WsTransport {
    fn open(&self) -> OpenFuture<'_> {
        Box::pin(async move {
            let mut ws_config = WebSocketConfig::default();
            ws_config.max_message_size = Some(self.config.max_message_size);
            ws_config.max_frame_size = Some(self.config.max_message_size);

            let (ws_stream, response) = tokio_tungstenite::connect_async_with_config(self.url(), Some(ws_config), false)
                .await
                .map_err(|e| connect_error(self.url(), e))?;

            let handshake = Handshake {
                status: response.status().as_u16(),
                protocol: response
                    .headers()
                    .get("sec-websocket-protocol")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string),
            };
            debug!(url = %self.url(), status = handshake.status, "WebSocket handshake complete");

            let (write, read) = ws_stream.split();
            let (out_tx, out_rx) = mpsc::channel(LINK_BUFFER_SIZE);
            let (ev_tx, ev_rx) = mpsc::channel(LINK_BUFFER_SIZE);
            let (ctrl_tx, ctrl_rx) = mpsc::channel::<tungstenite::Message>(16);
            let local_close = Arc::new(AtomicBool::new(false));
            let cancel = CancellationToken::new();

            tokio::spawn(crate::pumps::write::write_pump(
                write,
                out_rx,
                ctrl_rx,
                local_close.clone(),
                cancel.clone(),
            ));
            tokio::spawn(crate::pumps::read::read_pump(
                read,
                ev_tx,
                ctrl_tx,
                local_close,
                self.config.max_message_size,
                cancel,
            ));

            Ok(TransportLink {
                handshake,
                outbound: out_tx,
                events: ev_rx,
            })
        })
    }
}

/// Nothing listening or an upgrade answered with a plain HTTP status is a
/// refusal; anything else stays a WebSocket error.
fn connect_error(url: &str, err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::Io(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            TransportError::Refused(format!("{url}: {e}"))
        }
        tungstenite::Error::Http(response) => {
            TransportError::Refused(format!("{url}: upgrade rejected with status {}", response.status()))
        }
        other => TransportError::Ws(other),
    }
}
