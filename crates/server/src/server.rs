//! Device WebSocket server.
//!
//! Listens on a TCP port, upgrades `GET /{prefix}/{deviceId}` to WebSocket
//! and runs one [`DeviceSession`] per connection. Any other path is refused
//! during the handshake with 404.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;

use devgate_protocol::constants::WS_MAX_MESSAGE_SIZE;
use devgate_protocol::{DeviceIdentity, Envelope};

use crate::connection::{self, Sender};
use crate::directory::Collaborators;
use crate::registry::{BroadcastReport, DeviceSessionRegistry};
use crate::session::DeviceSession;
use crate::{SEND_BUFFER_SIZE, ServerError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
    /// First path segment of device URLs.
    pub path_prefix: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 0,
            path_prefix: "devices".into(),
        }
    }
}

/// The device WebSocket server.
///
/// Owns the [`DeviceSessionRegistry`] its sessions register in; the
/// registry lives exactly as long as the server.
pub struct DeviceServer {
    config: ServerConfig,
    registry: Arc<DeviceSessionRegistry>,
    collaborators: Collaborators,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl DeviceServer {
    pub fn new(config: ServerConfig, collaborators: Collaborators) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: Arc::new(DeviceSessionRegistry::new()),
            collaborators,
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
        })
    }

    /// Returns the local address the server is listening on.
    ///
    /// Only available after [`run`](Self::run) binds the socket.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Returns the listening port (0 if not yet bound).
    pub async fn port(&self) -> u16 {
        self.local_addr.lock().await.map(|a| a.port()).unwrap_or(0)
    }

    pub fn registry(&self) -> Arc<DeviceSessionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Sends an envelope to every online device.
    pub async fn send_broadcast(&self, msg: &Envelope) -> Result<BroadcastReport, ServerError> {
        let text = msg.to_json()?;
        Ok(self.registry.broadcast(&text).await)
    }

    /// Sends an envelope to one device. Returns `false` if it is not online.
    pub async fn send_to_device(&self, identity: &DeviceIdentity, msg: &Envelope) -> Result<bool, ServerError> {
        let text = msg.to_json()?;
        Ok(self.registry.send_to(identity, &text).await)
    }

    pub async fn online_count(&self) -> usize {
        self.registry.online_count().await
    }

    /// Stops accepting and closes every device connection.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the server until [`shutdown`](Self::shutdown).
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        let addr: SocketAddr = ([0, 0, 0, 0], self.config.port).into();
        let listener = TcpListener::bind(addr).await?;

        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        tracing::info!(prefix = %self.config.path_prefix, "device server listening on {local_addr}");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("device server shutting down");
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    tracing::warn!(%peer_addr, "connection error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Upgrades one TCP connection and serves its device session until it
    /// closes.
    async fn handle_connection(self: &Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) -> Result<(), ServerError> {
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);

        let prefix = self.config.path_prefix.as_str();
        let mut requested = String::new();
        let mut device_id: Option<String> = None;
        let route = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            requested = req.uri().path().to_string();
            match device_id_from_path(req.uri().path(), prefix) {
                Some(id) => {
                    device_id = Some(id.to_string());
                    Ok(resp)
                }
                None => {
                    let mut err = ErrorResponse::new(Some("unknown device route".into()));
                    *err.status_mut() = StatusCode::NOT_FOUND;
                    Err(err)
                }
            }
        };

        let accepted = accept_hdr_async_with_config(stream, route, Some(ws_config)).await;
        let ws_stream = match accepted {
            Ok(ws) => ws,
            Err(_) if device_id.is_none() && !requested.is_empty() => {
                return Err(ServerError::UnknownPath(requested));
            }
            Err(e) => return Err(e.into()),
        };
        let Some(device_id) = device_id else {
            return Err(ServerError::UnknownPath(requested));
        };
        tracing::info!(%peer_addr, device = %device_id, "device connected");

        let (tx, rx) = mpsc::channel(SEND_BUFFER_SIZE);
        let sender = Sender::new(tx);
        let session = DeviceSession::new(
            device_id,
            sender.clone(),
            Arc::clone(&self.registry),
            self.collaborators.clone(),
        );
        connection::run_connection(ws_stream, rx, sender, session, self.cancel.child_token()).await;
        Ok(())
    }
}

/// Extracts the device id from `/{prefix}/{deviceId}`.
fn device_id_from_path<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = path.strip_prefix('/')?;
    let prefix = prefix.trim_matches('/');
    let rest = if prefix.is_empty() {
        rest
    } else {
        rest.strip_prefix(prefix)?.strip_prefix('/')?
    };
    (!rest.is_empty() && !rest.contains('/')).then_some(rest)
}
