//! Wires the device server, the upstream link and the supplier uplink.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use devgate_link::{ClientError, ReconnectingClient, RoutedHandler, WsTransport, WsTransportConfig};
use devgate_protocol::Envelope;
use devgate_server::{Collaborators, DeviceServer, InMemoryDirectory};

use crate::config::{Config, UpstreamConfig};
use crate::supplier::LoggingSupplierFactory;
use crate::upstream::UpstreamHandler;

pub type UpstreamClient = ReconnectingClient<WsTransport, RoutedHandler<UpstreamHandler>>;

/// Device reports waiting to go upstream.
const UPLINK_BUFFER_SIZE: usize = 256;

/// How often startup reports that the upstream link is still down.
const UPSTREAM_POLL: Duration = Duration::from_secs(3);

struct Upstream {
    client: Arc<UpstreamClient>,
    forwarder: JoinHandle<()>,
}

/// A running gateway.
pub struct Gateway {
    server: Arc<DeviceServer>,
    server_task: JoinHandle<Result<(), devgate_server::ServerError>>,
    upstream: Option<Upstream>,
}

impl Gateway {
    /// Binds the device server and, when configured, opens the upstream
    /// link. Startup waits for the link up to its ready timeout, then
    /// carries on while the link keeps retrying in the background.
    pub async fn start(config: &Config) -> anyhow::Result<Self> {
        let directory = Arc::new(InMemoryDirectory::from_records(
            config.devices.clone(),
            config.supplier_configs.clone(),
        ));

        let (uplink_tx, uplink_rx) = mpsc::channel(UPLINK_BUFFER_SIZE);
        let mut factory = LoggingSupplierFactory::new();
        if config.upstream.is_some() {
            factory = factory.with_uplink(uplink_tx);
        }

        let collaborators = Collaborators {
            devices: directory.clone(),
            configs: directory,
            suppliers: Arc::new(factory),
        };
        let server = DeviceServer::new(config.server_config(), collaborators);
        let mut server_task = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.run().await }
        });

        loop {
            if server.port().await > 0 {
                break;
            }
            if server_task.is_finished() {
                (&mut server_task).await??;
                anyhow::bail!("device server stopped before binding");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let upstream = config
            .upstream
            .as_ref()
            .map(|up| start_upstream(up, &server, uplink_rx));
        if let (Some(link), Some(up)) = (&upstream, &config.upstream) {
            wait_for_upstream(&link.client, up.ready_timeout()).await;
        }

        Ok(Self {
            server,
            server_task,
            upstream,
        })
    }

    pub async fn port(&self) -> u16 {
        self.server.port().await
    }

    pub fn server(&self) -> &Arc<DeviceServer> {
        &self.server
    }

    pub fn upstream(&self) -> Option<&Arc<UpstreamClient>> {
        self.upstream.as_ref().map(|u| &u.client)
    }

    async fn close_upstream(&mut self) {
        if let Some(link) = self.upstream.take() {
            link.client.close_and_wait().await;
            link.forwarder.abort();
        }
    }

    /// Closes the upstream link, then every device connection.
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        self.close_upstream().await;
        self.server.shutdown();
        self.server_task.await??;
        info!("gateway stopped");
        Ok(())
    }
}

fn start_upstream(config: &UpstreamConfig, server: &DeviceServer, uplink_rx: mpsc::Receiver<Envelope>) -> Upstream {
    let transport = WsTransport::new(WsTransportConfig::new(&config.url));
    let handler = RoutedHandler::new(UpstreamHandler::new(server.registry()));
    let client = Arc::new(ReconnectingClient::new(transport, handler, config.reconnect()));
    client.connect();
    info!(url = %config.url, "upstream link started");

    let forwarder = tokio::spawn(forward_uplink(Arc::clone(&client), uplink_rx));
    Upstream { client, forwarder }
}

async fn wait_for_upstream(client: &UpstreamClient, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            warn!("upstream not reachable yet, continuing without it");
            return;
        }
        match client.wait_until_open(remaining.min(UPSTREAM_POLL)).await {
            Ok(()) => {
                info!("upstream link open");
                return;
            }
            Err(ClientError::Timeout) => {
                info!(attempts = client.attempt_count(), "upstream not open, waiting");
            }
            Err(e) => {
                warn!("upstream link unavailable: {e}");
                return;
            }
        }
    }
}

/// Sends supplier reports upstream. Reports produced while the link is
/// down are dropped.
async fn forward_uplink(client: Arc<UpstreamClient>, mut rx: mpsc::Receiver<Envelope>) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = client.send_envelope(&msg) {
            warn!(method = %msg.method_name, "dropping device report: {e}");
        }
    }
}

/// Runs the gateway until ctrl-c or until the device server stops.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let mut gateway = Gateway::start(&config).await?;
    info!(
        port = gateway.port().await,
        devices = config.devices.len(),
        upstream = gateway.upstream().is_some(),
        "gateway running"
    );

    let server_exit = tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            None
        }
        res = &mut gateway.server_task => Some(res),
    };

    match server_exit {
        None => {
            info!(online = gateway.server().online_count().await, "shutdown requested");
            gateway.shutdown().await
        }
        Some(res) => {
            error!("device server stopped unexpectedly");
            gateway.close_upstream().await;
            res?.map_err(Into::into)
        }
    }
}
