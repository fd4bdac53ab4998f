//! Default supplier: logs device traffic and relays reports upstream.
//!
//! Real supplier decoders live outside the gateway; this one accepts every
//! supplier id so configured devices can connect and be reached.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use devgate_protocol::messages::DeviceStatus;
use devgate_protocol::{DeviceRecord, Envelope, HandlerFuture, MethodName};
use devgate_server::{DeviceMessageHandler, LookupError, SupplierFactory};

/// Builds a [`LoggingSupplier`] for any supplier id.
#[derive(Default)]
pub struct LoggingSupplierFactory {
    uplink: Option<mpsc::Sender<Envelope>>,
}

impl LoggingSupplierFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Relays `DEVICE_EVENT` and `DEVICE_STATUS` envelopes to `uplink`.
    pub fn with_uplink(mut self, uplink: mpsc::Sender<Envelope>) -> Self {
        self.uplink = Some(uplink);
        self
    }
}

impl SupplierFactory for LoggingSupplierFactory {
    fn create_supplier(
        &self,
        supplier_id: &str,
        config_data: &serde_json::Value,
    ) -> Result<Arc<dyn DeviceMessageHandler>, LookupError> {
        if supplier_id.is_empty() {
            return Err(LookupError::UnknownSupplier("<empty>".into()));
        }
        debug!(supplier = supplier_id, config = %config_data, "creating logging supplier");
        Ok(Arc::new(LoggingSupplier {
            supplier_id: supplier_id.to_string(),
            uplink: self.uplink.clone(),
        }))
    }
}

pub struct LoggingSupplier {
    supplier_id: String,
    uplink: Option<mpsc::Sender<Envelope>>,
}

impl LoggingSupplier {
    fn relay(&self, msg: Envelope) {
        let Some(uplink) = &self.uplink else {
            return;
        };
        if let Err(e) = uplink.try_send(msg) {
            warn!(supplier = %self.supplier_id, "uplink full or closed, dropping device report: {e}");
        }
    }
}

impl DeviceMessageHandler for LoggingSupplier {
    fn on_receive_message<'a>(
        &'a self,
        method: MethodName,
        msg: Envelope,
        sub_devices: &'a [DeviceRecord],
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let device = sub_devices.last().map(|d| d.device_id.as_str()).unwrap_or_default();
            match method {
                MethodName::Heartbeat => {
                    debug!(supplier = %self.supplier_id, device, "heartbeat");
                }
                MethodName::DeviceStatus => {
                    let status: Option<DeviceStatus> = msg.parse_body()?;
                    if let Some(status) = &status {
                        info!(device = %status.device_id, online = status.online, detail = ?status.detail, "device status");
                    }
                    self.relay(msg);
                }
                MethodName::DeviceEvent => {
                    info!(
                        supplier = %self.supplier_id,
                        device,
                        sub_devices = sub_devices.len(),
                        body_len = msg.body_json().map(str::len).unwrap_or(0),
                        "device event"
                    );
                    self.relay(msg);
                }
                MethodName::DeviceCommand | MethodName::Broadcast => {
                    debug!(%method, device, "device sent a downstream-only method, ignoring");
                }
            }
            Ok(())
        })
    }
}
