//! Server-side lifecycle of one device connection.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use devgate_protocol::router::{self, DispatchOutcome};
use devgate_protocol::{DeviceIdentity, DeviceRecord, Envelope, HandlerFuture, MethodHandler, MethodName};

use crate::connection::Sender;
use crate::directory::{Collaborators, DeviceMessageHandler, LookupError};
use crate::registry::{DeviceSessionRegistry, SessionRecord};

/// Where a session is in its lifecycle. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, identity and handler not resolved yet.
    Unresolved,
    /// Resolved and registered; messages are dispatched.
    Active,
    Closed,
}

/// Why a session could not be set up.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("device {0} not found")]
    DeviceNotFound(String),

    #[error("no supplier configuration {config_id} for tenant {tenant_id}")]
    ConfigNotFound { config_id: String, tenant_id: String },

    #[error("lookup failed: {0}")]
    Lookup(#[from] LookupError),

    #[error("session already closed")]
    Closed,
}

struct Resolved {
    identity: DeviceIdentity,
    handler: Arc<dyn DeviceMessageHandler>,
    sub_devices: Arc<Vec<DeviceRecord>>,
}

/// One accepted device connection.
///
/// The connection task owns the session and calls it in event order, so
/// establish, message, error and close never overlap for one session.
pub struct DeviceSession {
    device_id: String,
    connection_id: Uuid,
    sender: Sender,
    registry: Arc<DeviceSessionRegistry>,
    collaborators: Collaborators,
    state: SessionState,
    resolved: Option<Resolved>,
}

impl DeviceSession {
    pub fn new(
        device_id: impl Into<String>,
        sender: Sender,
        registry: Arc<DeviceSessionRegistry>,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            connection_id: Uuid::new_v4(),
            sender,
            registry,
            collaborators,
            state: SessionState::Unresolved,
            resolved: None,
        }
    }

    /// Resolves the device, its supplier handler and sub-devices, then
    /// registers the session.
    ///
    /// An unknown device, a missing configuration or a failing supplier
    /// aborts setup: the session stays unresolved and unregistered, and the
    /// caller is expected to close the connection. Sub-device lookups are
    /// best effort.
    pub async fn establish(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Unresolved => {}
            SessionState::Active => return Ok(()),
            SessionState::Closed => return Err(SessionError::Closed),
        }

        let devices = &self.collaborators.devices;
        let configs = &self.collaborators.configs;

        let mut device = devices
            .get_device_by_id(&self.device_id)
            .await?
            .ok_or_else(|| SessionError::DeviceNotFound(self.device_id.clone()))?;

        let config = configs
            .get_config_by_id(&device.supplier_config_id, &device.tenant_id)
            .await?
            .ok_or_else(|| SessionError::ConfigNotFound {
                config_id: device.supplier_config_id.clone(),
                tenant_id: device.tenant_id.clone(),
            })?;

        let handler = self
            .collaborators
            .suppliers
            .create_supplier(&device.supplier_id, &config.config_data)?;

        let mut sub_devices = match devices.get_devices_by_parent(&device.device_id).await {
            Ok(children) => children,
            Err(e) => {
                warn!(device = %self.device_id, "sub-device lookup failed, continuing without: {e}");
                Vec::new()
            }
        };
        for child in &mut sub_devices {
            match configs
                .get_config_by_id(&child.supplier_config_id, &child.tenant_id)
                .await
            {
                Ok(Some(cfg)) => child.config = Some(cfg),
                Ok(None) => debug!(child = %child.device_id, "sub-device has no supplier configuration"),
                Err(e) => warn!(child = %child.device_id, "sub-device configuration lookup failed: {e}"),
            }
        }

        device.config = Some(config);
        let identity = device.identity();
        sub_devices.push(device);
        let sub_devices = Arc::new(sub_devices);

        self.state = SessionState::Active;
        self.resolved = Some(Resolved {
            identity: identity.clone(),
            handler: handler.clone(),
            sub_devices: sub_devices.clone(),
        });
        self.registry
            .register(SessionRecord {
                identity: identity.clone(),
                connection_id: self.connection_id,
                sender: self.sender.clone(),
                sub_devices: sub_devices.clone(),
                handler,
            })
            .await;

        info!(device = %identity, connection = %self.connection_id, sub_devices = sub_devices.len(), "device session active");
        Ok(())
    }

    /// Routes an inbound text frame to the supplier handler.
    ///
    /// Returns `None` when the session is not active and the frame was
    /// dropped. Malformed or unknown frames are logged by the router and the
    /// session stays active.
    pub async fn on_message(&self, text: &str) -> Option<DispatchOutcome> {
        let resolved = match (&self.state, &self.resolved) {
            (SessionState::Active, Some(resolved)) => resolved,
            _ => {
                debug!(device = %self.device_id, state = ?self.state, "dropping message for inactive session");
                return None;
            }
        };

        let context = SessionDispatch {
            handler: resolved.handler.as_ref(),
            sub_devices: &resolved.sub_devices,
        };
        Some(router::dispatch(&context, text).await)
    }

    /// Logs a connection fault. Closing is left to the close notification
    /// that follows.
    pub fn on_error(&self, err: &dyn fmt::Display) {
        warn!(device = %self.device_id, connection = %self.connection_id, "connection error: {err}");
    }

    /// Marks the session closed and removes it from the registry. Safe to
    /// call any number of times, in any state. Returns whether a registry
    /// entry was removed.
    pub async fn on_close(&mut self) -> bool {
        let previous = std::mem::replace(&mut self.state, SessionState::Closed);
        let removed = match &self.resolved {
            Some(resolved) => {
                self.registry
                    .unregister_connection(&resolved.identity, self.connection_id)
                    .await
            }
            None => false,
        };
        if previous != SessionState::Closed {
            debug!(device = %self.device_id, ?previous, removed, "device session closed");
        }
        removed
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The device id the connection asked for.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Resolved identity, once active.
    pub fn identity(&self) -> Option<&DeviceIdentity> {
        self.resolved.as_ref().map(|r| &r.identity)
    }

    /// Resolved fan-out list: children first, then the device itself.
    pub fn sub_devices(&self) -> &[DeviceRecord] {
        self.resolved.as_ref().map(|r| r.sub_devices.as_slice()).unwrap_or(&[])
    }
}

/// Router context for an active session: every method goes to the
/// supplier handler together with the sub-device list.
struct SessionDispatch<'a> {
    handler: &'a dyn DeviceMessageHandler,
    sub_devices: &'a [DeviceRecord],
}

impl MethodHandler for SessionDispatch<'_> {
    fn route(&self, method: MethodName, msg: Envelope) -> HandlerFuture<'_> {
        self.handler.on_receive_message(method, msg, self.sub_devices)
    }
}
