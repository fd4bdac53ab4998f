//! Collaborators a session resolves itself through.
//!
//! Device records, supplier configurations and supplier handlers all live
//! outside this crate. Sessions only see these traits.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use devgate_protocol::{DeviceRecord, Envelope, HandlerFuture, MethodName, SupplierConfig};

/// A boxed future returned by lookups.
pub type LookupFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, LookupError>> + Send + 'a>>;

/// Failure of an external lookup. "Not found" is not an error; lookups
/// return `None` or an empty list for that.
#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("lookup backend unavailable: {0}")]
    Unavailable(String),

    #[error("unknown supplier: {0}")]
    UnknownSupplier(String),

    #[error("invalid supplier configuration: {0}")]
    InvalidConfig(String),
}

/// Device metadata store.
pub trait DeviceDirectory: Send + Sync {
    fn get_device_by_id<'a>(&'a self, device_id: &'a str) -> LookupFuture<'a, Option<DeviceRecord>>;

    /// Devices whose `parent_id` is `parent_id`.
    fn get_devices_by_parent<'a>(&'a self, parent_id: &'a str) -> LookupFuture<'a, Vec<DeviceRecord>>;
}

/// Supplier configuration store.
pub trait SupplierConfigStore: Send + Sync {
    fn get_config_by_id<'a>(
        &'a self,
        config_id: &'a str,
        tenant_id: &'a str,
    ) -> LookupFuture<'a, Option<SupplierConfig>>;
}

/// Builds the message handler for a supplier.
pub trait SupplierFactory: Send + Sync {
    fn create_supplier(
        &self,
        supplier_id: &str,
        config_data: &serde_json::Value,
    ) -> Result<Arc<dyn DeviceMessageHandler>, LookupError>;
}

/// Supplier-specific handling of a device's inbound messages.
///
/// `sub_devices` holds the device's children followed by the device
/// itself, each with its supplier configuration when one was found.
pub trait DeviceMessageHandler: Send + Sync {
    fn on_receive_message<'a>(
        &'a self,
        method: MethodName,
        msg: Envelope,
        sub_devices: &'a [DeviceRecord],
    ) -> HandlerFuture<'a>;
}

/// The external services a server hands to each of its sessions.
#[derive(Clone)]
pub struct Collaborators {
    pub devices: Arc<dyn DeviceDirectory>,
    pub configs: Arc<dyn SupplierConfigStore>,
    pub suppliers: Arc<dyn SupplierFactory>,
}
