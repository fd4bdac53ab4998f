pub mod constants;
pub mod envelope;
pub mod messages;
pub mod router;
pub mod types;

// Re-export primary types for convenience.
pub use constants::MethodName;
pub use envelope::{Envelope, ProtocolError};
pub use router::{DispatchOutcome, HandlerError, HandlerFuture, MethodHandler};
pub use types::{DeviceIdentity, DeviceRecord, SupplierConfig};
