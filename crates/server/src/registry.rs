//! Shared directory of active device sessions.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use devgate_protocol::DeviceIdentity;
use devgate_protocol::DeviceRecord;
use devgate_protocol::constants::CLOSE_POLICY_VIOLATION;

use crate::connection::Sender;
use crate::directory::DeviceMessageHandler;

/// One registered session: identity, connection handle and resolved
/// dispatch context.
#[derive(Clone)]
pub struct SessionRecord {
    pub identity: DeviceIdentity,
    /// Distinguishes successive connections of the same device.
    pub connection_id: Uuid,
    pub sender: Sender,
    pub sub_devices: Arc<Vec<DeviceRecord>>,
    pub handler: Arc<dyn DeviceMessageHandler>,
}

impl std::fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRecord")
            .field("identity", &self.identity)
            .field("connection_id", &self.connection_id)
            .field("sub_devices", &self.sub_devices.len())
            .finish()
    }
}

/// Per-recipient outcome of a broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Active sessions keyed by [`DeviceIdentity`].
///
/// The online count is the size of the map, read under the same lock that
/// guards mutation, so it can never disagree with membership.
#[derive(Debug, Default)]
pub struct DeviceSessionRegistry {
    sessions: RwLock<HashMap<DeviceIdentity, SessionRecord>>,
}

impl DeviceSessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a session.
    ///
    /// If the identity is already registered the newer connection wins: the
    /// previous session is replaced, its connection is told to close, and
    /// it is returned. The online count is unchanged in that case.
    pub async fn register(&self, record: SessionRecord) -> Option<SessionRecord> {
        let identity = record.identity.clone();
        let connection_id = record.connection_id;
        let (displaced, online) = {
            let mut sessions = self.sessions.write().await;
            let displaced = sessions.insert(identity.clone(), record);
            (displaced, sessions.len())
        };

        if let Some(old) = &displaced {
            warn!(device = %identity, old = %old.connection_id, new = %connection_id, "device reconnected, replacing previous session");
            old.sender.close(CLOSE_POLICY_VIOLATION, "replaced by a newer connection");
        }
        info!(device = %identity, online, "device session registered");
        displaced
    }

    /// Removes the session for `identity`, whichever connection it belongs
    /// to. Returns `false` if nothing was registered.
    pub async fn unregister(&self, identity: &DeviceIdentity) -> bool {
        let (removed, online) = {
            let mut sessions = self.sessions.write().await;
            let removed = sessions.remove(identity).is_some();
            (removed, sessions.len())
        };
        if removed {
            info!(device = %identity, online, "device session unregistered");
        }
        removed
    }

    /// Removes the session for `identity` only if it still belongs to
    /// `connection_id`. A replaced session closing late cannot evict its
    /// successor.
    pub async fn unregister_connection(&self, identity: &DeviceIdentity, connection_id: Uuid) -> bool {
        let (removed, online) = {
            let mut sessions = self.sessions.write().await;
            let owned = sessions
                .get(identity)
                .is_some_and(|s| s.connection_id == connection_id);
            if owned {
                sessions.remove(identity);
            }
            (owned, sessions.len())
        };
        if removed {
            info!(device = %identity, online, "device session unregistered");
        } else {
            debug!(device = %identity, connection = %connection_id, "no session owned by this connection");
        }
        removed
    }

    /// Sends `text` to every registered session.
    ///
    /// A failed recipient is logged and skipped; it never stops delivery to
    /// the others.
    pub async fn broadcast(&self, text: &str) -> BroadcastReport {
        let recipients: Vec<(DeviceIdentity, Sender)> = self
            .sessions
            .read()
            .await
            .values()
            .map(|s| (s.identity.clone(), s.sender.clone()))
            .collect();

        let mut report = BroadcastReport::default();
        for (identity, sender) in recipients {
            match sender.send_text(text) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(device = %identity, "broadcast delivery failed: {e}");
                    report.failed += 1;
                }
            }
        }
        debug!(delivered = report.delivered, failed = report.failed, "broadcast done");
        report
    }

    /// Sends `text` to the session registered for `identity`. Returns
    /// whether a session was found and the frame was queued.
    pub async fn send_to(&self, identity: &DeviceIdentity, text: &str) -> bool {
        let sender = self
            .sessions
            .read()
            .await
            .get(identity)
            .map(|s| s.sender.clone());
        match sender {
            Some(sender) => match sender.send_text(text) {
                Ok(()) => true,
                Err(e) => {
                    warn!(device = %identity, "targeted send failed: {e}");
                    false
                }
            },
            None => {
                debug!(device = %identity, "targeted send: device not online");
                false
            }
        }
    }

    /// Sends `text` to every session whose device id is `device_id`, in any
    /// tenant. Returns whether at least one send succeeded.
    pub async fn send_to_device_id(&self, device_id: &str, text: &str) -> bool {
        let recipients: Vec<(DeviceIdentity, Sender)> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.identity.device_id == device_id)
            .map(|s| (s.identity.clone(), s.sender.clone()))
            .collect();

        let mut found = false;
        for (identity, sender) in recipients {
            match sender.send_text(text) {
                Ok(()) => found = true,
                Err(e) => warn!(device = %identity, "targeted send failed: {e}"),
            }
        }
        found
    }

    pub async fn online_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn contains(&self, identity: &DeviceIdentity) -> bool {
        self.sessions.read().await.contains_key(identity)
    }

    /// Identities of all registered sessions, sorted.
    pub async fn sessions(&self) -> Vec<DeviceIdentity> {
        let mut ids: Vec<_> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}
