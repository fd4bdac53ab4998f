//! Method hooks for envelopes arriving on the upstream link.

use std::sync::Arc;

use tracing::{debug, info, warn};

use devgate_protocol::messages::{BroadcastRequest, DeviceCommand};
use devgate_protocol::{Envelope, HandlerError, HandlerFuture, MethodHandler, MethodName};
use devgate_server::DeviceSessionRegistry;

/// Turns upstream commands into frames for connected devices.
pub struct UpstreamHandler {
    registry: Arc<DeviceSessionRegistry>,
}

impl UpstreamHandler {
    pub fn new(registry: Arc<DeviceSessionRegistry>) -> Self {
        Self { registry }
    }
}

impl MethodHandler for UpstreamHandler {
    fn on_heartbeat(&self, _msg: Envelope) -> HandlerFuture<'_> {
        Box::pin(async {
            debug!("upstream heartbeat");
            Ok(())
        })
    }

    fn on_device_command(&self, msg: Envelope) -> HandlerFuture<'_> {
        Box::pin(async move {
            let cmd: DeviceCommand = msg
                .parse_body()?
                .ok_or_else(|| HandlerError::Failed("device command without body".into()))?;
            let text = Envelope::new(MethodName::DeviceCommand, Some(&cmd.payload))?.to_json()?;

            let delivered = match cmd.identity() {
                Some(identity) => self.registry.send_to(&identity, &text).await,
                None => self.registry.send_to_device_id(&cmd.device_id, &text).await,
            };
            if delivered {
                debug!(device = %cmd.device_id, "command delivered");
            } else {
                warn!(device = %cmd.device_id, "command target not online, dropped");
            }
            Ok(())
        })
    }

    fn on_broadcast(&self, msg: Envelope) -> HandlerFuture<'_> {
        Box::pin(async move {
            let req: BroadcastRequest = msg
                .parse_body()?
                .ok_or_else(|| HandlerError::Failed("broadcast without body".into()))?;
            let text = Envelope::new(MethodName::Broadcast, Some(&req.payload))?.to_json()?;

            let report = self.registry.broadcast(&text).await;
            info!(delivered = report.delivered, failed = report.failed, "broadcast sent");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devgate_protocol::DispatchOutcome;
    use devgate_protocol::router;

    #[tokio::test]
    async fn commands_to_offline_devices_are_handled() {
        let handler = UpstreamHandler::new(Arc::new(DeviceSessionRegistry::new()));

        let outcome = router::dispatch(
            &handler,
            r#"{"methodName":"DEVICE_COMMAND","body":{"deviceId":"gw-1","tenantId":"t1","payload":{"on":true}}}"#,
        )
        .await;
        assert_eq!(outcome, DispatchOutcome::Handled(MethodName::DeviceCommand));

        let outcome = router::dispatch(&handler, r#"{"methodName":"BROADCAST","body":{"payload":1}}"#).await;
        assert_eq!(outcome, DispatchOutcome::Handled(MethodName::Broadcast));
    }

    #[tokio::test]
    async fn bodiless_or_malformed_commands_fail() {
        let handler = UpstreamHandler::new(Arc::new(DeviceSessionRegistry::new()));

        let outcome = router::dispatch(&handler, r#"{"methodName":"DEVICE_COMMAND"}"#).await;
        assert_eq!(outcome, DispatchOutcome::Failed(MethodName::DeviceCommand));

        let outcome = router::dispatch(&handler, r#"{"methodName":"DEVICE_COMMAND","body":{"payload":1}}"#).await;
        assert_eq!(outcome, DispatchOutcome::Failed(MethodName::DeviceCommand));
    }

    #[tokio::test]
    async fn device_reports_from_upstream_are_unsupported() {
        let handler = UpstreamHandler::new(Arc::new(DeviceSessionRegistry::new()));
        let outcome = router::dispatch(&handler, r#"{"methodName":"DEVICE_EVENT","body":{}}"#).await;
        assert_eq!(outcome, DispatchOutcome::Unsupported(MethodName::DeviceEvent));
    }
}
