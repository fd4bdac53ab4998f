//! The owner-facing handle of a reconnecting link.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use devgate_protocol::Envelope;

use crate::handler::ClientHandler;
use crate::reconnection::{Shared, drive};
use crate::transport::{FrameTransport, Outbound};
use crate::types::{ConnectionState, Frame, ReconnectConfig};

/// Errors returned by [`ReconnectingClient`] operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("not connected")]
    NotConnected,

    #[error("outbound buffer full")]
    BufferFull,

    #[error("timed out waiting for the connection to open")]
    Timeout,

    #[error("client closed")]
    Closed,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A client link that keeps itself connected.
///
/// After [`connect`](Self::connect) a background task opens the transport
/// and, whenever it closes for any reason, waits the configured interval
/// and opens it again. Only [`close`](Self::close) stops the cycle, and a
/// closed client stays closed.
pub struct ReconnectingClient<T: FrameTransport, H: ClientHandler> {
    shared: Arc<Shared<T, H>>,
    driver: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<T: FrameTransport, H: ClientHandler> ReconnectingClient<T, H> {
    pub fn new(transport: T, handler: H, config: ReconnectConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let shared = Arc::new(Shared {
            transport,
            handler,
            config,
            state,
            attempts: AtomicU32::new(0),
            outbound: std::sync::Mutex::new(None),
            cancel: CancellationToken::new(),
        });
        Self {
            shared,
            driver: std::sync::Mutex::new(None),
        }
    }

    /// Starts the connect/reconnect cycle. Must be called inside a tokio
    /// runtime.
    ///
    /// Calling it again while the cycle runs does nothing; calling it after
    /// [`close`](Self::close) is ignored.
    pub fn connect(&self) {
        if self.shared.cancel.is_cancelled() {
            warn!("connect called on a closed client, ignoring");
            return;
        }
        let Ok(mut driver) = self.driver.lock() else {
            return;
        };
        if driver.as_ref().is_some_and(|h| !h.is_finished()) {
            debug!("connect called while already running");
            return;
        }
        *driver = Some(tokio::spawn(drive(self.shared.clone())));
    }

    /// Queues a frame on the open connection.
    ///
    /// Fails with [`ClientError::NotConnected`] unless the state is
    /// [`ConnectionState::Open`]; nothing is buffered for later.
    pub fn send(&self, frame: impl Into<Frame>) -> Result<(), ClientError> {
        if self.state() != ConnectionState::Open {
            return Err(ClientError::NotConnected);
        }
        let tx = self
            .shared
            .outbound
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
            .ok_or(ClientError::NotConnected)?;
        tx.try_send(Outbound::Frame(frame.into())).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ClientError::BufferFull,
            mpsc::error::TrySendError::Closed(_) => ClientError::NotConnected,
        })
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<(), ClientError> {
        self.send(Frame::Text(text.into()))
    }

    pub fn send_binary(&self, data: impl Into<Vec<u8>>) -> Result<(), ClientError> {
        self.send(Frame::Binary(data.into()))
    }

    /// Serializes an envelope and sends it as a text frame.
    pub fn send_envelope(&self, envelope: &Envelope) -> Result<(), ClientError> {
        self.send_text(envelope.to_json()?)
    }

    /// Stops the cycle. An open connection is closed with a close frame and
    /// any pending reconnect is cancelled. Returns immediately.
    pub fn close(&self) {
        self.shared.cancel.cancel();
        // Without a running driver nobody else moves the state.
        let idle = self
            .driver
            .lock()
            .map(|driver| driver.as_ref().is_none_or(|h| h.is_finished()))
            .unwrap_or(true);
        if idle {
            self.shared.set_state(ConnectionState::Closed);
        }
    }

    /// Like [`close`](Self::close), then waits for the background task to
    /// finish (including the final `on_close` callback).
    pub async fn close_and_wait(&self) {
        self.close();
        let handle = self.driver.lock().ok().and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("connection driver ended abnormally: {e}");
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Reconnect attempts since the last successful open.
    pub fn attempt_count(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// Watches state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Waits until the connection is open, at most `timeout`.
    pub async fn wait_until_open(&self, timeout: Duration) -> Result<(), ClientError> {
        let mut rx = self.shared.state.subscribe();
        let cancel = self.shared.cancel.clone();
        let wait = async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ClientError::Closed),
                res = rx.wait_for(|s| *s == ConnectionState::Open) => {
                    res.map(|_| ()).map_err(|_| ClientError::Closed)
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ClientError::Timeout)?
    }

    pub fn handler(&self) -> &H {
        &self.shared.handler
    }

    pub fn transport(&self) -> &T {
        &self.shared.transport
    }
}

impl<T: FrameTransport, H: ClientHandler> Drop for ReconnectingClient<T, H> {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::CallbackFuture;
    use crate::mock::{MockTransport, Step};
    use crate::transport::{TransportError, TransportEvent};
    use crate::types::{CloseInfo, Handshake};
    use devgate_protocol::MethodName;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        log: Mutex<Vec<String>>,
        reconnects: Mutex<Vec<u32>>,
        panic_on_error: bool,
        panic_before_future: bool,
    }

    impl Recorder {
        fn panicking() -> Self {
            Self {
                panic_on_error: true,
                ..Self::default()
            }
        }

        /// Panics in `on_error` itself, before any future exists.
        fn panicking_eagerly() -> Self {
            Self {
                panic_before_future: true,
                ..Self::default()
            }
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        fn reconnects(&self) -> Vec<u32> {
            self.reconnects.lock().unwrap().clone()
        }
    }

    impl ClientHandler for Recorder {
        fn on_open<'a>(&'a self, _handshake: &'a Handshake) -> CallbackFuture<'a> {
            self.log.lock().unwrap().push("open".into());
            Box::pin(async {})
        }

        fn on_message(&self, text: String) -> CallbackFuture<'_> {
            self.log.lock().unwrap().push(format!("message:{text}"));
            Box::pin(async {})
        }

        fn on_error<'a>(&'a self, _err: &'a TransportError) -> CallbackFuture<'a> {
            if self.panic_before_future {
                panic!("handler blew up before returning a future");
            }
            Box::pin(async move {
                self.log.lock().unwrap().push("error".into());
                if self.panic_on_error {
                    panic!("handler blew up");
                }
            })
        }

        fn on_close<'a>(&'a self, info: &'a CloseInfo) -> CallbackFuture<'a> {
            self.log.lock().unwrap().push(format!("close:{}", info.code));
            Box::pin(async {})
        }

        fn on_reconnecting(&self, attempt: u32, _delay: Duration) -> CallbackFuture<'_> {
            self.reconnects.lock().unwrap().push(attempt);
            Box::pin(async {})
        }
    }

    /// Polls `cond` on virtual time until it holds.
    async fn eventually(mut cond: impl FnMut() -> bool) {
        for _ in 0..10_000 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never became true");
    }

    fn mock_client(
        script: Vec<Step>,
        handler: Recorder,
    ) -> (
        ReconnectingClient<MockTransport, Recorder>,
        mpsc::UnboundedReceiver<mpsc::Sender<TransportEvent>>,
    ) {
        let (transport, links) = MockTransport::new(script);
        let client = ReconnectingClient::new(transport, handler, ReconnectConfig::default());
        (client, links)
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_count_up_and_reset_on_open() {
        let (client, mut links) = mock_client(vec![Step::Refuse, Step::Refuse, Step::Refuse], Recorder::default());
        assert_eq!(client.state(), ConnectionState::Connecting);

        client.connect();
        let link = links.recv().await.unwrap();
        eventually(|| client.is_open()).await;

        assert_eq!(client.handler().reconnects(), vec![1, 2, 3]);
        assert_eq!(client.attempt_count(), 0);
        assert_eq!(client.transport().opens(), 4);

        link.send(TransportEvent::Closed(CloseInfo {
            code: 1001,
            reason: "going away".into(),
            remote: true,
        }))
        .await
        .unwrap();

        let _second = links.recv().await.unwrap();
        eventually(|| client.is_open()).await;
        assert_eq!(client.handler().reconnects(), vec![1, 2, 3, 1]);
        assert_eq!(client.attempt_count(), 0);

        client.close_and_wait().await;
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_pending_reconnect() {
        let (transport, _links) = MockTransport::new(vec![Step::Refuse]);
        let client = ReconnectingClient::new(
            transport,
            Recorder::default(),
            ReconnectConfig::with_interval(Duration::from_secs(60)),
        );

        client.connect();
        eventually(|| client.handler().reconnects() == vec![1]).await;

        client.close_and_wait().await;
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(client.transport().opens(), 1);
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn send_requires_open_connection() {
        let (client, _links) = mock_client(vec![], Recorder::default());

        assert!(matches!(client.send_text("early"), Err(ClientError::NotConnected)));

        client.connect();
        client.wait_until_open(Duration::from_secs(5)).await.unwrap();
        client.close_and_wait().await;

        assert!(matches!(client.send_text("late"), Err(ClientError::NotConnected)));
        assert!(client.transport().sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn send_while_open_reaches_transport() {
        let (client, _links) = mock_client(vec![], Recorder::default());
        client.connect();
        client.wait_until_open(Duration::from_secs(5)).await.unwrap();

        client.send_text("hello").unwrap();
        client.send_binary(vec![1u8, 2, 3]).unwrap();
        let env = Envelope::new::<()>(MethodName::Heartbeat, None).unwrap();
        client.send_envelope(&env).unwrap();

        eventually(|| client.transport().sent().len() == 3).await;
        let sent = client.transport().sent();
        assert_eq!(sent[0], Frame::Text("hello".into()));
        assert_eq!(sent[1], Frame::Binary(vec![1, 2, 3]));
        assert_eq!(sent[2], Frame::Text(r#"{"methodName":"HEARTBEAT"}"#.into()));

        client.close_and_wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn messages_are_delivered_in_order() {
        let (client, mut links) = mock_client(vec![], Recorder::default());
        client.connect();
        let link = links.recv().await.unwrap();

        for text in ["a", "b", "c"] {
            link.send(TransportEvent::Message(Frame::Text(text.into())))
                .await
                .unwrap();
        }
        eventually(|| client.handler().log().len() == 4).await;
        assert_eq!(
            client.handler().log(),
            vec!["open", "message:a", "message:b", "message:c"]
        );

        client.close_and_wait().await;
        assert_eq!(client.handler().log().last().map(String::as_str), Some("close:1000"));
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_forces_close_and_reconnect() {
        let (client, mut links) = mock_client(vec![], Recorder::default());
        client.connect();
        let link = links.recv().await.unwrap();
        eventually(|| client.is_open()).await;

        link.send(TransportEvent::Error(TransportError::PongTimeout(Duration::from_secs(60))))
            .await
            .unwrap();

        let _next = links.recv().await.unwrap();
        eventually(|| client.is_open()).await;

        let log = client.handler().log();
        assert_eq!(log[..3], ["open", "error", "close:1000"]);
        assert_eq!(client.handler().reconnects(), vec![1]);

        client.close_and_wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_handler_does_not_stop_reconnects() {
        let (client, _links) = mock_client(vec![Step::Refuse, Step::Refuse], Recorder::panicking());
        client.connect();

        client.wait_until_open(Duration::from_secs(30)).await.unwrap();
        assert_eq!(client.handler().reconnects(), vec![1, 2]);
        assert_eq!(client.transport().opens(), 3);

        client.close_and_wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn eagerly_panicking_handler_does_not_stop_reconnects() {
        let (client, _links) = mock_client(vec![Step::Refuse], Recorder::panicking_eagerly());
        client.connect();

        client.wait_until_open(Duration::from_secs(30)).await.unwrap();
        assert_eq!(client.handler().reconnects(), vec![1]);
        assert_eq!(client.transport().opens(), 2);

        client.close_and_wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn connect_twice_runs_one_cycle() {
        let (client, _links) = mock_client(vec![], Recorder::default());
        client.connect();
        client.connect();
        client.wait_until_open(Duration::from_secs(5)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(client.transport().opens(), 1);
        client.close_and_wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn connect_after_close_is_ignored() {
        let (client, _links) = mock_client(vec![], Recorder::default());
        let mut state = client.subscribe();
        client.close();
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(state.has_changed().unwrap());
        assert_eq!(*state.borrow_and_update(), ConnectionState::Closed);

        client.connect();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(client.transport().opens(), 0);
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(matches!(
            client.wait_until_open(Duration::from_secs(1)).await,
            Err(ClientError::Closed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_until_open_times_out() {
        let (transport, _links) = MockTransport::new(vec![Step::Refuse]);
        let client = ReconnectingClient::new(
            transport,
            Recorder::default(),
            ReconnectConfig::with_interval(Duration::from_secs(60)),
        );
        client.connect();

        assert!(matches!(
            client.wait_until_open(Duration::from_secs(3)).await,
            Err(ClientError::Timeout)
        ));
        client.close_and_wait().await;
    }
}
