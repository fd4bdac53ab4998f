//! Scripted in-memory transport for client tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::transport::{FrameTransport, OpenFuture, Outbound, TransportError, TransportEvent, TransportLink};
use crate::types::{CloseInfo, Frame, Handshake};

/// Outcome of one scripted `open` call.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Step {
    Refuse,
    Accept,
}

/// Transport whose opens follow a script; once the script runs out every
/// open succeeds.
///
/// For each accepted open the test receives the link's event sender, so it
/// can inject messages, errors and closes. Frames written by the client are
/// collected in `sent`. An [`Outbound::Close`] is answered with a normal
/// local close.
pub(crate) struct MockTransport {
    script: Mutex<VecDeque<Step>>,
    pub(crate) opens: AtomicUsize,
    pub(crate) sent: Arc<Mutex<Vec<Frame>>>,
    links: mpsc::UnboundedSender<mpsc::Sender<TransportEvent>>,
}

impl MockTransport {
    pub(crate) fn new(
        script: impl IntoIterator<Item = Step>,
    ) -> (Self, mpsc::UnboundedReceiver<mpsc::Sender<TransportEvent>>) {
        let (links_tx, links_rx) = mpsc::unbounded_channel();
        let transport = Self {
            script: Mutex::new(script.into_iter().collect()),
            opens: AtomicUsize::new(0),
            sent: Arc::new(Mutex::new(Vec::new())),
            links: links_tx,
        };
        (transport, links_rx)
    }

    pub(crate) fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub(crate) fn sent(&self) -> Vec<Frame> {
        self.sent.lock().unwrap().clone()
    }
}

impl FrameTransport for MockTransport {
    fn open(&self) -> OpenFuture<'_> {
        Box::pin(async move {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let step = self.script.lock().unwrap().pop_front().unwrap_or(Step::Accept);
            match step {
                Step::Refuse => Err(TransportError::Refused("scripted refusal".into())),
                Step::Accept => {
                    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(16);
                    let (ev_tx, ev_rx) = mpsc::channel(16);

                    let sent = self.sent.clone();
                    let peer = ev_tx.clone();
                    tokio::spawn(async move {
                        while let Some(out) = out_rx.recv().await {
                            match out {
                                Outbound::Frame(frame) => sent.lock().unwrap().push(frame),
                                Outbound::Close => {
                                    let info = CloseInfo {
                                        code: 1000,
                                        reason: "closing".into(),
                                        remote: false,
                                    };
                                    let _ = peer.send(TransportEvent::Closed(info)).await;
                                    break;
                                }
                            }
                        }
                    });

                    let _ = self.links.send(ev_tx);
                    Ok(TransportLink {
                        handshake: Handshake {
                            status: 101,
                            protocol: None,
                        },
                        outbound: out_tx,
                        events: ev_rx,
                    })
                }
            }
        })
    }
}
