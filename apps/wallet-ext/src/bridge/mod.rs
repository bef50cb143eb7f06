//! The content-script side of the extension: the durable-enough party that
//! keeps a session open toward a background worker the browser may kill at
//! any moment.
//!
//! Page requests are forwarded as RPC over the current port session; while
//! no session is ready they queue in order and drain FIFO once the
//! handshake completes. Replies travel back through the correlator, which
//! restores the page's original request id; the page never learns that an
//! internal RPC layer exists.

mod correlator;
mod reconnect;
mod session;

pub use correlator::{Routed, RpcCorrelator, Waiter};
pub use reconnect::backoff_delay;
pub use session::{HandshakeFailure, PortSession, SessionState};

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use port_bus::{DisconnectReason, PortEvent, PortHub, PortSender};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use wallet_proto::{PageEnvelope, PageMessage, PageReply, PortFrame, RequestId, RpcId};

use crate::config::ReconnectConfig;
use crate::error::BridgeError;
use crate::external::PageSink;

struct QueuedCall {
    id: RpcId,
    method: String,
    params: Option<Value>,
    waiter: Waiter,
}

struct BridgeState {
    session: Option<Arc<PortSession>>,
    phase: SessionState,
    queue: VecDeque<QueuedCall>,
}

struct Inner {
    hub: PortHub,
    port_name: String,
    sender: PortSender,
    config: ReconnectConfig,
    correlator: RpcCorrelator,
    sink: Arc<dyn PageSink>,
    state: Mutex<BridgeState>,
}

/// Per-tab bridge between the page and the background worker.
#[derive(Clone)]
pub struct ContentBridge {
    inner: Arc<Inner>,
}

impl ContentBridge {
    pub fn new(
        hub: PortHub,
        port_name: impl Into<String>,
        sender: PortSender,
        sink: Arc<dyn PageSink>,
        config: ReconnectConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                hub,
                port_name: port_name.into(),
                sender,
                config,
                correlator: RpcCorrelator::new(),
                sink,
                state: Mutex::new(BridgeState {
                    session: None,
                    phase: SessionState::Handshaking,
                    queue: VecDeque::new(),
                }),
            }),
        }
    }

    /// Drive the bridge until a terminal failure. Recoverable disconnects
    /// (worker recycling) are absorbed here: the dead port is discarded, a
    /// fresh session is established with backoff, and the outbound queue
    /// drains before new traffic.
    pub async fn run(&self) -> Result<(), BridgeError> {
        loop {
            let session = match self.establish_with_backoff().await {
                Ok(session) => session,
                Err(err) => {
                    self.enter_terminal(&err);
                    return Err(err);
                }
            };
            self.attach(&session);
            let reason = self.pump(&session).await;
            self.detach(&session, reason);
            if let Some(err) = BridgeError::from_terminal_disconnect(reason) {
                self.enter_terminal(&err);
                return Err(err);
            }
        }
    }

    /// Intake for `window.message` events. Echoes of our own messages and
    /// anything that does not parse as the page vocabulary are dropped.
    pub fn handle_page_event(&self, event: Value) {
        let envelope = match PageEnvelope::decode(event) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!(target: "bridge::page", error = %err, "ignoring non-wallet window message");
                return;
            }
        };
        if envelope.is_echo() {
            return;
        }
        let request = match envelope.message {
            PageMessage::Request(request) => request,
            // Replies and events flow toward the page, not from it.
            PageMessage::Reply(_) | PageMessage::Event { .. } => return,
        };
        let request_id = request.request_id().clone();
        if self.inner.state.lock().phase == SessionState::Closed {
            self.post_error(request_id, "wallet extension unavailable; reload the page".into());
            return;
        }
        self.submit(QueuedCall {
            id: RpcId::generate(),
            method: request.rpc_method().to_string(),
            params: request.rpc_params(),
            waiter: Waiter::Page(request_id),
        });
    }

    /// RPC for callers inside the content script itself.
    pub fn call(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> oneshot::Receiver<Result<Value, String>> {
        let (tx, rx) = oneshot::channel();
        if self.inner.state.lock().phase == SessionState::Closed {
            let _ = tx.send(Err("wallet extension unavailable".to_string()));
            return rx;
        }
        self.submit(QueuedCall {
            id: RpcId::generate(),
            method: method.into(),
            params,
            waiter: Waiter::Local(tx),
        });
        rx
    }

    pub fn phase(&self) -> SessionState {
        self.inner.state.lock().phase
    }

    fn submit(&self, call: QueuedCall) {
        let session = {
            let mut state = self.inner.state.lock();
            if state.phase == SessionState::Ready && state.queue.is_empty() {
                state.session.clone()
            } else {
                state.queue.push_back(call);
                return;
            }
        };
        match session {
            Some(session) => self.dispatch(&session, call),
            None => self.inner.state.lock().queue.push_back(call),
        }
    }

    fn dispatch(&self, session: &Arc<PortSession>, call: QueuedCall) {
        self.inner
            .correlator
            .register(call.id.clone(), session.session_id().clone(), call.waiter);
        let frame = PortFrame::RpcReq {
            id: call.id,
            port_session_id: session.session_id().clone(),
            method: call.method,
            params: call.params,
        };
        // A failed send means the port just died; the disconnect sweep will
        // fail the entry we registered above.
        let _ = session.send(frame);
    }

    async fn establish_with_backoff(&self) -> Result<Arc<PortSession>, BridgeError> {
        let mut attempt: u32 = 0;
        loop {
            self.set_phase(SessionState::Handshaking);
            match PortSession::establish(
                &self.inner.hub,
                &self.inner.port_name,
                self.inner.sender.clone(),
            )
            .await
            {
                Ok(session) => {
                    info!(
                        target: "bridge::reconnect",
                        session_id = %session.session_id(),
                        "port session established"
                    );
                    return Ok(Arc::new(session));
                }
                Err(HandshakeFailure::Disconnected(reason)) => {
                    if let Some(err) = BridgeError::from_terminal_disconnect(reason) {
                        return Err(err);
                    }
                    attempt += 1;
                    if attempt > self.inner.config.max_attempts {
                        return Err(BridgeError::ReconnectExhausted {
                            attempts: attempt - 1,
                        });
                    }
                    let delay = backoff_delay(self.inner.config.base_delay, attempt);
                    debug!(
                        target: "bridge::reconnect",
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        ?reason,
                        "worker unreachable; backing off"
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    /// Make the fresh session current and drain the queue strictly FIFO.
    fn attach(&self, session: &Arc<PortSession>) {
        let drained: Vec<QueuedCall> = {
            let mut state = self.inner.state.lock();
            state.session = Some(Arc::clone(session));
            state.phase = SessionState::Ready;
            state.queue.drain(..).collect()
        };
        for call in drained {
            self.dispatch(session, call);
        }
    }

    async fn pump(&self, session: &Arc<PortSession>) -> DisconnectReason {
        loop {
            match session.recv().await {
                PortEvent::Frame(value) => match PortFrame::decode(value) {
                    Ok(PortFrame::RpcRes { id, result, error }) => {
                        match self.inner.correlator.on_response(&id, result, error) {
                            Routed::Page {
                                request_id,
                                outcome,
                            } => self.post_outcome(request_id, outcome),
                            Routed::Local | Routed::Unknown => {}
                        }
                    }
                    Ok(PortFrame::Event { name, data }) => {
                        self.inner
                            .sink
                            .post(PageEnvelope::event_from_content(name, data));
                    }
                    Ok(other) => {
                        warn!(
                            target: "bridge::rpc",
                            frame = ?other,
                            "unexpected frame on established session; dropping"
                        );
                    }
                    Err(err) => {
                        warn!(target: "bridge::rpc", error = %err, "undecodable frame; dropping");
                    }
                },
                PortEvent::Disconnected(reason) => return reason,
            }
        }
    }

    /// Drop the dead session and fail whatever was in flight on it. The
    /// queue of not-yet-sent calls survives for the next session.
    fn detach(&self, session: &Arc<PortSession>, reason: DisconnectReason) {
        {
            let mut state = self.inner.state.lock();
            state.session = None;
            state.phase = SessionState::Handshaking;
        }
        warn!(
            target: "bridge::reconnect",
            session_id = %session.session_id(),
            ?reason,
            "port session lost"
        );
        let failures = self
            .inner
            .correlator
            .fail_session(session.session_id(), "background worker disconnected");
        for (request_id, error) in failures {
            self.post_error(request_id, error);
        }
    }

    fn enter_terminal(&self, err: &BridgeError) {
        let message = err.to_string();
        let queued: Vec<QueuedCall> = {
            let mut state = self.inner.state.lock();
            state.phase = SessionState::Closed;
            state.session = None;
            state.queue.drain(..).collect()
        };
        for call in queued {
            match call.waiter {
                Waiter::Local(tx) => {
                    let _ = tx.send(Err(message.clone()));
                }
                Waiter::Page(request_id) => self.post_error(request_id, message.clone()),
            }
        }
        for (request_id, error) in self.inner.correlator.fail_all(&message) {
            self.post_error(request_id, error);
        }
    }

    fn post_outcome(&self, request_id: RequestId, outcome: Result<Value, String>) {
        let reply = match outcome {
            Ok(payload) => PageReply::Reply {
                request_id,
                payload,
            },
            Err(error) if error == CANCELED_ERROR => PageReply::ReplyCanceled { request_id },
            Err(error) => PageReply::ReplyError { request_id, error },
        };
        self.inner.sink.post(PageEnvelope::from_content(reply));
    }

    fn post_error(&self, request_id: RequestId, error: String) {
        self.inner
            .sink
            .post(PageEnvelope::from_content(PageReply::ReplyError {
                request_id,
                error,
            }));
    }

    fn set_phase(&self, phase: SessionState) {
        self.inner.state.lock().phase = phase;
    }
}

/// Error string the router uses for user cancellations; the bridge turns it
/// into a `ReplyCanceled` so the page can tell rejection from failure.
pub const CANCELED_ERROR: &str = "canceled";
