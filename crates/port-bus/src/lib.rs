//! The browser extension "port" primitive, in Rust.
//!
//! A [`PortHandle`] is one end of a long-lived bidirectional channel carrying
//! JSON values. A [`PortHub`] models the background worker's accept side,
//! including the failure modes the messaging layer must survive: the worker
//! being torn down mid-conversation ([`PortHub::suspend`]), connects landing
//! while no worker is alive ([`PortHub::set_offline`]), and the extension
//! context being invalidated by a reload or update ([`PortHub::invalidate`]).
//!
//! Ports cannot be revived: once either end disconnects, the handle is dead
//! and a fresh connect is the only way forward.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

/// Why a port stopped working.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed the port deliberately.
    PeerClosed,
    /// The background worker was torn down (or was never alive); a fresh
    /// connect may succeed once it respawns.
    WorkerGone,
    /// The extension itself was reloaded or updated. Not recoverable from
    /// this page; the user must reload.
    ContextInvalidated,
}

impl DisconnectReason {
    pub fn is_recoverable(self) -> bool {
        !matches!(self, Self::ContextInvalidated)
    }
}

#[derive(Debug, Error)]
pub enum PortError {
    #[error("port disconnected")]
    Disconnected,
}

/// Metadata about the initiating side, as seen by the acceptor. Mirrors the
/// browser's `port.sender`: tabs carry a tab id and page URL, the extension
/// UI carries only its own URL.
#[derive(Debug, Clone, Default)]
pub struct PortSender {
    pub tab_id: Option<u32>,
    pub url: Option<String>,
}

impl PortSender {
    pub fn tab(tab_id: u32, url: impl Into<String>) -> Self {
        Self {
            tab_id: Some(tab_id),
            url: Some(url.into()),
        }
    }

    pub fn app(url: impl Into<String>) -> Self {
        Self {
            tab_id: None,
            url: Some(url.into()),
        }
    }

    /// Host component of the sender URL; the pairing key between tab and
    /// UI connections.
    pub fn authority(&self) -> Option<String> {
        let url = self.url.as_deref()?;
        let parsed = url::Url::parse(url).ok()?;
        parsed.host_str().map(str::to_string)
    }
}

/// What `recv` yields: either a frame or the end of the port's life.
#[derive(Debug)]
pub enum PortEvent {
    Frame(Value),
    Disconnected(DisconnectReason),
}

struct Shared {
    closed: Mutex<Option<DisconnectReason>>,
    a_tx: mpsc::UnboundedSender<PortEvent>,
    b_tx: mpsc::UnboundedSender<PortEvent>,
}

impl Shared {
    /// First disconnect wins; both ends observe the same reason after any
    /// frames already in flight.
    fn disconnect(&self, reason: DisconnectReason) {
        let mut closed = self.closed.lock();
        if closed.is_some() {
            return;
        }
        *closed = Some(reason);
        drop(closed);
        let _ = self.a_tx.send(PortEvent::Disconnected(reason));
        let _ = self.b_tx.send(PortEvent::Disconnected(reason));
    }
}

/// One end of a port.
pub struct PortHandle {
    name: String,
    peer: PortSender,
    out: mpsc::UnboundedSender<PortEvent>,
    inbox: AsyncMutex<mpsc::UnboundedReceiver<PortEvent>>,
    shared: Arc<Shared>,
}

impl PortHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Metadata about the other side (meaningful on the acceptor's handle).
    pub fn peer(&self) -> &PortSender {
        &self.peer
    }

    pub fn is_connected(&self) -> bool {
        self.shared.closed.lock().is_none()
    }

    pub fn closed_reason(&self) -> Option<DisconnectReason> {
        *self.shared.closed.lock()
    }

    /// Post a frame toward the peer. Frames posted before a disconnect are
    /// still delivered ahead of the disconnect event.
    pub fn post(&self, frame: Value) -> Result<(), PortError> {
        if !self.is_connected() {
            return Err(PortError::Disconnected);
        }
        self.out
            .send(PortEvent::Frame(frame))
            .map_err(|_| PortError::Disconnected)
    }

    /// Next event on this port. After the disconnect event has been
    /// delivered, every further call reports the same reason.
    pub async fn recv(&self) -> PortEvent {
        let mut inbox = self.inbox.lock().await;
        match inbox.try_recv() {
            Ok(event) => return event,
            Err(mpsc::error::TryRecvError::Empty) => {}
            Err(mpsc::error::TryRecvError::Disconnected) => {
                return PortEvent::Disconnected(
                    self.closed_reason().unwrap_or(DisconnectReason::PeerClosed),
                );
            }
        }
        if let Some(reason) = self.closed_reason() {
            // Disconnect already observed; drain any frame that slipped in
            // ahead of the sentinel before reporting it.
            return match inbox.try_recv() {
                Ok(event) => event,
                Err(_) => PortEvent::Disconnected(reason),
            };
        }
        match inbox.recv().await {
            Some(event) => event,
            None => PortEvent::Disconnected(
                self.closed_reason().unwrap_or(DisconnectReason::PeerClosed),
            ),
        }
    }

    /// Close the port from this side.
    pub fn disconnect(&self) {
        self.shared.disconnect(DisconnectReason::PeerClosed);
    }
}

/// Build a connected pair directly, bypassing any hub. `sender` is what the
/// acceptor side will see as `peer()`.
pub fn pair(name: &str, sender: PortSender) -> (PortHandle, PortHandle) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        closed: Mutex::new(None),
        a_tx: a_tx.clone(),
        b_tx: b_tx.clone(),
    });
    let initiator = PortHandle {
        name: name.to_string(),
        peer: PortSender::default(),
        out: b_tx,
        inbox: AsyncMutex::new(a_rx),
        shared: Arc::clone(&shared),
    };
    let acceptor = PortHandle {
        name: name.to_string(),
        peer: sender,
        out: a_tx,
        inbox: AsyncMutex::new(b_rx),
        shared,
    };
    (initiator, acceptor)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HubState {
    Online,
    Offline,
    Invalidated,
}

struct HubInner {
    accept_tx: mpsc::UnboundedSender<PortHandle>,
    accept_rx: AsyncMutex<mpsc::UnboundedReceiver<PortHandle>>,
    state: Mutex<HubState>,
    live: Mutex<VecDeque<Arc<Shared>>>,
}

/// The background worker's side of the port fabric.
#[derive(Clone)]
pub struct PortHub {
    inner: Arc<HubInner>,
}

impl PortHub {
    pub fn new() -> Self {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(HubInner {
                accept_tx,
                accept_rx: AsyncMutex::new(accept_rx),
                state: Mutex::new(HubState::Online),
                live: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Open a port toward the worker. Always returns a handle; if no worker
    /// is alive the handle is already disconnected, exactly as the browser
    /// reports a connect to a dead worker.
    pub fn connect(&self, name: &str, sender: PortSender) -> PortHandle {
        let (initiator, acceptor) = pair(name, sender);
        let state = *self.inner.state.lock();
        match state {
            HubState::Online => {
                let shared = Arc::clone(&acceptor.shared);
                {
                    let mut live = self.inner.live.lock();
                    live.retain(|s| s.closed.lock().is_none());
                    live.push_back(shared);
                }
                if self.inner.accept_tx.send(acceptor).is_err() {
                    initiator.shared.disconnect(DisconnectReason::WorkerGone);
                }
            }
            HubState::Offline => {
                debug!(target: "port_bus", name, "connect while worker offline");
                initiator.shared.disconnect(DisconnectReason::WorkerGone);
            }
            HubState::Invalidated => {
                initiator
                    .shared
                    .disconnect(DisconnectReason::ContextInvalidated);
            }
        }
        initiator
    }

    /// Next inbound port. `None` only after the hub is dropped everywhere.
    pub async fn accept(&self) -> Option<PortHandle> {
        self.inner.accept_rx.lock().await.recv().await
    }

    /// Tear the worker down: every live port disconnects with `WorkerGone`
    /// and subsequent connects fail until [`resume`](Self::resume).
    pub fn suspend(&self) {
        self.set_offline(true);
        self.kill_live(DisconnectReason::WorkerGone);
    }

    /// Bring the worker back after a suspension.
    pub fn resume(&self) {
        self.set_offline(false);
    }

    /// Toggle the accept side without killing existing ports.
    pub fn set_offline(&self, offline: bool) {
        let mut state = self.inner.state.lock();
        if *state == HubState::Invalidated {
            return;
        }
        *state = if offline {
            HubState::Offline
        } else {
            HubState::Online
        };
    }

    /// The extension was reloaded or updated. Permanent.
    pub fn invalidate(&self) {
        *self.inner.state.lock() = HubState::Invalidated;
        self.kill_live(DisconnectReason::ContextInvalidated);
    }

    fn kill_live(&self, reason: DisconnectReason) {
        let drained: Vec<_> = self.inner.live.lock().drain(..).collect();
        for shared in drained {
            shared.disconnect(reason);
        }
    }
}

impl Default for PortHub {
    fn default() -> Self {
        Self::new()
    }
}
