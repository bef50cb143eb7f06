//! The background-worker side: accepts ports, pairs tab and UI connections,
//! and routes every page request either straight to the signing flow (safe
//! methods with a remembered identifier) or through the approval popup.
//!
//! All worker state lives in one [`RouterState`] value behind a mutex; the
//! browser may kill the worker between any two messages, so nothing in here
//! assumes it survives longer than the current task.

mod connections;
mod pending;

pub use connections::{AppConnection, Connection, RouterState};
pub use pending::{PendingBusy, PendingRequest, PendingSlot};

use std::sync::Arc;

use parking_lot::Mutex;
use port_bus::{PortEvent, PortHandle, PortHub};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use url::form_urlencoded;
use wallet_proto::{
    AppFrame, PortFrame, PortSessionId, RpcId, SignPayload, APP_PORT_PREFIX, CONTENT_PORT_PREFIX,
};

use crate::bridge::CANCELED_ERROR;
use crate::external::PopupLauncher;
use crate::signing::SigningFlow;

/// Page the approval popup loads; the pending request rides in the query
/// string because the popup process may not exist yet when it is needed.
pub const POPUP_PAGE: &str = "popup.html";

#[derive(Clone)]
pub struct MessageRouter {
    state: Arc<Mutex<RouterState>>,
    signing: Arc<SigningFlow>,
    popup: Arc<dyn PopupLauncher>,
}

impl MessageRouter {
    pub fn new(signing: Arc<SigningFlow>, popup: Arc<dyn PopupLauncher>) -> Self {
        Self {
            state: Arc::new(Mutex::new(RouterState::default())),
            signing,
            popup,
        }
    }

    /// Accept loop. Each inbound port gets its own task; the port name
    /// prefix decides whether it is the extension UI or a content script.
    /// Ports under neither prefix are refused outright.
    pub async fn serve(&self, hub: PortHub) {
        while let Some(port) = hub.accept().await {
            let port = Arc::new(port);
            let router = self.clone();
            if port.name().starts_with(APP_PORT_PREFIX) {
                tokio::spawn(async move { router.serve_app_port(port).await });
            } else if port.name().starts_with(CONTENT_PORT_PREFIX) {
                tokio::spawn(async move { router.serve_content_port(port).await });
            } else {
                warn!(
                    target: "router::session",
                    connection_id = port.name(),
                    "port with unrecognized name prefix; refusing"
                );
                port.disconnect();
            }
        }
    }

    /// The browser closed a tab: drop its connection outright. The pending
    /// request dies with it since there is no one left to answer.
    pub fn tab_removed(&self, tab_id: u32) {
        let removed = self.state.lock().remove_tab(tab_id);
        for connection in &removed {
            info!(
                target: "router::session",
                connection_id = %connection.connection_id,
                tab_id,
                "tab closed; dropping its connection"
            );
            connection.port.disconnect();
        }
    }

    pub fn pending_request(&self) -> Option<PendingRequest> {
        self.state.lock().pending.current().cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    async fn serve_content_port(&self, port: Arc<PortHandle>) {
        // Nothing is routed until HELLO arrives.
        let session_id = loop {
            match port.recv().await {
                PortEvent::Frame(value) => match PortFrame::decode(value) {
                    Ok(PortFrame::Hello { instance_id }) => {
                        let session_id = PortSessionId::generate();
                        debug!(
                            target: "router::session",
                            connection_id = port.name(),
                            instance_id = %instance_id,
                            session_id = %session_id,
                            "content port handshake"
                        );
                        break session_id;
                    }
                    Ok(other) => {
                        warn!(
                            target: "router::session",
                            connection_id = port.name(),
                            frame = ?other,
                            "frame before HELLO; dropping"
                        );
                    }
                    Err(err) => {
                        warn!(
                            target: "router::session",
                            connection_id = port.name(),
                            error = %err,
                            "undecodable frame before HELLO; dropping"
                        );
                    }
                },
                PortEvent::Disconnected(reason) => {
                    debug!(
                        target: "router::session",
                        connection_id = port.name(),
                        ?reason,
                        "content port lost before handshake"
                    );
                    return;
                }
            }
        };
        {
            let mut state = self.state.lock();
            state.connections.insert(
                port.name().to_string(),
                Connection {
                    connection_id: port.name().to_string(),
                    tab_id: port.peer().tab_id,
                    page_authority: port.peer().authority(),
                    session_id: session_id.clone(),
                    port: Arc::clone(&port),
                },
            );
        }
        let ready = PortFrame::Ready {
            port_session_id: session_id.clone(),
        };
        if port.post(ready.encode()).is_err() {
            self.remove_connection(port.name(), &session_id);
            return;
        }

        loop {
            match port.recv().await {
                PortEvent::Frame(value) => match PortFrame::decode(value) {
                    Ok(PortFrame::RpcReq {
                        id,
                        port_session_id,
                        method,
                        params,
                    }) => {
                        if port_session_id != session_id {
                            warn!(
                                target: "router::rpc",
                                connection_id = port.name(),
                                rpc_id = %id,
                                "request stamped with a stale port session; rejecting"
                            );
                            let _ = port
                                .post(PortFrame::response_err(id, "stale port session").encode());
                            continue;
                        }
                        self.dispatch_rpc(&port, id, &method, params).await;
                    }
                    Ok(other) => {
                        warn!(
                            target: "router::rpc",
                            connection_id = port.name(),
                            frame = ?other,
                            "unexpected frame on established connection; dropping"
                        );
                    }
                    Err(err) => {
                        warn!(
                            target: "router::rpc",
                            connection_id = port.name(),
                            error = %err,
                            "undecodable frame; dropping"
                        );
                    }
                },
                PortEvent::Disconnected(reason) => {
                    debug!(
                        target: "router::session",
                        connection_id = port.name(),
                        ?reason,
                        "content port disconnected"
                    );
                    break;
                }
            }
        }
        self.remove_connection(port.name(), &session_id);
    }

    async fn serve_app_port(&self, port: Arc<PortHandle>) {
        let authority = port.peer().authority();
        {
            let mut state = self.state.lock();
            let paired = authority
                .as_deref()
                .map(|a| state.connection_by_authority(a).is_some())
                .unwrap_or(false);
            if !paired {
                info!(
                    target: "router::app",
                    connection_id = port.name(),
                    "no tab connection shares the app's authority"
                );
            }
            state.apps.insert(
                port.name().to_string(),
                AppConnection {
                    connection_id: port.name().to_string(),
                    page_authority: authority.clone(),
                    port: Arc::clone(&port),
                },
            );
        }
        debug!(target: "router::app", connection_id = port.name(), "app port attached");

        loop {
            match port.recv().await {
                PortEvent::Frame(value) => match AppFrame::decode(value) {
                    Ok(AppFrame::Reply { data }) => self.complete_pending(data).await,
                    Ok(AppFrame::ReplyCanceled) => self.cancel_pending(),
                    Ok(AppFrame::AppClosed) => self.last_gasp(),
                    Ok(AppFrame::QueryPending) => {
                        let request = self.state.lock().pending.current().map(|pending| {
                            json!({
                                "rpc_id": pending.rpc_id,
                                "method": pending.method,
                                "params": pending.params,
                                "origin": pending.origin,
                            })
                        });
                        let _ = port.post(AppFrame::PendingState { request }.encode());
                    }
                    Ok(AppFrame::PendingState { .. }) => {
                        warn!(
                            target: "router::app",
                            connection_id = port.name(),
                            "unexpected pending_state from the UI; dropping"
                        );
                    }
                    Err(err) => {
                        warn!(
                            target: "router::app",
                            connection_id = port.name(),
                            error = %err,
                            "undecodable app frame; dropping"
                        );
                    }
                },
                PortEvent::Disconnected(reason) => {
                    debug!(
                        target: "router::app",
                        connection_id = port.name(),
                        ?reason,
                        "app port disconnected"
                    );
                    break;
                }
            }
        }
        self.state.lock().apps.remove(port.name());
        // The popup went away without a verdict.
        self.last_gasp();
    }

    async fn dispatch_rpc(
        &self,
        port: &Arc<PortHandle>,
        id: RpcId,
        method: &str,
        params: Option<Value>,
    ) {
        match method {
            "sign_request" => {
                let payload = match params.clone().map(serde_json::from_value::<SignPayload>) {
                    Some(Ok(payload)) => payload,
                    _ => {
                        let _ = port.post(
                            PortFrame::response_err(id, "malformed sign_request payload").encode(),
                        );
                        return;
                    }
                };
                self.route_sign_request(port, id, payload, params).await;
            }
            "sign_data" | "select_identifier" | "select_credential" => {
                self.route_to_popup(port, id, method, params).await;
            }
            other => {
                warn!(target: "router::rpc", method = other, "unknown rpc method");
                let _ = port
                    .post(PortFrame::response_err(id, format!("unknown method: {other}")).encode());
            }
        }
    }

    /// Safe methods with a remembered identifier sign without the popup;
    /// everything else waits for the user.
    async fn route_sign_request(
        &self,
        port: &Arc<PortHandle>,
        id: RpcId,
        payload: SignPayload,
        params: Option<Value>,
    ) {
        let origin = self
            .state
            .lock()
            .connections
            .get(port.name())
            .and_then(|conn| conn.page_authority.clone());
        let Some(origin) = origin else {
            let _ = port.post(PortFrame::response_err(id, "page origin unknown").encode());
            return;
        };
        if let Err(busy) = self.begin_pending(port.name(), &id, "sign_request", &params, &origin) {
            let _ = port.post(PortFrame::response_err(id, busy.to_string()).encode());
            return;
        }
        if payload.is_safe_method() {
            match self.signing.remembered_identifier(&origin).await {
                Ok(Some(identifier)) => {
                    self.mark_waiting(&id);
                    let outcome = self
                        .sign_noting_agent(&origin, Some(&identifier), &payload)
                        .await;
                    self.finish_pending(&id);
                    info!(
                        target: "router::signing",
                        origin,
                        ok = outcome.is_ok(),
                        "safe request signed without approval"
                    );
                    let frame = match outcome {
                        Ok(result) => PortFrame::response_ok(id, result),
                        Err(error) => PortFrame::response_err(id, error),
                    };
                    let _ = port.post(frame.encode());
                    return;
                }
                Ok(None) => {}
                Err(err) => {
                    self.finish_pending(&id);
                    let _ = port.post(PortFrame::response_err(id, err.to_string()).encode());
                    return;
                }
            }
        }
        self.open_popup(port, id, "sign_request", params).await;
    }

    async fn route_to_popup(
        &self,
        port: &Arc<PortHandle>,
        id: RpcId,
        method: &str,
        params: Option<Value>,
    ) {
        let origin = self
            .state
            .lock()
            .connections
            .get(port.name())
            .and_then(|conn| conn.page_authority.clone())
            .unwrap_or_default();
        if let Err(busy) = self.begin_pending(port.name(), &id, method, &params, &origin) {
            let _ = port.post(PortFrame::response_err(id, busy.to_string()).encode());
            return;
        }
        self.open_popup(port, id, method, params).await;
    }

    /// Pending slot must already hold the request. A popup that cannot open
    /// frees the slot and errors the request.
    async fn open_popup(&self, port: &Arc<PortHandle>, id: RpcId, method: &str, params: Option<Value>) {
        let url = popup_url(method, &id, params.as_ref());
        if let Err(err) = self.popup.open(&url).await {
            warn!(target: "router::pending", error = %err, "approval popup failed to open");
            self.finish_pending(&id);
            let _ = port.post(
                PortFrame::response_err(id, format!("failed to open approval popup: {err}"))
                    .encode(),
            );
        }
    }

    /// User approval from the popup. For sign flows the agent call runs with
    /// the waiting flag set so a popup closing mid-call cannot cancel it.
    async fn complete_pending(&self, data: Option<Value>) {
        let pending = {
            let state = self.state.lock();
            match state.pending.current() {
                Some(pending) => pending.clone(),
                None => {
                    warn!(target: "router::pending", "approval arrived with nothing pending");
                    return;
                }
            }
        };
        if pending.method == "sign_request" {
            let payload = match pending.params.clone().map(serde_json::from_value::<SignPayload>) {
                Some(Ok(payload)) => payload,
                _ => {
                    self.finish_pending(&pending.rpc_id);
                    self.reply_to_owner(&pending, Err("pending request payload is unreadable".into()));
                    return;
                }
            };
            let origin = pending.origin.clone().unwrap_or_default();
            let chosen = data
                .as_ref()
                .and_then(|d| d.get("identifier"))
                .and_then(Value::as_str)
                .map(str::to_string);
            self.mark_waiting(&pending.rpc_id);
            let outcome = self
                .sign_noting_agent(&origin, chosen.as_deref(), &payload)
                .await;
            self.finish_pending(&pending.rpc_id);
            self.reply_to_owner(&pending, outcome);
        } else {
            self.finish_pending(&pending.rpc_id);
            self.reply_to_owner(&pending, Ok(data.unwrap_or(Value::Null)));
        }
    }

    /// Explicit rejection from the popup. Gated on the waiting flag like
    /// the last gasp: once the agent call is in flight, its outcome is the
    /// one reply the page gets.
    fn cancel_pending(&self) {
        let taken = self.state.lock().pending.take_if_idle();
        match taken {
            Some(pending) => {
                info!(
                    target: "router::pending",
                    rpc_id = %pending.rpc_id,
                    "request rejected by the user"
                );
                self.reply_to_owner(&pending, Err(CANCELED_ERROR.to_string()));
            }
            None => {
                warn!(target: "router::pending", "rejection with nothing idle to cancel");
            }
        }
    }

    /// The popup disappeared without a verdict. Cancels the pending request
    /// only when it is not already committed to the agent; safe to call any
    /// number of times.
    fn last_gasp(&self) {
        let pending = self.state.lock().pending.take_if_idle();
        if let Some(pending) = pending {
            info!(
                target: "router::pending",
                rpc_id = %pending.rpc_id,
                "popup went away; canceling the idle request"
            );
            self.reply_to_owner(&pending, Err(CANCELED_ERROR.to_string()));
        }
    }

    /// Run the signing flow and announce the agent coming online to every
    /// connected tab the first time it does.
    async fn sign_noting_agent(
        &self,
        origin: &str,
        identifier: Option<&str>,
        payload: &SignPayload,
    ) -> Result<Value, String> {
        let was_connected = self.signing.agent().is_connected().await;
        let outcome = match identifier {
            Some(identifier) => self.signing.sign_as(origin, identifier, payload).await,
            None => self.signing.sign_with_remembered(origin, payload).await,
        }
        .map_err(|err| err.to_string());
        if outcome.is_ok() && !was_connected {
            self.broadcast_event("agent_state", json!({ "connected": true }));
        }
        outcome
    }

    fn reply_to_owner(&self, pending: &PendingRequest, outcome: Result<Value, String>) {
        let port = self
            .state
            .lock()
            .connections
            .get(&pending.connection_id)
            .map(|conn| Arc::clone(&conn.port));
        let Some(port) = port else {
            warn!(
                target: "router::pending",
                connection_id = %pending.connection_id,
                "owning connection is gone; dropping the reply"
            );
            return;
        };
        let frame = match outcome {
            Ok(result) => PortFrame::response_ok(pending.rpc_id.clone(), result),
            Err(error) => PortFrame::response_err(pending.rpc_id.clone(), error),
        };
        let _ = port.post(frame.encode());
    }

    fn broadcast_event(&self, name: &str, data: Value) {
        let ports: Vec<Arc<PortHandle>> = self
            .state
            .lock()
            .connections
            .values()
            .map(|conn| Arc::clone(&conn.port))
            .collect();
        let frame = PortFrame::Event {
            name: name.to_string(),
            data,
        };
        for port in ports {
            let _ = port.post(frame.encode());
        }
    }

    fn begin_pending(
        &self,
        connection_id: &str,
        id: &RpcId,
        method: &str,
        params: &Option<Value>,
        origin: &str,
    ) -> Result<(), PendingBusy> {
        self.state.lock().pending.begin(PendingRequest {
            rpc_id: id.clone(),
            connection_id: connection_id.to_string(),
            method: method.to_string(),
            params: params.clone(),
            origin: Some(origin.to_string()),
            waiting_on_agent: false,
        })
    }

    fn mark_waiting(&self, id: &RpcId) {
        self.state.lock().pending.mark_waiting(id);
    }

    fn finish_pending(&self, id: &RpcId) {
        self.state.lock().pending.finish(id);
    }

    /// Unregister a connection, but only if the registry still holds the
    /// session this task owned; a reconnect may already have replaced it.
    fn remove_connection(&self, name: &str, session_id: &PortSessionId) {
        let mut state = self.state.lock();
        let owned = state
            .connections
            .get(name)
            .map(|conn| &conn.session_id == session_id)
            .unwrap_or(false);
        if !owned {
            return;
        }
        state.connections.remove(name);
        let orphaned = state
            .pending
            .current()
            .map(|pending| pending.connection_id == name)
            .unwrap_or(false);
        if orphaned {
            state.pending.take();
        }
    }
}

fn popup_url(method: &str, id: &RpcId, params: Option<&Value>) -> String {
    let mut query = form_urlencoded::Serializer::new(String::new());
    query.append_pair("method", method);
    query.append_pair("rpc_id", id.as_str());
    if let Some(params) = params {
        query.append_pair("params", &params.to_string());
    }
    format!("{POPUP_PAGE}?{}", query.finish())
}
