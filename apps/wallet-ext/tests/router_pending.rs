//! Router-level protocol tests, driving raw ports against the worker
//! without a bridge in between.

mod common;

use common::*;
use port_bus::{PortEvent, PortHandle, PortSender};
use serde_json::{json, Value};
use wallet_proto::{AppFrame, InstanceId, PortFrame, PortSessionId, RpcId, SignPayload};

async fn handshake(port: &PortHandle) -> PortSessionId {
    port.post(
        PortFrame::Hello {
            instance_id: InstanceId::generate(),
        }
        .encode(),
    )
    .expect("hello");
    loop {
        match port.recv().await {
            PortEvent::Frame(value) => {
                if let PortFrame::Ready { port_session_id } =
                    PortFrame::decode(value).expect("decode")
                {
                    return port_session_id;
                }
            }
            PortEvent::Disconnected(reason) => panic!("disconnected in handshake: {reason:?}"),
        }
    }
}

fn post_sign(port: &PortHandle, session: &PortSessionId, method: &str) -> RpcId {
    let id = RpcId::generate();
    let payload = SignPayload {
        method: method.into(),
        url: "https://api.example/data".into(),
        headers: None,
    };
    port.post(
        PortFrame::RpcReq {
            id: id.clone(),
            port_session_id: session.clone(),
            method: "sign_request".into(),
            params: Some(serde_json::to_value(&payload).expect("payload")),
        }
        .encode(),
    )
    .expect("rpc");
    id
}

async fn next_response(port: &PortHandle) -> (RpcId, Option<Value>, Option<String>) {
    loop {
        match port.recv().await {
            PortEvent::Frame(value) => {
                if let PortFrame::RpcRes { id, result, error } =
                    PortFrame::decode(value).expect("decode")
                {
                    return (id, result, error);
                }
            }
            PortEvent::Disconnected(reason) => panic!("port died awaiting response: {reason:?}"),
        }
    }
}

async fn next_app_frame(port: &PortHandle) -> AppFrame {
    match port.recv().await {
        PortEvent::Frame(value) => AppFrame::decode(value).expect("decode"),
        PortEvent::Disconnected(reason) => panic!("app port died: {reason:?}"),
    }
}

#[test_timeout::tokio_timeout_test]
async fn pending_slot_is_extension_wide() {
    let h = harness(StubSigner::ready());
    h.settings.remember(PAGE_AUTHORITY, "work");
    h.spawn_router();

    let tab1 = h.hub.connect("wallet-tab-1", PortSender::tab(1, PAGE_URL));
    let tab2 = h
        .hub
        .connect("wallet-tab-2", PortSender::tab(2, "https://other.example/"));
    let s1 = handshake(&tab1).await;
    let s2 = handshake(&tab2).await;

    let first = post_sign(&tab1, &s1, "POST");
    wait_until(|| !h.popup.opened().is_empty()).await;

    // Even a safe request from another tab is refused while one is pending.
    let second = post_sign(&tab2, &s2, "GET");
    let (id, result, error) = next_response(&tab2).await;
    assert_eq!(id, second);
    assert!(result.is_none());
    assert!(error.expect("busy error").contains("already"));

    assert_eq!(h.router.pending_request().expect("pending").rpc_id, first);
}

#[test_timeout::tokio_timeout_test]
async fn popup_vanishing_without_a_verdict_cancels_once() {
    let h = harness(StubSigner::ready());
    h.spawn_router();

    let tab = h.hub.connect("wallet-tab-1", PortSender::tab(1, PAGE_URL));
    let session = handshake(&tab).await;
    let id = post_sign(&tab, &session, "POST");
    wait_until(|| !h.popup.opened().is_empty()).await;

    let popup = h
        .hub
        .connect("wallet-app-1", PortSender::app("https://app.example/popup.html"));
    wait_until(|| h.router.pending_request().is_some()).await;
    // Deliberate close notice followed by the disconnect itself; the second
    // last-gasp finds the slot already empty.
    popup.post(AppFrame::AppClosed.encode()).expect("closing");
    popup.disconnect();

    let (res_id, result, error) = next_response(&tab).await;
    assert_eq!(res_id, id);
    assert!(result.is_none());
    assert_eq!(error.as_deref(), Some("canceled"));
    assert!(h.router.pending_request().is_none());

    // The slot is free for the next request.
    let next = post_sign(&tab, &session, "POST");
    wait_until(|| h.router.pending_request().is_some()).await;
    assert_eq!(h.router.pending_request().expect("pending").rpc_id, next);
}

#[test_timeout::tokio_timeout_test]
async fn popup_close_mid_agent_call_does_not_cancel() {
    let h = harness(StubSigner::ready());
    h.settings.remember(PAGE_AUTHORITY, "work");
    h.spawn_router();

    let tab = h.hub.connect("wallet-tab-1", PortSender::tab(1, PAGE_URL));
    let session = handshake(&tab).await;
    let id = post_sign(&tab, &session, "POST");
    wait_until(|| !h.popup.opened().is_empty()).await;

    let gate = h.signer.gate_signing();
    let popup = h
        .hub
        .connect("wallet-app-1", PortSender::app("https://app.example/popup.html"));
    popup
        .post(
            AppFrame::Reply {
                data: Some(json!({ "identifier": "work" })),
            }
            .encode(),
        )
        .expect("approve");
    wait_until(|| {
        h.router
            .pending_request()
            .map(|p| p.waiting_on_agent)
            .unwrap_or(false)
    })
    .await;

    // Popup dies while the agent call is in flight: no cancellation.
    popup.disconnect();
    gate.notify_one();

    let (res_id, result, error) = next_response(&tab).await;
    assert_eq!(res_id, id);
    assert!(error.is_none(), "unexpected error: {error:?}");
    let result = result.expect("signed result");
    assert_eq!(result["headers"]["signify-resource"], "work");
}

#[test_timeout::tokio_timeout_test]
async fn rejection_mid_agent_call_cannot_cancel() {
    let h = harness(StubSigner::ready());
    h.settings.remember(PAGE_AUTHORITY, "work");
    h.spawn_router();

    let tab = h.hub.connect("wallet-tab-1", PortSender::tab(1, PAGE_URL));
    let session = handshake(&tab).await;
    let id = post_sign(&tab, &session, "POST");
    wait_until(|| !h.popup.opened().is_empty()).await;

    let gate = h.signer.gate_signing();
    let popup = h
        .hub
        .connect("wallet-app-1", PortSender::app("https://app.example/popup.html"));
    popup
        .post(
            AppFrame::Reply {
                data: Some(json!({ "identifier": "work" })),
            }
            .encode(),
        )
        .expect("approve");
    wait_until(|| {
        h.router
            .pending_request()
            .map(|p| p.waiting_on_agent)
            .unwrap_or(false)
    })
    .await;

    // A late rejection while the agent call is in flight is ignored; the
    // signed result is the one reply the page receives.
    popup.post(AppFrame::ReplyCanceled.encode()).expect("late reject");
    gate.notify_one();

    let (res_id, result, error) = next_response(&tab).await;
    assert_eq!(res_id, id);
    assert!(error.is_none(), "unexpected error: {error:?}");
    assert!(result.is_some());
    assert!(h.router.pending_request().is_none());
}

#[test_timeout::tokio_timeout_test]
async fn ports_outside_the_known_prefixes_are_refused() {
    let h = harness(StubSigner::ready());
    h.spawn_router();

    let stray = h.hub.connect("metrics-1", PortSender::tab(1, PAGE_URL));
    assert!(matches!(
        stray.recv().await,
        PortEvent::Disconnected(port_bus::DisconnectReason::PeerClosed)
    ));
    assert_eq!(h.router.connection_count(), 0);

    // A properly named content port on the same hub is still served.
    let tab = h.hub.connect("wallet-tab-1", PortSender::tab(1, PAGE_URL));
    let _session = handshake(&tab).await;
    assert_eq!(h.router.connection_count(), 1);
}

#[test_timeout::tokio_timeout_test]
async fn closing_a_tab_drops_its_connection_and_request() {
    let h = harness(StubSigner::ready());
    h.spawn_router();

    let tab = h.hub.connect("wallet-tab-7", PortSender::tab(7, PAGE_URL));
    let session = handshake(&tab).await;
    post_sign(&tab, &session, "POST");
    wait_until(|| h.router.pending_request().is_some()).await;
    assert_eq!(h.router.connection_count(), 1);

    h.router.tab_removed(7);
    assert!(h.router.pending_request().is_none());
    wait_until(|| h.router.connection_count() == 0).await;
    assert!(matches!(
        tab.recv().await,
        PortEvent::Disconnected(port_bus::DisconnectReason::PeerClosed)
    ));
}

#[test_timeout::tokio_timeout_test]
async fn requests_from_a_stale_session_are_rejected() {
    let h = harness(StubSigner::ready());
    h.settings.remember(PAGE_AUTHORITY, "work");
    h.spawn_router();

    let tab = h.hub.connect("wallet-tab-1", PortSender::tab(1, PAGE_URL));
    let _session = handshake(&tab).await;

    let id = RpcId::generate();
    tab.post(
        PortFrame::RpcReq {
            id: id.clone(),
            port_session_id: PortSessionId::generate(),
            method: "sign_request".into(),
            params: Some(json!({ "method": "GET", "url": "https://api.example/x" })),
        }
        .encode(),
    )
    .expect("rpc");

    let (res_id, result, error) = next_response(&tab).await;
    assert_eq!(res_id, id);
    assert!(result.is_none());
    assert!(error.expect("stale error").contains("stale"));
}

#[test_timeout::tokio_timeout_test]
async fn a_fresh_popup_can_discover_the_pending_request() {
    let h = harness(StubSigner::ready());
    h.spawn_router();

    let tab = h.hub.connect("wallet-tab-1", PortSender::tab(1, PAGE_URL));
    let session = handshake(&tab).await;
    let id = post_sign(&tab, &session, "POST");
    wait_until(|| h.router.pending_request().is_some()).await;

    let popup = h
        .hub
        .connect("wallet-app-1", PortSender::app("https://app.example/popup.html"));
    popup.post(AppFrame::QueryPending.encode()).expect("query");
    match next_app_frame(&popup).await {
        AppFrame::PendingState { request } => {
            let request = request.expect("pending payload");
            assert_eq!(request["method"], "sign_request");
            assert_eq!(request["rpc_id"], Value::String(id.as_str().to_string()));
        }
        other => panic!("unexpected app frame: {other:?}"),
    }

    // And a popup arriving with nothing pending sees exactly that.
    popup.post(AppFrame::ReplyCanceled.encode()).expect("reject");
    let _ = next_response(&tab).await;
    popup.post(AppFrame::QueryPending.encode()).expect("query");
    match next_app_frame(&popup).await {
        AppFrame::PendingState { request } => assert!(request.is_none()),
        other => panic!("unexpected app frame: {other:?}"),
    }
}
