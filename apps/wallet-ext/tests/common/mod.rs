#![allow(dead_code)]

//! In-memory collaborators shared by the integration suites.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use port_bus::{PortHub, PortSender};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use wallet_ext::external::{
    AgentSettings, PageSink, PopupLauncher, SettingsStore, SignerClient, SignerFactory,
};
use wallet_ext::{AgentManager, ContentBridge, MessageRouter, ProbeConfig, ReconnectConfig, SigningFlow};
use wallet_proto::{
    PageEnvelope, PageMessage, PageReply, PageRequest, RequestId, SignPayload,
};

pub const PAGE_AUTHORITY: &str = "app.example";
pub const PAGE_URL: &str = "https://app.example/page";

pub struct MemSettings {
    agent: Option<AgentSettings>,
    remembered: Mutex<HashMap<String, String>>,
}

impl MemSettings {
    pub fn configured() -> Arc<Self> {
        Arc::new(Self {
            agent: Some(AgentSettings {
                admin_url: "https://keria.example/admin".into(),
                boot_url: "https://keria.example/boot".into(),
                passcode: "0123456789abcdefghij".into(),
            }),
            remembered: Mutex::new(HashMap::new()),
        })
    }

    pub fn unconfigured() -> Arc<Self> {
        Arc::new(Self {
            agent: None,
            remembered: Mutex::new(HashMap::new()),
        })
    }

    pub fn remember(&self, origin: &str, identifier: &str) {
        self.remembered
            .lock()
            .insert(origin.to_string(), identifier.to_string());
    }
}

#[async_trait]
impl SettingsStore for MemSettings {
    async fn agent_settings(&self) -> Result<Option<AgentSettings>> {
        Ok(self.agent.clone())
    }

    async fn remembered_identifier(&self, origin: &str) -> Result<Option<String>> {
        Ok(self.remembered.lock().get(origin).cloned())
    }
}

/// Scripted signing-library client. Probe failures count down; the signing
/// gate, when installed, parks `signed_headers` until notified.
#[derive(Debug)]
pub struct StubSigner {
    provisioned: AtomicBool,
    probe_failures: AtomicU32,
    boots: AtomicU32,
    sign_gate: Mutex<Option<Arc<Notify>>>,
}

impl StubSigner {
    pub fn ready() -> Arc<Self> {
        Arc::new(Self {
            provisioned: AtomicBool::new(true),
            probe_failures: AtomicU32::new(0),
            boots: AtomicU32::new(0),
            sign_gate: Mutex::new(None),
        })
    }

    pub fn with_probe_failures(failures: u32) -> Arc<Self> {
        let signer = Self::ready();
        signer.probe_failures.store(failures, Ordering::SeqCst);
        signer
    }

    pub fn unprovisioned() -> Arc<Self> {
        let signer = Self::ready();
        signer.provisioned.store(false, Ordering::SeqCst);
        signer
    }

    pub fn boots(&self) -> u32 {
        self.boots.load(Ordering::SeqCst)
    }

    pub fn set_probe_failures(&self, failures: u32) {
        self.probe_failures.store(failures, Ordering::SeqCst);
    }

    /// Gate the next `signed_headers` call; the returned handle releases
    /// it. Later calls run ungated.
    pub fn gate_signing(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.sign_gate.lock() = Some(Arc::clone(&gate));
        gate
    }
}

#[async_trait]
impl SignerClient for StubSigner {
    async fn provisioned(&self) -> Result<bool> {
        Ok(self.provisioned.load(Ordering::SeqCst))
    }

    async fn boot(&self) -> Result<()> {
        self.boots.fetch_add(1, Ordering::SeqCst);
        self.provisioned.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn list_identifiers(&self) -> Result<Vec<String>> {
        let remaining = self.probe_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.probe_failures.store(remaining - 1, Ordering::SeqCst);
            bail!("agent still waking up");
        }
        Ok(vec!["work".into(), "personal".into()])
    }

    async fn signed_headers(
        &self,
        origin: &str,
        identifier: &str,
        request: &SignPayload,
    ) -> Result<BTreeMap<String, String>> {
        let gate = self.sign_gate.lock().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let mut headers = BTreeMap::new();
        headers.insert(
            "signature".into(),
            format!("sig:{identifier}:{}:{origin}", request.method),
        );
        headers.insert("signify-resource".into(), identifier.to_string());
        Ok(headers)
    }
}

pub struct StubFactory {
    signer: Arc<StubSigner>,
    makes: AtomicU32,
}

impl StubFactory {
    pub fn new(signer: Arc<StubSigner>) -> Arc<Self> {
        Arc::new(Self {
            signer,
            makes: AtomicU32::new(0),
        })
    }

    pub fn makes(&self) -> u32 {
        self.makes.load(Ordering::SeqCst)
    }
}

impl SignerFactory for StubFactory {
    fn make(&self, _settings: &AgentSettings) -> Arc<dyn SignerClient> {
        self.makes.fetch_add(1, Ordering::SeqCst);
        Arc::clone(&self.signer) as Arc<dyn SignerClient>
    }
}

pub struct RecordingPopup {
    opened: Mutex<Vec<String>>,
    fail: AtomicBool,
}

impl RecordingPopup {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            opened: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        })
    }

    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().clone()
    }

    pub fn fail_opens(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl PopupLauncher for RecordingPopup {
    async fn open(&self, url: &str) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("window manager refused");
        }
        self.opened.lock().push(url.to_string());
        Ok(())
    }
}

pub struct RecordingSink {
    tx: mpsc::UnboundedSender<PageEnvelope>,
}

impl RecordingSink {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<PageEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl PageSink for RecordingSink {
    fn post(&self, envelope: PageEnvelope) {
        let _ = self.tx.send(envelope);
    }
}

/// A full page <-> content <-> worker assembly over one in-process hub.
pub struct Harness {
    pub hub: PortHub,
    pub router: MessageRouter,
    pub bridge: ContentBridge,
    pub settings: Arc<MemSettings>,
    pub signer: Arc<StubSigner>,
    pub factory: Arc<StubFactory>,
    pub popup: Arc<RecordingPopup>,
    pub replies: mpsc::UnboundedReceiver<PageEnvelope>,
}

pub fn fast_probe() -> ProbeConfig {
    ProbeConfig {
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(4),
        max_attempts: 4,
    }
}

pub fn fast_reconnect() -> ReconnectConfig {
    ReconnectConfig {
        base_delay: Duration::from_millis(2),
        max_attempts: 5,
    }
}

pub fn harness(signer: Arc<StubSigner>) -> Harness {
    wallet_ext::telemetry::init();
    let hub = PortHub::new();
    let settings = MemSettings::configured();
    let factory = StubFactory::new(Arc::clone(&signer));
    let agent = Arc::new(AgentManager::new(
        Arc::clone(&factory) as Arc<dyn SignerFactory>,
        fast_probe(),
    ));
    let signing = Arc::new(SigningFlow::new(
        Arc::clone(&settings) as Arc<dyn SettingsStore>,
        agent,
    ));
    let popup = RecordingPopup::new();
    let router = MessageRouter::new(signing, Arc::clone(&popup) as Arc<dyn PopupLauncher>);
    let (sink, replies) = RecordingSink::new();
    let bridge = ContentBridge::new(
        hub.clone(),
        "wallet-tab-1",
        PortSender::tab(1, PAGE_URL),
        sink,
        fast_reconnect(),
    );
    Harness {
        hub,
        router,
        bridge,
        settings,
        signer,
        factory,
        popup,
        replies,
    }
}

impl Harness {
    /// Spawn the worker accept loop and the bridge reconnect loop.
    pub fn spawn_all(&self) {
        let router = self.router.clone();
        let hub = self.hub.clone();
        tokio::spawn(async move { router.serve(hub).await });
        let bridge = self.bridge.clone();
        tokio::spawn(async move {
            let _ = bridge.run().await;
        });
    }

    pub fn spawn_router(&self) {
        let router = self.router.clone();
        let hub = self.hub.clone();
        tokio::spawn(async move { router.serve(hub).await });
    }

    /// Next reply addressed to the page, skipping pushed events.
    pub async fn next_reply(&mut self) -> PageReply {
        loop {
            let envelope = self.replies.recv().await.expect("page sink closed");
            match envelope.message {
                PageMessage::Reply(reply) => return reply,
                PageMessage::Request(_) | PageMessage::Event { .. } => {}
            }
        }
    }

    /// Next pushed event addressed to the page, skipping replies.
    pub async fn next_event(&mut self) -> (String, Value) {
        loop {
            let envelope = self.replies.recv().await.expect("page sink closed");
            if let PageMessage::Event { name, data } = envelope.message {
                return (name, data);
            }
        }
    }
}

/// Poll until a condition holds; the test-level timeout bounds the wait.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    while !cond() {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

pub fn sign_request_event(request_id: &str, method: &str) -> Value {
    PageEnvelope::from_page(PageRequest::SignRequest {
        request_id: RequestId::new(request_id),
        payload: SignPayload {
            method: method.into(),
            url: "https://api.example/data".into(),
            headers: None,
        },
    })
    .encode()
}

pub fn select_identifier_event(request_id: &str) -> Value {
    PageEnvelope::from_page(PageRequest::SelectIdentifier {
        request_id: RequestId::new(request_id),
    })
    .encode()
}
