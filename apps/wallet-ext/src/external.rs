//! Seams to the collaborators this core coordinates but does not own:
//! persisted settings, the signing-library client, the popup window, and
//! the page side of the `postMessage` boundary.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use wallet_proto::{PageEnvelope, SignPayload};

/// Remote agent coordinates and credentials, as persisted by the embedder.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub admin_url: String,
    pub boot_url: String,
    pub passcode: String,
}

/// Read-only view of the extension's persisted configuration.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn agent_settings(&self) -> Result<Option<AgentSettings>>;

    /// Identifier name the user chose to remember for this page origin, if
    /// any. Presence of one is what allows the safe-method popup bypass.
    async fn remembered_identifier(&self, origin: &str) -> Result<Option<String>>;
}

/// The signing-library shim. One client per connection attempt; a client
/// that failed mid-boot is discarded, never reused.
#[async_trait]
pub trait SignerClient: Send + Sync + std::fmt::Debug {
    /// Whether the agent already holds state for this passcode.
    async fn provisioned(&self) -> Result<bool>;
    async fn boot(&self) -> Result<()>;
    async fn connect(&self) -> Result<()>;
    /// Authenticated call used as the readiness probe.
    async fn list_identifiers(&self) -> Result<Vec<String>>;
    async fn signed_headers(
        &self,
        origin: &str,
        identifier: &str,
        request: &SignPayload,
    ) -> Result<BTreeMap<String, String>>;
}

pub trait SignerFactory: Send + Sync {
    fn make(&self, settings: &AgentSettings) -> Arc<dyn SignerClient>;
}

/// Opens the extension popup. The pending request rides in the URL because
/// the popup process may not exist yet when the request arrives.
#[async_trait]
pub trait PopupLauncher: Send + Sync {
    async fn open(&self, url: &str) -> Result<()>;
}

/// The content script's handle on `window.postMessage` toward the page.
pub trait PageSink: Send + Sync {
    fn post(&self, envelope: PageEnvelope);
}
