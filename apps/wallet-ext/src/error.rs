use port_bus::DisconnectReason;
use thiserror::Error;

/// Terminal failures of the content-script bridge. Ordinary worker
/// recycling is absorbed by the reconnect loop and never surfaces here.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The extension was reloaded or updated underneath the page. The
    /// embedder must prompt the user to reload; retrying is pointless.
    #[error("extension context invalidated; page reload required")]
    ContextInvalidated,
    /// The worker stayed unreachable through every allowed attempt.
    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
}

impl BridgeError {
    pub(crate) fn from_terminal_disconnect(reason: DisconnectReason) -> Option<Self> {
        match reason {
            DisconnectReason::ContextInvalidated => Some(Self::ContextInvalidated),
            _ => None,
        }
    }
}

/// Failures reaching or provisioning the remote identity agent.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("no agent settings configured")]
    NotConfigured,
    #[error("agent boot failed: {0}")]
    Boot(String),
    #[error("agent connect failed: {0}")]
    Connect(String),
    /// The agent accepted the connection but never started serving
    /// authenticated calls within the probe budget.
    #[error("agent not ready after {attempts} probe attempts")]
    ProbeExhausted { attempts: u32 },
}

/// Failures of the sign-request flow; each one becomes an error reply to
/// the originating page request.
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("no identifier remembered for origin {origin}")]
    NoIdentifier { origin: String },
    #[error("settings lookup failed: {0}")]
    Settings(String),
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error("signing failed: {0}")]
    Signer(String),
}
