//! The sign-request flow: origin -> remembered identifier -> connected
//! agent -> signed headers. Every failure becomes an error reply addressed
//! to the original page request; nothing here is allowed to time out
//! silently.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;
use wallet_proto::SignPayload;

use crate::agent::AgentManager;
use crate::error::{AgentError, SigningError};
use crate::external::SettingsStore;

pub struct SigningFlow {
    settings: Arc<dyn SettingsStore>,
    agent: Arc<AgentManager>,
}

impl SigningFlow {
    pub fn new(settings: Arc<dyn SettingsStore>, agent: Arc<AgentManager>) -> Self {
        Self { settings, agent }
    }

    pub fn agent(&self) -> &Arc<AgentManager> {
        &self.agent
    }

    /// Sign with whatever identifier is remembered for the origin; errors
    /// if none is.
    pub async fn sign_with_remembered(
        &self,
        origin: &str,
        payload: &SignPayload,
    ) -> Result<Value, SigningError> {
        let identifier = self
            .remembered_identifier(origin)
            .await?
            .ok_or_else(|| SigningError::NoIdentifier {
                origin: origin.to_string(),
            })?;
        self.sign_as(origin, &identifier, payload).await
    }

    /// Sign with an explicitly chosen identifier (the popup approval path).
    pub async fn sign_as(
        &self,
        origin: &str,
        identifier: &str,
        payload: &SignPayload,
    ) -> Result<Value, SigningError> {
        let settings = self
            .settings
            .agent_settings()
            .await
            .map_err(|err| SigningError::Settings(err.to_string()))?
            .ok_or(AgentError::NotConfigured)
            .map_err(SigningError::Agent)?;
        let client = self.agent.ensure_connected(&settings).await?;
        let headers = client
            .signed_headers(origin, identifier, payload)
            .await
            .map_err(|err| SigningError::Signer(err.to_string()))?;
        debug!(target: "signing", origin, identifier, "signed headers issued");
        Ok(json!({ "headers": headers }))
    }

    pub async fn remembered_identifier(
        &self,
        origin: &str,
    ) -> Result<Option<String>, SigningError> {
        self.settings
            .remembered_identifier(origin)
            .await
            .map_err(|err| SigningError::Settings(err.to_string()))
    }
}
