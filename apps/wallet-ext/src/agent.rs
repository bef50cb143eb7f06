//! Connection management for the remote identity agent (KERIA).
//!
//! The agent may accept `connect()` before it is actually able to serve
//! authenticated calls, so a successful connect is only declared after a
//! readiness probe (a bounded series of authenticated `list_identifiers`
//! calls with doubling backoff) comes back clean.

use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::ProbeConfig;
use crate::error::AgentError;
use crate::external::{AgentSettings, SignerClient, SignerFactory};

pub struct AgentManager {
    factory: Arc<dyn SignerFactory>,
    probe: ProbeConfig,
    client: AsyncMutex<Option<Arc<dyn SignerClient>>>,
}

impl AgentManager {
    pub fn new(factory: Arc<dyn SignerFactory>, probe: ProbeConfig) -> Self {
        Self {
            factory,
            probe,
            client: AsyncMutex::new(None),
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.client.lock().await.is_some()
    }

    /// Return the live client, establishing the connection first if needed.
    /// Every failure path leaves the held client as `None` so the next call
    /// starts from a fresh client rather than a half-initialized one.
    pub async fn ensure_connected(
        &self,
        settings: &AgentSettings,
    ) -> Result<Arc<dyn SignerClient>, AgentError> {
        let mut guard = self.client.lock().await;
        if let Some(client) = guard.as_ref() {
            return Ok(Arc::clone(client));
        }
        let client = self.factory.make(settings);
        match self.bring_up(&client).await {
            Ok(()) => {
                *guard = Some(Arc::clone(&client));
                Ok(client)
            }
            Err(err) => {
                *guard = None;
                Err(err)
            }
        }
    }

    /// Drop the held client; the next `ensure_connected` reconnects.
    pub async fn reset(&self) {
        *self.client.lock().await = None;
    }

    async fn bring_up(&self, client: &Arc<dyn SignerClient>) -> Result<(), AgentError> {
        let provisioned = client
            .provisioned()
            .await
            .map_err(|err| AgentError::Boot(err.to_string()))?;
        if !provisioned {
            client
                .boot()
                .await
                .map_err(|err| AgentError::Boot(err.to_string()))?;
        }
        client
            .connect()
            .await
            .map_err(|err| AgentError::Connect(err.to_string()))?;

        let mut delay = self.probe.base_delay;
        for attempt in 1..=self.probe.max_attempts {
            match client.list_identifiers().await {
                Ok(_) => {
                    debug!(target: "agent::probe", attempt, "agent ready");
                    return Ok(());
                }
                Err(err) if attempt == self.probe.max_attempts => {
                    warn!(
                        target: "agent::probe",
                        attempt,
                        error = %err,
                        "readiness probe budget exhausted"
                    );
                    return Err(AgentError::ProbeExhausted { attempts: attempt });
                }
                Err(err) => {
                    debug!(
                        target: "agent::probe",
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "agent not ready yet; retrying"
                    );
                    sleep(delay).await;
                    delay = (delay * 2).min(self.probe.max_delay);
                }
            }
        }
        Err(AgentError::ProbeExhausted {
            attempts: self.probe.max_attempts,
        })
    }
}
