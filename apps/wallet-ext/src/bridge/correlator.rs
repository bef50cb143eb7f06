use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::warn;
use wallet_proto::{PortSessionId, RequestId, RpcId};

/// Who is waiting on an in-flight RPC.
pub enum Waiter {
    /// A local caller inside the content script.
    Local(oneshot::Sender<Result<Value, String>>),
    /// A proxied page request; the page only ever sees its own request id.
    Page(RequestId),
}

struct Entry {
    session: PortSessionId,
    waiter: Waiter,
}

/// Maps outgoing RPC ids to their waiters. Every entry is consumed at most
/// once; responses with no live mapping are logged and dropped.
#[derive(Default)]
pub struct RpcCorrelator {
    entries: Mutex<HashMap<RpcId, Entry>>,
}

/// What `on_response` did with a response.
pub enum Routed {
    /// A local waiter was resolved.
    Local,
    /// The caller must forward this to the page under the original id.
    Page {
        request_id: RequestId,
        outcome: Result<Value, String>,
    },
    /// No live mapping; the response was dropped.
    Unknown,
}

impl RpcCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: RpcId, session: PortSessionId, waiter: Waiter) {
        self.entries.lock().insert(id, Entry { session, waiter });
    }

    pub fn on_response(
        &self,
        id: &RpcId,
        result: Option<Value>,
        error: Option<String>,
    ) -> Routed {
        let Some(entry) = self.entries.lock().remove(id) else {
            warn!(target: "bridge::rpc", id = %id, "response with no live correlation; dropping");
            return Routed::Unknown;
        };
        let outcome = match (result, error) {
            (Some(value), _) => Ok(value),
            (None, Some(error)) => Err(error),
            (None, None) => Ok(Value::Null),
        };
        match entry.waiter {
            Waiter::Local(tx) => {
                let _ = tx.send(outcome);
                Routed::Local
            }
            Waiter::Page(request_id) => Routed::Page {
                request_id,
                outcome,
            },
        }
    }

    /// Sweep every entry sent under a now-dead port session. Local waiters
    /// are failed in place; page waiters are returned so the bridge can
    /// emit exactly one error reply each. Responses for the dead session
    /// arriving later hit `Routed::Unknown` and are discarded.
    pub fn fail_session(
        &self,
        session: &PortSessionId,
        error: &str,
    ) -> Vec<(RequestId, String)> {
        let mut entries = self.entries.lock();
        let dead: Vec<RpcId> = entries
            .iter()
            .filter(|(_, entry)| &entry.session == session)
            .map(|(id, _)| id.clone())
            .collect();
        let mut page_failures = Vec::new();
        for id in dead {
            if let Some(entry) = entries.remove(&id) {
                match entry.waiter {
                    Waiter::Local(tx) => {
                        let _ = tx.send(Err(error.to_string()));
                    }
                    Waiter::Page(request_id) => {
                        page_failures.push((request_id, error.to_string()));
                    }
                }
            }
        }
        page_failures
    }

    /// Sweep everything, regardless of session. Used on terminal bridge
    /// failure.
    pub fn fail_all(&self, error: &str) -> Vec<(RequestId, String)> {
        let entries: Vec<Entry> = self.entries.lock().drain().map(|(_, e)| e).collect();
        let mut page_failures = Vec::new();
        for entry in entries {
            match entry.waiter {
                Waiter::Local(tx) => {
                    let _ = tx.send(Err(error.to_string()));
                }
                Waiter::Page(request_id) => {
                    page_failures.push((request_id, error.to_string()));
                }
            }
        }
        page_failures
    }

    #[cfg(test)]
    pub fn live(&self) -> usize {
        self.entries.lock().len()
    }
}
