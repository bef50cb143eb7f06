use serde_json::Value;
use thiserror::Error;
use wallet_proto::RpcId;

/// The one in-flight user-facing request, extension-wide.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub rpc_id: RpcId,
    /// Port name of the content connection the eventual reply goes to.
    pub connection_id: String,
    pub method: String,
    pub params: Option<Value>,
    pub origin: Option<String>,
    /// True while the remote agent call is in flight. A popup closing in
    /// that window must not cancel the request.
    pub waiting_on_agent: bool,
}

#[derive(Debug, Error)]
#[error("another request is already awaiting user action")]
pub struct PendingBusy;

/// Single-slot holder for [`PendingRequest`]; the only mutation point for
/// the at-most-one invariant.
#[derive(Default)]
pub struct PendingSlot(Option<PendingRequest>);

impl PendingSlot {
    pub fn begin(&mut self, request: PendingRequest) -> Result<(), PendingBusy> {
        if self.0.is_some() {
            return Err(PendingBusy);
        }
        self.0 = Some(request);
        Ok(())
    }

    pub fn current(&self) -> Option<&PendingRequest> {
        self.0.as_ref()
    }

    /// Flag the request as waiting on the remote agent. Returns false when
    /// the slot no longer holds that request.
    pub fn mark_waiting(&mut self, rpc_id: &RpcId) -> bool {
        match self.0.as_mut() {
            Some(pending) if &pending.rpc_id == rpc_id => {
                pending.waiting_on_agent = true;
                true
            }
            _ => false,
        }
    }

    /// Clear the slot if it holds the given request.
    pub fn finish(&mut self, rpc_id: &RpcId) -> Option<PendingRequest> {
        if self.0.as_ref().map(|p| &p.rpc_id == rpc_id).unwrap_or(false) {
            self.0.take()
        } else {
            None
        }
    }

    pub fn take(&mut self) -> Option<PendingRequest> {
        self.0.take()
    }

    /// Clear and return the request only when it is not waiting on the
    /// agent: the "last gasp" rule.
    pub fn take_if_idle(&mut self) -> Option<PendingRequest> {
        match self.0.as_ref() {
            Some(pending) if !pending.waiting_on_agent => self.0.take(),
            _ => None,
        }
    }
}
