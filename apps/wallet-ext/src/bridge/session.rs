use port_bus::{DisconnectReason, PortError, PortEvent, PortHandle, PortHub, PortSender};
use thiserror::Error;
use tracing::{debug, warn};
use wallet_proto::{InstanceId, PortFrame, PortSessionId};

/// Where the bridge's channel toward the worker currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshaking,
    Ready,
    Closed,
}

#[derive(Debug, Error)]
pub enum HandshakeFailure {
    #[error("port disconnected during handshake ({0:?})")]
    Disconnected(DisconnectReason),
}

/// One established HELLO/READY exchange over one port. A session is only
/// constructed once READY has arrived; a disconnected session is discarded,
/// never revived.
pub struct PortSession {
    port: PortHandle,
    instance_id: InstanceId,
    session_id: PortSessionId,
}

impl PortSession {
    /// Open a fresh port and complete the handshake: post HELLO with a new
    /// instance id, then wait for READY carrying the worker-assigned port
    /// session id.
    pub async fn establish(
        hub: &PortHub,
        port_name: &str,
        sender: PortSender,
    ) -> Result<Self, HandshakeFailure> {
        let port = hub.connect(port_name, sender);
        let instance_id = InstanceId::generate();
        let hello = PortFrame::Hello {
            instance_id: instance_id.clone(),
        };
        if port.post(hello.encode()).is_err() {
            let reason = port
                .closed_reason()
                .unwrap_or(DisconnectReason::WorkerGone);
            return Err(HandshakeFailure::Disconnected(reason));
        }
        loop {
            match port.recv().await {
                PortEvent::Frame(value) => match PortFrame::decode(value) {
                    Ok(PortFrame::Ready { port_session_id }) => {
                        debug!(
                            target: "bridge::session",
                            instance_id = %instance_id,
                            session_id = %port_session_id,
                            "handshake complete"
                        );
                        return Ok(Self {
                            port,
                            instance_id,
                            session_id: port_session_id,
                        });
                    }
                    Ok(other) => {
                        warn!(
                            target: "bridge::session",
                            frame = ?other,
                            "unexpected frame before READY; dropping"
                        );
                    }
                    Err(err) => {
                        warn!(
                            target: "bridge::session",
                            error = %err,
                            "undecodable frame during handshake; dropping"
                        );
                    }
                },
                PortEvent::Disconnected(reason) => {
                    return Err(HandshakeFailure::Disconnected(reason));
                }
            }
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn session_id(&self) -> &PortSessionId {
        &self.session_id
    }

    pub fn send(&self, frame: PortFrame) -> Result<(), PortError> {
        self.port.post(frame.encode())
    }

    pub async fn recv(&self) -> PortEvent {
        self.port.recv().await
    }

    pub fn close(&self) {
        self.port.disconnect();
    }
}
