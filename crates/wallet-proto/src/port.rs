use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DecodeError;
use crate::ids::{InstanceId, PortSessionId, RpcId};

/// Everything that crosses a content-script <-> background-worker port.
///
/// The handshake is HELLO -> READY; after that the channel carries
/// request/response pairs plus unsolicited events from the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PortFrame {
    Hello {
        instance_id: InstanceId,
    },
    Ready {
        port_session_id: PortSessionId,
    },
    RpcReq {
        id: RpcId,
        port_session_id: PortSessionId,
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
    },
    RpcRes {
        id: RpcId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Event {
        name: String,
        data: Value,
    },
}

impl PortFrame {
    pub fn response_ok(id: RpcId, result: Value) -> Self {
        Self::RpcRes {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn response_err(id: RpcId, error: impl Into<String>) -> Self {
        Self::RpcRes {
            id,
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn encode(&self) -> Value {
        serde_json::to_value(self).expect("port frame serializes to JSON")
    }

    pub fn decode(value: Value) -> Result<Self, DecodeError> {
        serde_json::from_value(value).map_err(|err| DecodeError::PortFrame(err.to_string()))
    }
}
