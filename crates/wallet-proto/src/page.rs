use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DecodeError;
use crate::ids::RequestId;

/// Source tag stamped on every message the page emits.
pub const PAGE_SOURCE: &str = "wallet/page";
/// Source tag stamped on every message the content script emits. The content
/// script ignores any window event carrying its own tag (echo suppression).
pub const CONTENT_SOURCE: &str = "wallet/content";

/// The `window.postMessage` envelope shared by both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageEnvelope {
    pub source: String,
    #[serde(flatten)]
    pub message: PageMessage,
}

/// Untagged union: requests flow page -> content, replies flow back, events
/// are pushed content -> page without a request id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PageMessage {
    Request(PageRequest),
    Reply(PageReply),
    Event { name: String, data: Value },
}

/// Page-originated authorization requests. `request_id` is chosen by the
/// page and is the only id the page ever sees again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PageRequest {
    SignRequest {
        request_id: RequestId,
        payload: SignPayload,
    },
    SignData {
        request_id: RequestId,
        payload: Value,
    },
    SelectIdentifier {
        request_id: RequestId,
    },
    SelectCredential {
        request_id: RequestId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        schema: Option<String>,
    },
}

/// Exactly one of these terminates every [`PageRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PageReply {
    Reply {
        request_id: RequestId,
        payload: Value,
    },
    ReplyError {
        request_id: RequestId,
        error: String,
    },
    ReplyCanceled {
        request_id: RequestId,
    },
}

/// The request-signing payload: enough of the outbound HTTP request for the
/// agent to produce signed headers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignPayload {
    pub method: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
}

impl SignPayload {
    /// GET/HEAD/OPTIONS requests may complete without the authorization
    /// popup when an identifier is already remembered for the origin.
    pub fn is_safe_method(&self) -> bool {
        matches!(
            self.method.to_ascii_uppercase().as_str(),
            "GET" | "HEAD" | "OPTIONS"
        )
    }
}

impl PageRequest {
    pub fn request_id(&self) -> &RequestId {
        match self {
            Self::SignRequest { request_id, .. }
            | Self::SignData { request_id, .. }
            | Self::SelectIdentifier { request_id }
            | Self::SelectCredential { request_id, .. } => request_id,
        }
    }

    /// RPC method name this request is forwarded under.
    pub fn rpc_method(&self) -> &'static str {
        match self {
            Self::SignRequest { .. } => "sign_request",
            Self::SignData { .. } => "sign_data",
            Self::SelectIdentifier { .. } => "select_identifier",
            Self::SelectCredential { .. } => "select_credential",
        }
    }

    /// RPC params for the forwarded request, without the page request id.
    pub fn rpc_params(&self) -> Option<Value> {
        match self {
            Self::SignRequest { payload, .. } => {
                Some(serde_json::to_value(payload).expect("sign payload serializes"))
            }
            Self::SignData { payload, .. } => Some(payload.clone()),
            Self::SelectIdentifier { .. } => None,
            Self::SelectCredential { schema, .. } => schema
                .as_ref()
                .map(|schema| serde_json::json!({ "schema": schema })),
        }
    }
}

impl PageReply {
    pub fn request_id(&self) -> &RequestId {
        match self {
            Self::Reply { request_id, .. }
            | Self::ReplyError { request_id, .. }
            | Self::ReplyCanceled { request_id } => request_id,
        }
    }
}

impl PageEnvelope {
    pub fn from_page(request: PageRequest) -> Self {
        Self {
            source: PAGE_SOURCE.to_string(),
            message: PageMessage::Request(request),
        }
    }

    pub fn from_content(reply: PageReply) -> Self {
        Self {
            source: CONTENT_SOURCE.to_string(),
            message: PageMessage::Reply(reply),
        }
    }

    pub fn event_from_content(name: impl Into<String>, data: Value) -> Self {
        Self {
            source: CONTENT_SOURCE.to_string(),
            message: PageMessage::Event {
                name: name.into(),
                data,
            },
        }
    }

    /// True when the event was produced by the content script itself and
    /// must not be re-processed.
    pub fn is_echo(&self) -> bool {
        self.source == CONTENT_SOURCE
    }

    pub fn encode(&self) -> Value {
        serde_json::to_value(self).expect("page envelope serializes to JSON")
    }

    pub fn decode(value: Value) -> Result<Self, DecodeError> {
        serde_json::from_value(value).map_err(|err| DecodeError::PageMessage(err.to_string()))
    }
}
