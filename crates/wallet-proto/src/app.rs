use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DecodeError;

/// Ports opened by the extension's own UI process use this name prefix;
/// anything else is treated as a content-script port.
pub const APP_PORT_PREFIX: &str = "wallet-app";
/// Name prefix for content-script ports; the full name carries a per-tab
/// suffix so each connection id is unique.
pub const CONTENT_PORT_PREFIX: &str = "wallet-tab";

/// The `{type, data}` envelope spoken between the background worker and the
/// extension UI. `Reply`/`ReplyCanceled`/`AppClosed` mirror the vocabulary
/// used toward the content script; `QueryPending`/`PendingState` let a
/// freshly opened popup discover the in-flight request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppFrame {
    /// UI -> worker: the user approved; `data` carries the selection payload
    /// when the flow is a selection rather than a signing.
    Reply {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    /// UI -> worker: the user rejected the request.
    ReplyCanceled,
    /// UI -> worker: the popup is closing deliberately.
    AppClosed,
    /// UI -> worker: what request, if any, is waiting on the user?
    QueryPending,
    /// worker -> UI: answer to `QueryPending`.
    PendingState {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request: Option<Value>,
    },
}

impl AppFrame {
    pub fn encode(&self) -> Value {
        serde_json::to_value(self).expect("app frame serializes to JSON")
    }

    pub fn decode(value: Value) -> Result<Self, DecodeError> {
        serde_json::from_value(value).map_err(|err| DecodeError::AppFrame(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_frames_round_trip() {
        let frame = AppFrame::Reply {
            data: Some(serde_json::json!({ "identifier": "work" })),
        };
        assert_eq!(AppFrame::decode(frame.encode()).expect("decode"), frame);
    }

    #[test]
    fn unit_variants_omit_data() {
        let value = AppFrame::AppClosed.encode();
        assert_eq!(value, serde_json::json!({ "type": "app_closed" }));
    }
}
