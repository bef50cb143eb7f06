//! Wire vocabulary for the wallet extension messaging layer.
//!
//! Three boundaries, three message families:
//! - [`PortFrame`]: content script <-> background worker, over an extension port.
//! - [`PageEnvelope`]: web page <-> content script, over `window.postMessage`.
//! - [`AppFrame`]: background worker <-> extension UI, over an app-named port.
//!
//! Frames cross a port as `serde_json::Value` (the browser boundary is
//! untyped) and are decoded at each edge; a failed decode is a protocol
//! error for the receiver to log and drop, never a panic.

mod app;
mod error;
mod ids;
mod page;
mod port;

pub use app::{AppFrame, APP_PORT_PREFIX, CONTENT_PORT_PREFIX};
pub use error::DecodeError;
pub use ids::{InstanceId, PortSessionId, RequestId, RpcId};
pub use page::{
    PageEnvelope, PageMessage, PageReply, PageRequest, SignPayload, CONTENT_SOURCE, PAGE_SOURCE,
};
pub use port::PortFrame;
