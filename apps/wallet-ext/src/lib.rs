//! Messaging and RPC coordination core of a browser-extension wallet.
//!
//! The extension spans three mutually-distrusting contexts: the web page,
//! a per-tab content script, and an ephemeral background worker that the
//! browser may kill between any two messages. This crate implements the
//! protocol that holds those contexts together:
//!
//! - [`bridge`]: the content-script side: port handshake, reconnect with
//!   exponential backoff, an ordered outbound queue for offline periods,
//!   and RPC correlation back to the page's own request ids.
//! - [`router`]: the background-worker side: port classification,
//!   tab/UI connection pairing by page authority, the single-slot pending
//!   request, and popup routing with last-gasp cancellation.
//! - [`signing`] and [`agent`]: the sign-request flow and the retry/
//!   readiness-probe policy around the remote identity agent.
//!
//! Storage, UI rendering, and the cryptographic client itself live behind
//! the traits in [`external`].

pub mod agent;
pub mod bridge;
pub mod config;
pub mod error;
pub mod external;
pub mod router;
pub mod signing;
pub mod telemetry;

pub use agent::AgentManager;
pub use bridge::ContentBridge;
pub use config::{ProbeConfig, ReconnectConfig};
pub use error::{AgentError, BridgeError, SigningError};
pub use router::MessageRouter;
pub use signing::SigningFlow;
