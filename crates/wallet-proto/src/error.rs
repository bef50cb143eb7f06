use thiserror::Error;

/// A frame that arrived over a boundary but does not parse as the expected
/// vocabulary. Receivers log and drop; decode failures never propagate as
/// panics.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed port frame: {0}")]
    PortFrame(String),
    #[error("malformed page message: {0}")]
    PageMessage(String),
    #[error("malformed app frame: {0}")]
    AppFrame(String),
}
