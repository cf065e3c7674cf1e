//! Error types for the upstream client.

use thiserror::Error;

/// Errors that can occur when talking to the upstream source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Transport failure: connection refused, DNS, timeout.
    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    /// The upstream answered with a non-success status.
    #[error("unexpected upstream status: {0}")]
    UnexpectedStatus(u16),

    /// The body could not be decoded.
    #[error("malformed upstream response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            SourceError::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            SourceError::UnexpectedStatus(status.as_u16())
        } else {
            SourceError::Unavailable(e.to_string())
        }
    }
}

impl From<serde_json::Error> for SourceError {
    fn from(e: serde_json::Error) -> Self {
        SourceError::Decode(e.to_string())
    }
}
