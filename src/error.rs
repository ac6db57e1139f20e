//! Error types of the relay. None of them is fatal to the process, they only decide whether a
//! connection is retried, a message dropped or a chat destination disabled.

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Failures of the upstream connection. Every variant leads to a backoff and reconnect.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error("no keep-alive response within {0:?}")]
    KeepaliveTimeout(std::time::Duration),
    #[error("connection closed by upstream")]
    Closed,
}

/// An upstream message that couldn't be decoded at all.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Failures of a single chat destination.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Credentials were rejected. Retrying with the same token won't help.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// The platform's usage limit is used up for the day.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("transient failure: {0}")]
    Transient(String),
    /// The destination isn't ready to send yet, e.g. the chat channel wasn't joined so far.
    #[error("not ready: {0}")]
    NotReady(String),
}

impl From<reqwest::Error> for DispatchError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transient(e.to_string())
    }
}
