use serde::Serialize;
use thiserror::Error;

/// Error taxonomy for the mail subsystem.
///
/// Only `Transport { transient: true }` is ever retried; everything else is
/// surfaced to the immediate caller as-is. `DeliveryFailed` wraps the last
/// transport error once retries are exhausted (or on a permanent rejection).
#[derive(Debug, Error)]
pub enum MailError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("transport error: {message}")]
    Transport { message: String, transient: bool },

    #[error("delivery failed after {attempts} attempt(s): {source}")]
    DeliveryFailed {
        attempts: u32,
        #[source]
        source: Box<MailError>,
    },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl MailError {
    pub fn transient(message: impl Into<String>) -> Self {
        MailError::Transport {
            message: message.into(),
            transient: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        MailError::Transport {
            message: message.into(),
            transient: false,
        }
    }

    /// Whether a retry could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, MailError::Transport { transient: true, .. })
    }
}

// The web layer serializes errors straight into API responses.
impl Serialize for MailError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
