//! Error types for chatwarden.
//!
//! [`TransportError`] covers the chat transport, [`ClassifyError`] covers the
//! classification path, and [`WardenError`] is the top-level error that
//! both convert into. All are non-exhaustive.

use std::time::Duration;

use thiserror::Error;

/// Failures talking to the chat transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportError {
    /// Network fault, 5xx or throttling; worth retrying.
    #[error("transient transport error: {0}")]
    Transient(String),

    /// The credential was refused; the auth collaborator must refresh it.
    #[error("authentication expired: {0}")]
    AuthExpired(String),

    /// The transport understood the command and refused it.
    #[error("command rejected: {0}")]
    Rejected(String),

    /// The named user or message does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

impl TransportError {
    /// Whether a retry of the same command may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Transient(_) | TransportError::AuthExpired(_)
        )
    }
}

/// Failures of a single classification call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ClassifyError {
    /// No result arrived before the per-call deadline.
    #[error("classification timed out after {}s", after.as_secs())]
    Timeout { after: Duration },

    /// The engine kept throttling after every retry was spent.
    #[error("rate limit exceeded after {attempts} attempts")]
    RateLimitExceeded { attempts: u32 },

    /// The response could not be parsed at all.
    #[error("bad response: {0}")]
    BadResponse(String),

    /// The engine refused the credential.
    #[error("engine authentication failed: {0}")]
    AuthFailed(String),

    /// Any other engine failure (HTTP error, failed run, network).
    #[error("engine error: {0}")]
    Engine(String),
}

/// Top-level error type.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum WardenError {
    /// Configuration is malformed or semantically invalid.
    #[error("invalid config: {0}")]
    Config(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Classify(#[from] ClassifyError),

    /// A worker stopped because shutdown was requested.
    #[error("shutting down")]
    Shutdown,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A convenience alias for fallible chatwarden operations.
pub type Result<T> = std::result::Result<T, WardenError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_retryability() {
        assert!(TransportError::Transient("reset".into()).is_retryable());
        assert!(TransportError::AuthExpired("401".into()).is_retryable());
        assert!(!TransportError::Rejected("400".into()).is_retryable());
        assert!(!TransportError::NotFound("user".into()).is_retryable());
    }

    #[test]
    fn display_timeout() {
        let err = ClassifyError::Timeout {
            after: Duration::from_secs(60),
        };
        assert_eq!(err.to_string(), "classification timed out after 60s");
    }

    #[test]
    fn display_rate_limit_exceeded() {
        let err = ClassifyError::RateLimitExceeded { attempts: 4 };
        assert_eq!(err.to_string(), "rate limit exceeded after 4 attempts");
    }

    #[test]
    fn warden_error_wraps_transparently() {
        let err: WardenError = TransportError::Rejected("not a moderator".into()).into();
        assert_eq!(err.to_string(), "command rejected: not a moderator");

        let err: WardenError = ClassifyError::BadResponse("not json".into()).into();
        assert_eq!(err.to_string(), "bad response: not json");
    }

    #[test]
    fn json_error_from_conversion() {
        let serde_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: WardenError = serde_err.into();
        assert!(err.to_string().starts_with("json error:"));
    }
}
