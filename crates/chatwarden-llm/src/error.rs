//! HTTP-level errors from the classification engine.
//!
//! [`ProviderError`] describes what went wrong on the wire. Producers
//! translate it into the pipeline-facing
//! [`ClassifyError`](chatwarden_types::ClassifyError) before returning.

use chatwarden_types::ClassifyError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    /// Non-success status that is neither throttling nor auth.
    #[error("request failed: {0}")]
    RequestFailed(String),

    /// HTTP 401/403.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The engine is throttling (HTTP 429 or a run failed with `rate_limit_exceeded`).
    #[error("rate limited: retry after {retry_after_ms}ms")]
    RateLimited {
        /// Suggested wait before retrying, in milliseconds.
        retry_after_ms: u64,
    },

    /// Unknown thread, run or assistant (HTTP 404).
    #[error("not found: {0}")]
    NotFound(String),

    /// A body that does not match the expected shape.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A convenience type alias for engine calls.
pub type Result<T> = std::result::Result<T, ProviderError>;

impl From<ProviderError> for ClassifyError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::AuthFailed(msg) => ClassifyError::AuthFailed(msg),
            ProviderError::InvalidResponse(msg) => ClassifyError::BadResponse(msg),
            ProviderError::Json(e) => ClassifyError::BadResponse(e.to_string()),
            other => ClassifyError::Engine(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_rate_limited() {
        let err = ProviderError::RateLimited {
            retry_after_ms: 5000,
        };
        assert_eq!(err.to_string(), "rate limited: retry after 5000ms");
    }

    #[test]
    fn auth_maps_to_classify_auth() {
        let err: ClassifyError = ProviderError::AuthFailed("bad key".into()).into();
        assert_eq!(err, ClassifyError::AuthFailed("bad key".into()));
    }

    #[test]
    fn invalid_response_maps_to_bad_response() {
        let err: ClassifyError = ProviderError::InvalidResponse("no data".into()).into();
        assert_eq!(err, ClassifyError::BadResponse("no data".into()));
    }

    #[test]
    fn other_errors_map_to_engine() {
        let err: ClassifyError = ProviderError::RequestFailed("HTTP 500: boom".into()).into();
        assert_eq!(
            err,
            ClassifyError::Engine("request failed: HTTP 500: boom".into())
        );
    }
}
