//! Error types for the collection engine
//!
//! Layered thiserror enums: `ClientError` covers the HTTP/retry layer,
//! `CollectError` everything above it. A 404 on a detail fetch is not an
//! error anywhere in this crate — it is a normal `Ok(None)` outcome.

use thiserror::Error;

/// Errors from the rate-limited HTTP layer.
///
/// `RateLimited`, `Transient` and `Network` are retry states: the client
/// handles them internally and callers only ever see them as the `source`
/// of an `ExhaustedRetries`.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("rate limited by the API on attempt {attempt}")]
    RateLimited { attempt: u32 },

    #[error("transient server error {status} on attempt {attempt}")]
    Transient { status: u16, attempt: u32 },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("retries exhausted after {attempts} attempts")]
    ExhaustedRetries {
        attempts: u32,
        #[source]
        source: Option<Box<ClientError>>,
    },

    #[error("unexpected response status {status} for {url}")]
    Unexpected { status: u16, url: String },
}

/// Main error type for collection runs
#[derive(Error, Debug)]
pub enum CollectError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("state conflict: {0}")]
    State(String),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type aliases for convenience
pub type ClientResult<T> = Result<T, ClientError>;
pub type CollectResult<T> = Result<T, CollectError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausted_retries_carries_last_failure() {
        let err = ClientError::ExhaustedRetries {
            attempts: 5,
            source: Some(Box::new(ClientError::Transient {
                status: 503,
                attempt: 4,
            })),
        };
        assert!(err.to_string().contains("5 attempts"));
        let source = std::error::Error::source(&err).expect("source");
        assert!(source.to_string().contains("503"));
    }

    #[test]
    fn test_state_conflict_message() {
        let err = CollectError::State("case is not pending".into());
        assert_eq!(err.to_string(), "state conflict: case is not pending");
    }
}
