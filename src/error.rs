//! Custom error types for rustbibfetch.
//!
//! Every fallible operation returns `Result<T, FetchError>`. The executor
//! uses [`FetchError::class`] to decide whether a failure rotates the
//! credential, retries the batch, becomes sentinel rows, or ends the run.

use thiserror::Error;

/// Main error type for rustbibfetch operations.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Invalid configuration or missing input, raised before any external call
    #[error("Config error: {0}")]
    Config(String),

    /// The service reported that the current credential has no quota left
    #[error("Quota exhausted for credential #{key_index}")]
    QuotaExhausted {
        /// Index of the credential that ran out
        key_index: usize,
    },

    /// Every credential in the pool has been used up
    #[error("All {pool_size} credentials exhausted")]
    CredentialsExhausted {
        /// Number of credentials that were loaded
        pool_size: usize,
    },

    /// Network/HTTP transport error
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Service answered with a retryable status
    #[error("Transient service error: {status} - {message}")]
    Transient {
        /// HTTP status code
        status: u16,
        /// Message from the response body, if any
        message: String,
    },

    /// Requested resource does not exist on the service
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Service refused the request as invalid (bad query, bad parameter)
    #[error("Request rejected: {status} - {message}")]
    Rejected {
        /// HTTP status code
        status: u16,
        /// Message from the response body, if any
        message: String,
    },

    /// Response body was not the expected envelope
    #[error("Malformed response: {0}")]
    Malformed(String),

    /// Nested field text could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// File I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV read/write error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// How the executor reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Rotate to the next credential and retry the same batch
    Quota,
    /// Back off and retry the same batch within the retry budget
    Transient,
    /// Give up on the batch and write sentinel rows
    Permanent,
    /// Abort the run
    Fatal,
}

impl FetchError {
    /// Classify this error for the batch retry loop.
    pub fn class(&self) -> ErrorClass {
        match self {
            FetchError::QuotaExhausted { .. } => ErrorClass::Quota,
            FetchError::Network(_) | FetchError::Transient { .. } => ErrorClass::Transient,
            FetchError::NotFound(_)
            | FetchError::Rejected { .. }
            | FetchError::Malformed(_)
            | FetchError::Parse(_) => ErrorClass::Permanent,
            FetchError::Config(_)
            | FetchError::CredentialsExhausted { .. }
            | FetchError::Io(_)
            | FetchError::Csv(_)
            | FetchError::Json(_) => ErrorClass::Fatal,
        }
    }
}

/// Result type alias using `FetchError`
pub type Result<T> = std::result::Result<T, FetchError>;

/// Extension trait for adding context to Option types
pub trait OptionExt<T> {
    /// Convert Option to Result with a malformed-response message
    fn ok_or_malformed(self, msg: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_malformed(self, msg: &str) -> Result<T> {
        self.ok_or_else(|| FetchError::Malformed(msg.to_string()))
    }
}
