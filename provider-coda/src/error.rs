//! Error types for the Coda provider

use bridge_traits::error::BridgeError;
use thiserror::Error;

/// Coda provider errors
#[derive(Error, Debug)]
pub enum CodaError {
    /// Token rejected (401/403)
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Coda API error (status {status_code}): {message}")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limit exceeded")]
    RateLimitExceeded { retry_after_seconds: Option<u64> },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Failed to parse API response: {0}")]
    ParseError(String),

    #[error(transparent)]
    BridgeError(#[from] BridgeError),
}

/// Result type for Coda operations
pub type Result<T> = std::result::Result<T, CodaError>;

impl CodaError {
    pub(crate) fn from_status(status_code: u16, message: String, retry_after: Option<u64>) -> Self {
        match status_code {
            401 | 403 => CodaError::AuthenticationFailed(message),
            404 => CodaError::NotFound(message),
            429 => CodaError::RateLimitExceeded {
                retry_after_seconds: retry_after,
            },
            _ => CodaError::ApiError {
                status_code,
                message,
            },
        }
    }
}

impl From<CodaError> for BridgeError {
    fn from(error: CodaError) -> Self {
        match error {
            CodaError::AuthenticationFailed(msg) => {
                BridgeError::OperationFailed(format!("Coda authentication failed: {}", msg))
            }
            CodaError::ApiError {
                status_code,
                message,
            } => BridgeError::OperationFailed(format!(
                "Coda API error (status {}): {}",
                status_code, message
            )),
            CodaError::RateLimitExceeded {
                retry_after_seconds,
            } => BridgeError::RateLimited {
                retry_after_seconds,
            },
            CodaError::NotFound(msg) => BridgeError::NotFound(msg),
            CodaError::ParseError(msg) => {
                BridgeError::OperationFailed(format!("Coda parse error: {}", msg))
            }
            CodaError::BridgeError(e) => e,
        }
    }
}
