//! Error types for the Outline provider

use bridge_traits::error::BridgeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OutlineError {
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Outline API error (status {status_code}): {message}")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limit exceeded")]
    RateLimitExceeded { retry_after_seconds: Option<u64> },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Failed to parse API response: {0}")]
    ParseError(String),

    #[error(transparent)]
    BridgeError(#[from] BridgeError),
}

pub type Result<T> = std::result::Result<T, OutlineError>;

impl OutlineError {
    pub(crate) fn from_status(status_code: u16, message: String, retry_after: Option<u64>) -> Self {
        match status_code {
            401 | 403 => OutlineError::AuthenticationFailed(message),
            404 => OutlineError::NotFound(message),
            429 => OutlineError::RateLimitExceeded {
                retry_after_seconds: retry_after,
            },
            _ => OutlineError::ApiError {
                status_code,
                message,
            },
        }
    }
}

impl From<OutlineError> for BridgeError {
    fn from(error: OutlineError) -> Self {
        match error {
            OutlineError::AuthenticationFailed(msg) => {
                BridgeError::OperationFailed(format!("Outline authentication failed: {}", msg))
            }
            OutlineError::ApiError {
                status_code,
                message,
            } => BridgeError::OperationFailed(format!(
                "Outline API error (status {}): {}",
                status_code, message
            )),
            OutlineError::RateLimitExceeded {
                retry_after_seconds,
            } => BridgeError::RateLimited {
                retry_after_seconds,
            },
            OutlineError::NotFound(msg) => BridgeError::NotFound(msg),
            OutlineError::InvalidInput(msg) => {
                BridgeError::OperationFailed(format!("Invalid Outline input: {}", msg))
            }
            OutlineError::ParseError(msg) => {
                BridgeError::OperationFailed(format!("Outline parse error: {}", msg))
            }
            OutlineError::BridgeError(e) => e,
        }
    }
}
