use bridge_traits::error::BridgeError;
use core_sync::SyncError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImportError {
    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("Invalid state transition from {from} to {to}: {reason}")]
    InvalidStateTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Import job {0} not found")]
    JobNotFound(String),

    #[error("{0}")]
    Handler(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ImportError {
    pub fn is_rate_limited(&self) -> bool {
        match self {
            ImportError::Sync(e) => e.is_rate_limited(),
            ImportError::Bridge(e) => e.is_rate_limited(),
            _ => false,
        }
    }

    /// Scheduler-facing form of the error. Rate limits stay classifiable so
    /// the task is demoted instead of failed.
    pub fn into_sync(self) -> SyncError {
        match self {
            ImportError::Sync(e) => e,
            ImportError::Bridge(e) => SyncError::Bridge(e),
            other => SyncError::Bridge(BridgeError::OperationFailed(other.to_string())),
        }
    }
}

pub type Result<T> = std::result::Result<T, ImportError>;
