use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("backend not initialized: {0}")]
    NotInitialized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("connection failure: {0}")]
    ConnectionFailure(String),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("timed out after {timeout_ms}ms waiting for lock on agent {agent_id}")]
    LockTimeout { agent_id: String, timeout_ms: u64 },

    #[error("invalid transition for {entity}: {from} -> {to}")]
    InvalidTransition {
        entity: String,
        from: String,
        to: String,
    },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the failure is transient and the operation may be retried as-is.
    /// This is what [`crate::retry::with_retry`] retries. A `LockTimeout` is
    /// not included: the lock holder is still working, and waiting longer is
    /// the caller's decision.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ConnectionFailure(_))
    }
}

impl From<duckdb::Error> for Error {
    fn from(e: duckdb::Error) -> Self {
        let msg = e.to_string();
        if msg.contains("Constraint Error") || msg.contains("Duplicate key") {
            Error::ConstraintViolation(msg)
        } else {
            Error::Storage(msg)
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
