use std::time::Duration;

/// Crate-level error for configuration, validation and registry failures.
#[derive(Debug, thiserror::Error)]
pub enum ThrottlerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("Invalid key pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type Result<T> = std::result::Result<T, ThrottlerError>;

/// Failure reported by the transport that performs the real call.
///
/// The variant decides whether the coordinator may retry: only transient
/// failures (no status, or a 5xx status) are retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("request aborted")]
    Aborted,

    #[error("network error: {0}")]
    Network(String),

    #[error("server responded with {status}: {message}")]
    Status { status: u16, message: String },

    #[error("{0}")]
    Other(String),
}

impl RequestError {
    pub fn network(message: impl Into<String>) -> Self {
        RequestError::Network(message.into())
    }

    pub fn status(status: u16, message: impl Into<String>) -> Self {
        RequestError::Status {
            status,
            message: message.into(),
        }
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, RequestError::Aborted)
    }

    /// True for 4xx responses, which are the caller's fault and never retried.
    pub fn is_permanent(&self) -> bool {
        matches!(self, RequestError::Status { status, .. } if (400..500).contains(status))
    }

    pub fn is_transient(&self) -> bool {
        match self {
            RequestError::Network(_) => true,
            RequestError::Status { status, .. } => *status >= 500,
            RequestError::Aborted | RequestError::Other(_) => false,
        }
    }
}

/// Outcome error of a coordinated execution.
///
/// Cloneable because every caller joined to one execution receives the same
/// outcome.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinatorError {
    #[error("key '{key}' is temporarily blocked")]
    Blocked { key: String },

    #[error("operation '{key}' was aborted")]
    Aborted { key: String },

    #[error("rate limit exceeded for '{key}', retry after {retry_after_ms}ms")]
    RateLimited { key: String, retry_after_ms: u64 },

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error("internal coordinator error: {0}")]
    Internal(String),
}

impl CoordinatorError {
    pub fn is_abort(&self) -> bool {
        matches!(self, CoordinatorError::Aborted { .. })
    }
}

impl From<ThrottlerError> for CoordinatorError {
    fn from(err: ThrottlerError) -> Self {
        CoordinatorError::Internal(err.to_string())
    }
}

/// Raised by the operation tracker when a loading operation outlives its timeout.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("operation '{key}' timed out after {elapsed:?}")]
pub struct OperationTimeout {
    pub key: String,
    pub elapsed: Duration,
}
