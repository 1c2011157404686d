use thiserror::Error;

use crate::classify::ProviderError;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
    #[error("provider not found: {name}")]
    ProviderNotFound { name: String },
    #[error("queue full for {provider},{model}")]
    QueueFull { provider: String, model: String },
    #[error("request timeout waiting for {provider},{model}")]
    QueueTimeout { provider: String, model: String },
    #[error("no capacity for {provider},{model}")]
    NoCapacity { provider: String, model: String },
    #[error("upstream error: {0}")]
    Upstream(#[source] ProviderError),
    #[error("all parallel attempts failed")]
    AllAttemptsFailed,
    #[error("request cancelled")]
    Cancelled,
    #[error("stream aborted: {reason}")]
    StreamAborted { reason: String },
}

impl RelayError {
    /// HTTP status surfaced to the downstream client.
    pub fn http_status(&self) -> u16 {
        match self {
            RelayError::InvalidRequest { .. } => 400,
            RelayError::ProviderNotFound { .. } => 404,
            RelayError::QueueFull { .. } | RelayError::NoCapacity { .. } => 429,
            RelayError::QueueTimeout { .. } => 504,
            RelayError::Upstream(err) => err.http_status,
            RelayError::AllAttemptsFailed => 502,
            RelayError::Cancelled => 499,
            RelayError::StreamAborted { .. } => 502,
            RelayError::Http(_) | RelayError::Io(_) => 502,
            RelayError::Json(_) => 400,
        }
    }

    /// Machine-readable code for the JSON error body, when one applies.
    pub fn code(&self) -> Option<&str> {
        match self {
            RelayError::InvalidRequest { .. } => Some("invalid_request"),
            RelayError::ProviderNotFound { .. } => Some("provider_not_found"),
            RelayError::QueueFull { .. } => Some("queue_full"),
            RelayError::NoCapacity { .. } => Some("no_capacity"),
            RelayError::QueueTimeout { .. } => Some("queue_timeout"),
            RelayError::Upstream(err) => Some(err.code.as_str()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
