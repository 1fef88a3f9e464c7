use thiserror::Error;

/// Application-wide error types for Trawl.
#[derive(Error, Debug)]
pub enum AppError {
    /// HTTP request failed (non-success status, bad body).
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// The remote source throttled us (HTTP 429 or equivalent).
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// Credentials were rejected by a source API.
    #[error("Authentication failed: {0}")]
    AuthError(String),

    /// API quota exhausted for the current period.
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// A proxy endpoint refused or dropped the connection.
    #[error("Proxy error: {0}")]
    ProxyError(String),

    /// Page or payload could not be turned into raw records.
    #[error("Extraction error: {0}")]
    ExtractionError(String),

    /// Malformed input: unknown job kind, bad URL, invalid record.
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// No adapter is registered under this source name.
    #[error("Unknown source: {0}")]
    UnknownSource(String),

    /// A job state change was refused: the job is missing, no longer owned
    /// by the caller, or not in a state that allows the change.
    #[error("Job conflict: {0}")]
    JobConflict(String),

    /// A batch transaction failed and was rolled back.
    #[error("Transaction failed: {0}")]
    TransactionError(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Missing or invalid configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_)
            | AppError::Timeout(_)
            | AppError::RateLimitExceeded
            | AppError::ProxyError(_)
            | AppError::TransactionError(_)
            | AppError::DatabaseError(_) => true,
            AppError::HttpError(msg) => {
                msg.contains("timeout")
                    || msg.contains("connect")
                    || msg.contains("reset")
                    || msg.contains("HTTP 5")
            }
            _ => false,
        }
    }

    /// Returns true if the failure makes the job itself unrunnable, so no
    /// retry should be scheduled regardless of remaining attempts.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AppError::UnknownSource(_) | AppError::ValidationError(_) | AppError::ConfigError(_)
        )
    }

    /// Returns true if this error should trip the API circuit breaker.
    pub fn should_trip_circuit(&self) -> bool {
        match self {
            AppError::AuthError(_)
            | AppError::QuotaExceeded(_)
            | AppError::RateLimitExceeded
            | AppError::NetworkError(_)
            | AppError::Timeout(_) => true,
            AppError::HttpError(msg) => msg.contains("HTTP 5"),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(AppError::NetworkError("reset".into()).is_retryable());
        assert!(AppError::Timeout(30).is_retryable());
        assert!(AppError::RateLimitExceeded.is_retryable());
        assert!(AppError::ProxyError("refused".into()).is_retryable());
        assert!(AppError::HttpError("HTTP 503 for https://x".into()).is_retryable());
        assert!(!AppError::HttpError("HTTP 404 for https://x".into()).is_retryable());
        assert!(!AppError::AuthError("expired token".into()).is_retryable());
        assert!(!AppError::ValidationError("bad".into()).is_retryable());
    }

    #[test]
    fn test_terminal_errors() {
        assert!(AppError::UnknownSource("nope".into()).is_terminal());
        assert!(AppError::ValidationError("kind".into()).is_terminal());
        assert!(!AppError::Timeout(5).is_terminal());
        assert!(!AppError::JobConflict("stale".into()).is_retryable());
    }

    #[test]
    fn test_circuit_tripping() {
        assert!(AppError::QuotaExceeded("daily".into()).should_trip_circuit());
        assert!(AppError::AuthError("401".into()).should_trip_circuit());
        assert!(!AppError::ExtractionError("bad".into()).should_trip_circuit());
    }
}
