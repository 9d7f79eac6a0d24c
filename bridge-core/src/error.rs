//! Error types for the bridge

use std::time::Duration;
use thiserror::Error;

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Bridge error types
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Malformed point, caller's fault
    #[error("Validation error: {0}")]
    Validation(String),

    /// Buffer stayed full for the whole enqueue deadline
    #[error("Backpressure timeout: buffer full for {0:?}")]
    BackpressureTimeout(Duration),

    /// Buffer no longer accepts points
    #[error("Pipeline is closed")]
    Closed,

    /// A value the wire format cannot carry
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Line protocol parse failure
    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    /// Transient transport failure (network, timeout, 429, 5xx)
    #[error("Retryable transport error: {0}")]
    RetryableTransport(String),

    /// Permanent transport failure (4xx other than 408/429)
    #[error("Non-retryable transport error: status {status}: {message}")]
    NonRetryableTransport { status: u16, message: String },

    /// Circuit breaker is open, no request was made
    #[error("Circuit open, retry in {retry_in:?}")]
    CircuitOpen { retry_in: Duration },

    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Checksum mismatch in the dead-letter log
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Invalid on-disk format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl BridgeError {
    /// Check if a failed write should be attempted again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::RetryableTransport(_) | BridgeError::CircuitOpen { .. }
        )
    }

    /// Check if error is returned synchronously to a producer
    pub fn is_producer_facing(&self) -> bool {
        matches!(
            self,
            BridgeError::Validation(_) | BridgeError::BackpressureTimeout(_) | BridgeError::Closed
        )
    }

    /// Check if error indicates dead-letter log corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            BridgeError::InvalidFormat(_) | BridgeError::ChecksumMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(BridgeError::RetryableTransport("reset".into()).is_retryable());
        assert!(BridgeError::CircuitOpen { retry_in: Duration::from_secs(1) }.is_retryable());
        assert!(!BridgeError::NonRetryableTransport { status: 400, message: String::new() }.is_retryable());
        assert!(!BridgeError::Encoding("nan".into()).is_retryable());

        assert!(BridgeError::Closed.is_producer_facing());
        assert!(BridgeError::BackpressureTimeout(Duration::from_millis(5)).is_producer_facing());
        assert!(!BridgeError::RetryableTransport("x".into()).is_producer_facing());
    }
}
