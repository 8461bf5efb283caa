//! Test error types.

/// Result type alias for harness operations.
pub type Result<T> = std::result::Result<T, TestError>;

/// Harness errors.
#[derive(Debug, thiserror::Error)]
pub enum TestError {
    /// Harness setup or process handling failed.
    #[error("harness error: {0}")]
    Harness(String),

    /// A condition did not hold in time.
    #[error("timeout after {0:?}: {1}")]
    Timeout(std::time::Duration, String),

    /// Supervisor error (registry access, signalling).
    #[error("supervisor error: {0}")]
    Supervisor(#[from] sereno_core::SupervisorError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TestError {
    /// Creates a harness error.
    #[must_use]
    pub fn harness(msg: impl Into<String>) -> Self {
        Self::Harness(msg.into())
    }

    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(after: std::time::Duration, waiting_for: impl Into<String>) -> Self {
        Self::Timeout(after, waiting_for.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TestError::harness("no binary");
        assert_eq!(err.to_string(), "harness error: no binary");

        let err = TestError::timeout(std::time::Duration::from_secs(2), "ping up");
        assert!(err.to_string().contains("ping up"));

        let err: TestError = sereno_core::SupervisorError::NotFound("x".into()).into();
        assert!(matches!(err, TestError::Supervisor(_)));
    }
}
