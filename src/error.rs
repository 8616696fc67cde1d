//! memproxy error types

use thiserror::Error;

/// memproxy error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (rejected at startup, never at request time)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Embedding or extraction collaborator failed or timed out.
    ///
    /// The affected step is skipped; the request path is never failed by it.
    #[error("Degraded: {0}")]
    Degradable(String),

    /// Capacity invariant broken after eviction (internal bug)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Store or revision write failed; the mutation was rolled back
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Embedding dimensionality does not match the store
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Entry or conversation not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Upstream LLM error
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Whether the failure should degrade a feature instead of failing a request.
    pub fn is_degradable(&self) -> bool {
        matches!(self, Self::Degradable(_) | Self::DimensionMismatch { .. })
    }

    /// Short machine-readable code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::Degradable(_) => "DEGRADED",
            Self::InvariantViolation(_) => "INVARIANT_VIOLATION",
            Self::Persistence(_) => "PERSISTENCE_ERROR",
            Self::DimensionMismatch { .. } => "DIMENSION_MISMATCH",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Upstream(_) => "UPSTREAM_ERROR",
            Self::Io(_) | Self::Serialization(_) | Self::Http(_) => "INTERNAL_ERROR",
        }
    }
}

/// Result type alias for memproxy operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degradable_classification() {
        assert!(Error::Degradable("timeout".into()).is_degradable());
        assert!(Error::DimensionMismatch {
            expected: 4,
            actual: 3
        }
        .is_degradable());
        assert!(!Error::Persistence("disk full".into()).is_degradable());
        assert!(!Error::Config("bad lambda".into()).is_degradable());
    }

    #[test]
    fn test_display() {
        let err = Error::DimensionMismatch {
            expected: 384,
            actual: 768,
        };
        assert_eq!(
            err.to_string(),
            "Embedding dimension mismatch: expected 384, got 768"
        );
        assert_eq!(err.code(), "DIMENSION_MISMATCH");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err: Error = io.into();
        assert_eq!(err.code(), "INTERNAL_ERROR");
        assert!(err.to_string().contains("boom"));
    }
}
