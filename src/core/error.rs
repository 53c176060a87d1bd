//! Error types for the SVM solver core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SVMError {
    /// Invalid cache budget, tolerance or thread configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// No cache slot could be obtained for a row; callers fall back to
    /// computing the row on the fly
    #[error("Kernel cache full: cannot cache row {row}")]
    CacheFull { row: usize },

    /// The duality gap stopped shrinking across unshrink passes
    #[error("Numerical stall: duality gap {gap} did not decrease after unshrinking")]
    NumericalStall { gap: f64 },

    /// The iteration budget ran out before a stopping rule fired
    #[error("Iteration limit of {iterations} reached with duality gap {gap}")]
    IterationLimit { iterations: usize, gap: f64 },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Infeasible starting point: {0}")]
    InfeasibleStart(String),

    #[error("Invalid label: expected -1 or +1, got {0}")]
    InvalidLabel(f64),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Empty dataset")]
    EmptyDataset,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl SVMError {
    /// Whether the caller can continue by degrading to uncached computation
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SVMError::CacheFull { .. })
    }
}

pub type Result<T> = std::result::Result<T, SVMError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_full_is_recoverable() {
        assert!(SVMError::CacheFull { row: 3 }.is_recoverable());
        assert!(!SVMError::Config("too small".into()).is_recoverable());
        assert!(!SVMError::NumericalStall { gap: 0.1 }.is_recoverable());
    }

    #[test]
    fn test_error_messages() {
        let err = SVMError::CacheFull { row: 7 };
        assert_eq!(err.to_string(), "Kernel cache full: cannot cache row 7");

        let err = SVMError::DimensionMismatch {
            expected: 4,
            actual: 2,
        };
        assert_eq!(err.to_string(), "Dimension mismatch: expected 4, got 2");
    }
}
