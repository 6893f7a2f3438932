use thiserror::Error;

/// Main error type for the revgrad engine
#[derive(Error, Debug, Clone)]
pub enum RevgradError {
    /// Operand shapes incompatible for the requested operation and not broadcastable
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Graph traversal found a back-edge
    #[error("Cycle detected in computation graph")]
    CycleDetected,

    /// A numeric operation was attempted before backend selection
    #[error("Backend not configured: call backend::select() before constructing nodes")]
    BackendUnconfigured,

    /// The requested backend is not available in this build
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A primitive or its gradient rule was evaluated outside its domain
    #[error("Invalid domain: {0}")]
    InvalidDomain(String),

    /// Invalid arguments to a public entry point
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal errors that shouldn't happen
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RevgradError {
    /// Create a shape mismatch error carrying the operation and both operand shapes
    pub fn shape_mismatch(operation: &str, lhs: &[usize], rhs: &[usize]) -> Self {
        RevgradError::ShapeMismatch(format!(
            "{}: operand shapes {:?} and {:?} are not compatible",
            operation, lhs, rhs
        ))
    }

    /// Create an invalid domain error for a named primitive
    pub fn invalid_domain(operation: &str, detail: &str) -> Self {
        RevgradError::InvalidDomain(format!("{}: {}", operation, detail))
    }
}

/// Result type for revgrad operations
pub type RevgradResult<T> = Result<T, RevgradError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_mismatch_message() {
        let error = RevgradError::shape_mismatch("matmul", &[2, 3], &[4, 2]);
        assert!(error.to_string().contains("matmul"));
        assert!(error.to_string().contains("[2, 3]"));
        assert!(error.to_string().contains("[4, 2]"));
    }

    #[test]
    fn test_invalid_domain_message() {
        let error = RevgradError::invalid_domain("ln", "input contains non-positive values");
        assert!(error.to_string().contains("ln"));
        assert!(error.to_string().contains("non-positive"));
    }
}
