//! revgrad - reverse-mode automatic differentiation
//!
//! Builds a dynamic computation graph from elementwise and reduction
//! operations over dense arrays, then computes gradients of a terminal node
//! with respect to every graph input that requests them. Dense numeric
//! kernels come from ndarray; this crate owns graph construction, the
//! deferred per-node gradient rules, topological scheduling of the backward
//! sweep, and gradient reduction across implicit broadcasting.

pub mod autograd;
pub mod backend;
pub mod error;
pub mod nn;
pub mod optim;

pub use autograd::{ops, AngleMode, Graph, NodeId, Op, Var};
pub use backend::{Device, NoGradGuard};
pub use error::{RevgradError, RevgradResult};

/// Initialize the engine with default logging configuration.
pub fn init() -> RevgradResult<()> {
    tracing_subscriber::fmt::try_init()
        .map_err(|e| RevgradError::Internal(e.to_string()))?;
    tracing::info!("revgrad initialized");
    Ok(())
}

/// Get the current crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
