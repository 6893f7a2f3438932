//! Process-wide backend selection and the no-grad recording scope
//!
//! The dense-array backend is selected once, before any node is constructed,
//! and read by every primitive through [`current`]. Gradient recording can be
//! suspended for a scoped block with [`NoGradGuard`].

use std::cell::Cell;

use lazy_static::lazy_static;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{RevgradError, RevgradResult};

/// Device backing every node's numeric operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Device {
    Cpu,
    Cuda,
}

impl Device {
    /// Check if device is GPU-based
    pub const fn is_gpu(&self) -> bool {
        matches!(self, Device::Cuda)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Cpu => "cpu",
            Device::Cuda => "cuda",
        }
    }
}

lazy_static! {
    static ref SELECTED: RwLock<Option<Device>> = RwLock::new(None);
}

/// Select the process-wide device backend.
///
/// Must be called before any node is constructed. Selecting [`Device::Cuda`]
/// fails in this build, which links no accelerator runtime.
pub fn select(device: Device) -> RevgradResult<()> {
    match device {
        Device::Cpu => {
            *SELECTED.write() = Some(device);
            tracing::info!(device = device.as_str(), "backend selected");
            Ok(())
        }
        Device::Cuda => Err(RevgradError::BackendUnavailable(
            "no CUDA runtime is linked into this build".to_string(),
        )),
    }
}

/// The currently selected device, or `BackendUnconfigured` if none was set.
pub fn current() -> RevgradResult<Device> {
    SELECTED.read().ok_or(RevgradError::BackendUnconfigured)
}

thread_local! {
    static GRAD_ENABLED: Cell<bool> = Cell::new(true);
}

/// Whether operator calls on this thread currently record graph structure.
pub fn grad_enabled() -> bool {
    GRAD_ENABLED.with(|flag| flag.get())
}

/// Scoped suspension of gradient recording.
///
/// While a guard is alive, operator outputs carry no parents and do not
/// require gradients. The previous recording state is restored on drop, so
/// the scope survives early returns and unwinds.
#[must_use = "the scope ends as soon as the guard is dropped"]
pub struct NoGradGuard {
    previous: bool,
}

impl NoGradGuard {
    pub fn new() -> Self {
        let previous = GRAD_ENABLED.with(|flag| flag.replace(false));
        Self { previous }
    }
}

impl Default for NoGradGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for NoGradGuard {
    fn drop(&mut self) {
        let previous = self.previous;
        GRAD_ENABLED.with(|flag| flag.set(previous));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cuda_unavailable() {
        assert!(matches!(
            select(Device::Cuda),
            Err(RevgradError::BackendUnavailable(_))
        ));
    }

    #[test]
    fn test_no_grad_scope_restores() {
        assert!(grad_enabled());
        {
            let _guard = NoGradGuard::new();
            assert!(!grad_enabled());
            {
                let _nested = NoGradGuard::new();
                assert!(!grad_enabled());
            }
            assert!(!grad_enabled());
        }
        assert!(grad_enabled());
    }

    #[test]
    fn test_no_grad_scope_restores_across_panic() {
        let result = std::panic::catch_unwind(|| {
            let _guard = NoGradGuard::new();
            panic!("forced unwind");
        });
        assert!(result.is_err());
        assert!(grad_enabled());
    }
}
