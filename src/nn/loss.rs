//! Loss functions
//!
//! Thin consumers of the core ops, like the layer modules: each loss builds
//! its criterion out of recorded primitives so gradients flow to the logits
//! through the normal backward sweep.

use crate::autograd::{ops, Var};
use crate::error::RevgradResult;

/// Softmax cross-entropy over one class axis.
///
/// Logits are shifted by their per-row maximum before exponentiation so the
/// softmax stays finite for large inputs; the shift itself carries no
/// gradient. The log is taken with a small epsilon under it.
pub struct SoftmaxCrossEntropy {
    axis: usize,
    epsilon: f64,
}

impl SoftmaxCrossEntropy {
    pub fn new(axis: usize) -> Self {
        Self {
            axis,
            epsilon: 1e-9,
        }
    }

    /// Mean negative cross-entropy between the softmax of `logits` and
    /// `targets` (one-hot or a probability distribution per row).
    pub fn forward(&self, logits: &Var, targets: &Var) -> RevgradResult<Var> {
        let shift = logits.max(Some(self.axis), true)?;
        let stable = logits.sub(&shift)?;

        let exps = ops::exp(&stable)?;
        let softmax = exps.div(&exps.sum(Some(self.axis), true)?)?;

        let eps = logits.graph().scalar(self.epsilon);
        let log_softmax = ops::ln(&softmax.add(&eps)?)?;
        let cross_entropy = targets.mul(&log_softmax)?.sum(Some(self.axis), false)?;
        cross_entropy.mean(None)?.neg()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::Graph;
    use crate::backend::{self, Device};
    use approx::assert_abs_diff_eq;
    use ndarray::{ArrayD, IxDyn};

    fn graph() -> Graph {
        backend::select(Device::Cpu).unwrap();
        Graph::new().unwrap()
    }

    #[test]
    fn test_uniform_logits_give_log_class_count() {
        // All-zero logits make the softmax uniform, so the one-hot loss is
        // ln(classes).
        let g = graph();
        let logits = g.var(ArrayD::zeros(IxDyn(&[2, 3])), true);
        let targets = g
            .from_vec(vec![1.0, 0.0, 0.0, 0.0, 0.0, 1.0], &[2, 3], false)
            .unwrap();
        let loss = SoftmaxCrossEntropy::new(1).forward(&logits, &targets).unwrap();
        assert_abs_diff_eq!(loss.data().sum(), 3.0_f64.ln(), epsilon = 1e-6);
    }

    #[test]
    fn test_gradient_is_softmax_minus_targets_over_batch() {
        let g = graph();
        let logits = g
            .from_vec(vec![1.0, 2.0, 3.0, 1.0, 1.0, 1.0], &[2, 3], true)
            .unwrap();
        let targets = g
            .from_vec(vec![0.0, 0.0, 1.0, 1.0, 0.0, 0.0], &[2, 3], false)
            .unwrap();
        let loss = SoftmaxCrossEntropy::new(1).forward(&logits, &targets).unwrap();
        loss.backward().unwrap();

        let data = logits.data();
        let target = targets.data();
        let grad = logits.grad().unwrap();
        for row in 0..2 {
            let denom: f64 = (0..3).map(|c| data[[row, c]].exp()).sum();
            for col in 0..3 {
                let softmax = data[[row, col]].exp() / denom;
                let expected = (softmax - target[[row, col]]) / 2.0;
                assert_abs_diff_eq!(grad[[row, col]], expected, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_large_logits_stay_finite() {
        let g = graph();
        let logits = g
            .from_vec(vec![1000.0, 0.0, -1000.0, 500.0], &[2, 2], true)
            .unwrap();
        let targets = g
            .from_vec(vec![1.0, 0.0, 0.0, 1.0], &[2, 2], false)
            .unwrap();
        let loss = SoftmaxCrossEntropy::new(1).forward(&logits, &targets).unwrap();
        assert!(loss.data().iter().all(|v| v.is_finite()));
        loss.backward().unwrap();
        assert!(logits.grad().unwrap().iter().all(|v| v.is_finite()));
    }
}
