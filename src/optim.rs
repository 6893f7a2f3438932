//! Optimizers consuming named parameter maps
//!
//! The training loop touches exactly two entry points: `step` applies the
//! accumulated gradients in place, `zero_grad` resets every gradient buffer.

use std::collections::HashMap;

use ndarray::ArrayD;

use crate::autograd::Var;
use crate::error::RevgradResult;

/// Stochastic gradient descent with momentum.
///
/// Keeps one velocity buffer per parameter and updates each parameter's data
/// in place from its accumulated gradient.
pub struct Sgd {
    parameters: HashMap<String, Var>,
    lr: f64,
    momentum: f64,
    velocities: HashMap<String, ArrayD<f64>>,
}

impl Sgd {
    pub fn new(parameters: HashMap<String, Var>, lr: f64) -> Self {
        Self {
            parameters,
            lr,
            momentum: 0.9,
            velocities: HashMap::new(),
        }
    }

    pub fn with_momentum(mut self, momentum: f64) -> Self {
        self.momentum = momentum;
        self
    }

    pub fn learning_rate(&self) -> f64 {
        self.lr
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    /// Apply one update to every parameter with an accumulated gradient.
    pub fn step(&mut self) -> RevgradResult<()> {
        for (name, param) in &self.parameters {
            let grad = match param.grad() {
                Some(g) => g,
                None => continue,
            };
            let velocity = self
                .velocities
                .entry(name.clone())
                .or_insert_with(|| ArrayD::zeros(grad.raw_dim()));
            let momentum = self.momentum;
            velocity.zip_mut_with(&grad, |v, &g| *v = momentum * *v + (1.0 - momentum) * g);
            let update = velocity.mapv(|v| v * self.lr);
            param.set_data(param.data() - update)?;
        }
        Ok(())
    }

    /// Reset every parameter's gradient buffer to zero.
    pub fn zero_grad(&mut self) {
        for param in self.parameters.values() {
            param.zero_grad();
        }
    }
}
