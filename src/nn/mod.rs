//! Thin neural-network consumer layer over the autodiff core
//!
//! Parameters are named, gradient-tracked leaves; modules expose a recursive
//! parameter-collection walk producing dot-qualified names for optimizer
//! consumption.

use std::collections::HashMap;

use ndarray::{ArrayD, IxDyn};
use rand::Rng;

use crate::autograd::{Graph, Var};
use crate::error::RevgradResult;

pub mod loss;

pub use loss::SoftmaxCrossEntropy;

/// A trainable, gradient-tracked leaf value.
#[derive(Clone)]
pub struct Parameter {
    var: Var,
}

impl Parameter {
    pub fn new(graph: &Graph, data: ArrayD<f64>) -> Self {
        Self {
            var: graph.var(data, true),
        }
    }

    pub fn var(&self) -> &Var {
        &self.var
    }
}

/// Base behavior for network modules
pub trait Module {
    fn forward(&self, input: &Var) -> RevgradResult<Var>;

    /// Add this module's parameters to `params` under `prefix`-qualified,
    /// dot-separated names. Containers forward the walk to their children.
    fn collect_parameters(&self, prefix: &str, params: &mut HashMap<String, Var>);

    /// All parameters of this module and its submodules, by qualified name.
    fn parameters(&self) -> HashMap<String, Var> {
        let mut params = HashMap::new();
        self.collect_parameters("", &mut params);
        params
    }
}

/// Join a name onto a dot-separated prefix.
pub fn qualify(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

/// Fully connected layer: `output = input @ weight + bias`
pub struct Linear {
    weight: Parameter,
    bias: Parameter,
}

impl Linear {
    pub fn new(graph: &Graph, in_features: usize, out_features: usize) -> Self {
        let mut rng = rand::thread_rng();
        let weight = ArrayD::from_shape_fn(IxDyn(&[in_features, out_features]), |_| {
            rng.gen_range(-0.1..0.1)
        });
        let bias = ArrayD::zeros(IxDyn(&[out_features]));
        Self {
            weight: Parameter::new(graph, weight),
            bias: Parameter::new(graph, bias),
        }
    }

    pub fn weight(&self) -> &Var {
        self.weight.var()
    }

    pub fn bias(&self) -> &Var {
        self.bias.var()
    }
}

impl Module for Linear {
    fn forward(&self, input: &Var) -> RevgradResult<Var> {
        input.matmul(self.weight.var())?.add(self.bias.var())
    }

    fn collect_parameters(&self, prefix: &str, params: &mut HashMap<String, Var>) {
        params.insert(qualify(prefix, "weight"), self.weight.var().clone());
        params.insert(qualify(prefix, "bias"), self.bias.var().clone());
    }
}

/// Rectified linear unit activation
pub struct ReLU;

impl Module for ReLU {
    fn forward(&self, input: &Var) -> RevgradResult<Var> {
        input.relu()
    }

    fn collect_parameters(&self, _prefix: &str, _params: &mut HashMap<String, Var>) {}
}

/// Hyperbolic tangent activation
pub struct Tanh;

impl Module for Tanh {
    fn forward(&self, input: &Var) -> RevgradResult<Var> {
        input.tanh()
    }

    fn collect_parameters(&self, _prefix: &str, _params: &mut HashMap<String, Var>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{self, Device};

    fn graph() -> Graph {
        backend::select(Device::Cpu).unwrap();
        Graph::new().unwrap()
    }

    struct Mlp {
        hidden: Linear,
        activation: ReLU,
        output: Linear,
    }

    impl Module for Mlp {
        fn forward(&self, input: &Var) -> RevgradResult<Var> {
            let h = self.hidden.forward(input)?;
            let h = self.activation.forward(&h)?;
            self.output.forward(&h)
        }

        fn collect_parameters(&self, prefix: &str, params: &mut HashMap<String, Var>) {
            self.hidden.collect_parameters(&qualify(prefix, "hidden"), params);
            self.output.collect_parameters(&qualify(prefix, "output"), params);
        }
    }

    #[test]
    fn test_linear_forward_and_gradients() {
        let g = graph();
        let layer = Linear::new(&g, 3, 2);
        let x = g.var(ArrayD::ones(IxDyn(&[4, 3])), false);
        let y = layer.forward(&x).unwrap();
        assert_eq!(y.shape(), vec![4, 2]);

        let loss = y.sum(None, false).unwrap();
        loss.backward().unwrap();
        assert_eq!(layer.weight().grad().unwrap().shape(), &[3, 2]);
        assert_eq!(layer.bias().grad().unwrap().shape(), &[2]);
        // Each bias element sees one unit of gradient per batch row.
        assert!(layer.bias().grad().unwrap().iter().all(|&v| v == 4.0));
    }

    #[test]
    fn test_parameter_collection_qualified_names() {
        let g = graph();
        let model = Mlp {
            hidden: Linear::new(&g, 4, 8),
            activation: ReLU,
            output: Linear::new(&g, 8, 2),
        };
        let params = model.parameters();
        let mut names: Vec<_> = params.keys().cloned().collect();
        names.sort();
        assert_eq!(
            names,
            vec!["hidden.bias", "hidden.weight", "output.bias", "output.weight"]
        );
        assert!(params.values().all(|p| p.requires_grad()));
    }

    #[test]
    fn test_relu_module_masks_negatives() {
        let g = graph();
        let x = g.from_vec(vec![-1.0, 2.0], &[2], true).unwrap();
        let y = ReLU.forward(&x).unwrap();
        assert_eq!(y.data().as_slice().unwrap(), &[0.0, 2.0]);
        y.sum(None, false).unwrap().backward().unwrap();
        assert_eq!(x.grad().unwrap().as_slice().unwrap(), &[0.0, 1.0]);
    }
}
