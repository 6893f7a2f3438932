//! The differentiable primitive catalogue
//!
//! Every operator output carries one [`Op`] tag naming the primitive that
//! produced it. The backward driver dispatches on the tag instead of invoking
//! an opaque stored closure, which keeps the graph inspectable and
//! serializable. Forward-time operand values live in the arena, so a variant
//! only carries what the arena cannot reconstruct (reduction axes, angle
//! mode, the selection mask).

use ndarray::{ArrayD, Axis, IxDyn, Zip};
use serde::{Deserialize, Serialize};

use super::graph::{Node, NodeId};
use super::numeric::{broadcast_apply, matmul, reduce_gradient, swap_last_axes};
use crate::error::{RevgradError, RevgradResult};

/// Interpretation of trigonometric inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AngleMode {
    Radians,
    Degrees,
}

impl AngleMode {
    pub(crate) fn to_radians(self, v: f64) -> f64 {
        match self {
            AngleMode::Radians => v,
            AngleMode::Degrees => v.to_radians(),
        }
    }

    /// Chain-rule factor of the input-to-radians conversion.
    pub(crate) fn scale(self) -> f64 {
        match self {
            AngleMode::Radians => 1.0,
            AngleMode::Degrees => std::f64::consts::PI / 180.0,
        }
    }
}

/// Operation that produced a node, carrying its parent handles
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Op {
    Leaf,
    Add(NodeId, NodeId),
    Sub(NodeId, NodeId),
    Mul(NodeId, NodeId),
    Div(NodeId, NodeId),
    Pow(NodeId, NodeId),
    MatMul(NodeId, NodeId),
    Neg(NodeId),
    Transpose(NodeId),
    Sum {
        input: NodeId,
        axis: Option<usize>,
        keepdims: bool,
    },
    Mean {
        input: NodeId,
        axis: Option<usize>,
    },
    Max {
        input: NodeId,
    },
    Sin {
        input: NodeId,
        mode: AngleMode,
    },
    Cos {
        input: NodeId,
        mode: AngleMode,
    },
    Exp(NodeId),
    Ln(NodeId),
    Log10(NodeId),
    Relu(NodeId),
    Tanh(NodeId),
    Where {
        mask: ArrayD<bool>,
        then_branch: NodeId,
        else_branch: NodeId,
    },
}

impl Op {
    /// Parent handles in operand order; empty for leaves.
    pub fn parents(&self) -> Vec<NodeId> {
        match self {
            Op::Leaf => vec![],
            Op::Add(a, b)
            | Op::Sub(a, b)
            | Op::Mul(a, b)
            | Op::Div(a, b)
            | Op::Pow(a, b)
            | Op::MatMul(a, b) => vec![*a, *b],
            Op::Neg(a)
            | Op::Transpose(a)
            | Op::Exp(a)
            | Op::Ln(a)
            | Op::Log10(a)
            | Op::Relu(a)
            | Op::Tanh(a) => vec![*a],
            Op::Sum { input, .. }
            | Op::Mean { input, .. }
            | Op::Max { input }
            | Op::Sin { input, .. }
            | Op::Cos { input, .. } => vec![*input],
            Op::Where {
                then_branch,
                else_branch,
                ..
            } => vec![*then_branch, *else_branch],
        }
    }

    /// Short operator label, used in graph display
    pub fn label(&self) -> &'static str {
        match self {
            Op::Leaf => "",
            Op::Add(..) => "+",
            Op::Sub(..) => "-",
            Op::Mul(..) => "*",
            Op::Div(..) => "/",
            Op::Pow(..) => "**",
            Op::MatMul(..) => "@",
            Op::Neg(..) => "neg",
            Op::Transpose(..) => "T",
            Op::Sum { .. } => "sum",
            Op::Mean { .. } => "mean",
            Op::Max { .. } => "max",
            Op::Sin { .. } => "sin",
            Op::Cos { .. } => "cos",
            Op::Exp(..) => "exp",
            Op::Ln(..) => "ln",
            Op::Log10(..) => "log10",
            Op::Relu(..) => "relu",
            Op::Tanh(..) => "tanh",
            Op::Where { .. } => "where",
        }
    }

    /// Compute each parent's local gradient contribution, already reduced to
    /// the parent's own shape. Parents that do not require gradients receive
    /// no entry.
    pub(crate) fn backward(
        &self,
        nodes: &[Node],
        out_data: &ArrayD<f64>,
        out_grad: &ArrayD<f64>,
    ) -> RevgradResult<Vec<(NodeId, ArrayD<f64>)>> {
        let mut contributions = Vec::new();
        let needs = |id: NodeId| nodes[id].requires_grad;
        let data = |id: NodeId| &nodes[id].data;

        match self {
            Op::Leaf | Op::Max { .. } => {}

            Op::Add(a, b) => {
                if needs(*a) {
                    contributions.push((*a, reduce_gradient(out_grad.clone(), data(*a).shape())));
                }
                if needs(*b) {
                    contributions.push((*b, reduce_gradient(out_grad.clone(), data(*b).shape())));
                }
            }

            Op::Sub(a, b) => {
                if needs(*a) {
                    contributions.push((*a, reduce_gradient(out_grad.clone(), data(*a).shape())));
                }
                if needs(*b) {
                    contributions.push((*b, reduce_gradient(out_grad.mapv(|v| -v), data(*b).shape())));
                }
            }

            Op::Mul(a, b) => {
                if needs(*a) {
                    let grad = broadcast_apply(data(*b), out_grad, "mul", |bv, g| bv * g)?;
                    contributions.push((*a, reduce_gradient(grad, data(*a).shape())));
                }
                if needs(*b) {
                    let grad = broadcast_apply(data(*a), out_grad, "mul", |av, g| av * g)?;
                    contributions.push((*b, reduce_gradient(grad, data(*b).shape())));
                }
            }

            Op::Div(a, b) => {
                if needs(*a) {
                    let grad = broadcast_apply(out_grad, data(*b), "div", |g, bv| g / bv)?;
                    contributions.push((*a, reduce_gradient(grad, data(*a).shape())));
                }
                if needs(*b) {
                    let numer = broadcast_apply(data(*a), out_grad, "div", |av, g| av * g)?;
                    let grad = broadcast_apply(&numer, data(*b), "div", |n, bv| -n / (bv * bv))?;
                    contributions.push((*b, reduce_gradient(grad, data(*b).shape())));
                }
            }

            Op::Pow(a, b) => {
                if needs(*a) {
                    let local =
                        broadcast_apply(data(*b), data(*a), "pow", |e, base| e * base.powf(e - 1.0))?;
                    let grad = broadcast_apply(&local, out_grad, "pow", |l, g| l * g)?;
                    contributions.push((*a, reduce_gradient(grad, data(*a).shape())));
                }
                if needs(*b) {
                    // d(a^b)/db = a^b * ln(a), defined only for a > 0
                    if data(*a).iter().any(|&v| v <= 0.0) {
                        return Err(RevgradError::invalid_domain(
                            "pow",
                            "exponent gradient requires a strictly positive base",
                        ));
                    }
                    let local = broadcast_apply(out_data, data(*a), "pow", |o, base| o * base.ln())?;
                    let grad = broadcast_apply(&local, out_grad, "pow", |l, g| l * g)?;
                    contributions.push((*b, reduce_gradient(grad, data(*b).shape())));
                }
            }

            Op::MatMul(a, b) => {
                if needs(*a) {
                    contributions.push((*a, matmul(out_grad, &swap_last_axes(data(*b)))?));
                }
                if needs(*b) {
                    contributions.push((*b, matmul(&swap_last_axes(data(*a)), out_grad)?));
                }
            }

            Op::Neg(a) => {
                if needs(*a) {
                    contributions.push((*a, out_grad.mapv(|v| -v)));
                }
            }

            Op::Transpose(a) => {
                if needs(*a) {
                    contributions.push((*a, out_grad.t().to_owned()));
                }
            }

            Op::Sum {
                input,
                axis,
                keepdims,
            } => {
                if needs(*input) {
                    let mut grad = out_grad.clone();
                    if let Some(ax) = axis {
                        if !keepdims {
                            grad = grad.insert_axis(Axis(*ax));
                        }
                    }
                    contributions.push((*input, expand_to(&grad, data(*input).shape())?));
                }
            }

            Op::Mean { input, axis } => {
                if needs(*input) {
                    let shape = data(*input).shape().to_vec();
                    let count = match axis {
                        Some(ax) => shape[*ax] as f64,
                        None => shape.iter().product::<usize>() as f64,
                    };
                    let mut grad = out_grad.clone();
                    if let Some(ax) = axis {
                        grad = grad.insert_axis(Axis(*ax));
                    }
                    let expanded = expand_to(&grad, &shape)?;
                    contributions.push((*input, expanded.mapv(|v| v / count)));
                }
            }

            Op::Sin { input, mode } => {
                if needs(*input) {
                    let scale = mode.scale();
                    let grad = Zip::from(out_grad)
                        .and(data(*input))
                        .map_collect(|&g, &x| g * mode.to_radians(x).cos() * scale);
                    contributions.push((*input, grad));
                }
            }

            Op::Cos { input, mode } => {
                if needs(*input) {
                    let scale = mode.scale();
                    let grad = Zip::from(out_grad)
                        .and(data(*input))
                        .map_collect(|&g, &x| -g * mode.to_radians(x).sin() * scale);
                    contributions.push((*input, grad));
                }
            }

            Op::Exp(a) => {
                if needs(*a) {
                    let grad = Zip::from(out_grad).and(out_data).map_collect(|&g, &o| g * o);
                    contributions.push((*a, grad));
                }
            }

            Op::Ln(a) => {
                if needs(*a) {
                    let grad = Zip::from(out_grad).and(data(*a)).map_collect(|&g, &x| g / x);
                    contributions.push((*a, grad));
                }
            }

            Op::Log10(a) => {
                if needs(*a) {
                    let scale = std::f64::consts::LOG10_E;
                    let grad = Zip::from(out_grad)
                        .and(data(*a))
                        .map_collect(|&g, &x| g * scale / x);
                    contributions.push((*a, grad));
                }
            }

            Op::Relu(a) => {
                if needs(*a) {
                    let grad = Zip::from(out_grad)
                        .and(data(*a))
                        .map_collect(|&g, &x| if x > 0.0 { g } else { 0.0 });
                    contributions.push((*a, grad));
                }
            }

            Op::Tanh(a) => {
                if needs(*a) {
                    let grad = Zip::from(out_grad)
                        .and(data(*a))
                        .map_collect(|&g, &x| g * (1.0 - x.tanh() * x.tanh()));
                    contributions.push((*a, grad));
                }
            }

            Op::Where {
                mask,
                then_branch,
                else_branch,
            } => {
                // Routes the output gradient to whichever branch was selected
                // per element; both branches go through the scheduler like
                // every other primitive.
                if needs(*then_branch) {
                    let grad = Zip::from(out_grad)
                        .and(mask)
                        .map_collect(|&g, &m| if m { g } else { 0.0 });
                    contributions
                        .push((*then_branch, reduce_gradient(grad, data(*then_branch).shape())));
                }
                if needs(*else_branch) {
                    let grad = Zip::from(out_grad)
                        .and(mask)
                        .map_collect(|&g, &m| if m { 0.0 } else { g });
                    contributions
                        .push((*else_branch, reduce_gradient(grad, data(*else_branch).shape())));
                }
            }
        }

        Ok(contributions)
    }
}

/// Re-expand a reduced gradient to the original operand shape.
fn expand_to(grad: &ArrayD<f64>, shape: &[usize]) -> RevgradResult<ArrayD<f64>> {
    grad.broadcast(IxDyn(shape))
        .map(|v| v.to_owned())
        .ok_or_else(|| {
            RevgradError::Internal(format!(
                "gradient of shape {:?} does not re-expand to {:?}",
                grad.shape(),
                shape
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parents_in_operand_order() {
        assert_eq!(Op::Sub(3, 7).parents(), vec![3, 7]);
        assert_eq!(
            Op::Sum {
                input: 5,
                axis: Some(1),
                keepdims: true
            }
            .parents(),
            vec![5]
        );
        assert!(Op::Leaf.parents().is_empty());
    }

    #[test]
    fn test_op_serializes() {
        let op = Op::Sin {
            input: 2,
            mode: AngleMode::Degrees,
        };
        let json = serde_json::to_string(&op).unwrap();
        assert!(json.contains("Sin"));
        assert!(json.contains("Degrees"));

        let restored: Op = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.parents(), vec![2]);
        assert_eq!(restored.label(), "sin");
    }
}
