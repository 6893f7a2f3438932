//! Differentiable value handles over the graph arena
//!
//! A [`Var`] pairs a graph handle with the [`NodeId`] of one node. Operator
//! methods compute their result eagerly through the dense-array backend,
//! record the new node's provenance, and return a fresh handle. Construction
//! errors (incompatible shapes, mixed arenas) abort the call that triggered
//! them.

use std::fmt;

use ndarray::{ArrayD, Axis, IxDyn};

use super::graph::{Graph, NodeId};
use super::numeric::{broadcast_apply, broadcast_compare, matmul as matmul_nd};
use super::op::Op;
use crate::backend::Device;
use crate::error::{RevgradError, RevgradResult};

/// Handle to a single differentiable value
///
/// The named operator methods (`add`, `sub`, `mul`, `div`, ...) are the
/// fallible path and return [`RevgradResult`]. The `std::ops` sugar
/// (`&a + &b`, `&a * 2.0`) panics on the same errors, shape mismatches
/// included; use the named methods when the operand shapes are not known
/// to be compatible.
#[derive(Clone)]
pub struct Var {
    graph: Graph,
    id: NodeId,
}

impl Graph {
    /// Create a leaf node from array data.
    pub fn var(&self, data: ArrayD<f64>, requires_grad: bool) -> Var {
        let id = self.inner.write().leaf(data, requires_grad);
        Var {
            graph: self.clone(),
            id,
        }
    }

    /// Create a constant scalar leaf.
    pub fn scalar(&self, value: f64) -> Var {
        self.var(ArrayD::from_elem(IxDyn(&[]), value), false)
    }

    /// Wrap an existing arena node in a handle.
    pub(crate) fn handle(&self, id: NodeId) -> Var {
        Var {
            graph: self.clone(),
            id,
        }
    }

    /// Create a leaf from a flat value buffer and a shape.
    pub fn from_vec(
        &self,
        values: Vec<f64>,
        shape: &[usize],
        requires_grad: bool,
    ) -> RevgradResult<Var> {
        let data = ArrayD::from_shape_vec(IxDyn(shape), values)
            .map_err(|e| RevgradError::InvalidInput(format!("from_vec: {}", e)))?;
        Ok(self.var(data, requires_grad))
    }
}

impl Var {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// The numeric payload (cloned out of the arena).
    pub fn data(&self) -> ArrayD<f64> {
        self.graph.inner.read().nodes[self.id].data.clone()
    }

    /// The accumulated gradient, if one has been allocated.
    pub fn grad(&self) -> Option<ArrayD<f64>> {
        self.graph.inner.read().nodes[self.id].grad.clone()
    }

    pub fn shape(&self) -> Vec<usize> {
        self.graph.inner.read().nodes[self.id].data.shape().to_vec()
    }

    pub fn requires_grad(&self) -> bool {
        self.graph.inner.read().nodes[self.id].requires_grad
    }

    /// Label of the primitive that produced this node; empty for leaves.
    pub fn op_label(&self) -> &'static str {
        self.graph.inner.read().nodes[self.id].op.label()
    }

    /// Run the backward sweep with this node as the terminal.
    pub fn backward(&self) -> RevgradResult<()> {
        self.graph.inner.write().backward(self.id)
    }

    /// Reset this node's gradient buffer to zero.
    pub fn zero_grad(&self) {
        let mut inner = self.graph.inner.write();
        let node = &mut inner.nodes[self.id];
        if node.requires_grad {
            node.grad = Some(ArrayD::zeros(node.data.raw_dim()));
        }
    }

    /// Replace the payload in place. The new data must keep the shape, so the
    /// gradient buffer stays valid. Used by optimizers for parameter updates.
    pub fn set_data(&self, data: ArrayD<f64>) -> RevgradResult<()> {
        let mut inner = self.graph.inner.write();
        let node = &mut inner.nodes[self.id];
        if node.data.shape() != data.shape() {
            return Err(RevgradError::InvalidInput(format!(
                "set_data: shape {:?} does not match existing shape {:?}",
                data.shape(),
                node.data.shape()
            )));
        }
        node.data = data;
        Ok(())
    }

    /// A new constant leaf sharing this node's data, cut off from the graph.
    pub fn detach(&self) -> Var {
        self.graph.var(self.data(), false)
    }

    /// Transfer to another device.
    pub fn to_device(&self, device: Device) -> RevgradResult<Var> {
        match device {
            Device::Cpu => Ok(self.clone()),
            Device::Cuda => Err(RevgradError::BackendUnavailable(
                "no CUDA runtime is linked into this build".to_string(),
            )),
        }
    }

    fn ensure_same_arena(&self, other: &Var) -> RevgradResult<()> {
        if self.graph.same_arena(&other.graph) {
            Ok(())
        } else {
            Err(RevgradError::InvalidInput(
                "operands belong to different graphs".to_string(),
            ))
        }
    }

    fn binary<F>(&self, other: &Var, forward: F, make_op: fn(NodeId, NodeId) -> Op) -> RevgradResult<Var>
    where
        F: FnOnce(&ArrayD<f64>, &ArrayD<f64>) -> RevgradResult<ArrayD<f64>>,
    {
        self.ensure_same_arena(other)?;
        let data = {
            let inner = self.graph.inner.read();
            forward(&inner.nodes[self.id].data, &inner.nodes[other.id].data)?
        };
        let id = self.graph.inner.write().op_node(data, make_op(self.id, other.id));
        Ok(Var {
            graph: self.graph.clone(),
            id,
        })
    }

    pub(crate) fn unary<F>(&self, forward: F, make_op: impl FnOnce(NodeId) -> Op) -> RevgradResult<Var>
    where
        F: FnOnce(&ArrayD<f64>) -> RevgradResult<ArrayD<f64>>,
    {
        let data = {
            let inner = self.graph.inner.read();
            forward(&inner.nodes[self.id].data)?
        };
        let id = self.graph.inner.write().op_node(data, make_op(self.id));
        Ok(Var {
            graph: self.graph.clone(),
            id,
        })
    }

    /// Element-wise addition with implicit broadcasting.
    pub fn add(&self, other: &Var) -> RevgradResult<Var> {
        self.binary(other, |a, b| broadcast_apply(a, b, "add", |x, y| x + y), Op::Add)
    }

    /// Element-wise subtraction.
    pub fn sub(&self, other: &Var) -> RevgradResult<Var> {
        self.binary(other, |a, b| broadcast_apply(a, b, "sub", |x, y| x - y), Op::Sub)
    }

    /// Element-wise multiplication.
    pub fn mul(&self, other: &Var) -> RevgradResult<Var> {
        self.binary(other, |a, b| broadcast_apply(a, b, "mul", |x, y| x * y), Op::Mul)
    }

    /// Element-wise division. Division by zero follows IEEE semantics.
    pub fn div(&self, other: &Var) -> RevgradResult<Var> {
        self.binary(other, |a, b| broadcast_apply(a, b, "div", |x, y| x / y), Op::Div)
    }

    /// Element-wise exponentiation, `self ** other`.
    pub fn pow(&self, other: &Var) -> RevgradResult<Var> {
        self.binary(
            other,
            |a, b| broadcast_apply(a, b, "pow", |x, y| x.powf(y)),
            Op::Pow,
        )
    }

    /// Matrix multiplication; batched over matching leading axes.
    pub fn matmul(&self, other: &Var) -> RevgradResult<Var> {
        self.binary(other, |a, b| matmul_nd(a, b), Op::MatMul)
    }

    /// Element-wise negation.
    pub fn neg(&self) -> RevgradResult<Var> {
        self.unary(|a| Ok(a.mapv(|v| -v)), Op::Neg)
    }

    /// Transpose (all axes reversed).
    pub fn t(&self) -> RevgradResult<Var> {
        self.unary(|a| Ok(a.t().to_owned()), Op::Transpose)
    }

    /// Sum of elements, optionally over one axis.
    pub fn sum(&self, axis: Option<usize>, keepdims: bool) -> RevgradResult<Var> {
        self.unary(
            |a| match axis {
                Some(ax) => {
                    check_axis(ax, a.ndim(), "sum")?;
                    let mut out = a.sum_axis(Axis(ax));
                    if keepdims {
                        out = out.insert_axis(Axis(ax));
                    }
                    Ok(out)
                }
                None => {
                    let total = a.sum();
                    if keepdims {
                        Ok(ArrayD::from_elem(IxDyn(&vec![1; a.ndim()]), total))
                    } else {
                        Ok(ArrayD::from_elem(IxDyn(&[]), total))
                    }
                }
            },
            |input| Op::Sum {
                input,
                axis,
                keepdims,
            },
        )
    }

    /// Mean of elements, optionally over one axis.
    pub fn mean(&self, axis: Option<usize>) -> RevgradResult<Var> {
        self.unary(
            |a| match axis {
                Some(ax) => {
                    check_axis(ax, a.ndim(), "mean")?;
                    a.mean_axis(Axis(ax)).ok_or_else(|| {
                        RevgradError::InvalidInput("mean: axis has no elements".to_string())
                    })
                }
                None => a
                    .mean()
                    .map(|m| ArrayD::from_elem(IxDyn(&[]), m))
                    .ok_or_else(|| {
                        RevgradError::InvalidInput("mean: array has no elements".to_string())
                    }),
            },
            |input| Op::Mean { input, axis },
        )
    }

    /// Maximum of elements, optionally over one axis. Forward-only: no
    /// gradient flows through this reduction.
    pub fn max(&self, axis: Option<usize>, keepdims: bool) -> RevgradResult<Var> {
        self.unary(
            |a| {
                if a.is_empty() {
                    return Err(RevgradError::InvalidInput(
                        "max: array has no elements".to_string(),
                    ));
                }
                match axis {
                    Some(ax) => {
                        check_axis(ax, a.ndim(), "max")?;
                        let mut out =
                            a.map_axis(Axis(ax), |lane| lane.fold(f64::NEG_INFINITY, |m, &v| m.max(v)));
                        if keepdims {
                            out = out.insert_axis(Axis(ax));
                        }
                        Ok(out)
                    }
                    None => {
                        let m = a.iter().fold(f64::NEG_INFINITY, |m, &v| m.max(v));
                        Ok(ArrayD::from_elem(IxDyn(&[]), m))
                    }
                }
            },
            |input| Op::Max { input },
        )
    }

    /// Rectified linear unit, `max(x, 0)` element-wise.
    pub fn relu(&self) -> RevgradResult<Var> {
        self.unary(|a| Ok(a.mapv(|v| v.max(0.0))), Op::Relu)
    }

    /// Hyperbolic tangent.
    pub fn tanh(&self) -> RevgradResult<Var> {
        self.unary(|a| Ok(a.mapv(f64::tanh)), Op::Tanh)
    }

    /// Element-wise greater-than comparison, producing a boolean mask.
    pub fn gt(&self, other: &Var) -> RevgradResult<ArrayD<bool>> {
        self.compare(other, "gt", |a, b| a > b)
    }

    /// Element-wise less-than comparison.
    pub fn lt(&self, other: &Var) -> RevgradResult<ArrayD<bool>> {
        self.compare(other, "lt", |a, b| a < b)
    }

    /// Element-wise greater-or-equal comparison.
    pub fn ge(&self, other: &Var) -> RevgradResult<ArrayD<bool>> {
        self.compare(other, "ge", |a, b| a >= b)
    }

    /// Element-wise less-or-equal comparison.
    pub fn le(&self, other: &Var) -> RevgradResult<ArrayD<bool>> {
        self.compare(other, "le", |a, b| a <= b)
    }

    fn compare(
        &self,
        other: &Var,
        operation: &str,
        f: fn(f64, f64) -> bool,
    ) -> RevgradResult<ArrayD<bool>> {
        self.ensure_same_arena(other)?;
        let inner = self.graph.inner.read();
        broadcast_compare(
            &inner.nodes[self.id].data,
            &inner.nodes[other.id].data,
            operation,
            f,
        )
    }
}

fn check_axis(axis: usize, ndim: usize, operation: &str) -> RevgradResult<()> {
    if axis >= ndim {
        return Err(RevgradError::InvalidInput(format!(
            "{}: axis {} out of bounds for rank {}",
            operation, axis, ndim
        )));
    }
    Ok(())
}

impl fmt::Debug for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("Var");
        dbg.field("shape", &self.shape());
        let label = self.op_label();
        if !label.is_empty() {
            dbg.field("op", &label);
        }
        if self.requires_grad() {
            dbg.field("requires_grad", &true);
        }
        dbg.finish()
    }
}

// Operator sugar over the named methods. Panics where the named method
// would return an error; scalar operands become constant nodes.
macro_rules! impl_binary_operator {
    ($trait:ident, $method:ident, $named:ident) => {
        impl std::ops::$trait<&Var> for &Var {
            type Output = Var;
            fn $method(self, rhs: &Var) -> Var {
                self.$named(rhs).unwrap_or_else(|e| panic!("{}", e))
            }
        }

        impl std::ops::$trait<f64> for &Var {
            type Output = Var;
            fn $method(self, rhs: f64) -> Var {
                let rhs = self.graph().scalar(rhs);
                self.$named(&rhs).unwrap_or_else(|e| panic!("{}", e))
            }
        }
    };
}

impl_binary_operator!(Add, add, add);
impl_binary_operator!(Sub, sub, sub);
impl_binary_operator!(Mul, mul, mul);
impl_binary_operator!(Div, div, div);

impl std::ops::Neg for &Var {
    type Output = Var;
    fn neg(self) -> Var {
        Var::neg(self).unwrap_or_else(|e| panic!("{}", e))
    }
}
