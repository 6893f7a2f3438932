//! Function-style differentiable math
//!
//! Trigonometric, exponential/logarithmic, nth-root, and conditional
//! selection primitives over [`Var`] handles. These complement the operator
//! methods on `Var` itself.

use ndarray::{ArrayD, IxDyn, Zip};

use super::numeric::broadcast_shape;
use super::op::{AngleMode, Op};
use super::var::Var;
use crate::error::{RevgradError, RevgradResult};

/// Element-wise sine. Degree-mode inputs are converted to radians before the
/// forward computation, and the backward rule carries the conversion's own
/// chain-rule factor.
pub fn sin(x: &Var, mode: AngleMode) -> RevgradResult<Var> {
    x.unary(
        |a| Ok(a.mapv(|v| mode.to_radians(v).sin())),
        |input| Op::Sin { input, mode },
    )
}

/// Element-wise cosine; see [`sin`] for angle-mode handling.
pub fn cos(x: &Var, mode: AngleMode) -> RevgradResult<Var> {
    x.unary(
        |a| Ok(a.mapv(|v| mode.to_radians(v).cos())),
        |input| Op::Cos { input, mode },
    )
}

/// Element-wise natural exponential.
pub fn exp(x: &Var) -> RevgradResult<Var> {
    x.unary(|a| Ok(a.mapv(f64::exp)), Op::Exp)
}

/// Element-wise natural logarithm. Fails fast on non-positive input.
pub fn ln(x: &Var) -> RevgradResult<Var> {
    x.unary(
        |a| {
            check_positive(a, "ln")?;
            Ok(a.mapv(f64::ln))
        },
        Op::Ln,
    )
}

/// Element-wise base-10 logarithm. Fails fast on non-positive input.
pub fn log10(x: &Var) -> RevgradResult<Var> {
    x.unary(
        |a| {
            check_positive(a, "log10")?;
            Ok(a.mapv(f64::log10))
        },
        Op::Log10,
    )
}

/// The nth root, `x^(1/n)`, expressed as a power with an auxiliary
/// converted-exponent node so both operands flow through the power rule.
pub fn root(x: &Var, n: f64) -> RevgradResult<Var> {
    if n == 0.0 {
        return Err(RevgradError::invalid_domain("root", "zeroth root is undefined"));
    }
    let exponent = x.graph().scalar(1.0 / n);
    x.pow(&exponent)
}

/// Element-wise conditional selection: where the mask holds, take
/// `then_v`, otherwise `else_v`. The backward rule routes the output
/// gradient to whichever branch was selected per element; both branches are
/// scheduled like every other primitive.
pub fn where_cond(mask: &ArrayD<bool>, then_v: &Var, else_v: &Var) -> RevgradResult<Var> {
    if !then_v.graph().same_arena(else_v.graph()) {
        return Err(RevgradError::InvalidInput(
            "operands belong to different graphs".to_string(),
        ));
    }

    let graph = then_v.graph().clone();
    let (data, mask, then_id, else_id) = {
        let inner = graph.inner.read();
        let t = &inner.nodes[then_v.id()].data;
        let e = &inner.nodes[else_v.id()].data;
        let branches = broadcast_shape(t.shape(), e.shape())
            .ok_or_else(|| RevgradError::shape_mismatch("where", t.shape(), e.shape()))?;
        let shape = broadcast_shape(mask.shape(), &branches)
            .ok_or_else(|| RevgradError::shape_mismatch("where", mask.shape(), &branches))?;

        let mv = broadcast_view(mask, &shape, "where")?;
        let tv = broadcast_view(t, &shape, "where")?;
        let ev = broadcast_view(e, &shape, "where")?;
        let data = Zip::from(&mv)
            .and(&tv)
            .and(&ev)
            .map_collect(|&m, &tval, &eval| if m { tval } else { eval });
        (data, mv.to_owned(), then_v.id(), else_v.id())
    };

    let id = graph.inner.write().op_node(
        data,
        Op::Where {
            mask,
            then_branch: then_id,
            else_branch: else_id,
        },
    );
    Ok(graph.handle(id))
}

fn broadcast_view<'a, T: Clone>(
    a: &'a ArrayD<T>,
    shape: &[usize],
    operation: &str,
) -> RevgradResult<ndarray::ArrayViewD<'a, T>> {
    a.broadcast(IxDyn(shape))
        .ok_or_else(|| RevgradError::Internal(format!("{}: broadcast view failed", operation)))
}

fn check_positive(a: &ArrayD<f64>, operation: &str) -> RevgradResult<()> {
    if a.iter().any(|&v| v <= 0.0) {
        return Err(RevgradError::invalid_domain(
            operation,
            "input contains non-positive values",
        ));
    }
    Ok(())
}
