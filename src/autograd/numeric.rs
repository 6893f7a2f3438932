//! Numeric glue over the dense-array backend
//!
//! Gradient reduction across implicit broadcasting, broadcast-aware
//! elementwise application, and (batched) matrix multiplication. Raw kernels
//! are ndarray's; this module only arranges shapes around them.

use ndarray::{ArrayD, Axis, Ix2, IxDyn, Zip};

use crate::error::{RevgradError, RevgradResult};

/// Collapse a gradient computed at a broadcast result shape back down to
/// `target`, summing away the axes broadcasting introduced or stretched.
///
/// Inverts NumPy-style broadcasting: leading axes are summed off until ranks
/// match, then any axis the target holds at size 1 is summed keeping the
/// axis. Idempotent on an already-target-shaped gradient.
pub fn reduce_gradient(mut grad: ArrayD<f64>, target: &[usize]) -> ArrayD<f64> {
    while grad.ndim() > target.len() {
        grad = grad.sum_axis(Axis(0));
    }
    for (i, &dim) in target.iter().enumerate() {
        if dim == 1 && grad.shape()[i] != 1 {
            grad = grad.sum_axis(Axis(i)).insert_axis(Axis(i));
        }
    }
    grad
}

/// The NumPy broadcast result shape of two operand shapes, if compatible.
pub fn broadcast_shape(lhs: &[usize], rhs: &[usize]) -> Option<Vec<usize>> {
    let rank = lhs.len().max(rhs.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let a = if i < rank - lhs.len() { 1 } else { lhs[i - (rank - lhs.len())] };
        let b = if i < rank - rhs.len() { 1 } else { rhs[i - (rank - rhs.len())] };
        if a != b && a != 1 && b != 1 {
            return None;
        }
        out[i] = a.max(b);
    }
    Some(out)
}

/// Apply a binary function elementwise over both operands broadcast to their
/// common shape. Fails with `ShapeMismatch` when the shapes are incompatible.
pub fn broadcast_apply<F>(
    lhs: &ArrayD<f64>,
    rhs: &ArrayD<f64>,
    operation: &str,
    f: F,
) -> RevgradResult<ArrayD<f64>>
where
    F: Fn(f64, f64) -> f64,
{
    let shape = broadcast_shape(lhs.shape(), rhs.shape())
        .ok_or_else(|| RevgradError::shape_mismatch(operation, lhs.shape(), rhs.shape()))?;
    let lv = lhs
        .broadcast(IxDyn(&shape))
        .ok_or_else(|| RevgradError::Internal(format!("{}: broadcast view failed", operation)))?;
    let rv = rhs
        .broadcast(IxDyn(&shape))
        .ok_or_else(|| RevgradError::Internal(format!("{}: broadcast view failed", operation)))?;
    Ok(Zip::from(&lv).and(&rv).map_collect(|&a, &b| f(a, b)))
}

/// Elementwise comparison over both operands broadcast to their common
/// shape, producing a boolean mask.
pub fn broadcast_compare<F>(
    lhs: &ArrayD<f64>,
    rhs: &ArrayD<f64>,
    operation: &str,
    f: F,
) -> RevgradResult<ArrayD<bool>>
where
    F: Fn(f64, f64) -> bool,
{
    let shape = broadcast_shape(lhs.shape(), rhs.shape())
        .ok_or_else(|| RevgradError::shape_mismatch(operation, lhs.shape(), rhs.shape()))?;
    let lv = lhs
        .broadcast(IxDyn(&shape))
        .ok_or_else(|| RevgradError::Internal(format!("{}: broadcast view failed", operation)))?;
    let rv = rhs
        .broadcast(IxDyn(&shape))
        .ok_or_else(|| RevgradError::Internal(format!("{}: broadcast view failed", operation)))?;
    Ok(Zip::from(&lv).and(&rv).map_collect(|&a, &b| f(a, b)))
}

/// Transpose only the last two axes, leaving any batch axes in place.
pub fn swap_last_axes(a: &ArrayD<f64>) -> ArrayD<f64> {
    let n = a.ndim();
    let mut view = a.view();
    view.swap_axes(n - 2, n - 1);
    view.to_owned()
}

/// Matrix multiplication for rank-2 operands, batched over exactly matching
/// leading axes for higher ranks.
pub fn matmul(a: &ArrayD<f64>, b: &ArrayD<f64>) -> RevgradResult<ArrayD<f64>> {
    if a.ndim() < 2 || b.ndim() < 2 {
        return Err(RevgradError::shape_mismatch("matmul", a.shape(), b.shape()));
    }
    let (m, ka) = (a.shape()[a.ndim() - 2], a.shape()[a.ndim() - 1]);
    let (kb, n) = (b.shape()[b.ndim() - 2], b.shape()[b.ndim() - 1]);
    if ka != kb {
        return Err(RevgradError::shape_mismatch("matmul", a.shape(), b.shape()));
    }

    if a.ndim() == 2 && b.ndim() == 2 {
        let a2 = as_matrix(a)?;
        let b2 = as_matrix(b)?;
        return Ok(a2.dot(&b2).into_dyn());
    }

    let lead_a = &a.shape()[..a.ndim() - 2];
    let lead_b = &b.shape()[..b.ndim() - 2];
    if lead_a != lead_b {
        return Err(RevgradError::shape_mismatch("matmul", a.shape(), b.shape()));
    }

    let batch: usize = lead_a.iter().product();
    let a3 = reshaped(a, &[batch, m, ka])?;
    let b3 = reshaped(b, &[batch, kb, n])?;
    let mut out = ArrayD::<f64>::zeros(IxDyn(&[batch, m, n]));
    for i in 0..batch {
        let ai = as_matrix(&a3.index_axis(Axis(0), i).to_owned())?;
        let bi = as_matrix(&b3.index_axis(Axis(0), i).to_owned())?;
        out.index_axis_mut(Axis(0), i).assign(&ai.dot(&bi));
    }
    let mut out_shape = lead_a.to_vec();
    out_shape.push(m);
    out_shape.push(n);
    reshaped(&out, &out_shape)
}

fn as_matrix(a: &ArrayD<f64>) -> RevgradResult<ndarray::Array2<f64>> {
    a.view()
        .into_dimensionality::<Ix2>()
        .map(|v| v.to_owned())
        .map_err(|e| RevgradError::Internal(format!("matmul: rank-2 view failed: {}", e)))
}

fn reshaped(a: &ArrayD<f64>, shape: &[usize]) -> RevgradResult<ArrayD<f64>> {
    a.as_standard_layout()
        .to_owned()
        .into_shape(IxDyn(shape))
        .map_err(|e| RevgradError::Internal(format!("matmul: reshape failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn test_reduce_gradient_broadcast_law() {
        // (3,1) + (1,4) broadcast to (3,4): the all-ones output gradient
        // collapses to all-4s at (3,1) and all-3s at (1,4).
        let grad = ArrayD::<f64>::ones(IxDyn(&[3, 4]));
        let left = reduce_gradient(grad.clone(), &[3, 1]);
        assert_eq!(left.shape(), &[3, 1]);
        assert!(left.iter().all(|&v| v == 4.0));

        let right = reduce_gradient(grad, &[1, 4]);
        assert_eq!(right.shape(), &[1, 4]);
        assert!(right.iter().all(|&v| v == 3.0));
    }

    #[test]
    fn test_reduce_gradient_collapses_prepended_axes() {
        let grad = ArrayD::<f64>::ones(IxDyn(&[2, 3, 4]));
        let reduced = reduce_gradient(grad, &[4]);
        assert_eq!(reduced.shape(), &[4]);
        assert!(reduced.iter().all(|&v| v == 6.0));
    }

    #[test]
    fn test_reduce_gradient_idempotent() {
        let grad = ArrayD::<f64>::from_shape_vec(IxDyn(&[2, 2]), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let reduced = reduce_gradient(grad.clone(), &[2, 2]);
        assert_eq!(reduced, grad);
    }

    #[test]
    fn test_broadcast_shape() {
        assert_eq!(broadcast_shape(&[3, 1], &[1, 4]), Some(vec![3, 4]));
        assert_eq!(broadcast_shape(&[2, 3], &[3]), Some(vec![2, 3]));
        assert_eq!(broadcast_shape(&[], &[2, 2]), Some(vec![2, 2]));
        assert_eq!(broadcast_shape(&[2, 3], &[2, 4]), None);
    }

    #[test]
    fn test_matmul_2d() {
        let a = arr2(&[[1.0, 2.0], [3.0, 4.0]]).into_dyn();
        let b = arr2(&[[5.0, 6.0], [7.0, 8.0]]).into_dyn();
        let c = matmul(&a, &b).unwrap();
        assert_eq!(c, arr2(&[[19.0, 22.0], [43.0, 50.0]]).into_dyn());
    }

    #[test]
    fn test_matmul_batched() {
        let a = ArrayD::<f64>::ones(IxDyn(&[2, 3, 4]));
        let b = ArrayD::<f64>::ones(IxDyn(&[2, 4, 5]));
        let c = matmul(&a, &b).unwrap();
        assert_eq!(c.shape(), &[2, 3, 5]);
        assert!(c.iter().all(|&v| v == 4.0));
    }

    #[test]
    fn test_matmul_inner_dim_mismatch() {
        let a = ArrayD::<f64>::ones(IxDyn(&[2, 3]));
        let b = ArrayD::<f64>::ones(IxDyn(&[4, 2]));
        assert!(matmul(&a, &b).is_err());
    }

    #[test]
    fn test_swap_last_axes() {
        let a = arr2(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]).into_dyn();
        let t = swap_last_axes(&a);
        assert_eq!(t.shape(), &[3, 2]);
        assert_eq!(t[[0, 1]], 4.0);
    }
}
