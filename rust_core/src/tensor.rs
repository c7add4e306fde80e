use ndarray::{ArrayD, Axis, IxDyn};

use crate::error::{McmcError, Result};

/// Dense tensor of doubles. Scalars are zero-dimensional arrays.
pub type Tensor = ArrayD<f64>;

pub fn scalar(value: f64) -> Tensor {
    ArrayD::from_elem(IxDyn(&[]), value)
}

pub fn filled(shape: &[usize], value: f64) -> Tensor {
    ArrayD::from_elem(IxDyn(shape), value)
}

pub fn from_vec(shape: &[usize], values: Vec<f64>) -> Result<Tensor> {
    ArrayD::from_shape_vec(IxDyn(shape), values).map_err(|e| {
        McmcError::ShapeMismatch(format!("cannot build tensor of shape {:?}: {}", shape, e))
    })
}

/// Resulting shape of broadcasting `a` against `b`, numpy rules.
pub fn broadcast_shape(a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    let ndim = a.len().max(b.len());
    let mut result = vec![0usize; ndim];

    for i in 0..ndim {
        let d1 = if i < ndim - a.len() { 1 } else { a[i - (ndim - a.len())] };
        let d2 = if i < ndim - b.len() { 1 } else { b[i - (ndim - b.len())] };

        result[i] = if d1 == d2 || d2 == 1 {
            d1
        } else if d1 == 1 {
            d2
        } else {
            return Err(McmcError::ShapeMismatch(format!(
                "shapes {:?} and {:?} cannot be broadcast",
                a, b
            )));
        };
    }

    Ok(result)
}

/// Whether `from` can be broadcast up to exactly `to`.
pub fn broadcasts_to(from: &[usize], to: &[usize]) -> bool {
    matches!(broadcast_shape(from, to), Ok(ref s) if s.as_slice() == to)
}

/// Sum-reduce an adjoint over every broadcast dimension so that it lines up
/// with an operand of `shape`.
///
/// Leading dimensions the operand does not have are summed away; dimensions
/// where the operand has size 1 are summed and kept.
pub fn sum_to(tensor: &Tensor, shape: &[usize]) -> Tensor {
    if tensor.shape() == shape {
        return tensor.clone();
    }
    debug_assert!(tensor.ndim() >= shape.len());

    let mut out = tensor.clone();
    let leading = out.ndim().saturating_sub(shape.len());
    for _ in 0..leading {
        out = out.sum_axis(Axis(0));
    }
    for (axis, &dim) in shape.iter().enumerate() {
        if dim == 1 && out.shape()[axis] != 1 {
            out = out.sum_axis(Axis(axis)).insert_axis(Axis(axis));
        }
    }
    out
}

/// Broadcast `tensor` into `shape`, materialising the result.
pub fn broadcast_to(tensor: &Tensor, shape: &[usize]) -> Result<Tensor> {
    tensor
        .broadcast(IxDyn(shape))
        .map(|view| view.to_owned())
        .ok_or_else(|| {
            McmcError::ShapeMismatch(format!(
                "cannot broadcast {:?} into {:?}",
                tensor.shape(),
                shape
            ))
        })
}

/// Number of elements a tensor of `shape` holds.
pub fn element_count(shape: &[usize]) -> usize {
    shape.iter().product()
}
