//! Broadcasting helpers for elementwise kernels and their gradients.

use crate::error::{Result, RuntimeError};

/// Compute NumPy-style broadcast output shape from two input shapes.
///
/// Shapes are aligned from the rightmost dimension; dimensions match if they
/// are equal or one of them is 1.
///
/// ```text
/// broadcast_shape(&[2, 3, 4], &[3, 4])       -> [2, 3, 4]
/// broadcast_shape(&[8, 1, 6, 1], &[7, 1, 5]) -> [8, 7, 6, 5]
/// ```
pub fn broadcast_shape(a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    let max_rank = a.len().max(b.len());
    let mut result = Vec::with_capacity(max_rank);

    for i in 0..max_rank {
        let da = if i < max_rank - a.len() {
            1
        } else {
            a[i - (max_rank - a.len())]
        };
        let db = if i < max_rank - b.len() {
            1
        } else {
            b[i - (max_rank - b.len())]
        };

        if da == db {
            result.push(da);
        } else if da == 1 {
            result.push(db);
        } else if db == 1 {
            result.push(da);
        } else {
            return Err(RuntimeError::ExecutionError(format!(
                "Cannot broadcast shapes {:?} and {:?} at dimension {i}",
                a, b
            )));
        }
    }

    Ok(result)
}

/// Strides for reading a tensor of `shape` while iterating over `out_shape`.
///
/// Broadcast (size 1 or missing) dimensions get stride 0.
pub fn broadcast_strides(shape: &[usize], out_shape: &[usize]) -> Vec<usize> {
    let offset = out_shape.len() - shape.len();
    let mut strides = vec![0; out_shape.len()];
    let mut stride = 1;
    for i in (0..shape.len()).rev() {
        if shape[i] != 1 {
            strides[i + offset] = stride;
        }
        stride *= shape[i];
    }
    strides
}

/// Map a linear index over `out_shape` to an element offset using `strides`.
pub fn broadcast_offset(mut linear: usize, out_shape: &[usize], strides: &[usize]) -> usize {
    let mut offset = 0;
    for (&dim, &stride) in out_shape.iter().zip(strides).rev() {
        offset += (linear % dim) * stride;
        linear /= dim;
    }
    offset
}

/// Sum `data` of shape `from` down to `to`, undoing a broadcast.
///
/// `to` must broadcast to `from`.
pub fn reduce_to_shape(data: &[f32], from: &[usize], to: &[usize]) -> Result<Vec<f32>> {
    if to.len() > from.len() || broadcast_shape(to, from)? != from {
        return Err(RuntimeError::ExecutionError(format!(
            "Shape {:?} does not broadcast to {:?}",
            to, from
        )));
    }

    let strides = broadcast_strides(to, from);
    let mut out = vec![0.0f32; to.iter().product()];
    for (i, &v) in data.iter().enumerate() {
        out[broadcast_offset(i, from, &strides)] += v;
    }
    Ok(out)
}
