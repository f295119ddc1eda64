//! Shape manipulation kernels.

use super::expect_inputs;
use crate::error::{Result, RuntimeError};
use crate::kernel::Kernel;
use crate::value::Value;
use tessel_graph::Node;

/// Passes its input through unchanged. Works for every element type.
pub struct IdentityKernel;

impl Kernel for IdentityKernel {
    fn name(&self) -> &str {
        "Identity"
    }

    fn compute(&self, _node: &Node, inputs: &[&Value]) -> Result<Vec<Value>> {
        expect_inputs("Identity", inputs, 1)?;
        Ok(vec![inputs[0].clone()])
    }
}

/// Permutes axes according to `perm` (default: reversed).
///
/// Operates on raw element bytes, so any element type is accepted.
pub struct TransposeKernel;

impl Kernel for TransposeKernel {
    fn name(&self) -> &str {
        "Transpose"
    }

    fn compute(&self, node: &Node, inputs: &[&Value]) -> Result<Vec<Value>> {
        expect_inputs("Transpose", inputs, 1)?;
        let input = inputs[0];
        let shape = input.shape();
        let rank = shape.len();

        let perm: Vec<i64> = node
            .attr_or("perm", (0..rank as i64).rev().collect())
            .map_err(|e| RuntimeError::kernel("Transpose", e.to_string()))?;
        let perm = validate_perm(&perm, rank)?;

        let mut in_strides = vec![1usize; rank];
        for i in (0..rank.saturating_sub(1)).rev() {
            in_strides[i] = in_strides[i + 1] * shape[i + 1];
        }
        let out_shape: Vec<usize> = perm.iter().map(|&p| shape[p]).collect();

        let width = input.dtype().size();
        let bytes = input.as_bytes();
        let count = input.len();
        let mut out = Vec::with_capacity(bytes.len());
        for linear in 0..count {
            let mut rem = linear;
            let mut src = 0;
            for axis in (0..rank).rev() {
                let idx = rem % out_shape[axis];
                rem /= out_shape[axis];
                src += idx * in_strides[perm[axis]];
            }
            out.extend_from_slice(&bytes[src * width..(src + 1) * width]);
        }

        Ok(vec![Value::from_raw(out, &out_shape, input.dtype())?])
    }
}

fn validate_perm(perm: &[i64], rank: usize) -> Result<Vec<usize>> {
    let mut seen = vec![false; rank];
    let mut out = Vec::with_capacity(rank);
    if perm.len() != rank {
        return Err(RuntimeError::kernel(
            "Transpose",
            format!("perm {:?} does not match rank {}", perm, rank),
        ));
    }
    for &p in perm {
        let axis = usize::try_from(p).ok().filter(|&a| a < rank && !seen[a]);
        match axis {
            Some(axis) => {
                seen[axis] = true;
                out.push(axis);
            }
            None => {
                return Err(RuntimeError::kernel(
                    "Transpose",
                    format!("invalid perm {:?}", perm),
                ));
            }
        }
    }
    Ok(out)
}
