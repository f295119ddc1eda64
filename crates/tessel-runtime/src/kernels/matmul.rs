//! Matrix multiplication.

use super::{expect_inputs, f32_input};
use crate::error::{Result, RuntimeError};
use crate::kernel::Kernel;
use crate::value::Value;
use tessel_graph::Node;

/// `[M, K] x [K, N] -> [M, N]` in float32.
pub struct MatMulKernel;

impl Kernel for MatMulKernel {
    fn name(&self) -> &str {
        "MatMul"
    }

    fn compute(&self, _node: &Node, inputs: &[&Value]) -> Result<Vec<Value>> {
        expect_inputs("MatMul", inputs, 2)?;
        let (a_shape, b_shape) = (inputs[0].shape(), inputs[1].shape());
        let (m, k, n) = match (a_shape, b_shape) {
            ([m, k], [k2, n]) if k == k2 => (*m, *k, *n),
            _ => {
                return Err(RuntimeError::kernel(
                    "MatMul",
                    format!("cannot multiply {:?} by {:?}", a_shape, b_shape),
                ));
            }
        };

        let a = f32_input("MatMul", inputs[0])?;
        let b = f32_input("MatMul", inputs[1])?;
        let mut out = vec![0.0f32; m * n];
        for i in 0..m {
            for p in 0..k {
                let lhs = a[i * k + p];
                for j in 0..n {
                    out[i * n + j] += lhs * b[p * n + j];
                }
            }
        }

        Ok(vec![Value::from_vec(out, &[m, n])?])
    }
}
