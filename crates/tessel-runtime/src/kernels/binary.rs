//! Binary elementwise kernel family.
//!
//! Covers: Add, Sub, Mul, Div

use super::{expect_inputs, f32_input};
use crate::broadcast::{broadcast_offset, broadcast_shape, broadcast_strides};
use crate::error::Result;
use crate::kernel::Kernel;
use crate::value::Value;
use tessel_graph::Node;

/// Binary elementwise kernel family.
///
/// All members broadcast NumPy-style and differ only in the scalar function.
pub struct BinaryElementwiseKernel {
    name: &'static str,
    op: fn(f32, f32) -> f32,
}

impl BinaryElementwiseKernel {
    pub fn add() -> Self {
        Self {
            name: "Add",
            op: |a, b| a + b,
        }
    }

    pub fn sub() -> Self {
        Self {
            name: "Sub",
            op: |a, b| a - b,
        }
    }

    pub fn mul() -> Self {
        Self {
            name: "Mul",
            op: |a, b| a * b,
        }
    }

    pub fn div() -> Self {
        Self {
            name: "Div",
            op: |a, b| a / b,
        }
    }
}

impl Kernel for BinaryElementwiseKernel {
    fn name(&self) -> &str {
        self.name
    }

    fn compute(&self, _node: &Node, inputs: &[&Value]) -> Result<Vec<Value>> {
        expect_inputs(self.name, inputs, 2)?;
        let (a, b) = (inputs[0], inputs[1]);
        let lhs = f32_input(self.name, a)?;
        let rhs = f32_input(self.name, b)?;

        let out_shape = broadcast_shape(a.shape(), b.shape())?;
        let sa = broadcast_strides(a.shape(), &out_shape);
        let sb = broadcast_strides(b.shape(), &out_shape);
        let count: usize = out_shape.iter().product();

        let out: Vec<f32> = (0..count)
            .map(|i| {
                (self.op)(
                    lhs[broadcast_offset(i, &out_shape, &sa)],
                    rhs[broadcast_offset(i, &out_shape, &sb)],
                )
            })
            .collect();

        Ok(vec![Value::from_vec(out, &out_shape)?])
    }
}
