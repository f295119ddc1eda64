//! Comparison kernel family.
//!
//! Covers: Equal, Greater, Less. Outputs are Bool, one byte per element.

use super::{expect_inputs, f32_input};
use crate::broadcast::{broadcast_offset, broadcast_shape, broadcast_strides};
use crate::error::Result;
use crate::kernel::Kernel;
use crate::value::Value;
use tessel_graph::Node;

pub struct ComparisonKernel {
    name: &'static str,
    op: fn(f32, f32) -> bool,
}

impl ComparisonKernel {
    pub fn equal() -> Self {
        Self {
            name: "Equal",
            op: |a, b| a == b,
        }
    }

    pub fn greater() -> Self {
        Self {
            name: "Greater",
            op: |a, b| a > b,
        }
    }

    pub fn less() -> Self {
        Self {
            name: "Less",
            op: |a, b| a < b,
        }
    }
}

impl Kernel for ComparisonKernel {
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

        let out: Vec<bool> = (0..count)
            .map(|i| {
                (self.op)(
                    lhs[broadcast_offset(i, &out_shape, &sa)],
                    rhs[broadcast_offset(i, &out_shape, &sb)],
                )
            })
            .collect();

        Ok(vec![Value::from_bools(&out, &out_shape)?])
    }
}
