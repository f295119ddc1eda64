//! Unary elementwise kernel family.
//!
//! Covers: Relu, Sigmoid, Tanh, Neg, Exp

use super::{expect_inputs, f32_input};
use crate::error::Result;
use crate::kernel::Kernel;
use crate::value::Value;
use tessel_graph::Node;

pub struct UnaryElementwiseKernel {
    name: &'static str,
    op: fn(f32) -> f32,
}

impl UnaryElementwiseKernel {
    pub fn relu() -> Self {
        Self {
            name: "Relu",
            op: |x| x.max(0.0),
        }
    }

    pub fn sigmoid() -> Self {
        Self {
            name: "Sigmoid",
            op: |x| 1.0 / (1.0 + (-x).exp()),
        }
    }

    pub fn tanh() -> Self {
        Self {
            name: "Tanh",
            op: f32::tanh,
        }
    }

    pub fn neg() -> Self {
        Self {
            name: "Neg",
            op: |x| -x,
        }
    }

    pub fn exp() -> Self {
        Self {
            name: "Exp",
            op: f32::exp,
        }
    }
}

impl Kernel for UnaryElementwiseKernel {
    fn name(&self) -> &str {
        self.name
    }

    fn compute(&self, _node: &Node, inputs: &[&Value]) -> Result<Vec<Value>> {
        expect_inputs(self.name, inputs, 1)?;
        let x = f32_input(self.name, inputs[0])?;
        let y: Vec<f32> = x.into_iter().map(self.op).collect();
        Ok(vec![Value::from_vec(y, inputs[0].shape())?])
    }
}
