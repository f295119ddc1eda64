//! Kernels used by synthesized backward graphs.

use super::{expect_inputs, f32_input};
use crate::broadcast::{broadcast_offset, broadcast_shape, broadcast_strides, reduce_to_shape};
use crate::error::{Result, RuntimeError};
use crate::kernel::Kernel;
use crate::value::Value;
use tessel_graph::Node;

/// Variadic elementwise sum with broadcasting. Accumulates gradient
/// contributions.
pub struct SumKernel;

impl Kernel for SumKernel {
    fn name(&self) -> &str {
        "Sum"
    }

    fn compute(&self, _node: &Node, inputs: &[&Value]) -> Result<Vec<Value>> {
        if inputs.is_empty() {
            return Err(RuntimeError::kernel("Sum", "expected at least one input"));
        }

        let mut out_shape = inputs[0].shape().to_vec();
        for input in &inputs[1..] {
            out_shape = broadcast_shape(&out_shape, input.shape())?;
        }

        let count: usize = out_shape.iter().product();
        let mut out = vec![0.0f32; count];
        for input in inputs {
            let data = f32_input("Sum", input)?;
            let strides = broadcast_strides(input.shape(), &out_shape);
            for (i, acc) in out.iter_mut().enumerate() {
                *acc += data[broadcast_offset(i, &out_shape, &strides)];
            }
        }

        Ok(vec![Value::from_vec(out, &out_shape)?])
    }
}

/// Gradient of an elementwise activation: inputs `(dY, T)` where `T` is the
/// forward input for Relu and the forward output for Sigmoid and Tanh.
pub struct ActivationGradKernel {
    name: &'static str,
    derivative: fn(f32) -> f32,
}

impl ActivationGradKernel {
    pub fn relu() -> Self {
        Self {
            name: "ReluGrad",
            derivative: |x| if x > 0.0 { 1.0 } else { 0.0 },
        }
    }

    pub fn sigmoid() -> Self {
        Self {
            name: "SigmoidGrad",
            derivative: |y| y * (1.0 - y),
        }
    }

    pub fn tanh() -> Self {
        Self {
            name: "TanhGrad",
            derivative: |y| 1.0 - y * y,
        }
    }
}

impl Kernel for ActivationGradKernel {
    fn name(&self) -> &str {
        self.name
    }

    fn compute(&self, _node: &Node, inputs: &[&Value]) -> Result<Vec<Value>> {
        expect_inputs(self.name, inputs, 2)?;
        if inputs[0].shape() != inputs[1].shape() {
            return Err(RuntimeError::kernel(
                self.name,
                format!(
                    "gradient shape {:?} differs from {:?}",
                    inputs[0].shape(),
                    inputs[1].shape()
                ),
            ));
        }
        let dy = f32_input(self.name, inputs[0])?;
        let t = f32_input(self.name, inputs[1])?;
        let dx: Vec<f32> = dy
            .iter()
            .zip(&t)
            .map(|(&g, &v)| g * (self.derivative)(v))
            .collect();
        Ok(vec![Value::from_vec(dx, inputs[0].shape())?])
    }
}

/// Inputs `(dY, R)`: sums `dY` down to the shape of `R`, undoing a
/// broadcast in the forward pass.
pub struct ReduceToShapeOfKernel;

impl Kernel for ReduceToShapeOfKernel {
    fn name(&self) -> &str {
        "ReduceToShapeOf"
    }

    fn compute(&self, _node: &Node, inputs: &[&Value]) -> Result<Vec<Value>> {
        expect_inputs("ReduceToShapeOf", inputs, 2)?;
        let (dy, reference) = (inputs[0], inputs[1]);
        if dy.shape() == reference.shape() {
            return Ok(vec![dy.clone()]);
        }
        let data = f32_input("ReduceToShapeOf", dy)?;
        let reduced = reduce_to_shape(&data, dy.shape(), reference.shape())?;
        Ok(vec![Value::from_vec(reduced, reference.shape())?])
    }
}
