//! Reduction kernel family.
//!
//! Covers: ReduceSum, ReduceMean, and the gradient kernels that spread an
//! upstream gradient back over the reduced axes.
//!
//! Attributes: `axes` (ints, default all axes) and `keepdims` (int, default 1).

use super::{expect_inputs, f32_input, normalize_axes};
use crate::broadcast::{broadcast_offset, broadcast_strides};
use crate::error::{Result, RuntimeError};
use crate::kernel::Kernel;
use crate::value::Value;
use tessel_graph::Node;

/// Reduced axes and the input shape with those axes set to 1.
struct ReductionLayout {
    keep_shape: Vec<usize>,
    out_shape: Vec<usize>,
    reduced: usize,
}

fn reduction_layout(op: &str, node: &Node, shape: &[usize]) -> Result<ReductionLayout> {
    let axes: Vec<i64> = node
        .attr_or("axes", Vec::new())
        .map_err(|e| RuntimeError::kernel(op, e.to_string()))?;
    let keepdims: i64 = node
        .attr_or("keepdims", 1)
        .map_err(|e| RuntimeError::kernel(op, e.to_string()))?;

    let axes = if axes.is_empty() {
        (0..shape.len()).collect()
    } else {
        normalize_axes(op, &axes, shape.len())?
    };

    let mut keep_shape = shape.to_vec();
    let mut reduced = 1;
    for &axis in &axes {
        reduced *= shape[axis];
        keep_shape[axis] = 1;
    }

    let out_shape = if keepdims != 0 {
        keep_shape.clone()
    } else {
        shape
            .iter()
            .enumerate()
            .filter(|(i, _)| !axes.contains(i))
            .map(|(_, &d)| d)
            .collect()
    };

    Ok(ReductionLayout {
        keep_shape,
        out_shape,
        reduced,
    })
}

pub struct ReductionKernel {
    name: &'static str,
    mean: bool,
}

impl ReductionKernel {
    pub fn reduce_sum() -> Self {
        Self {
            name: "ReduceSum",
            mean: false,
        }
    }

    pub fn reduce_mean() -> Self {
        Self {
            name: "ReduceMean",
            mean: true,
        }
    }
}

impl Kernel for ReductionKernel {
    fn name(&self) -> &str {
        self.name
    }

    fn compute(&self, node: &Node, inputs: &[&Value]) -> Result<Vec<Value>> {
        expect_inputs(self.name, inputs, 1)?;
        let shape = inputs[0].shape();
        let x = f32_input(self.name, inputs[0])?;
        let layout = reduction_layout(self.name, node, shape)?;

        let strides = broadcast_strides(&layout.keep_shape, shape);
        let mut out = vec![0.0f32; layout.keep_shape.iter().product()];
        for (i, &v) in x.iter().enumerate() {
            out[broadcast_offset(i, shape, &strides)] += v;
        }
        if self.mean {
            let scale = 1.0 / layout.reduced as f32;
            out.iter_mut().for_each(|v| *v *= scale);
        }

        Ok(vec![Value::from_vec(out, &layout.out_shape)?])
    }
}

/// Gradient of a reduction: inputs `(dY, X)`, output shaped like `X`.
pub struct ReductionGradKernel {
    name: &'static str,
    mean: bool,
}

impl ReductionGradKernel {
    pub fn reduce_sum() -> Self {
        Self {
            name: "ReduceSumGrad",
            mean: false,
        }
    }

    pub fn reduce_mean() -> Self {
        Self {
            name: "ReduceMeanGrad",
            mean: true,
        }
    }
}

impl Kernel for ReductionGradKernel {
    fn name(&self) -> &str {
        self.name
    }

    fn compute(&self, node: &Node, inputs: &[&Value]) -> Result<Vec<Value>> {
        expect_inputs(self.name, inputs, 2)?;
        let dy = f32_input(self.name, inputs[0])?;
        let shape = inputs[1].shape();
        let layout = reduction_layout(self.name, node, shape)?;

        if dy.len() != layout.keep_shape.iter().product::<usize>() {
            return Err(RuntimeError::kernel(
                self.name,
                format!(
                    "gradient shape {:?} does not match reduced shape {:?}",
                    inputs[0].shape(),
                    layout.out_shape
                ),
            ));
        }

        let scale = if self.mean {
            1.0 / layout.reduced as f32
        } else {
            1.0
        };
        let strides = broadcast_strides(&layout.keep_shape, shape);
        let count: usize = shape.iter().product();
        let out: Vec<f32> = (0..count)
            .map(|i| dy[broadcast_offset(i, shape, &strides)] * scale)
            .collect();

        Ok(vec![Value::from_vec(out, shape)?])
    }
}
