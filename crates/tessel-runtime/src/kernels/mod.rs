//! Built-in CPU kernels.
//!
//! # Kernel Families
//!
//! - **Binary elementwise**: Add, Sub, Mul, Div
//! - **Unary elementwise**: Relu, Sigmoid, Tanh, Neg, Exp
//! - **Comparison**: Equal, Greater, Less
//! - **Reduction**: ReduceSum, ReduceMean and their gradients
//!
//! # Individual Kernels
//!
//! - Matrix multiplication (MatMul)
//! - Shape (Transpose, Identity)
//! - Type conversion (Cast)
//! - Gradient helpers (Sum, ReluGrad, SigmoidGrad, TanhGrad, ReduceToShapeOf)

mod binary;
mod cast;
mod comparison;
mod gradient;
mod matmul;
mod reduction;
mod shape;
mod unary;

pub use binary::BinaryElementwiseKernel;
pub use cast::CastKernel;
pub use comparison::ComparisonKernel;
pub use gradient::{ActivationGradKernel, ReduceToShapeOfKernel, SumKernel};
pub use matmul::MatMulKernel;
pub use reduction::{ReductionGradKernel, ReductionKernel};
pub use shape::{IdentityKernel, TransposeKernel};
pub use unary::UnaryElementwiseKernel;

use crate::error::{Result, RuntimeError};
use crate::kernel::KernelRegistry;
use crate::value::Value;
use tessel_graph::DataType;

/// Register every built-in kernel.
pub(crate) fn register_all(registry: &mut KernelRegistry) {
    registry
        .register("Add", BinaryElementwiseKernel::add())
        .register("Sub", BinaryElementwiseKernel::sub())
        .register("Mul", BinaryElementwiseKernel::mul())
        .register("Div", BinaryElementwiseKernel::div());

    registry
        .register("Relu", UnaryElementwiseKernel::relu())
        .register("Sigmoid", UnaryElementwiseKernel::sigmoid())
        .register("Tanh", UnaryElementwiseKernel::tanh())
        .register("Neg", UnaryElementwiseKernel::neg())
        .register("Exp", UnaryElementwiseKernel::exp());

    registry
        .register("Equal", ComparisonKernel::equal())
        .register("Greater", ComparisonKernel::greater())
        .register("Less", ComparisonKernel::less());

    registry
        .register("ReduceSum", ReductionKernel::reduce_sum())
        .register("ReduceMean", ReductionKernel::reduce_mean())
        .register("ReduceSumGrad", ReductionGradKernel::reduce_sum())
        .register("ReduceMeanGrad", ReductionGradKernel::reduce_mean());

    registry
        .register("MatMul", MatMulKernel)
        .register("Transpose", TransposeKernel)
        .register("Identity", IdentityKernel)
        .register("Cast", CastKernel);

    registry
        .register("Sum", SumKernel)
        .register("ReluGrad", ActivationGradKernel::relu())
        .register("SigmoidGrad", ActivationGradKernel::sigmoid())
        .register("TanhGrad", ActivationGradKernel::tanh())
        .register("ReduceToShapeOf", ReduceToShapeOfKernel);
}

/// Check the input count of a node.
fn expect_inputs(op: &str, inputs: &[&Value], count: usize) -> Result<()> {
    if inputs.len() != count {
        return Err(RuntimeError::kernel(
            op,
            format!("expected {} inputs, got {}", count, inputs.len()),
        ));
    }
    Ok(())
}

/// Read a float32 input.
fn f32_input(op: &str, value: &Value) -> Result<Vec<f32>> {
    if value.dtype() != DataType::F32 {
        return Err(RuntimeError::kernel(
            op,
            format!("expected float32 input, got {}", value.dtype()),
        ));
    }
    value.to_vec::<f32>()
}

/// Normalize possibly negative axes against a rank.
fn normalize_axes(op: &str, axes: &[i64], rank: usize) -> Result<Vec<usize>> {
    let mut normalized = Vec::with_capacity(axes.len());
    for &axis in axes {
        let resolved = if axis < 0 { axis + rank as i64 } else { axis };
        if resolved < 0 || resolved >= rank as i64 {
            return Err(RuntimeError::kernel(
                op,
                format!("axis {} out of range for rank {}", axis, rank),
            ));
        }
        let resolved = resolved as usize;
        if !normalized.contains(&resolved) {
            normalized.push(resolved);
        }
    }
    normalized.sort_unstable();
    Ok(normalized)
}
