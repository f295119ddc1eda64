//! Gradient rules for the built-in operators.

use super::{GradientContext, GradientRule};
use crate::error::{Result, TrainingError};
use tessel_graph::{AttributeValue, DataType, Node};

fn operand<'n>(node: &'n Node, index: usize) -> Result<&'n str> {
    node.inputs
        .get(index)
        .map(String::as_str)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| {
            TrainingError::build(format!(
                "node '{}' is missing input {}",
                node.display_name(),
                index
            ))
        })
}

fn result(node: &Node) -> Result<&str> {
    node.outputs.first().map(String::as_str).ok_or_else(|| {
        TrainingError::build(format!("node '{}' has no output", node.display_name()))
    })
}

fn target(targets: &[Option<String>], index: usize) -> Option<&str> {
    targets.get(index).and_then(|t| t.as_deref())
}

#[derive(Debug, Clone, Copy)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Broadcasting elementwise arithmetic. Each operand gradient is reduced
/// back to that operand's shape.
pub struct BroadcastBinaryRule {
    op: BinaryOp,
}

impl BroadcastBinaryRule {
    pub fn add() -> Self {
        Self { op: BinaryOp::Add }
    }

    pub fn sub() -> Self {
        Self { op: BinaryOp::Sub }
    }

    pub fn mul() -> Self {
        Self { op: BinaryOp::Mul }
    }

    pub fn div() -> Self {
        Self { op: BinaryOp::Div }
    }
}

impl GradientRule for BroadcastBinaryRule {
    fn name(&self) -> &str {
        match self.op {
            BinaryOp::Add => "Add",
            BinaryOp::Sub => "Sub",
            BinaryOp::Mul => "Mul",
            BinaryOp::Div => "Div",
        }
    }

    fn emit(
        &self,
        ctx: &mut GradientContext<'_>,
        node: &Node,
        dy: &str,
        targets: &[Option<String>],
    ) -> Result<()> {
        let a = operand(node, 0)?;
        let b = operand(node, 1)?;
        let y = result(node)?;

        if let Some(da) = target(targets, 0) {
            let full = match self.op {
                BinaryOp::Add | BinaryOp::Sub => dy.to_string(),
                BinaryOp::Mul => {
                    let t = ctx.temp("dy_mul_b");
                    ctx.emit_op("Mul", &[dy, b], &t);
                    t
                }
                BinaryOp::Div => {
                    let t = ctx.temp("dy_div_b");
                    ctx.emit_op("Div", &[dy, b], &t);
                    t
                }
            };
            ctx.reduce_into(&full, a, y, da);
        }

        if let Some(db) = target(targets, 1) {
            let full = match self.op {
                BinaryOp::Add => dy.to_string(),
                BinaryOp::Sub => {
                    let t = ctx.temp("neg_dy");
                    ctx.emit_op("Neg", &[dy], &t);
                    t
                }
                BinaryOp::Mul => {
                    let t = ctx.temp("dy_mul_a");
                    ctx.emit_op("Mul", &[dy, a], &t);
                    t
                }
                BinaryOp::Div => {
                    // d(a / b) / db = -y / b
                    let scaled = ctx.temp("dy_mul_y");
                    ctx.emit_op("Mul", &[dy, y], &scaled);
                    let quotient = ctx.temp("dy_mul_y_div_b");
                    ctx.emit_op("Div", &[&scaled, b], &quotient);
                    let t = ctx.temp("neg_dy_mul_y_div_b");
                    ctx.emit_op("Neg", &[&quotient], &t);
                    t
                }
            };
            ctx.reduce_into(&full, b, y, db);
        }
        Ok(())
    }
}

/// `Y = A @ B` for 2-D operands.
pub struct MatMulRule;

impl GradientRule for MatMulRule {
    fn name(&self) -> &str {
        "MatMul"
    }

    fn emit(
        &self,
        ctx: &mut GradientContext<'_>,
        node: &Node,
        dy: &str,
        targets: &[Option<String>],
    ) -> Result<()> {
        let a = operand(node, 0)?;
        let b = operand(node, 1)?;

        if let Some(da) = target(targets, 0) {
            let bt = ctx.temp("b_t");
            ctx.emit_op("Transpose", &[b], &bt);
            ctx.emit_op("MatMul", &[dy, &bt], da);
        }
        if let Some(db) = target(targets, 1) {
            let at = ctx.temp("a_t");
            ctx.emit_op("Transpose", &[a], &at);
            ctx.emit_op("MatMul", &[&at, dy], db);
        }
        Ok(())
    }
}

/// Relu, Sigmoid and Tanh through their dedicated gradient kernels.
///
/// Relu's derivative is taken from the forward input; Sigmoid's and Tanh's
/// from the forward output.
pub struct ActivationRule {
    name: &'static str,
    grad_op: &'static str,
    uses_output: bool,
}

impl ActivationRule {
    pub fn relu() -> Self {
        Self {
            name: "Relu",
            grad_op: "ReluGrad",
            uses_output: false,
        }
    }

    pub fn sigmoid() -> Self {
        Self {
            name: "Sigmoid",
            grad_op: "SigmoidGrad",
            uses_output: true,
        }
    }

    pub fn tanh() -> Self {
        Self {
            name: "Tanh",
            grad_op: "TanhGrad",
            uses_output: true,
        }
    }
}

impl GradientRule for ActivationRule {
    fn name(&self) -> &str {
        self.name
    }

    fn emit(
        &self,
        ctx: &mut GradientContext<'_>,
        node: &Node,
        dy: &str,
        targets: &[Option<String>],
    ) -> Result<()> {
        if let Some(dx) = target(targets, 0) {
            let saved = if self.uses_output {
                result(node)?
            } else {
                operand(node, 0)?
            };
            ctx.emit_op(self.grad_op, &[dy, saved], dx);
        }
        Ok(())
    }
}

pub struct NegRule;

impl GradientRule for NegRule {
    fn name(&self) -> &str {
        "Neg"
    }

    fn emit(
        &self,
        ctx: &mut GradientContext<'_>,
        _node: &Node,
        dy: &str,
        targets: &[Option<String>],
    ) -> Result<()> {
        if let Some(dx) = target(targets, 0) {
            ctx.emit_op("Neg", &[dy], dx);
        }
        Ok(())
    }
}

/// `d exp(x) = exp(x) dx`, reusing the forward output.
pub struct ExpRule;

impl GradientRule for ExpRule {
    fn name(&self) -> &str {
        "Exp"
    }

    fn emit(
        &self,
        ctx: &mut GradientContext<'_>,
        node: &Node,
        dy: &str,
        targets: &[Option<String>],
    ) -> Result<()> {
        if let Some(dx) = target(targets, 0) {
            ctx.emit_op("Mul", &[dy, result(node)?], dx);
        }
        Ok(())
    }
}

pub struct IdentityRule;

impl GradientRule for IdentityRule {
    fn name(&self) -> &str {
        "Identity"
    }

    fn emit(
        &self,
        ctx: &mut GradientContext<'_>,
        _node: &Node,
        dy: &str,
        targets: &[Option<String>],
    ) -> Result<()> {
        if let Some(dx) = target(targets, 0) {
            ctx.emit_op("Identity", &[dy], dx);
        }
        Ok(())
    }
}

/// ReduceSum / ReduceMean: broadcast the gradient back over the reduced
/// axes. The forward node's `axes` and `keepdims` are carried over.
pub struct ReductionRule {
    name: &'static str,
    grad_op: &'static str,
}

impl ReductionRule {
    pub fn reduce_sum() -> Self {
        Self {
            name: "ReduceSum",
            grad_op: "ReduceSumGrad",
        }
    }

    pub fn reduce_mean() -> Self {
        Self {
            name: "ReduceMean",
            grad_op: "ReduceMeanGrad",
        }
    }
}

impl GradientRule for ReductionRule {
    fn name(&self) -> &str {
        self.name
    }

    fn emit(
        &self,
        ctx: &mut GradientContext<'_>,
        node: &Node,
        dy: &str,
        targets: &[Option<String>],
    ) -> Result<()> {
        if let Some(dx) = target(targets, 0) {
            let x = operand(node, 0)?;
            let mut grad = Node::new(self.grad_op)
                .with_inputs([dy, x])
                .with_outputs([dx]);
            grad.attributes = node.attributes.clone();
            ctx.emit(grad);
        }
        Ok(())
    }
}

/// Transposes the gradient back with the inverse permutation.
pub struct TransposeRule;

impl GradientRule for TransposeRule {
    fn name(&self) -> &str {
        "Transpose"
    }

    fn emit(
        &self,
        ctx: &mut GradientContext<'_>,
        node: &Node,
        dy: &str,
        targets: &[Option<String>],
    ) -> Result<()> {
        let Some(dx) = target(targets, 0) else {
            return Ok(());
        };

        let mut grad = Node::new("Transpose").with_inputs([dy]).with_outputs([dx]);
        // The default (reversed axes) is its own inverse.
        if node.has_attr("perm") {
            let perm: Vec<i64> = node.attr("perm")?;
            let mut inverse = vec![0i64; perm.len()];
            for (i, &p) in perm.iter().enumerate() {
                let slot = usize::try_from(p)
                    .ok()
                    .and_then(|p| inverse.get_mut(p))
                    .ok_or_else(|| {
                        TrainingError::build(format!(
                            "invalid perm {:?} on node '{}'",
                            perm,
                            node.display_name()
                        ))
                    })?;
                *slot = i as i64;
            }
            grad = grad.with_attr("perm", AttributeValue::Ints(inverse));
        }
        ctx.emit(grad);
        Ok(())
    }
}

/// Float-to-float casts pass the gradient through as float32.
pub struct CastRule;

impl GradientRule for CastRule {
    fn name(&self) -> &str {
        "Cast"
    }

    fn emit(
        &self,
        ctx: &mut GradientContext<'_>,
        _node: &Node,
        dy: &str,
        targets: &[Option<String>],
    ) -> Result<()> {
        if let Some(dx) = target(targets, 0) {
            ctx.emit(
                Node::new("Cast")
                    .with_inputs([dy])
                    .with_outputs([dx])
                    .with_attr(
                        "to",
                        AttributeValue::Int(i64::from(DataType::F32.onnx_code())),
                    ),
            );
        }
        Ok(())
    }
}
