//! Per-operator gradient rules.
//!
//! A [`GradientRule`] emits the backward nodes of one forward node into the
//! training graph under construction. Rules are looked up by operator type
//! in a [`GradientRegistry`], the same way kernels are looked up at
//! execution time.

mod rules;

pub use rules::{
    ActivationRule, BroadcastBinaryRule, CastRule, ExpRule, IdentityRule, MatMulRule, NegRule,
    ReductionRule, TransposeRule,
};

use crate::error::{Result, TrainingError};
use std::collections::HashMap;
use tessel_graph::{DataType, Graph, Node, TensorInfo, TensorKind, TensorShape};

/// Gradient definition for one operator type.
///
/// `grad_output` names the gradient of the node's (single) output.
/// `targets[i]` is the tensor the gradient of input `i` must be written to,
/// or `None` when that input needs no gradient. Every `Some` target must be
/// produced by exactly one emitted node.
pub trait GradientRule: Send + Sync {
    fn name(&self) -> &str;

    fn emit(
        &self,
        ctx: &mut GradientContext<'_>,
        node: &Node,
        grad_output: &str,
        targets: &[Option<String>],
    ) -> Result<()>;
}

/// Access to the training graph while a rule emits nodes.
pub struct GradientContext<'a> {
    graph: &'a mut Graph,
    prefix: String,
    emitted: usize,
}

impl<'a> GradientContext<'a> {
    pub(crate) fn new(graph: &'a mut Graph, node: &Node, node_id: usize) -> Self {
        let prefix = if node.name.is_empty() {
            format!("{}_{}", node.op_type, node_id)
        } else {
            node.name.clone()
        };
        Self {
            graph,
            prefix,
            emitted: 0,
        }
    }

    /// Declare a fresh float intermediate and return its name.
    pub fn temp(&mut self, hint: &str) -> String {
        let mut name = format!("{}_{}", self.prefix, hint);
        let mut suffix = 1;
        while self.graph.has_tensor(&name) {
            name = format!("{}_{}_{}", self.prefix, hint, suffix);
            suffix += 1;
        }
        self.graph.add_tensor(TensorInfo::new(
            name.clone(),
            DataType::F32,
            TensorShape::Unknown,
            TensorKind::Intermediate,
        ));
        name
    }

    /// Add a backward node, naming it after the forward node if unnamed.
    pub fn emit(&mut self, mut node: Node) {
        if node.name.is_empty() {
            node.name = format!("{}_grad_{}", self.prefix, self.emitted);
        }
        self.emitted += 1;
        self.graph.add_node(node);
    }

    /// Shorthand for a single-output node without attributes.
    pub fn emit_op(&mut self, op_type: &str, inputs: &[&str], output: &str) {
        self.emit(
            Node::new(op_type)
                .with_inputs(inputs.iter().copied())
                .with_outputs([output]),
        );
    }

    /// Static shape of a tensor, when the specialized graph knows it.
    pub fn static_shape(&self, name: &str) -> Option<&[usize]> {
        self.graph
            .tensor_by_name(name)
            .ok()
            .and_then(|info| info.shape.as_static())
    }

    /// Write `grad` reduced to the shape of `input` into `target`.
    ///
    /// When `input` and `output` are known to share a static shape no
    /// reduction is needed and the gradient is forwarded unchanged.
    pub fn reduce_into(&mut self, grad: &str, input: &str, output: &str, target: &str) {
        let same = matches!(
            (self.static_shape(input), self.static_shape(output)),
            (Some(a), Some(b)) if a == b
        );
        if same {
            self.emit_op("Identity", &[grad], target);
        } else {
            self.emit_op("ReduceToShapeOf", &[grad, input], target);
        }
    }
}

/// Registry mapping operator types to gradient rules.
pub struct GradientRegistry {
    rules: HashMap<String, Box<dyn GradientRule>>,
}

impl GradientRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    /// Create a registry with a rule for every differentiable built-in
    /// operator.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .register("Add", BroadcastBinaryRule::add())
            .register("Sub", BroadcastBinaryRule::sub())
            .register("Mul", BroadcastBinaryRule::mul())
            .register("Div", BroadcastBinaryRule::div())
            .register("MatMul", MatMulRule)
            .register("Relu", ActivationRule::relu())
            .register("Sigmoid", ActivationRule::sigmoid())
            .register("Tanh", ActivationRule::tanh())
            .register("Neg", NegRule)
            .register("Exp", ExpRule)
            .register("Identity", IdentityRule)
            .register("ReduceSum", ReductionRule::reduce_sum())
            .register("ReduceMean", ReductionRule::reduce_mean())
            .register("Transpose", TransposeRule)
            .register("Cast", CastRule);
        registry
    }

    /// Register a rule. Returns `self` for chaining.
    pub fn register<R>(&mut self, op_type: &str, rule: R) -> &mut Self
    where
        R: GradientRule + 'static,
    {
        self.rules.insert(op_type.to_string(), Box::new(rule));
        self
    }

    pub fn get(&self, op_type: &str) -> Option<&dyn GradientRule> {
        self.rules.get(op_type).map(|rule| rule.as_ref())
    }

    /// Look up a rule, failing with a build error that names the node.
    pub(crate) fn require(&self, node: &Node) -> Result<&dyn GradientRule> {
        self.get(&node.op_type).ok_or_else(|| {
            TrainingError::build(format!(
                "no gradient rule for operator '{}' (node '{}')",
                node.op_type,
                node.display_name()
            ))
        })
    }

    pub fn contains(&self, op_type: &str) -> bool {
        self.rules.contains_key(op_type)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn op_types(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(|s| s.as_str())
    }
}

impl Default for GradientRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for GradientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.op_types().collect();
        names.sort_unstable();
        f.debug_struct("GradientRegistry")
            .field("rules", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_differentiable_ops() {
        let registry = GradientRegistry::with_defaults();
        for op in [
            "Add", "Sub", "Mul", "Div", "MatMul", "Relu", "Sigmoid", "Tanh", "Neg", "Exp",
            "Identity", "ReduceSum", "ReduceMean", "Transpose", "Cast",
        ] {
            assert!(registry.contains(op), "missing rule for {}", op);
        }
        assert_eq!(registry.len(), 15);
        assert!(!registry.contains("Greater"));
    }

    #[test]
    fn test_require_names_node() {
        let registry = GradientRegistry::new();
        assert!(registry.is_empty());
        let node = Node::new("Greater").with_name("cmp");
        let err = registry.require(&node).err().map(|e| e.to_string());
        assert!(err.is_some_and(|msg| msg.contains("'cmp'")));
    }

    #[test]
    fn test_temp_names_are_unique() {
        let mut graph = Graph::new();
        let node = Node::new("Mul").with_name("scale");
        let mut ctx = GradientContext::new(&mut graph, &node, 0);
        let a = ctx.temp("dy_b");
        let b = ctx.temp("dy_b");
        assert_ne!(a, b);
        assert!(graph.has_tensor(&a) && graph.has_tensor(&b));
    }
}
