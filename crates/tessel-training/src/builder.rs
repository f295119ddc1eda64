//! Synthesis of combined forward and backward training graphs.
//!
//! The training graph keeps every forward node, feeds the gradients of the
//! differentiable outputs at a yield node, and appends the backward nodes
//! produced by the gradient rules in reverse topological order.

use crate::error::{Result, TrainingError};
use crate::gradient::{GradientContext, GradientRegistry};
use crate::specialize::specialize;
use std::collections::{HashMap, HashSet};
use tessel_graph::{
    AttributeValue, DataType, Graph, Node, NodeId, TensorInfo, TensorKind, to_bytes,
};
use tessel_runtime::{YIELD_GRAD_INDICES, YIELD_OP};

/// Concrete shapes of the user inputs, in graph input order.
pub type ShapeSignature = Vec<Vec<usize>>;

/// Name of the gradient of `tensor`.
pub fn grad_name(tensor: &str) -> String {
    format!("{}_grad", tensor)
}

/// Which tensors of the forward graph need gradients.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GradientBuilderConfig {
    pub initializer_names_to_train: Vec<String>,
    pub input_names_require_grad: Vec<String>,
}

impl GradientBuilderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_trainable<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.initializer_names_to_train = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_require_grad<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_names_require_grad = names.into_iter().map(Into::into).collect();
        self
    }
}

/// Description of a built training graph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphMetadata {
    /// Inputs supplied by the caller, in order.
    pub user_input_names: Vec<String>,
    /// Forward-graph initializers, in declaration order. All of them are
    /// optional inputs of the training graph.
    pub initializer_names: Vec<String>,
    /// User inputs whose gradients the training graph outputs.
    pub input_names_require_grad: Vec<String>,
    /// Initializers whose gradients the training graph outputs.
    pub trainable_initializer_names: Vec<String>,
    /// Forward outputs, in order.
    pub output_names: Vec<String>,
    /// Gradients fed at the yield point, one per differentiable output.
    pub backward_output_grad_names: Vec<String>,
    /// Training graph outputs: input gradients, then initializer gradients.
    pub gradient_output_names: Vec<String>,
}

struct BuiltGraph {
    graph: Graph,
    info: GraphMetadata,
    signature: ShapeSignature,
}

/// Builds training graphs for one forward graph.
#[derive(Default)]
pub struct GradientGraphBuilder {
    registry: GradientRegistry,
    forward: Option<Graph>,
    config: GradientBuilderConfig,
    built: Option<BuiltGraph>,
}

impl GradientGraphBuilder {
    /// Create a builder using the built-in gradient rules.
    pub fn new() -> Self {
        Self::with_registry(GradientRegistry::with_defaults())
    }

    pub fn with_registry(registry: GradientRegistry) -> Self {
        Self {
            registry,
            forward: None,
            config: GradientBuilderConfig::default(),
            built: None,
        }
    }

    /// Set the forward graph and gradient configuration.
    ///
    /// Discards any previously built graph.
    ///
    /// # Errors
    /// [`TrainingError::GraphBuildError`] if a configured name is unknown,
    /// listed twice, or not floating point.
    pub fn initialize(&mut self, forward: Graph, config: GradientBuilderConfig) -> Result<()> {
        forward.validate()?;
        let user_inputs = user_input_names(&forward);
        let initializers = forward.initializer_names();

        check_names(
            "initializer",
            &config.initializer_names_to_train,
            |name| initializers.iter().any(|i| i == name),
        )?;
        check_names("input", &config.input_names_require_grad, |name| {
            user_inputs.iter().any(|i| i == name)
        })?;
        for name in config
            .initializer_names_to_train
            .iter()
            .chain(&config.input_names_require_grad)
        {
            let dtype = forward.tensor_by_name(name)?.dtype;
            if !dtype.is_float() {
                return Err(TrainingError::build(format!(
                    "'{}' has type {} and cannot require a gradient",
                    name, dtype
                )));
            }
        }

        tracing::debug!(
            graph = %forward.metadata.name,
            trainable = config.initializer_names_to_train.len(),
            require_grad = config.input_names_require_grad.len(),
            "initialized gradient builder"
        );
        self.forward = Some(forward);
        self.config = config;
        self.built = None;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.forward.is_some()
    }

    pub fn forward_graph(&self) -> Option<&Graph> {
        self.forward.as_ref()
    }

    pub fn config(&self) -> &GradientBuilderConfig {
        &self.config
    }

    /// Signature of the last successful build.
    pub fn built_signature(&self) -> Option<&[Vec<usize>]> {
        self.built.as_ref().map(|b| b.signature.as_slice())
    }

    /// Synthesize the training graph specialized to `signature`.
    ///
    /// Deterministic: the same forward graph, configuration and signature
    /// always produce the same graph.
    pub fn build(&mut self, signature: &[Vec<usize>]) -> Result<()> {
        let forward = self.forward.as_ref().ok_or_else(|| {
            TrainingError::InvalidState("gradient builder has not been initialized".to_string())
        })?;
        let _span = tracing::info_span!(
            "build_gradient_graph",
            graph = %forward.metadata.name,
            signature = ?signature
        )
        .entered();

        let (graph, info) = synthesize(forward, &self.config, &self.registry, signature)?;
        tracing::info!(
            forward_nodes = forward.nodes.len(),
            training_nodes = graph.nodes.len(),
            gradients = info.gradient_output_names.len(),
            "built training graph"
        );
        self.built = Some(BuiltGraph {
            graph,
            info,
            signature: signature.to_vec(),
        });
        Ok(())
    }

    pub fn get_training_graph(&self) -> Result<&Graph> {
        self.built
            .as_ref()
            .map(|b| &b.graph)
            .ok_or(TrainingError::NotBuilt)
    }

    pub fn get_graph_info(&self) -> Result<&GraphMetadata> {
        self.built
            .as_ref()
            .map(|b| &b.info)
            .ok_or(TrainingError::NotBuilt)
    }

    /// Serialized training graph, loadable with `ModelSource::Bytes`.
    pub fn training_graph_bytes(&self) -> Result<Vec<u8>> {
        Ok(to_bytes(self.get_training_graph()?)?)
    }
}

impl std::fmt::Debug for GradientGraphBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GradientGraphBuilder")
            .field("registry", &self.registry)
            .field("initialized", &self.forward.is_some())
            .field("config", &self.config)
            .field("built_signature", &self.built_signature())
            .finish()
    }
}

/// Graph inputs without an initializer default.
pub(crate) fn user_input_names(graph: &Graph) -> Vec<String> {
    graph
        .inputs
        .iter()
        .filter(|name| !graph.is_optional_input(name))
        .cloned()
        .collect()
}

/// Turn every initializer into an optional graph input so callers can bind
/// current parameter values over the stored defaults.
pub(crate) fn promote_initializers(graph: &mut Graph) -> Result<()> {
    for name in graph.initializer_names() {
        graph.tensor_by_name_mut(&name)?.kind = TensorKind::Input;
        graph.inputs.push(name);
    }
    Ok(())
}

fn check_names(kind: &str, names: &[String], exists: impl Fn(&str) -> bool) -> Result<()> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name.as_str()) {
            return Err(TrainingError::build(format!(
                "{} name '{}' is listed more than once",
                kind, name
            )));
        }
        if !exists(name) {
            return Err(TrainingError::build(format!("unknown {} '{}'", kind, name)));
        }
    }
    Ok(())
}

fn synthesize(
    forward: &Graph,
    config: &GradientBuilderConfig,
    registry: &GradientRegistry,
    signature: &[Vec<usize>],
) -> Result<(Graph, GraphMetadata)> {
    let mut graph = forward.clone();
    let user_inputs = user_input_names(&graph);
    specialize(&mut graph, &user_inputs, signature)?;
    let order = graph.topological_order()?;

    let is_float = |name: &str| {
        graph
            .tensor_by_name(name)
            .map(|info| info.dtype.is_float())
            .unwrap_or(false)
    };
    let differentiable: Vec<String> = graph
        .outputs
        .iter()
        .take_while(|name| is_float(name))
        .cloned()
        .collect();
    let require_grad: Vec<String> = user_inputs
        .iter()
        .filter(|name| config.input_names_require_grad.contains(name))
        .cloned()
        .collect();
    let initializers = forward.initializer_names();
    let trainable: Vec<String> = initializers
        .iter()
        .filter(|name| config.initializer_names_to_train.contains(name))
        .cloned()
        .collect();
    let sources: Vec<String> = require_grad.iter().chain(&trainable).cloned().collect();

    let active = active_tensors(&graph, &order, &sources, &differentiable);
    if let Some(unreachable) = sources.iter().find(|s| !active.contains(s.as_str())) {
        return Err(TrainingError::build(format!(
            "'{}' is unreachable from the differentiable outputs",
            unreachable
        )));
    }

    // Plan the backward pass and count gradient contributions per tensor.
    let mut accumulator = Accumulator::default();
    for output in differentiable.iter().filter(|o| active.contains(o.as_str())) {
        accumulator.expect(output);
    }
    let mut plan: Vec<(NodeId, Vec<bool>)> = Vec::new();
    for &node_id in order.iter().rev() {
        let node = &graph.nodes[node_id];
        if !node.outputs.iter().any(|o| active.contains(o.as_str())) {
            continue;
        }
        let wanted: Vec<bool> = node
            .inputs
            .iter()
            .map(|i| !i.is_empty() && active.contains(i.as_str()))
            .collect();
        if !wanted.iter().any(|&w| w) {
            continue;
        }
        registry.require(node)?;
        if node.outputs.len() != 1 {
            return Err(TrainingError::build(format!(
                "node '{}' has {} outputs; gradients need exactly one",
                node.display_name(),
                node.outputs.len()
            )));
        }
        for (input, _) in node.inputs.iter().zip(&wanted).filter(|(_, w)| **w) {
            accumulator.expect(input);
        }
        plan.push((node_id, wanted));
    }

    promote_initializers(&mut graph)?;
    for output in &forward.outputs {
        graph.tensor_by_name_mut(output)?.kind = TensorKind::Intermediate;
    }

    // Yield point: forward outputs in, output gradients out.
    let mut yield_outputs = Vec::with_capacity(differentiable.len());
    for output in &differentiable {
        let name = if active.contains(output.as_str()) {
            accumulator.contribution(output)
        } else {
            grad_name(output)
        };
        declare_grad(&mut graph, &name, output, TensorKind::Intermediate)?;
        yield_outputs.push(name);
    }
    let grad_indices = (0..differentiable.len() as i64).collect();
    graph.add_node(
        Node::new(YIELD_OP)
            .with_name("yield")
            .with_inputs(forward.outputs.iter().cloned())
            .with_outputs(yield_outputs.iter().cloned())
            .with_attr(YIELD_GRAD_INDICES, AttributeValue::Ints(grad_indices)),
    );

    for (node_id, wanted) in plan {
        let node = graph.nodes[node_id].clone();
        let dy = accumulator.finish(&mut graph, &node.outputs[0])?;
        let mut targets = Vec::with_capacity(wanted.len());
        for (input, &want) in node.inputs.iter().zip(&wanted) {
            if want {
                let name = accumulator.contribution(input);
                declare_grad(&mut graph, &name, input, TensorKind::Intermediate)?;
                targets.push(Some(name));
            } else {
                targets.push(None);
            }
        }
        let rule = registry.require(&node)?;
        let mut ctx = GradientContext::new(&mut graph, &node, node_id);
        rule.emit(&mut ctx, &node, &dy, &targets)?;
        tracing::trace!(node = node.display_name(), rule = rule.name(), "emitted gradient");
    }

    let mut gradient_outputs = Vec::with_capacity(sources.len());
    for source in &sources {
        let name = accumulator.finish(&mut graph, source)?;
        graph.tensor_by_name_mut(&name)?.kind = TensorKind::Output;
        gradient_outputs.push(name);
    }
    graph.outputs = gradient_outputs.clone();
    graph.metadata.name = format!("{}_training", forward.metadata.name);
    graph.validate()?;

    let info = GraphMetadata {
        user_input_names: user_inputs,
        initializer_names: initializers,
        input_names_require_grad: require_grad,
        trainable_initializer_names: trainable,
        output_names: forward.outputs.clone(),
        backward_output_grad_names: yield_outputs,
        gradient_output_names: gradient_outputs,
    };
    Ok((graph, info))
}

/// Float tensors that depend on a source and feed a differentiable output.
fn active_tensors(
    graph: &Graph,
    order: &[NodeId],
    sources: &[String],
    differentiable: &[String],
) -> HashSet<String> {
    let is_float = |name: &str| {
        graph
            .tensor_by_name(name)
            .map(|info| info.dtype.is_float())
            .unwrap_or(false)
    };

    let mut from_sources: HashSet<&str> = sources.iter().map(String::as_str).collect();
    for &node_id in order {
        let node = &graph.nodes[node_id];
        if node.inputs.iter().any(|i| from_sources.contains(i.as_str())) {
            for output in node.outputs.iter().filter(|o| !o.is_empty() && is_float(o)) {
                from_sources.insert(output);
            }
        }
    }

    let mut to_outputs: HashSet<&str> = differentiable.iter().map(String::as_str).collect();
    for &node_id in order.iter().rev() {
        let node = &graph.nodes[node_id];
        if node.outputs.iter().any(|o| to_outputs.contains(o.as_str())) {
            for input in node.inputs.iter().filter(|i| !i.is_empty() && is_float(i)) {
                to_outputs.insert(input);
            }
        }
    }

    from_sources
        .intersection(&to_outputs)
        .map(|name| name.to_string())
        .collect()
}

fn declare_grad(graph: &mut Graph, name: &str, of: &str, kind: TensorKind) -> Result<()> {
    if graph.has_tensor(name) {
        return Err(TrainingError::build(format!(
            "gradient name '{}' collides with an existing tensor",
            name
        )));
    }
    let shape = graph.tensor_by_name(of)?.shape.clone();
    graph.add_tensor(TensorInfo::new(name, DataType::F32, shape, kind));
    Ok(())
}

/// Names gradient contributions and sums them once all are emitted.
#[derive(Default)]
struct Accumulator {
    expected: HashMap<String, usize>,
    issued: HashMap<String, Vec<String>>,
}

impl Accumulator {
    fn expect(&mut self, tensor: &str) {
        *self.expected.entry(tensor.to_string()).or_default() += 1;
    }

    /// Name for the next contribution to the gradient of `tensor`.
    fn contribution(&mut self, tensor: &str) -> String {
        let expected = self.expected.get(tensor).copied().unwrap_or(0);
        let issued = self.issued.entry(tensor.to_string()).or_default();
        let name = if expected <= 1 {
            grad_name(tensor)
        } else {
            format!("{}_{}", grad_name(tensor), issued.len())
        };
        issued.push(name.clone());
        name
    }

    /// The complete gradient of `tensor`, emitting a `Sum` when it has
    /// several contributions.
    fn finish(&mut self, graph: &mut Graph, tensor: &str) -> Result<String> {
        let total = grad_name(tensor);
        let parts = self.issued.get(tensor).cloned().unwrap_or_default();
        match parts.len() {
            0 => Err(TrainingError::build(format!(
                "no gradient reaches '{}'",
                tensor
            ))),
            1 => Ok(total),
            _ if graph.has_tensor(&total) => Ok(total),
            _ => {
                declare_grad(graph, &total, tensor, TensorKind::Intermediate)?;
                graph.add_node(
                    Node::new("Sum")
                        .with_name(format!("{}_accumulate", total))
                        .with_inputs(parts)
                        .with_outputs([total.as_str()]),
                );
                Ok(total)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulator_names() {
        let mut graph = Graph::new();
        graph.add_tensor(TensorInfo::weight("w", DataType::F32, &[2], vec![0; 8]));
        for part in ["w_grad_0", "w_grad_1"] {
            graph.add_tensor(TensorInfo::weight(part, DataType::F32, &[2], vec![0; 8]));
        }

        let mut acc = Accumulator::default();
        acc.expect("w");
        acc.expect("w");
        acc.expect("x");
        assert_eq!(acc.contribution("x"), "x_grad");
        assert_eq!(acc.contribution("w"), "w_grad_0");
        assert_eq!(acc.contribution("w"), "w_grad_1");

        assert_eq!(acc.finish(&mut graph, "w").unwrap(), "w_grad");
        let sum = graph.nodes.last().unwrap();
        assert_eq!(sum.op_type, "Sum");
        assert_eq!(sum.inputs, vec!["w_grad_0", "w_grad_1"]);

        // Finishing twice does not emit a second Sum.
        assert_eq!(acc.finish(&mut graph, "w").unwrap(), "w_grad");
        assert_eq!(graph.nodes.len(), 1);
    }

    #[test]
    fn test_duplicate_and_unknown_names() {
        let known = ["a".to_string(), "b".to_string()];
        let exists = |name: &str| known.iter().any(|k| k == name);

        assert!(check_names("input", &["a".to_string(), "b".to_string()], exists).is_ok());
        let dup = check_names("input", &["a".to_string(), "a".to_string()], exists);
        assert!(matches!(dup, Err(TrainingError::GraphBuildError(m)) if m.contains("more than once")));
        let unknown = check_names("input", &["c".to_string()], exists);
        assert!(matches!(unknown, Err(TrainingError::GraphBuildError(m)) if m.contains("unknown")));
    }

    #[test]
    fn test_accessors_before_build() {
        let builder = GradientGraphBuilder::new();
        assert!(matches!(builder.get_training_graph(), Err(TrainingError::NotBuilt)));
        assert!(matches!(builder.get_graph_info(), Err(TrainingError::NotBuilt)));
        assert!(!builder.is_initialized());
    }

    #[test]
    fn test_build_requires_initialize() {
        let mut builder = GradientGraphBuilder::new();
        assert!(matches!(
            builder.build(&[vec![1]]),
            Err(TrainingError::InvalidState(_))
        ));
    }
}
