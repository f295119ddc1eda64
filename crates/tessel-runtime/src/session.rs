//! Execution sessions.
//!
//! A session owns a validated graph, the providers it runs on and the node
//! placement computed at construction. It executes either from a name to
//! value mapping ([`ExecutionSession::run`]) or from an [`IoBinding`] of
//! caller-owned buffers ([`ExecutionSession::run_with_binding`]).
//!
//! Training graphs contain a single [`YIELD_OP`] node. Everything upstream of
//! it is the forward partition, everything consuming its outputs is the
//! backward partition, and the two run as separate calls with the forward
//! values retained in between.

use crate::binding::{BoundBuffer, IoBinding};
use crate::device::DeviceHandle;
use crate::error::{Result, RuntimeError};
use crate::profiler::Profiler;
use crate::provider::{CpuExecutionProvider, ExecutionProvider};
use crate::value::Value;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tessel_graph::{DataType, Graph, ModelMetadata, ModelSource, NodeId, TensorInfo, load_graph};

/// Operator type of the node separating forward from backward.
///
/// Its inputs are the forward outputs; its outputs are the gradients of the
/// forward outputs listed in its [`YIELD_GRAD_INDICES`] attribute.
pub const YIELD_OP: &str = "YieldOp";

/// Attribute of [`YIELD_OP`]: for each yield output, the index of the yield
/// input it is the gradient of.
pub const YIELD_GRAD_INDICES: &str = "grad_indices";

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Session construction options.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Device the session is expected to run on. Some provider must serve it.
    pub device: DeviceHandle,

    /// Providers in preference order. Empty means a single CPU provider.
    pub providers: Vec<Arc<dyn ExecutionProvider>>,

    pub enable_profiling: bool,

    /// Profiling artifacts are written to `{prefix}_{timestamp}.json`.
    pub profile_file_prefix: PathBuf,

    /// Identifier attached to this session's log records.
    pub log_id: String,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            device: DeviceHandle::cpu(),
            providers: Vec::new(),
            enable_profiling: false,
            profile_file_prefix: PathBuf::from("tessel_profile"),
            log_id: String::new(),
        }
    }
}

impl SessionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(mut self, device: DeviceHandle) -> Self {
        self.device = device;
        self
    }

    /// Append a provider at the lowest preference.
    pub fn with_provider(mut self, provider: Arc<dyn ExecutionProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn with_providers(mut self, providers: Vec<Arc<dyn ExecutionProvider>>) -> Self {
        self.providers = providers;
        self
    }

    /// Enable profiling with the given artifact prefix.
    pub fn with_profiling(mut self, prefix: impl Into<PathBuf>) -> Self {
        self.enable_profiling = true;
        self.profile_file_prefix = prefix.into();
        self
    }

    pub fn with_log_id(mut self, log_id: impl Into<String>) -> Self {
        self.log_id = log_id.into();
        self
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Tag recorded on the execution span.
    pub tag: String,
}

impl RunOptions {
    pub fn with_tag(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }
}

#[derive(Debug, Clone, Copy)]
enum Partition {
    Forward,
    Backward,
}

/// A loaded graph ready for execution.
#[derive(Debug)]
pub struct ExecutionSession {
    id: u64,
    graph: Arc<Graph>,
    device: DeviceHandle,
    log_id: String,
    providers: Vec<Arc<dyn ExecutionProvider>>,
    /// Provider index per node; `None` only for the yield node.
    placement: Vec<Option<usize>>,
    forward_nodes: Vec<NodeId>,
    backward_nodes: Vec<NodeId>,
    yield_node: Option<NodeId>,
    initializers: HashMap<String, Value>,
    profiler: Option<Profiler>,
    retained: Option<HashMap<String, Value>>,
}

impl ExecutionSession {
    /// Load a graph document and create a session for it.
    pub fn new(source: &ModelSource, options: SessionOptions) -> Result<Self> {
        let graph = load_graph(source)?;
        Self::from_graph(graph, options)
    }

    /// Create a session for an in-memory graph.
    ///
    /// # Errors
    /// - [`RuntimeError::DeviceMismatch`] if no provider serves `options.device`
    /// - [`RuntimeError::UnsupportedOperator`] if no provider implements a node
    /// - graph validation and ordering errors
    pub fn from_graph(graph: impl Into<Arc<Graph>>, options: SessionOptions) -> Result<Self> {
        let init_start = Instant::now();
        let graph: Arc<Graph> = graph.into();
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let _span =
            tracing::info_span!("session_init", session = id, log_id = %options.log_id).entered();

        graph.validate()?;

        let providers = if options.providers.is_empty() {
            vec![Arc::new(CpuExecutionProvider::new()) as Arc<dyn ExecutionProvider>]
        } else {
            options.providers
        };
        if !providers.iter().any(|p| p.device() == options.device) {
            return Err(RuntimeError::DeviceMismatch {
                name: "<session>".to_string(),
                device: options.device,
                providers: describe_providers(&providers),
            });
        }

        let order = graph.topological_order()?;
        let mut yield_node = None;
        let mut placement = vec![None; graph.nodes.len()];
        for &node_id in &order {
            let node = &graph.nodes[node_id];
            if node.op_type == YIELD_OP {
                if yield_node.replace(node_id).is_some() {
                    return Err(RuntimeError::ExecutionError(
                        "graph contains more than one yield point".to_string(),
                    ));
                }
                continue;
            }
            let provider = providers
                .iter()
                .position(|p| p.kernel(&node.op_type).is_some())
                .ok_or_else(|| RuntimeError::UnsupportedOperator {
                    op_type: node.op_type.clone(),
                    node: node.display_name().to_string(),
                })?;
            placement[node_id] = Some(provider);
        }

        let (forward_nodes, backward_nodes): (Vec<NodeId>, Vec<NodeId>) = match yield_node {
            Some(yield_id) => {
                let downstream: HashSet<NodeId> = graph
                    .downstream_of(&graph.nodes[yield_id].outputs)?
                    .into_iter()
                    .collect();
                order
                    .iter()
                    .copied()
                    .filter(|&node_id| node_id != yield_id)
                    .partition(|node_id| !downstream.contains(node_id))
            }
            None => (order, Vec::new()),
        };

        let mut initializers = HashMap::new();
        for info in &graph.tensor_info {
            if let Some(bytes) = &info.initializer {
                let dims = info.shape.as_static().ok_or_else(|| {
                    RuntimeError::TensorError(format!(
                        "initializer '{}' has non-static shape {}",
                        info.name, info.shape
                    ))
                })?;
                let value =
                    Value::from_raw(bytes.clone(), dims, info.dtype)?.with_device(options.device);
                initializers.insert(info.name.clone(), value);
            }
        }

        let mut profiler = options
            .enable_profiling
            .then(|| Profiler::start(&options.profile_file_prefix));
        if let Some(profiler) = profiler.as_mut() {
            profiler.record_session("session_initialization", init_start, init_start.elapsed());
        }

        tracing::info!(
            providers = %describe_providers(&providers),
            forward_nodes = forward_nodes.len(),
            backward_nodes = backward_nodes.len(),
            "session created"
        );

        Ok(Self {
            id,
            graph,
            device: options.device,
            log_id: options.log_id,
            providers,
            placement,
            forward_nodes,
            backward_nodes,
            yield_node,
            initializers,
            profiler,
            retained: None,
        })
    }

    /// Unique id of this session.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    pub fn device(&self) -> DeviceHandle {
        self.device
    }

    pub fn log_id(&self) -> &str {
        &self.log_id
    }

    /// Declared graph inputs, in order.
    pub fn inputs(&self) -> Vec<&TensorInfo> {
        self.declared(&self.graph.inputs)
    }

    /// Declared graph outputs, in order.
    pub fn outputs(&self) -> Vec<&TensorInfo> {
        self.declared(&self.graph.outputs)
    }

    pub fn model_metadata(&self) -> &ModelMetadata {
        &self.graph.metadata
    }

    pub fn providers(&self) -> &[Arc<dyn ExecutionProvider>] {
        &self.providers
    }

    /// Name of the provider a node was placed on.
    pub fn placement(&self, node: NodeId) -> Option<&str> {
        self.placement
            .get(node)
            .copied()
            .flatten()
            .map(|idx| self.providers[idx].name())
    }

    /// Whether this is a training graph with separate forward and backward.
    pub fn has_yield_point(&self) -> bool {
        self.yield_node.is_some()
    }

    /// Whether forward values are retained for a backward call.
    pub fn has_forward_state(&self) -> bool {
        self.retained.is_some()
    }

    /// Current initializer values by name.
    pub fn state(&self) -> HashMap<String, Value> {
        self.initializers.clone()
    }

    /// Replace initializer values.
    ///
    /// Values keep the session device. In strict mode `state` must name
    /// exactly the graph's initializers; otherwise unknown names are skipped
    /// and missing ones keep their current value. Nothing is replaced unless
    /// every entry is accepted. Retained forward values are discarded.
    ///
    /// # Errors
    /// - [`RuntimeError::UnknownTensorName`] for unknown or (strict) missing
    ///   names
    /// - [`RuntimeError::TypeMismatch`] / [`RuntimeError::ShapeMismatch`] for
    ///   values that do not match the current initializer
    pub fn load_state(&mut self, state: HashMap<String, Value>, strict: bool) -> Result<()> {
        if strict {
            let mut missing: Vec<&String> = self
                .initializers
                .keys()
                .filter(|name| !state.contains_key(*name))
                .collect();
            missing.sort();
            if let Some(name) = missing.first() {
                return Err(RuntimeError::UnknownTensorName(name.to_string()));
            }
        }

        let mut accepted = Vec::with_capacity(state.len());
        for (name, value) in state {
            let Some(current) = self.initializers.get(&name) else {
                if strict {
                    return Err(RuntimeError::UnknownTensorName(name));
                }
                tracing::debug!(name = %name, "skipping unknown state entry");
                continue;
            };
            if value.dtype() != current.dtype() {
                return Err(RuntimeError::TypeMismatch {
                    name,
                    expected: current.dtype().to_string(),
                    actual: value.dtype().to_string(),
                });
            }
            if value.shape() != current.shape() {
                return Err(RuntimeError::ShapeMismatch {
                    expected: format!("{:?}", current.shape()),
                    actual: format!("{:?}", value.shape()),
                    name,
                });
            }
            accepted.push((name, value.with_device(self.device)));
        }

        tracing::debug!(loaded = accepted.len(), strict, "loaded initializer state");
        self.initializers.extend(accepted);
        self.retained = None;
        Ok(())
    }

    /// Create an empty binding table for this session.
    pub fn io_binding(&self) -> IoBinding {
        IoBinding::new(self.id, Arc::clone(&self.graph))
    }

    /// Execute the graph from a name to value mapping.
    ///
    /// Empty `output_names` means every declared output, in declaration
    /// order. Results are returned in the order of `output_names`.
    ///
    /// # Errors
    /// - [`RuntimeError::MissingInput`] if the feed has fewer entries than the
    ///   graph has required inputs, or misses a required one
    /// - [`RuntimeError::UnknownTensorName`] for names the graph does not declare
    /// - [`RuntimeError::TypeMismatch`] / [`RuntimeError::ShapeMismatch`] for
    ///   values that do not satisfy their declaration
    pub fn run(
        &mut self,
        output_names: &[&str],
        input_feed: HashMap<String, Value>,
        options: &RunOptions,
    ) -> Result<Vec<Value>> {
        let span = tracing::info_span!("run", session = self.id, tag = %options.tag);
        let _enter = span.enter();
        let start = Instant::now();
        self.ensure_single_pass()?;

        let required = self.graph.required_input_count();
        if input_feed.len() < required {
            return Err(RuntimeError::MissingInput {
                required,
                supplied: input_feed.len(),
                missing: self.missing_required(|name| input_feed.contains_key(name)),
            });
        }
        for (name, value) in &input_feed {
            self.check_input(name, value.dtype(), value.shape(), value.device())?;
        }
        let missing = self.missing_required(|name| input_feed.contains_key(name));
        if !missing.is_empty() {
            return Err(RuntimeError::MissingInput {
                required,
                supplied: input_feed.len(),
                missing,
            });
        }
        let requested = self.resolve_outputs(output_names)?;

        let mut values = input_feed;
        self.seed_initializers(&mut values);
        self.execute(Partition::Forward, &mut values)?;

        let results = requested
            .iter()
            .map(|name| {
                values.get(name).cloned().ok_or_else(|| {
                    RuntimeError::ExecutionError(format!("output '{}' was not computed", name))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        self.record_session("model_run", start);
        Ok(results)
    }

    /// Execute the graph reading inputs from and writing outputs to the
    /// buffers bound in `binding`.
    ///
    /// Bound outputs are written in place; every other output is allocated by
    /// the session and left in the table (see [`IoBinding::outputs`]).
    ///
    /// # Safety
    /// Every address bound in `binding` must satisfy the contract of
    /// [`IoBinding::bind_input`] / [`IoBinding::bind_output`] for the
    /// duration of this call.
    ///
    /// # Errors
    /// [`RuntimeError::DeviceMismatch`] if a bound buffer lives on a device no
    /// provider serves, [`RuntimeError::ForeignBinding`] for a table created by
    /// another session, plus the errors of [`run`](Self::run).
    pub unsafe fn run_with_binding(
        &mut self,
        binding: &mut IoBinding,
        options: &RunOptions,
    ) -> Result<()> {
        let span = tracing::info_span!("run_with_binding", session = self.id, tag = %options.tag);
        let _enter = span.enter();
        let start = Instant::now();
        self.check_binding(binding)?;
        self.ensure_single_pass()?;

        let graph = Arc::clone(&self.graph);
        // SAFETY: forwarded caller contract.
        let mut values = unsafe { self.gather_bound_inputs(binding) }?;
        self.check_bound_outputs(binding, &graph.outputs)?;
        self.execute(Partition::Forward, &mut values)?;
        // SAFETY: forwarded caller contract.
        unsafe { self.deliver_outputs(binding, &graph.outputs, &values) }?;

        self.record_session("model_run", start);
        Ok(())
    }

    /// Execute the forward partition of a training graph.
    ///
    /// Retains every computed value for [`run_backward`](Self::run_backward)
    /// and returns the forward outputs (the yield node's inputs) in order.
    ///
    /// # Safety
    /// Same contract as [`run_with_binding`](Self::run_with_binding) for the
    /// bound inputs.
    pub unsafe fn run_forward(
        &mut self,
        binding: &IoBinding,
        options: &RunOptions,
    ) -> Result<Vec<Value>> {
        let span = tracing::info_span!("run_forward", session = self.id, tag = %options.tag);
        let _enter = span.enter();
        let start = Instant::now();
        self.check_binding(binding)?;
        let yield_id = self.require_yield_point()?;
        self.retained = None;

        // SAFETY: forwarded caller contract.
        let mut values = unsafe { self.gather_bound_inputs(binding) }?;
        self.execute(Partition::Forward, &mut values)?;

        let graph = Arc::clone(&self.graph);
        let outputs = graph.nodes[yield_id]
            .inputs
            .iter()
            .map(|name| {
                values.get(name).cloned().ok_or_else(|| {
                    RuntimeError::ExecutionError(format!(
                        "forward output '{}' was not computed",
                        name
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        self.retained = Some(values);
        self.record_session("forward_run", start);
        Ok(outputs)
    }

    /// Execute the backward partition of a training graph.
    ///
    /// `grads` are the gradients of the forward outputs, one per yield
    /// output, read from caller memory. Gradient outputs are delivered to
    /// `binding` like [`run_with_binding`](Self::run_with_binding) does.
    /// Consumes the retained forward state.
    ///
    /// # Safety
    /// Every address in `grads` and every output bound in `binding` must be
    /// valid for the duration of this call.
    ///
    /// # Errors
    /// [`RuntimeError::NoForwardState`] unless preceded by a successful
    /// [`run_forward`](Self::run_forward).
    pub unsafe fn run_backward(
        &mut self,
        binding: &mut IoBinding,
        grads: &[BoundBuffer],
        options: &RunOptions,
    ) -> Result<()> {
        let span = tracing::info_span!("run_backward", session = self.id, tag = %options.tag);
        let _enter = span.enter();
        let start = Instant::now();
        self.check_binding(binding)?;
        let yield_id = self.require_yield_point()?;
        let retained = self.retained.as_ref().ok_or(RuntimeError::NoForwardState)?;

        let graph = Arc::clone(&self.graph);
        let yield_node = &graph.nodes[yield_id];
        if grads.len() != yield_node.outputs.len() {
            return Err(RuntimeError::ExecutionError(format!(
                "expected {} output gradients, got {}",
                yield_node.outputs.len(),
                grads.len()
            )));
        }
        let grad_indices: Vec<i64> = yield_node
            .attr_or(
                YIELD_GRAD_INDICES,
                (0..yield_node.outputs.len() as i64).collect(),
            )
            .map_err(RuntimeError::Graph)?;

        // Forward values stay retained until every gradient has been read.
        let mut grad_values = Vec::with_capacity(grads.len());
        for ((grad, grad_name), &index) in grads.iter().zip(&yield_node.outputs).zip(&grad_indices)
        {
            let forward_name = usize::try_from(index)
                .ok()
                .and_then(|i| yield_node.inputs.get(i))
                .ok_or_else(|| {
                    RuntimeError::ExecutionError(format!("invalid yield gradient index {}", index))
                })?;
            let forward = retained.get(forward_name).ok_or_else(|| {
                RuntimeError::ExecutionError(format!("forward value '{}' missing", forward_name))
            })?;
            if grad.element_type() != forward.dtype() {
                return Err(RuntimeError::TypeMismatch {
                    name: grad_name.clone(),
                    expected: forward.dtype().to_string(),
                    actual: grad.element_type().to_string(),
                });
            }
            if grad.shape() != forward.shape() {
                return Err(RuntimeError::ShapeMismatch {
                    name: grad_name.clone(),
                    expected: format!("{:?}", forward.shape()),
                    actual: format!("{:?}", grad.shape()),
                });
            }
            let provider = self.serving_provider(grad_name, grad.device())?;
            // SAFETY: forwarded caller contract.
            let bytes = unsafe { provider.read(grad.address(), grad.byte_len()) }?;
            let value = Value::from_raw(bytes, grad.shape(), grad.element_type())?
                .with_device(grad.device());
            grad_values.push((grad_name.clone(), value));
        }
        self.check_bound_outputs(binding, &graph.outputs)?;

        let mut values = self.retained.take().ok_or(RuntimeError::NoForwardState)?;
        values.extend(grad_values);
        self.execute(Partition::Backward, &mut values)?;
        // SAFETY: forwarded caller contract.
        unsafe { self.deliver_outputs(binding, &graph.outputs, &values) }?;

        self.record_session("backward_run", start);
        Ok(())
    }

    /// Finish profiling and write the trace.
    ///
    /// Returns the artifact path, or `None` if profiling was not enabled or
    /// already ended.
    pub fn end_profiling(&mut self) -> Result<Option<PathBuf>> {
        self.profiler.take().map(Profiler::finish).transpose()
    }

    fn execute(&mut self, partition: Partition, values: &mut HashMap<String, Value>) -> Result<()> {
        let Self {
            graph,
            providers,
            placement,
            forward_nodes,
            backward_nodes,
            profiler,
            ..
        } = self;
        let graph: &Graph = graph;
        let providers: &[Arc<dyn ExecutionProvider>] = providers;
        let nodes: &[NodeId] = match partition {
            Partition::Forward => forward_nodes,
            Partition::Backward => backward_nodes,
        };

        for &node_id in nodes.iter() {
            let node = &graph.nodes[node_id];
            let provider = placement[node_id]
                .map(|idx| &providers[idx])
                .ok_or_else(|| {
                    RuntimeError::ExecutionError(format!(
                        "node '{}' has no execution provider",
                        node.display_name()
                    ))
                })?;
            let kernel =
                provider
                    .kernel(&node.op_type)
                    .ok_or_else(|| RuntimeError::UnsupportedOperator {
                        op_type: node.op_type.clone(),
                        node: node.display_name().to_string(),
                    })?;

            let start = Instant::now();
            let outputs = {
                let inputs = node
                    .inputs
                    .iter()
                    .map(|name| {
                        values.get(name).ok_or_else(|| {
                            RuntimeError::ExecutionError(format!(
                                "value '{}' needed by '{}' is not available",
                                name,
                                node.display_name()
                            ))
                        })
                    })
                    .collect::<Result<Vec<&Value>>>()?;
                kernel.compute(node, &inputs)?
            };
            let elapsed = start.elapsed();

            if outputs.len() != node.outputs.len() {
                return Err(RuntimeError::ExecutionError(format!(
                    "node '{}' returned {} outputs but declares {}",
                    node.display_name(),
                    outputs.len(),
                    node.outputs.len()
                )));
            }
            tracing::trace!(
                node = node.display_name(),
                op = %node.op_type,
                provider = provider.name(),
                elapsed_us = elapsed.as_micros() as u64,
                "executed node"
            );
            if let Some(profiler) = profiler.as_mut() {
                profiler.record_node(
                    node.display_name(),
                    &node.op_type,
                    provider.name(),
                    start,
                    elapsed,
                );
            }

            for (name, value) in node.outputs.iter().zip(outputs) {
                if name.is_empty() {
                    continue;
                }
                let declared = graph.tensor_by_name(name)?.dtype;
                if declared != value.dtype() {
                    return Err(RuntimeError::TypeMismatch {
                        name: name.clone(),
                        expected: declared.to_string(),
                        actual: value.dtype().to_string(),
                    });
                }
                values.insert(name.clone(), value.with_device(provider.device()));
            }
        }
        Ok(())
    }

    /// Read bound inputs into values and add initializers not overridden.
    unsafe fn gather_bound_inputs(&self, binding: &IoBinding) -> Result<HashMap<String, Value>> {
        let bound: Vec<&BoundBuffer> = binding.bound_inputs().collect();
        let required = self.graph.required_input_count();
        if bound.len() < required {
            return Err(RuntimeError::MissingInput {
                required,
                supplied: bound.len(),
                missing: self.missing_required(|name| binding.bound_input(name).is_some()),
            });
        }

        let mut values = HashMap::with_capacity(bound.len() + self.initializers.len());
        for buffer in &bound {
            let provider = self.check_input(
                buffer.name(),
                buffer.element_type(),
                buffer.shape(),
                buffer.device(),
            )?;
            // SAFETY: the caller upholds the binding contract.
            let bytes = unsafe { provider.read(buffer.address(), buffer.byte_len()) }?;
            let value = Value::from_raw(bytes, buffer.shape(), buffer.element_type())?
                .with_device(buffer.device());
            values.insert(buffer.name().to_string(), value);
        }

        let missing = self.missing_required(|name| values.contains_key(name));
        if !missing.is_empty() {
            return Err(RuntimeError::MissingInput {
                required,
                supplied: bound.len(),
                missing,
            });
        }

        self.seed_initializers(&mut values);
        Ok(values)
    }

    /// Write bound outputs in place; leave the rest in the table.
    unsafe fn deliver_outputs(
        &self,
        binding: &mut IoBinding,
        names: &[String],
        values: &HashMap<String, Value>,
    ) -> Result<()> {
        let mut allocated = Vec::new();
        for name in names {
            let value = values.get(name).ok_or_else(|| {
                RuntimeError::ExecutionError(format!("output '{}' was not computed", name))
            })?;
            match binding.bound_output(name) {
                Some(buffer) => {
                    if buffer.element_type() != value.dtype() {
                        return Err(RuntimeError::TypeMismatch {
                            name: name.clone(),
                            expected: value.dtype().to_string(),
                            actual: buffer.element_type().to_string(),
                        });
                    }
                    if buffer.shape() != value.shape() {
                        return Err(RuntimeError::ShapeMismatch {
                            name: name.clone(),
                            expected: format!("{:?}", value.shape()),
                            actual: format!("{:?}", buffer.shape()),
                        });
                    }
                    let provider = self.serving_provider(name, buffer.device())?;
                    // SAFETY: the caller upholds the binding contract.
                    unsafe { provider.write(buffer.address(), value.as_bytes()) }?;
                }
                None => allocated.push((name.clone(), value.clone())),
            }
        }
        binding.set_allocated(allocated);
        Ok(())
    }

    /// Validate one input against its declaration and return the provider
    /// serving its memory.
    fn check_input(
        &self,
        name: &str,
        dtype: DataType,
        shape: &[usize],
        device: DeviceHandle,
    ) -> Result<&Arc<dyn ExecutionProvider>> {
        if !self.graph.inputs.iter().any(|input| input == name) {
            return Err(RuntimeError::UnknownTensorName(name.to_string()));
        }
        let info = self.graph.tensor_by_name(name)?;
        if info.dtype != dtype {
            return Err(RuntimeError::TypeMismatch {
                name: name.to_string(),
                expected: info.dtype.to_string(),
                actual: dtype.to_string(),
            });
        }
        if !info.shape.matches(shape) {
            return Err(RuntimeError::ShapeMismatch {
                name: name.to_string(),
                expected: info.shape.to_string(),
                actual: format!("{:?}", shape),
            });
        }
        self.serving_provider(name, device)
    }

    /// Reject bound outputs the graph does not produce or no provider can
    /// write, before anything executes.
    fn check_bound_outputs(&self, binding: &IoBinding, outputs: &[String]) -> Result<()> {
        for buffer in binding.bound_outputs() {
            if !outputs.iter().any(|output| output == buffer.name()) {
                return Err(RuntimeError::UnknownTensorName(buffer.name().to_string()));
            }
            self.serving_provider(buffer.name(), buffer.device())?;
        }
        Ok(())
    }

    fn serving_provider(
        &self,
        name: &str,
        device: DeviceHandle,
    ) -> Result<&Arc<dyn ExecutionProvider>> {
        self.providers
            .iter()
            .find(|p| p.device() == device)
            .ok_or_else(|| RuntimeError::DeviceMismatch {
                name: name.to_string(),
                device,
                providers: describe_providers(&self.providers),
            })
    }

    fn seed_initializers(&self, values: &mut HashMap<String, Value>) {
        for (name, value) in &self.initializers {
            values
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }
    }

    fn missing_required(&self, present: impl Fn(&str) -> bool) -> Vec<String> {
        self.graph
            .inputs
            .iter()
            .filter(|name| !self.graph.is_optional_input(name) && !present(name))
            .cloned()
            .collect()
    }

    fn resolve_outputs(&self, output_names: &[&str]) -> Result<Vec<String>> {
        if output_names.is_empty() {
            return Ok(self.graph.outputs.clone());
        }
        output_names
            .iter()
            .map(|&name| {
                if self.graph.outputs.iter().any(|output| output == name) {
                    Ok(name.to_string())
                } else {
                    Err(RuntimeError::UnknownTensorName(name.to_string()))
                }
            })
            .collect()
    }

    fn declared(&self, names: &[String]) -> Vec<&TensorInfo> {
        names
            .iter()
            .filter_map(|name| self.graph.tensor_by_name(name).ok())
            .collect()
    }

    fn check_binding(&self, binding: &IoBinding) -> Result<()> {
        if binding.session_id() != self.id {
            return Err(RuntimeError::ForeignBinding {
                binding: binding.session_id(),
                session: self.id,
            });
        }
        Ok(())
    }

    fn ensure_single_pass(&self) -> Result<()> {
        if self.yield_node.is_some() {
            return Err(RuntimeError::ExecutionError(
                "graph has a yield point; use run_forward and run_backward".to_string(),
            ));
        }
        Ok(())
    }

    fn require_yield_point(&self) -> Result<NodeId> {
        self.yield_node.ok_or_else(|| {
            RuntimeError::ExecutionError("graph has no yield point".to_string())
        })
    }

    fn record_session(&mut self, name: &str, start: Instant) {
        if let Some(profiler) = self.profiler.as_mut() {
            profiler.record_session(name, start, start.elapsed());
        }
    }
}

fn describe_providers(providers: &[Arc<dyn ExecutionProvider>]) -> String {
    providers
        .iter()
        .map(|p| format!("{}@{}", p.name(), p.device()))
        .collect::<Vec<_>>()
        .join(", ")
}
