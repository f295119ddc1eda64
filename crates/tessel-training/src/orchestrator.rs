//! Forward/backward orchestration of a host module over a training session.
//!
//! [`TrainingOrchestrator`] exports the wrapped module once, keeps a
//! [`GradientGraphBuilder`] configured for the current gradient
//! requirements, and rebuilds the training graph and session whenever the
//! input shape signature changes. Each forward call binds host memory,
//! runs the forward partition and unbinds before returning; the matching
//! backward call feeds output gradients and collects input and parameter
//! gradients.

use crate::builder::{
    GradientBuilderConfig, GradientGraphBuilder, GraphMetadata, ShapeSignature,
    promote_initializers, user_input_names,
};
use crate::error::{Result, TrainingError};
use crate::host::{ExportSpec, HostModule, HostTensor};
use crate::transport;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tessel_graph::{DataType, Graph, save_graph};
use tessel_runtime::{
    BoundBuffer, DefaultProviderFactory, DeviceHandle, ExecutionSession, IoBinding,
    ProviderFactory, RunOptions, SessionOptions, Value,
};

/// Protocol state of an orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Nothing exported yet.
    Uninitialized,
    /// The gradient builder is configured; no usable session.
    GraphBuilt,
    /// A session matches the last input signature.
    SessionReady,
    /// A forward call is waiting for its backward call.
    ForwardDone,
}

/// Configuration of a [`TrainingOrchestrator`].
#[derive(Clone)]
pub struct OrchestratorOptions {
    pub device: DeviceHandle,
    pub provider_factory: Arc<dyn ProviderFactory>,
    /// Write `{prefix}_inference.json` and `{prefix}_training.json` when
    /// graphs are (re)built.
    pub save_graphs: Option<PathBuf>,
    pub log_id: String,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            device: DeviceHandle::cpu(),
            provider_factory: Arc::new(DefaultProviderFactory),
            save_graphs: None,
            log_id: "tessel_training".to_string(),
        }
    }
}

impl OrchestratorOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(mut self, device: DeviceHandle) -> Self {
        self.device = device;
        self
    }

    pub fn with_provider_factory(mut self, factory: Arc<dyn ProviderFactory>) -> Self {
        self.provider_factory = factory;
        self
    }

    pub fn with_save_graphs(mut self, prefix: impl Into<PathBuf>) -> Self {
        self.save_graphs = Some(prefix.into());
        self
    }

    pub fn with_log_id(mut self, log_id: impl Into<String>) -> Self {
        self.log_id = log_id.into();
        self
    }
}

impl std::fmt::Debug for OrchestratorOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorOptions")
            .field("device", &self.device)
            .field("save_graphs", &self.save_graphs)
            .field("log_id", &self.log_id)
            .finish_non_exhaustive()
    }
}

/// The exported forward graph and the inputs it was exported for.
#[derive(Debug)]
struct Exported {
    input_names: Vec<String>,
    forward: Graph,
    /// Forward graph with parameters as optional inputs, for eval mode.
    inference: Arc<Graph>,
}

#[derive(Debug)]
struct TrainingSession {
    session: ExecutionSession,
    binding: IoBinding,
}

/// Drives a [`HostModule`] through forward and backward passes.
#[derive(Debug)]
pub struct TrainingOrchestrator<M> {
    module: M,
    options: OrchestratorOptions,
    state: OrchestratorState,
    training: bool,
    builder: GradientGraphBuilder,
    exported: Option<Exported>,
    require_grad: Option<Vec<String>>,
    trainable: Vec<String>,
    signature: Option<ShapeSignature>,
    session: Option<TrainingSession>,
    inference: Option<(ShapeSignature, ExecutionSession)>,
    /// Argument names of the pending forward call; `None` for absent args.
    pending: Option<Vec<Option<String>>>,
    rebuild_count: usize,
}

impl<M: HostModule> TrainingOrchestrator<M> {
    pub fn new(module: M, options: OrchestratorOptions) -> Self {
        Self {
            module,
            options,
            state: OrchestratorState::Uninitialized,
            training: true,
            builder: GradientGraphBuilder::new(),
            exported: None,
            require_grad: None,
            trainable: Vec::new(),
            signature: None,
            session: None,
            inference: None,
            pending: None,
            rebuild_count: 0,
        }
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    /// Number of training graph and session rebuilds so far.
    pub fn rebuild_count(&self) -> usize {
        self.rebuild_count
    }

    pub fn module(&self) -> &M {
        &self.module
    }

    /// Mutable access to the module. Parameter values are read at every
    /// forward call, so in-place updates need no rebuild.
    pub fn module_mut(&mut self) -> &mut M {
        &mut self.module
    }

    pub fn device(&self) -> DeviceHandle {
        self.options.device
    }

    pub fn builder(&self) -> &GradientGraphBuilder {
        &self.builder
    }

    pub fn graph_info(&self) -> Result<&GraphMetadata> {
        self.builder.get_graph_info()
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn train(&mut self, mode: bool) {
        self.training = mode;
    }

    pub fn eval(&mut self) {
        self.train(false);
    }

    /// Move the module to `device`. The next forward call rebuilds the
    /// session for the new device.
    pub fn relocate(&mut self, device: DeviceHandle) {
        tracing::info!(from = %self.options.device, to = %device, "relocating");
        self.options.device = device;
        self.module.relocate(device);
        self.session = None;
        self.inference = None;
        self.pending = None;
        if matches!(
            self.state,
            OrchestratorState::SessionReady | OrchestratorState::ForwardDone
        ) {
            self.state = OrchestratorState::GraphBuilt;
        }
    }

    /// Run the forward pass.
    ///
    /// `inputs` has one entry per argument of the module's forward
    /// signature; `None` arguments are left out of the exported graph.
    /// In training mode the call must be followed by [`backward`] before
    /// the next step's gradients are needed.
    ///
    /// [`backward`]: Self::backward
    #[tracing::instrument(skip_all, fields(log_id = %self.options.log_id, training = self.training))]
    pub fn forward(&mut self, inputs: &[Option<&HostTensor>]) -> Result<Vec<HostTensor>> {
        let names = self.module.forward_signature();
        if inputs.len() != names.len() {
            return Err(TrainingError::InvalidState(format!(
                "forward takes {} arguments, got {}",
                names.len(),
                inputs.len()
            )));
        }
        let present: Vec<(String, &HostTensor)> = names
            .iter()
            .zip(inputs)
            .filter_map(|(name, input)| input.map(|tensor| (name.clone(), tensor)))
            .collect();

        self.ensure_exported(&present)?;
        if !self.training {
            return self.forward_eval(&present);
        }
        self.ensure_builder(&present)?;
        self.ensure_session(&present)?;

        let outputs = self.run_forward(&present)?;
        self.pending = Some(
            names
                .into_iter()
                .zip(inputs)
                .map(|(name, input)| input.map(|_| name))
                .collect(),
        );
        self.state = OrchestratorState::ForwardDone;
        Ok(outputs)
    }

    /// Run the backward pass for the preceding forward call.
    ///
    /// Takes one gradient per differentiable output, or one per forward
    /// output (the non-differentiable trailing ones are ignored). Returns
    /// one slot per forward argument, `None` where no gradient was
    /// required, followed by one slot per trainable parameter.
    ///
    /// # Errors
    /// [`TrainingError::GradientOrderMismatch`] for any other gradient count,
    /// [`TrainingError::InvalidState`] without a preceding forward call.
    #[tracing::instrument(skip_all, fields(log_id = %self.options.log_id))]
    pub fn backward(&mut self, output_grads: &[&HostTensor]) -> Result<Vec<Option<HostTensor>>> {
        if self.state != OrchestratorState::ForwardDone {
            return Err(TrainingError::InvalidState(
                "backward requires a preceding training forward call".to_string(),
            ));
        }
        let info = self.builder.get_graph_info()?.clone();
        let expected = info.backward_output_grad_names.len();
        let grads = if output_grads.len() == expected {
            output_grads
        } else if output_grads.len() == info.output_names.len() {
            &output_grads[..expected]
        } else {
            return Err(TrainingError::GradientOrderMismatch {
                expected,
                got: output_grads.len(),
            });
        };

        let buffers = grads
            .iter()
            .zip(&info.backward_output_grad_names)
            .map(|(grad, name)| {
                BoundBuffer::new(
                    name.clone(),
                    grad.device(),
                    grad.dtype(),
                    &grad.signed_shape(),
                    grad.data_ptr(),
                )
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let device = self.options.device;
        let active = self.session.as_mut().ok_or_else(|| {
            TrainingError::InvalidState("training session is missing".to_string())
        })?;
        let graph = Arc::clone(active.session.graph());
        let mut produced = Vec::with_capacity(info.gradient_output_names.len());
        for name in &info.gradient_output_names {
            let shape = graph.tensor_by_name(name)?.shape.as_static().ok_or_else(|| {
                TrainingError::build(format!("gradient '{}' has no static shape", name))
            })?;
            produced.push(HostTensor::zeros(shape, DataType::F32).with_device(device));
        }

        // SAFETY: `grads` and `produced` outlive the call and are not
        // touched until it returns; the bindings are cleared right after.
        let result = unsafe {
            run_backward_bound(
                active,
                &info.gradient_output_names,
                &mut produced,
                &buffers,
            )
        };
        active.binding.clear_outputs();
        let forward_retained = active.session.has_forward_state();
        if let Err(err) = result {
            // Rejected gradients leave the forward step pending for a retry.
            if !forward_retained {
                self.pending = None;
                self.state = OrchestratorState::SessionReady;
            }
            return Err(err);
        }
        let args = self.pending.take().unwrap_or_default();
        self.state = OrchestratorState::SessionReady;

        let mut by_name: HashMap<String, HostTensor> = info
            .input_names_require_grad
            .iter()
            .chain(&info.trainable_initializer_names)
            .cloned()
            .zip(produced)
            .collect();
        let mut slots: Vec<Option<HostTensor>> = args
            .iter()
            .map(|arg| arg.as_ref().and_then(|name| by_name.remove(name)))
            .collect();
        slots.extend(
            info.trainable_initializer_names
                .iter()
                .map(|name| by_name.remove(name)),
        );
        Ok(slots)
    }

    /// Export the module if never exported or the set of present arguments
    /// changed.
    fn ensure_exported(&mut self, present: &[(String, &HostTensor)]) -> Result<()> {
        let names: Vec<String> = present.iter().map(|(name, _)| name.clone()).collect();
        if matches!(&self.exported, Some(e) if e.input_names == names) {
            return Ok(());
        }

        let spec = ExportSpec::new(present);
        let forward = self.module.export(&spec)?;
        forward.validate()?;
        if user_input_names(&forward) != names {
            return Err(TrainingError::Export(format!(
                "exported graph inputs {:?} do not match arguments {:?}",
                user_input_names(&forward),
                names
            )));
        }
        for (name, _) in self.module.named_parameters() {
            let is_initializer = forward
                .tensor_by_name(&name)
                .map(|info| info.initializer.is_some())
                .unwrap_or(false);
            if !is_initializer {
                return Err(TrainingError::Export(format!(
                    "parameter '{}' is not an initializer of the exported graph",
                    name
                )));
            }
        }
        if let Some(prefix) = &self.options.save_graphs {
            save_graph(&forward, format!("{}_inference.json", prefix.display()))?;
        }

        let mut inference = forward.clone();
        promote_initializers(&mut inference)?;
        tracing::info!(
            graph = %forward.metadata.name,
            inputs = ?names,
            nodes = forward.nodes.len(),
            "exported forward graph"
        );
        self.exported = Some(Exported {
            input_names: names,
            forward,
            inference: Arc::new(inference),
        });
        self.require_grad = None;
        self.signature = None;
        self.session = None;
        self.inference = None;
        self.pending = None;
        self.state = OrchestratorState::Uninitialized;
        Ok(())
    }

    /// Reinitialize the builder when the gradient requirements changed.
    fn ensure_builder(&mut self, present: &[(String, &HostTensor)]) -> Result<()> {
        let exported = self
            .exported
            .as_ref()
            .ok_or_else(|| TrainingError::InvalidState("module not exported".to_string()))?;
        let require_grad: Vec<String> = present
            .iter()
            .filter(|(_, tensor)| tensor.requires_grad())
            .map(|(name, _)| name.clone())
            .collect();
        let parameters = self.module.named_parameters();
        let trainable: Vec<String> = exported
            .forward
            .initializer_names()
            .into_iter()
            .filter(|name| {
                parameters
                    .iter()
                    .any(|(param, tensor)| param == name && tensor.requires_grad())
            })
            .collect();

        if self.builder.is_initialized()
            && self.require_grad.as_ref() == Some(&require_grad)
            && self.trainable == trainable
        {
            return Ok(());
        }

        if self.require_grad.is_some() {
            tracing::debug!(
                require_grad = ?require_grad,
                trainable = ?trainable,
                "gradient requirements changed"
            );
        }
        let config = GradientBuilderConfig::new()
            .with_trainable(trainable.iter().cloned())
            .with_require_grad(require_grad.iter().cloned());
        self.builder.initialize(exported.forward.clone(), config)?;
        self.require_grad = Some(require_grad);
        self.trainable = trainable;
        self.signature = None;
        self.session = None;
        self.state = OrchestratorState::GraphBuilt;
        Ok(())
    }

    /// Rebuild graph and session when the shape signature changed.
    fn ensure_session(&mut self, present: &[(String, &HostTensor)]) -> Result<()> {
        let signature: ShapeSignature = present
            .iter()
            .map(|(_, tensor)| tensor.shape().to_vec())
            .collect();
        if self.session.is_some() && self.signature.as_ref() == Some(&signature) {
            return Ok(());
        }

        self.session = None;
        self.state = OrchestratorState::GraphBuilt;
        tracing::info!(signature = ?signature, "rebuilding training graph and session");

        self.builder.build(&signature)?;
        let graph = self.builder.get_training_graph()?;
        if let Some(prefix) = &self.options.save_graphs {
            save_graph(graph, format!("{}_training.json", prefix.display()))?;
        }
        let session = self.create_session(graph.clone())?;
        let binding = session.io_binding();

        self.session = Some(TrainingSession { session, binding });
        self.signature = Some(signature);
        self.rebuild_count += 1;
        self.state = OrchestratorState::SessionReady;
        Ok(())
    }

    fn create_session(&self, graph: impl Into<Arc<Graph>>) -> Result<ExecutionSession> {
        let providers = self
            .options
            .provider_factory
            .providers_for(self.options.device)?;
        let options = SessionOptions::new()
            .with_device(self.options.device)
            .with_providers(providers)
            .with_log_id(self.options.log_id.clone());
        Ok(ExecutionSession::from_graph(graph, options)?)
    }

    fn run_forward(&mut self, present: &[(String, &HostTensor)]) -> Result<Vec<HostTensor>> {
        let Self {
            module,
            session,
            exported,
            builder,
            ..
        } = self;
        let active = session.as_mut().ok_or_else(|| {
            TrainingError::InvalidState("training session is missing".to_string())
        })?;
        let exported = exported
            .as_ref()
            .ok_or_else(|| TrainingError::InvalidState("module not exported".to_string()))?;

        let parameters = module.named_parameters();
        let bound: Vec<(&str, &HostTensor)> = present
            .iter()
            .map(|(name, tensor)| (name.as_str(), *tensor))
            .chain(parameters.iter().map(|(name, tensor)| (name.as_str(), *tensor)))
            .collect();

        // SAFETY: every bound tensor is borrowed for the whole call and the
        // input bindings are cleared before returning.
        let result = unsafe { run_forward_bound(active, &bound) };
        active.binding.clear_inputs();
        let values = result?;

        let differentiable = builder.get_graph_info()?.backward_output_grad_names.len();
        let requires_grad = !builder.get_graph_info()?.gradient_output_names.is_empty();
        values
            .into_iter()
            .zip(&exported.forward.outputs)
            .enumerate()
            .map(|(index, (value, name))| {
                let declared = exported.forward.tensor_by_name(name)?.dtype;
                let tensor = transport::receive(transport::send(value), declared)?;
                Ok(tensor.with_requires_grad(requires_grad && index < differentiable))
            })
            .collect()
    }

    /// Eval mode: plain inference through the value-mapping path.
    fn forward_eval(&mut self, present: &[(String, &HostTensor)]) -> Result<Vec<HostTensor>> {
        let signature: ShapeSignature = present
            .iter()
            .map(|(_, tensor)| tensor.shape().to_vec())
            .collect();
        let exported = self
            .exported
            .as_ref()
            .ok_or_else(|| TrainingError::InvalidState("module not exported".to_string()))?;

        let cached = matches!(&self.inference, Some((sig, _)) if *sig == signature);
        if !cached {
            let session = self.create_session(Arc::clone(&exported.inference))?;
            tracing::debug!(signature = ?signature, "created inference session");
            self.inference = Some((signature, session));
        }

        let mut feed: HashMap<String, Value> = HashMap::new();
        for (name, tensor) in present {
            feed.insert(name.clone(), tensor.to_value()?);
        }
        for (name, tensor) in self.module.named_parameters() {
            feed.insert(name, tensor.to_value()?);
        }

        let (_, session) = self
            .inference
            .as_mut()
            .ok_or_else(|| TrainingError::InvalidState("inference session is missing".to_string()))?;
        let values = session.run(&[], feed, &RunOptions::with_tag("eval"))?;

        let forward = &self
            .exported
            .as_ref()
            .ok_or_else(|| TrainingError::InvalidState("module not exported".to_string()))?
            .forward;
        values
            .into_iter()
            .zip(&forward.outputs)
            .map(|(value, name)| {
                let declared = forward.tensor_by_name(name)?.dtype;
                transport::receive(transport::send(value), declared)
            })
            .collect()
    }
}

/// Bind `tensors` as inputs and run the forward partition.
///
/// # Safety
/// Every tensor must stay alive and unmodified for the duration of the call.
unsafe fn run_forward_bound(
    active: &mut TrainingSession,
    tensors: &[(&str, &HostTensor)],
) -> Result<Vec<Value>> {
    for (name, tensor) in tensors {
        // SAFETY: forwarded caller contract.
        unsafe {
            active.binding.bind_input(
                name,
                tensor.device(),
                tensor.dtype(),
                &tensor.signed_shape(),
                tensor.data_ptr(),
            )
        }?;
    }
    // SAFETY: forwarded caller contract.
    let values = unsafe {
        active
            .session
            .run_forward(&active.binding, &RunOptions::with_tag("forward"))
    }?;
    Ok(values)
}

/// Bind `outputs` as gradient outputs and run the backward partition.
///
/// # Safety
/// `outputs` and the memory behind `grads` must stay alive and unaliased
/// for the duration of the call.
unsafe fn run_backward_bound(
    active: &mut TrainingSession,
    names: &[String],
    outputs: &mut [HostTensor],
    grads: &[BoundBuffer],
) -> Result<()> {
    for (name, tensor) in names.iter().zip(outputs.iter_mut()) {
        let shape = tensor.signed_shape();
        // SAFETY: forwarded caller contract.
        unsafe {
            active.binding.bind_output(
                name,
                tensor.device(),
                tensor.dtype(),
                &shape,
                tensor.data_mut_ptr(),
            )
        }?;
    }
    // SAFETY: forwarded caller contract.
    unsafe {
        active.session.run_backward(
            &mut active.binding,
            grads,
            &RunOptions::with_tag("backward"),
        )
    }?;
    Ok(())
}
