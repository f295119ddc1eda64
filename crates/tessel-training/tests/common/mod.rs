//! Common test utilities for builder and orchestrator tests.
//!
//! Host modules exporting small graphs, a host-backed accelerator factory
//! and reference math to compare against.

#![allow(dead_code)]

use std::sync::Arc;
use tessel_graph::{DataType, Graph, Node, TensorInfo, TensorKind, TensorShape};
use tessel_runtime::{
    CpuExecutionProvider, DeviceHandle, ExecutionProvider, Kernel, ProviderFactory, RuntimeError,
};
use tessel_training::{ExportSpec, HostModule, HostTensor, Result};

/// Install a test subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn f32_bytes(data: &[f32]) -> Vec<u8> {
    bytemuck::cast_slice(data).to_vec()
}

fn unknown(graph: &mut Graph, name: &str, dtype: DataType, kind: TensorKind) {
    graph.add_tensor(TensorInfo::new(name, dtype, TensorShape::Unknown, kind));
}

fn weight_of(name: &str, tensor: &HostTensor) -> TensorInfo {
    TensorInfo::weight(
        name,
        tensor.dtype(),
        tensor.shape(),
        tensor.as_bytes().to_vec(),
    )
}

pub const W_INIT: [f32; 6] = [0.5, -1.0, 1.5, 0.25, -0.75, 2.0];
pub const B_INIT: [f32; 2] = [0.1, -0.2];

/// `y = Relu(x @ w + b)` and `mask = y > 0`.
///
/// `x: [batch, 3]`, `w: [3, 2]`, `b: [2]`. The `zero` threshold is an
/// initializer but not a parameter.
#[derive(Debug)]
pub struct MlpModule {
    pub w: HostTensor,
    pub b: HostTensor,
}

impl MlpModule {
    pub fn new() -> Self {
        Self {
            w: HostTensor::from_vec(W_INIT.to_vec(), &[3, 2])
                .unwrap()
                .with_requires_grad(true),
            b: HostTensor::from_vec(B_INIT.to_vec(), &[2])
                .unwrap()
                .with_requires_grad(true),
        }
    }
}

impl HostModule for MlpModule {
    fn forward_signature(&self) -> Vec<String> {
        vec!["x".to_string()]
    }

    fn named_parameters(&self) -> Vec<(String, &HostTensor)> {
        vec![("w".to_string(), &self.w), ("b".to_string(), &self.b)]
    }

    fn export(&self, spec: &ExportSpec) -> Result<Graph> {
        let mut graph = Graph::new();
        graph.add_tensor(TensorInfo::new(
            "x",
            spec.input_dtypes[0],
            spec.input_shape(0),
            TensorKind::Input,
        ));
        graph.add_tensor(weight_of("w", &self.w));
        graph.add_tensor(weight_of("b", &self.b));
        graph.add_tensor(TensorInfo::weight("zero", DataType::F32, &[1], f32_bytes(&[0.0])));
        unknown(&mut graph, "xw", DataType::F32, TensorKind::Intermediate);
        unknown(&mut graph, "z", DataType::F32, TensorKind::Intermediate);
        unknown(&mut graph, "y", DataType::F32, TensorKind::Output);
        unknown(&mut graph, "mask", DataType::Bool, TensorKind::Output);

        graph.add_node(Node::new("MatMul").with_name("mm").with_inputs(["x", "w"]).with_outputs(["xw"]));
        graph.add_node(Node::new("Add").with_name("bias").with_inputs(["xw", "b"]).with_outputs(["z"]));
        graph.add_node(Node::new("Relu").with_name("act").with_inputs(["z"]).with_outputs(["y"]));
        graph.add_node(
            Node::new("Greater")
                .with_name("positive")
                .with_inputs(["y", "zero"])
                .with_outputs(["mask"]),
        );

        graph.inputs = vec!["x".to_string()];
        graph.outputs = vec!["y".to_string(), "mask".to_string()];
        graph.metadata.name = "mlp".to_string();
        Ok(graph)
    }

    fn relocate(&mut self, device: DeviceHandle) {
        self.w.set_device(device);
        self.b.set_device(device);
    }
}

/// `y = a * scale + b`, or `y = a * scale` when `b` is absent.
///
/// `a` and `b` are `[n]`; `scale: [1]` is the only parameter.
#[derive(Debug)]
pub struct ScaleModule {
    pub scale: HostTensor,
}

impl ScaleModule {
    pub fn new(scale: f32) -> Self {
        Self {
            scale: HostTensor::from_vec(vec![scale], &[1])
                .unwrap()
                .with_requires_grad(true),
        }
    }
}

impl HostModule for ScaleModule {
    fn forward_signature(&self) -> Vec<String> {
        vec!["a".to_string(), "b".to_string()]
    }

    fn named_parameters(&self) -> Vec<(String, &HostTensor)> {
        vec![("scale".to_string(), &self.scale)]
    }

    fn export(&self, spec: &ExportSpec) -> Result<Graph> {
        let mut graph = Graph::new();
        for (index, name) in spec.input_names.iter().enumerate() {
            graph.add_tensor(TensorInfo::new(
                name.as_str(),
                spec.input_dtypes[index],
                spec.input_shape(index),
                TensorKind::Input,
            ));
        }
        graph.add_tensor(weight_of("scale", &self.scale));
        unknown(&mut graph, "y", DataType::F32, TensorKind::Output);

        if spec.input_names.iter().any(|name| name == "b") {
            unknown(&mut graph, "scaled", DataType::F32, TensorKind::Intermediate);
            graph.add_node(
                Node::new("Mul")
                    .with_name("mul")
                    .with_inputs(["a", "scale"])
                    .with_outputs(["scaled"]),
            );
            graph.add_node(
                Node::new("Add")
                    .with_name("add")
                    .with_inputs(["scaled", "b"])
                    .with_outputs(["y"]),
            );
        } else {
            graph.add_node(
                Node::new("Mul")
                    .with_name("mul")
                    .with_inputs(["a", "scale"])
                    .with_outputs(["y"]),
            );
        }

        graph.inputs = spec.input_names.clone();
        graph.outputs = vec!["y".to_string()];
        graph.metadata.name = "scale".to_string();
        Ok(graph)
    }

    fn relocate(&mut self, device: DeviceHandle) {
        self.scale.set_device(device);
    }
}

/// Stand-in accelerator whose "device memory" is host memory.
#[derive(Debug)]
pub struct HostAccelerator {
    index: u32,
    cpu: CpuExecutionProvider,
}

impl ExecutionProvider for HostAccelerator {
    fn name(&self) -> &str {
        "host-accelerator"
    }

    fn device(&self) -> DeviceHandle {
        DeviceHandle::accelerator(self.index)
    }

    fn kernel(&self, op_type: &str) -> Option<&dyn Kernel> {
        self.cpu.kernel(op_type)
    }

    unsafe fn read(&self, address: usize, len: usize) -> tessel_runtime::Result<Vec<u8>> {
        unsafe { self.cpu.read(address, len) }
    }

    unsafe fn write(&self, address: usize, bytes: &[u8]) -> tessel_runtime::Result<()> {
        unsafe { self.cpu.write(address, bytes) }
    }
}

/// Serves accelerators with [`HostAccelerator`] and the host with the CPU.
#[derive(Debug, Default)]
pub struct HostAcceleratorFactory;

impl ProviderFactory for HostAcceleratorFactory {
    fn providers_for(
        &self,
        device: DeviceHandle,
    ) -> tessel_runtime::Result<Vec<Arc<dyn ExecutionProvider>>> {
        if device.is_cpu() {
            return Ok(vec![Arc::new(CpuExecutionProvider::new())]);
        }
        if device.index() > 0 {
            return Err(RuntimeError::InvalidDevice(format!(
                "{} is not attached",
                device
            )));
        }
        Ok(vec![
            Arc::new(HostAccelerator {
                index: device.index(),
                cpu: CpuExecutionProvider::new(),
            }),
            Arc::new(CpuExecutionProvider::new()),
        ])
    }
}

/// Batch of `rows` inputs with three features each.
pub fn mlp_input(rows: usize) -> Vec<f32> {
    (0..rows * 3)
        .map(|i| ((i as f32) * 0.37).sin() * 2.0)
        .collect()
}

/// Pre-activation `x @ w + b` for a `[rows, 3]` batch.
fn mlp_preactivation(x: &[f32], w: &[f32], b: &[f32]) -> Vec<f32> {
    let rows = x.len() / 3;
    let mut z = vec![0.0f32; rows * 2];
    for r in 0..rows {
        for c in 0..2 {
            let mut acc = b[c];
            for k in 0..3 {
                acc += x[r * 3 + k] * w[k * 2 + c];
            }
            z[r * 2 + c] = acc;
        }
    }
    z
}

pub fn mlp_forward(x: &[f32], w: &[f32], b: &[f32]) -> Vec<f32> {
    mlp_preactivation(x, w, b)
        .into_iter()
        .map(|v| v.max(0.0))
        .collect()
}

/// Reference gradients `(dx, dw, db)` of the MLP for output gradient `dy`.
pub fn mlp_backward(
    x: &[f32],
    w: &[f32],
    b: &[f32],
    dy: &[f32],
) -> (Vec<f32>, Vec<f32>, Vec<f32>) {
    let rows = x.len() / 3;
    let z = mlp_preactivation(x, w, b);
    let dz: Vec<f32> = z
        .iter()
        .zip(dy)
        .map(|(&v, &g)| if v > 0.0 { g } else { 0.0 })
        .collect();

    let mut dx = vec![0.0f32; rows * 3];
    let mut dw = vec![0.0f32; 6];
    let mut db = vec![0.0f32; 2];
    for r in 0..rows {
        for c in 0..2 {
            let g = dz[r * 2 + c];
            db[c] += g;
            for k in 0..3 {
                dx[r * 3 + k] += g * w[k * 2 + c];
                dw[k * 2 + c] += x[r * 3 + k] * g;
            }
        }
    }
    (dx, dw, db)
}

pub fn assert_close(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len());
    for (a, e) in actual.iter().zip(expected) {
        approx::assert_abs_diff_eq!(*a, *e, epsilon = 1e-4);
    }
}
