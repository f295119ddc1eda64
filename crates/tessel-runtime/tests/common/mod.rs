//! Common test utilities for session and binding tests.
//!
//! Shared graph builders and a host-backed stand-in for an accelerator
//! provider.

#![allow(dead_code)]

use tessel_graph::{
    AttributeValue, DataType, Dimension, Graph, Node, TensorInfo, TensorKind, TensorShape,
};
use tessel_runtime::{
    CpuExecutionProvider, DeviceHandle, ExecutionProvider, Kernel, Result, YIELD_GRAD_INDICES,
    YIELD_OP,
};

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

fn batch_by(cols: usize) -> TensorShape {
    TensorShape::Dynamic(vec![
        Dimension::Named("batch".to_string()),
        Dimension::Static(cols),
    ])
}

fn finish(mut graph: Graph, name: &str) -> Graph {
    graph.metadata.name = name.to_string();
    graph.metadata.ir_version = 9;
    graph.metadata.producer_name = "tessel_test".to_string();
    graph.metadata.model_version = 1;
    graph
}

/// One input, two outputs:
/// - y1 = Relu(x)
/// - y2 = Neg(x)
///
/// `x` is `[batch, 3]` float32.
pub fn make_two_output_graph() -> Graph {
    let mut graph = Graph::new();
    graph.add_tensor(TensorInfo::new("x", DataType::F32, batch_by(3), TensorKind::Input));
    graph.add_tensor(TensorInfo::new("y1", DataType::F32, batch_by(3), TensorKind::Output));
    graph.add_tensor(TensorInfo::new("y2", DataType::F32, batch_by(3), TensorKind::Output));

    graph.add_node(Node::new("Relu").with_name("relu").with_inputs(["x"]).with_outputs(["y1"]));
    graph.add_node(Node::new("Neg").with_name("neg").with_inputs(["x"]).with_outputs(["y2"]));

    graph.inputs = vec!["x".to_string()];
    graph.outputs = vec!["y1".to_string(), "y2".to_string()];
    finish(graph, "two_outputs")
}

/// `y = x * scale` where `scale` is an optional input defaulting to 2.0.
pub fn make_optional_input_graph() -> Graph {
    let mut graph = Graph::new();
    graph.add_tensor(TensorInfo::new(
        "x",
        DataType::F32,
        TensorShape::Static(vec![2]),
        TensorKind::Input,
    ));
    let mut scale = TensorInfo::weight("scale", DataType::F32, &[1], f32_bytes(&[2.0]));
    scale.kind = TensorKind::Input;
    graph.add_tensor(scale);
    graph.add_tensor(TensorInfo::new(
        "y",
        DataType::F32,
        TensorShape::Static(vec![2]),
        TensorKind::Output,
    ));

    graph.add_node(
        Node::new("Mul")
            .with_name("scale")
            .with_inputs(["x", "scale"])
            .with_outputs(["y"]),
    );

    graph.inputs = vec!["x".to_string(), "scale".to_string()];
    graph.outputs = vec!["y".to_string()];
    finish(graph, "optional_input")
}

/// `mask = x > 0` with a boolean output.
pub fn make_bool_output_graph() -> Graph {
    let mut graph = Graph::new();
    graph.add_tensor(TensorInfo::new(
        "x",
        DataType::F32,
        TensorShape::Static(vec![4]),
        TensorKind::Input,
    ));
    graph.add_tensor(TensorInfo::weight("zero", DataType::F32, &[1], f32_bytes(&[0.0])));
    graph.add_tensor(TensorInfo::new(
        "mask",
        DataType::Bool,
        TensorShape::Static(vec![4]),
        TensorKind::Output,
    ));

    graph.add_node(
        Node::new("Greater")
            .with_name("positive")
            .with_inputs(["x", "zero"])
            .with_outputs(["mask"]),
    );

    graph.inputs = vec!["x".to_string()];
    graph.outputs = vec!["mask".to_string()];
    finish(graph, "bool_output")
}

/// `y = Relu(x @ w + b)` with `x: [batch, 3]`, `w: [3, 2]`, `b: [2]`.
pub fn make_linear_relu_graph() -> Graph {
    let mut graph = Graph::new();
    graph.add_tensor(TensorInfo::new("x", DataType::F32, batch_by(3), TensorKind::Input));
    graph.add_tensor(TensorInfo::weight(
        "w",
        DataType::F32,
        &[3, 2],
        f32_bytes(&[0.5, -1.0, 1.5, 0.25, -0.75, 2.0]),
    ));
    graph.add_tensor(TensorInfo::weight("b", DataType::F32, &[2], f32_bytes(&[0.1, -0.2])));
    for name in ["xw", "z"] {
        graph.add_tensor(TensorInfo::new(
            name,
            DataType::F32,
            batch_by(2),
            TensorKind::Intermediate,
        ));
    }
    graph.add_tensor(TensorInfo::new("y", DataType::F32, batch_by(2), TensorKind::Output));

    graph.add_node(Node::new("MatMul").with_name("mm").with_inputs(["x", "w"]).with_outputs(["xw"]));
    graph.add_node(Node::new("Add").with_name("bias").with_inputs(["xw", "b"]).with_outputs(["z"]));
    graph.add_node(Node::new("Relu").with_name("act").with_inputs(["z"]).with_outputs(["y"]));

    graph.inputs = vec!["x".to_string()];
    graph.outputs = vec!["y".to_string()];
    finish(graph, "linear_relu")
}

/// Hand-written training graph for `y = x * w` with `x, w: [2]`.
///
/// Forward: `y = Mul(x, w)`; yield point feeds `y_grad`.
/// Backward: `x_grad = y_grad * w`, `w_grad = y_grad * x`.
pub fn make_split_training_graph() -> Graph {
    let mut graph = Graph::new();
    graph.add_tensor(TensorInfo::new(
        "x",
        DataType::F32,
        TensorShape::Static(vec![2]),
        TensorKind::Input,
    ));
    let mut w = TensorInfo::weight("w", DataType::F32, &[2], f32_bytes(&[3.0, -1.0]));
    w.kind = TensorKind::Input;
    graph.add_tensor(w);
    for (name, kind) in [
        ("y", TensorKind::Intermediate),
        ("y_grad", TensorKind::Intermediate),
        ("x_grad", TensorKind::Output),
        ("w_grad", TensorKind::Output),
    ] {
        graph.add_tensor(TensorInfo::new(
            name,
            DataType::F32,
            TensorShape::Static(vec![2]),
            kind,
        ));
    }

    graph.add_node(Node::new("Mul").with_name("fwd").with_inputs(["x", "w"]).with_outputs(["y"]));
    graph.add_node(
        Node::new(YIELD_OP)
            .with_name("yield")
            .with_inputs(["y"])
            .with_outputs(["y_grad"])
            .with_attr(YIELD_GRAD_INDICES, AttributeValue::Ints(vec![0])),
    );
    graph.add_node(
        Node::new("Mul")
            .with_name("dx")
            .with_inputs(["y_grad", "w"])
            .with_outputs(["x_grad"]),
    );
    graph.add_node(
        Node::new("Mul")
            .with_name("dw")
            .with_inputs(["y_grad", "x"])
            .with_outputs(["w_grad"]),
    );

    graph.inputs = vec!["x".to_string(), "w".to_string()];
    graph.outputs = vec!["x_grad".to_string(), "w_grad".to_string()];
    finish(graph, "split_training")
}

/// Stand-in accelerator whose "device memory" is host memory.
///
/// Implements only the operators in `ops`, delegating to the CPU kernels.
#[derive(Debug)]
pub struct HostBackedAccelerator {
    index: u32,
    ops: Vec<&'static str>,
    cpu: CpuExecutionProvider,
}

impl HostBackedAccelerator {
    pub fn new(index: u32, ops: &[&'static str]) -> Self {
        Self {
            index,
            ops: ops.to_vec(),
            cpu: CpuExecutionProvider::new(),
        }
    }
}

impl ExecutionProvider for HostBackedAccelerator {
    fn name(&self) -> &str {
        "host-accelerator"
    }

    fn device(&self) -> DeviceHandle {
        DeviceHandle::accelerator(self.index)
    }

    fn kernel(&self, op_type: &str) -> Option<&dyn Kernel> {
        if self.ops.contains(&op_type) {
            self.cpu.kernel(op_type)
        } else {
            None
        }
    }

    unsafe fn read(&self, address: usize, len: usize) -> Result<Vec<u8>> {
        unsafe { self.cpu.read(address, len) }
    }

    unsafe fn write(&self, address: usize, bytes: &[u8]) -> Result<()> {
        unsafe { self.cpu.write(address, bytes) }
    }
}
