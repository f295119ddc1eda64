//! Tests for gradient graph synthesis, executed through the runtime.

mod common;

use common::*;
use std::collections::HashMap;
use tessel_graph::{
    AttributeValue, DataType, Graph, Node, TensorInfo, TensorKind, TensorShape, to_bytes,
};
use tessel_runtime::{
    BoundBuffer, DeviceHandle, ExecutionSession, RunOptions, SessionOptions, Value,
    YIELD_GRAD_INDICES, YIELD_OP,
};
use tessel_training::{
    ExportSpec, GradientBuilderConfig, GradientGraphBuilder, GradientRegistry, HostModule,
    TrainingError,
};

fn mlp_graph() -> Graph {
    let spec = ExportSpec {
        input_names: vec!["x".to_string()],
        input_dtypes: vec![DataType::F32],
        dynamic_axes: vec![vec!["batch".to_string(), "features".to_string()]],
    };
    MlpModule::new().export(&spec).unwrap()
}

fn full_config() -> GradientBuilderConfig {
    GradientBuilderConfig::new()
        .with_trainable(["w", "b"])
        .with_require_grad(["x"])
}

fn static_input(graph: &mut Graph, name: &str, dims: &[usize]) {
    graph.add_tensor(TensorInfo::new(
        name,
        DataType::F32,
        TensorShape::Static(dims.to_vec()),
        TensorKind::Input,
    ));
}

fn intermediates(graph: &mut Graph, names: &[&str]) {
    for name in names {
        graph.add_tensor(TensorInfo::new(
            *name,
            DataType::F32,
            TensorShape::Unknown,
            TensorKind::Intermediate,
        ));
    }
}

/// `y = x * x` with `x: [3]`.
fn square_graph() -> Graph {
    let mut graph = Graph::new();
    static_input(&mut graph, "x", &[3]);
    graph.add_tensor(TensorInfo::new(
        "y",
        DataType::F32,
        TensorShape::Unknown,
        TensorKind::Output,
    ));
    graph.add_node(Node::new("Mul").with_name("square").with_inputs(["x", "x"]).with_outputs(["y"]));
    graph.inputs = vec!["x".to_string()];
    graph.outputs = vec!["y".to_string()];
    graph.metadata.name = "square".to_string();
    graph
}

/// A scalar function of `x: [2, 3]` touching most differentiable operators:
///
/// ```text
/// q = Sigmoid(x) / (Exp(-x) + 2)
/// c = Cast(Identity(Transpose(Tanh(x) - q)))      [3, 2]
/// y = ReduceMean(ReduceSum(c, axes=[1]) * c)      []
/// ```
fn composite_graph() -> Graph {
    let mut graph = Graph::new();
    static_input(&mut graph, "x", &[2, 3]);
    graph.add_tensor(TensorInfo::weight("two", DataType::F32, &[1], f32_bytes(&[2.0])));
    intermediates(
        &mut graph,
        &["s", "n", "e", "d", "q", "t", "u", "p", "i", "c", "r", "k"],
    );
    graph.add_tensor(TensorInfo::new(
        "y",
        DataType::F32,
        TensorShape::Unknown,
        TensorKind::Output,
    ));

    graph.add_node(Node::new("Sigmoid").with_inputs(["x"]).with_outputs(["s"]));
    graph.add_node(Node::new("Neg").with_inputs(["x"]).with_outputs(["n"]));
    graph.add_node(Node::new("Exp").with_inputs(["n"]).with_outputs(["e"]));
    graph.add_node(Node::new("Add").with_inputs(["e", "two"]).with_outputs(["d"]));
    graph.add_node(Node::new("Div").with_inputs(["s", "d"]).with_outputs(["q"]));
    graph.add_node(Node::new("Tanh").with_inputs(["x"]).with_outputs(["t"]));
    graph.add_node(Node::new("Sub").with_inputs(["t", "q"]).with_outputs(["u"]));
    graph.add_node(Node::new("Transpose").with_inputs(["u"]).with_outputs(["p"]));
    graph.add_node(Node::new("Identity").with_inputs(["p"]).with_outputs(["i"]));
    graph.add_node(
        Node::new("Cast")
            .with_inputs(["i"])
            .with_outputs(["c"])
            .with_attr("to", AttributeValue::Int(i64::from(DataType::F32.onnx_code()))),
    );
    graph.add_node(
        Node::new("ReduceSum")
            .with_inputs(["c"])
            .with_outputs(["r"])
            .with_attr("axes", AttributeValue::Ints(vec![1])),
    );
    graph.add_node(Node::new("Mul").with_inputs(["r", "c"]).with_outputs(["k"]));
    graph.add_node(
        Node::new("ReduceMean")
            .with_inputs(["k"])
            .with_outputs(["y"])
            .with_attr("keepdims", AttributeValue::Int(0)),
    );

    graph.inputs = vec!["x".to_string()];
    graph.outputs = vec!["y".to_string()];
    graph.metadata.name = "composite".to_string();
    graph
}

/// Run a built training graph once and return the named gradient.
fn run_training(
    graph: &Graph,
    x: &[f32],
    x_shape: &[i64],
    dy: &[f32],
    dy_shape: &[i64],
    grad: &str,
) -> Vec<f32> {
    let mut session =
        ExecutionSession::from_graph(graph.clone(), SessionOptions::default()).unwrap();
    let mut binding = session.io_binding();
    unsafe {
        binding
            .bind_input("x", DeviceHandle::cpu(), DataType::F32, x_shape, x.as_ptr() as usize)
            .unwrap();
        session.run_forward(&binding, &RunOptions::default()).unwrap();

        let yield_grad = BoundBuffer::new(
            "y_grad",
            DeviceHandle::cpu(),
            DataType::F32,
            dy_shape,
            dy.as_ptr() as usize,
        )
        .unwrap();
        session
            .run_backward(&mut binding, &[yield_grad], &RunOptions::default())
            .unwrap();
    }
    binding.output(grad).unwrap().to_vec::<f32>().unwrap()
}

#[test]
fn test_training_graph_structure() {
    init_tracing();
    let mut builder = GradientGraphBuilder::new();
    builder.initialize(mlp_graph(), full_config()).unwrap();
    builder.build(&[vec![4, 3]]).unwrap();

    let info = builder.get_graph_info().unwrap();
    assert_eq!(info.user_input_names, vec!["x"]);
    assert_eq!(info.initializer_names, vec!["w", "b", "zero"]);
    assert_eq!(info.input_names_require_grad, vec!["x"]);
    assert_eq!(info.trainable_initializer_names, vec!["w", "b"]);
    assert_eq!(info.output_names, vec!["y", "mask"]);
    assert_eq!(info.backward_output_grad_names, vec!["y_grad"]);
    assert_eq!(info.gradient_output_names, vec!["x_grad", "w_grad", "b_grad"]);

    let graph = builder.get_training_graph().unwrap();
    assert_eq!(graph.inputs, vec!["x", "w", "b", "zero"]);
    assert!(graph.is_optional_input("w"));
    assert!(!graph.is_optional_input("x"));
    assert_eq!(graph.outputs, info.gradient_output_names);
    assert_eq!(
        graph.tensor_by_name("x").unwrap().shape,
        TensorShape::Static(vec![4, 3])
    );
    assert_eq!(
        graph.tensor_by_name("x_grad").unwrap().shape,
        TensorShape::Static(vec![4, 3])
    );
    assert_eq!(graph.tensor_by_name("x_grad").unwrap().kind, TensorKind::Output);

    let yields: Vec<&Node> = graph.nodes.iter().filter(|n| n.op_type == YIELD_OP).collect();
    assert_eq!(yields.len(), 1);
    assert_eq!(yields[0].inputs, vec!["y", "mask"]);
    assert_eq!(yields[0].outputs, vec!["y_grad"]);
    assert_eq!(
        yields[0].attr::<Vec<i64>>(YIELD_GRAD_INDICES).unwrap(),
        vec![0]
    );
}

#[test]
fn test_build_is_deterministic() {
    let mut first = GradientGraphBuilder::new();
    first.initialize(mlp_graph(), full_config()).unwrap();
    first.build(&[vec![2, 3]]).unwrap();

    let mut second = GradientGraphBuilder::new();
    second.initialize(mlp_graph(), full_config()).unwrap();
    second.build(&[vec![2, 3]]).unwrap();

    assert_eq!(
        first.training_graph_bytes().unwrap(),
        second.training_graph_bytes().unwrap()
    );
    assert_eq!(
        to_bytes(first.get_training_graph().unwrap()).unwrap(),
        first.training_graph_bytes().unwrap()
    );
}

#[test]
fn test_reinitialize_discards_built_graph() {
    let mut builder = GradientGraphBuilder::new();
    builder.initialize(mlp_graph(), full_config()).unwrap();
    builder.build(&[vec![2, 3]]).unwrap();
    assert!(builder.get_training_graph().is_ok());

    builder
        .initialize(mlp_graph(), GradientBuilderConfig::new().with_trainable(["w"]))
        .unwrap();
    assert!(matches!(builder.get_training_graph(), Err(TrainingError::NotBuilt)));
    assert!(matches!(builder.get_graph_info(), Err(TrainingError::NotBuilt)));
    assert!(builder.built_signature().is_none());
}

#[test]
fn test_invalid_configurations_rejected() {
    let mut builder = GradientGraphBuilder::new();

    let unknown = GradientBuilderConfig::new().with_trainable(["missing"]);
    assert!(matches!(
        builder.initialize(mlp_graph(), unknown),
        Err(TrainingError::GraphBuildError(_))
    ));

    let duplicate = GradientBuilderConfig::new().with_require_grad(["x", "x"]);
    assert!(matches!(
        builder.initialize(mlp_graph(), duplicate),
        Err(TrainingError::GraphBuildError(_))
    ));

    // Initializers are not user inputs.
    let not_input = GradientBuilderConfig::new().with_require_grad(["w"]);
    assert!(matches!(
        builder.initialize(mlp_graph(), not_input),
        Err(TrainingError::GraphBuildError(_))
    ));
    assert!(!builder.is_initialized());
}

#[test]
fn test_integer_input_cannot_require_grad() {
    let mut graph = Graph::new();
    graph.add_tensor(TensorInfo::new(
        "idx",
        DataType::I64,
        TensorShape::Static(vec![2]),
        TensorKind::Input,
    ));
    graph.add_tensor(TensorInfo::new(
        "y",
        DataType::F32,
        TensorShape::Static(vec![2]),
        TensorKind::Output,
    ));
    graph.add_node(
        Node::new("Cast")
            .with_inputs(["idx"])
            .with_outputs(["y"])
            .with_attr("to", AttributeValue::Int(i64::from(DataType::F32.onnx_code()))),
    );
    graph.inputs = vec!["idx".to_string()];
    graph.outputs = vec!["y".to_string()];

    let mut builder = GradientGraphBuilder::new();
    let result = builder.initialize(graph, GradientBuilderConfig::new().with_require_grad(["idx"]));
    assert!(matches!(result, Err(TrainingError::GraphBuildError(m)) if m.contains("idx")));
}

#[test]
fn test_unreachable_source_rejected() {
    // `zero` only feeds the boolean mask.
    let mut builder = GradientGraphBuilder::new();
    builder
        .initialize(mlp_graph(), GradientBuilderConfig::new().with_trainable(["zero"]))
        .unwrap();
    let result = builder.build(&[vec![2, 3]]);
    assert!(matches!(result, Err(TrainingError::GraphBuildError(m)) if m.contains("zero")));
}

#[test]
fn test_signature_checked_against_declaration() {
    let mut builder = GradientGraphBuilder::new();
    builder.initialize(mlp_graph(), full_config()).unwrap();

    assert!(matches!(
        builder.build(&[vec![2, 3], vec![1]]),
        Err(TrainingError::GraphBuildError(_))
    ));
    assert!(matches!(
        builder.build(&[vec![2]]),
        Err(TrainingError::GraphBuildError(_))
    ));
}

#[test]
fn test_missing_rule_names_node() {
    let mut builder = GradientGraphBuilder::with_registry(GradientRegistry::new());
    builder.initialize(mlp_graph(), full_config()).unwrap();
    let result = builder.build(&[vec![2, 3]]);
    assert!(matches!(result, Err(TrainingError::GraphBuildError(m)) if m.contains("act")));
}

#[test]
fn test_repeated_operand_accumulates() {
    init_tracing();
    let mut builder = GradientGraphBuilder::new();
    builder
        .initialize(square_graph(), GradientBuilderConfig::new().with_require_grad(["x"]))
        .unwrap();
    builder.build(&[vec![3]]).unwrap();

    let graph = builder.get_training_graph().unwrap();
    let sum = graph
        .nodes
        .iter()
        .find(|n| n.op_type == "Sum")
        .unwrap();
    assert_eq!(sum.inputs, vec!["x_grad_0", "x_grad_1"]);
    assert_eq!(sum.outputs, vec!["x_grad"]);

    let x = [1.0f32, 2.0, -3.0];
    let dy = [1.0f32, 1.0, 0.5];
    let dx = run_training(graph, &x, &[3], &dy, &[3], "x_grad");
    assert_eq!(dx, vec![2.0, 4.0, -3.0]);
}

#[test]
fn test_gradients_match_finite_differences() {
    init_tracing();
    let forward = composite_graph();
    let mut builder = GradientGraphBuilder::new();
    builder
        .initialize(forward.clone(), GradientBuilderConfig::new().with_require_grad(["x"]))
        .unwrap();
    builder.build(&[vec![2, 3]]).unwrap();

    let x = [0.3f32, -0.7, 1.1, -1.4, 0.05, 0.9];
    let analytic = run_training(
        builder.get_training_graph().unwrap(),
        &x,
        &[2, 3],
        &[1.0],
        &[],
        "x_grad",
    );

    let mut session = ExecutionSession::from_graph(forward, SessionOptions::default()).unwrap();
    let mut eval = |values: &[f32]| -> f32 {
        let mut feed = HashMap::new();
        feed.insert(
            "x".to_string(),
            Value::from_vec(values.to_vec(), &[2, 3]).unwrap(),
        );
        let out = session.run(&[], feed, &RunOptions::default()).unwrap();
        out[0].to_vec::<f32>().unwrap()[0]
    };

    let eps = 1e-2f32;
    for i in 0..x.len() {
        let mut plus = x;
        let mut minus = x;
        plus[i] += eps;
        minus[i] -= eps;
        let numeric = (eval(&plus) - eval(&minus)) / (2.0 * eps);
        approx::assert_abs_diff_eq!(analytic[i], numeric, epsilon = 2e-3);
    }
}
