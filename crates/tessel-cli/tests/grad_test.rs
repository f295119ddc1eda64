//! End-to-end tests of the CLI library over graph documents on disk.

use tessel_cli::{grad, inspect};
use tessel_graph::{
    DataType, Dimension, Graph, ModelSource, Node, TensorInfo, TensorKind, TensorShape,
    load_graph, save_graph,
};

/// `y = Sigmoid(x @ w)` with `x: [batch, 2]`, `w: [2, 1]`.
fn forward_graph() -> Graph {
    let mut graph = Graph::new();
    graph.add_tensor(TensorInfo::new(
        "x",
        DataType::F32,
        TensorShape::Dynamic(vec![Dimension::Named("batch".to_string()), Dimension::Static(2)]),
        TensorKind::Input,
    ));
    let w: [f32; 2] = [0.5, -0.5];
    let bytes = w.iter().flat_map(|v| v.to_le_bytes()).collect();
    graph.add_tensor(TensorInfo::weight("w", DataType::F32, &[2, 1], bytes));
    graph.add_tensor(TensorInfo::new("xw", DataType::F32, TensorShape::Unknown, TensorKind::Intermediate));
    graph.add_tensor(TensorInfo::new("y", DataType::F32, TensorShape::Unknown, TensorKind::Output));
    graph.add_node(Node::new("MatMul").with_name("mm").with_inputs(["x", "w"]).with_outputs(["xw"]));
    graph.add_node(Node::new("Sigmoid").with_name("act").with_inputs(["xw"]).with_outputs(["y"]));
    graph.inputs = vec!["x".to_string()];
    graph.outputs = vec!["y".to_string()];
    graph.metadata.name = "logistic".to_string();
    graph
}

#[test]
fn test_grad_from_saved_graph() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("logistic.json");
    save_graph(&forward_graph(), &path).unwrap();

    let forward = load_graph(&ModelSource::Path(path)).unwrap();
    let shapes = vec![grad::parse_shape("x=8,2").unwrap()];
    let (graph, info) = grad::synthesize(
        forward,
        &["w".to_string()],
        &["x".to_string()],
        &shapes,
    )
    .unwrap();

    assert_eq!(info.gradient_output_names, vec!["x_grad", "w_grad"]);
    assert_eq!(graph.metadata.name, "logistic_training");
    assert_eq!(
        graph.tensor_by_name("x_grad").unwrap().shape,
        TensorShape::Static(vec![8, 2])
    );

    let out = dir.path().join("logistic_training.json");
    save_graph(&graph, &out).unwrap();
    let reloaded = load_graph(&ModelSource::Path(out)).unwrap();
    assert_eq!(reloaded.outputs, graph.outputs);

    let summary = inspect::summarize(&reloaded);
    assert!(summary.contains("Model: logistic_training"));
    assert!(summary.contains("w - float32 [2, 1] (optional)"));
}

#[test]
fn test_grad_rejects_unknown_names() {
    let shapes = vec![grad::parse_shape("x=4,2").unwrap()];
    assert!(grad::synthesize(forward_graph(), &["bias".to_string()], &[], &shapes).is_err());
    assert!(grad::synthesize(forward_graph(), &[], &[], &[]).is_err());
}
