//! Offline training graph synthesis.

use anyhow::{Context, Result, bail};
use std::collections::HashMap;
use tessel_graph::Graph;
use tessel_training::{GradientBuilderConfig, GradientGraphBuilder, GraphMetadata, ShapeSignature};

/// Parse `name=d0,d1,...` into an input name and its dimensions.
///
/// `name=` denotes a scalar.
pub fn parse_shape(arg: &str) -> Result<(String, Vec<usize>)> {
    let Some((name, dims)) = arg.split_once('=') else {
        bail!("Invalid shape '{}'. Expected format: name=d0,d1,...", arg);
    };
    if name.is_empty() {
        bail!("Invalid shape '{}': missing input name", arg);
    }
    let dims = if dims.trim().is_empty() {
        Vec::new()
    } else {
        dims.split(',')
            .map(|d| {
                d.trim()
                    .parse::<usize>()
                    .with_context(|| format!("Invalid dimension '{}' for input '{}'", d, name))
            })
            .collect::<Result<Vec<_>>>()?
    };
    Ok((name.to_string(), dims))
}

/// Order `shapes` by the graph's user inputs.
///
/// Inputs without an explicit shape fall back to their declared static
/// shape.
pub fn signature_for(graph: &Graph, shapes: &[(String, Vec<usize>)]) -> Result<ShapeSignature> {
    let mut given: HashMap<&str, &Vec<usize>> = HashMap::new();
    for (name, dims) in shapes {
        if given.insert(name.as_str(), dims).is_some() {
            bail!("Shape for input '{}' given more than once", name);
        }
    }

    let mut signature = Vec::new();
    for name in graph.inputs.iter().filter(|n| !graph.is_optional_input(n)) {
        let dims = match given.remove(name.as_str()) {
            Some(dims) => dims.clone(),
            None => graph
                .tensor_by_name(name)?
                .shape
                .as_static()
                .map(<[usize]>::to_vec)
                .with_context(|| format!("Input '{}' has no static shape; pass --shape", name))?,
        };
        signature.push(dims);
    }
    if let Some(name) = given.keys().next() {
        bail!("'{}' is not a user input of the graph", name);
    }
    Ok(signature)
}

/// Build the training graph for `forward`.
pub fn synthesize(
    forward: Graph,
    train: &[String],
    require_grad: &[String],
    shapes: &[(String, Vec<usize>)],
) -> Result<(Graph, GraphMetadata)> {
    let signature = signature_for(&forward, shapes)?;
    let config = GradientBuilderConfig::new()
        .with_trainable(train.iter().cloned())
        .with_require_grad(require_grad.iter().cloned());

    let mut builder = GradientGraphBuilder::new();
    builder
        .initialize(forward, config)
        .context("Invalid gradient configuration")?;
    builder
        .build(&signature)
        .context("Failed to build training graph")?;

    let graph = builder.get_training_graph()?.clone();
    let info = builder.get_graph_info()?.clone();
    tracing::info!(
        nodes = graph.nodes.len(),
        gradients = ?info.gradient_output_names,
        "synthesized training graph"
    );
    Ok((graph, info))
}
