//! Graph summaries.

use std::collections::BTreeMap;
use std::fmt::Write;
use tessel_graph::{Graph, TensorKind};
use tessel_runtime::KernelRegistry;
use tessel_training::GradientRegistry;

/// Operator usage with kernel and gradient-rule coverage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpUsage {
    pub op_type: String,
    pub count: usize,
    pub has_kernel: bool,
    pub has_gradient: bool,
}

/// Count operators in `graph`, sorted by name.
pub fn op_usage(graph: &Graph) -> Vec<OpUsage> {
    let kernels = KernelRegistry::with_defaults();
    let gradients = GradientRegistry::with_defaults();

    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for node in &graph.nodes {
        *counts.entry(node.op_type.as_str()).or_default() += 1;
    }
    counts
        .into_iter()
        .map(|(op_type, count)| OpUsage {
            op_type: op_type.to_string(),
            count,
            has_kernel: kernels.contains(op_type),
            has_gradient: gradients.contains(op_type),
        })
        .collect()
}

/// Human-readable summary of a graph's contract and contents.
pub fn summarize(graph: &Graph) -> String {
    let mut out = String::new();
    // Writing to a String cannot fail.
    let _ = write_summary(&mut out, graph);
    out
}

fn write_summary(out: &mut String, graph: &Graph) -> std::fmt::Result {
    writeln!(out, "Model: {}", graph.metadata.name)?;
    writeln!(out, "  IR version: {}", graph.metadata.ir_version)?;
    writeln!(out, "  Producer: {}", graph.metadata.producer_name)?;
    writeln!(out, "  Nodes: {}", graph.nodes.len())?;
    writeln!(out, "  Tensors: {}", graph.tensor_info.len())?;
    writeln!(out)?;

    writeln!(out, "Inputs ({}):", graph.inputs.len())?;
    for name in &graph.inputs {
        if let Ok(info) = graph.tensor_by_name(name) {
            let marker = if graph.is_optional_input(name) {
                " (optional)"
            } else {
                ""
            };
            writeln!(out, "  {} - {} {}{}", info.name, info.dtype, info.shape, marker)?;
        }
    }
    writeln!(out)?;

    writeln!(out, "Outputs ({}):", graph.outputs.len())?;
    for name in &graph.outputs {
        if let Ok(info) = graph.tensor_by_name(name) {
            writeln!(out, "  {} - {} {}", info.name, info.dtype, info.shape)?;
        }
    }
    writeln!(out)?;

    let weights: Vec<_> = graph
        .tensor_info
        .iter()
        .filter(|info| info.kind == TensorKind::Weight && info.initializer.is_some())
        .collect();
    if !weights.is_empty() {
        writeln!(out, "Initializers ({}):", weights.len())?;
        for info in weights {
            writeln!(out, "  {} - {} {}", info.name, info.dtype, info.shape)?;
        }
        writeln!(out)?;
    }

    writeln!(out, "Operators:")?;
    for usage in op_usage(graph) {
        let mut notes = Vec::new();
        if !usage.has_kernel {
            notes.push("no cpu kernel");
        }
        if !usage.has_gradient {
            notes.push("no gradient rule");
        }
        if notes.is_empty() {
            writeln!(out, "  {} x{}", usage.op_type, usage.count)?;
        } else {
            writeln!(
                out,
                "  {} x{} ({})",
                usage.op_type,
                usage.count,
                notes.join(", ")
            )?;
        }
    }
    Ok(())
}
