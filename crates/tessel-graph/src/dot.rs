//! Graphviz DOT export.

use crate::graph::Graph;

/// Convert a graph to Graphviz DOT format.
///
/// Inputs are drawn as blue ellipses, outputs as green ellipses, and
/// operators as boxes with edges from and to the tensors they touch.
pub fn to_dot(graph: &Graph) -> String {
    let mut dot = String::from("digraph tessel_graph {\n");
    dot.push_str("    rankdir=TB;\n");
    dot.push_str("    node [shape=box, style=rounded];\n");
    dot.push_str("    concentrate=true;\n");
    dot.push_str("    nodesep=0.3;\n");
    dot.push_str("    ranksep=0.5;\n\n");

    if !graph.metadata.name.is_empty() {
        dot.push_str(&format!(
            "    label=\"{}\";\n",
            escape_dot_string(&graph.metadata.name)
        ));
    }
    dot.push_str("    labelloc=\"t\";\n\n");

    for input in &graph.inputs {
        let input_name = escape_dot_string(input);
        dot.push_str(&format!(
            "    \"{}\" [shape=ellipse, style=filled, fillcolor=lightblue, label=\"{}\"];\n",
            input_name, input_name
        ));
    }

    for output in &graph.outputs {
        let output_name = escape_dot_string(output);
        dot.push_str(&format!(
            "    \"{}\" [shape=ellipse, style=filled, fillcolor=lightgreen, label=\"{}\"];\n",
            output_name, output_name
        ));
    }

    dot.push('\n');

    for (idx, node) in graph.nodes.iter().enumerate() {
        let node_id = if !node.name.is_empty() {
            escape_dot_string(&node.name)
        } else {
            format!("node_{}", idx)
        };

        let op_type = escape_dot_string(&node.op_type);
        let label = if !node.name.is_empty() {
            format!("{}\\n[{}]", escape_dot_string(&node.name), op_type)
        } else {
            op_type
        };

        dot.push_str(&format!(
            "    \"{}\" [label=\"{}\", style=filled, fillcolor=lightyellow];\n",
            node_id, label
        ));

        for input in node.inputs.iter().filter(|i| !i.is_empty()) {
            dot.push_str(&format!(
                "    \"{}\" -> \"{}\";\n",
                escape_dot_string(input),
                node_id
            ));
        }

        for output in node.outputs.iter().filter(|o| !o.is_empty()) {
            dot.push_str(&format!(
                "    \"{}\" -> \"{}\";\n",
                node_id,
                escape_dot_string(output)
            ));
        }
    }

    dot.push_str("}\n");
    dot
}

/// Escape special characters in DOT strings.
fn escape_dot_string(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
