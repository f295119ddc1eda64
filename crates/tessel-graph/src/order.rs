//! Execution ordering for graph nodes.
//!
//! Builds a dependency graph over node data edges and orders it
//! topologically.

use crate::graph::{Graph, NodeId};
use crate::{GraphError, Result};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Topo;
use std::collections::HashMap;

impl Graph {
    /// Node ids in an order where every producer precedes its consumers.
    pub fn topological_order(&self) -> Result<Vec<NodeId>> {
        let dep_graph = self.dependency_graph();

        if petgraph::algo::is_cyclic_directed(&dep_graph) {
            let culprit = petgraph::algo::toposort(&dep_graph, None)
                .err()
                .map(|cycle| dep_graph[cycle.node_id()])
                .map(|id| self.nodes[id].display_name().to_string())
                .unwrap_or_default();
            return Err(GraphError::Cycle(culprit));
        }

        let mut topo = Topo::new(&dep_graph);
        let mut sorted = Vec::with_capacity(self.nodes.len());
        while let Some(idx) = topo.next(&dep_graph) {
            sorted.push(dep_graph[idx]);
        }

        if sorted.len() != self.nodes.len() {
            return Err(GraphError::InvalidGraph(
                "Topological sort did not visit all nodes".to_string(),
            ));
        }

        Ok(sorted)
    }

    /// Nodes that (transitively) consume any of `roots`, in node order.
    pub fn downstream_of(&self, roots: &[String]) -> Result<Vec<NodeId>> {
        let mut tainted: std::collections::HashSet<&str> =
            roots.iter().map(String::as_str).collect();
        let mut affected = vec![false; self.nodes.len()];

        for id in self.topological_order()? {
            let node = &self.nodes[id];
            if node.inputs.iter().any(|i| tainted.contains(i.as_str())) {
                affected[id] = true;
                for output in &node.outputs {
                    tainted.insert(output.as_str());
                }
            }
        }

        Ok((0..self.nodes.len()).filter(|&id| affected[id]).collect())
    }

    /// Dependency graph where edges point from producer to consumer.
    fn dependency_graph(&self) -> DiGraph<NodeId, ()> {
        let mut dep_graph = DiGraph::new();
        let indices: Vec<NodeIndex> = (0..self.nodes.len())
            .map(|id| dep_graph.add_node(id))
            .collect();

        let mut producers: HashMap<&str, NodeId> = HashMap::new();
        for (node_id, node) in self.nodes.iter().enumerate() {
            for output in node.outputs.iter().filter(|o| !o.is_empty()) {
                producers.insert(output, node_id);
            }
        }

        for (consumer_id, node) in self.nodes.iter().enumerate() {
            for input in node.inputs.iter().filter(|i| !i.is_empty()) {
                if let Some(&producer_id) = producers.get(input.as_str()) {
                    dep_graph.add_edge(indices[producer_id], indices[consumer_id], ());
                }
            }
        }

        dep_graph
    }
}
