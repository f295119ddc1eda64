//! Loading and saving graph documents.

use crate::graph::Graph;
use crate::Result;
use std::fs;
use std::path::{Path, PathBuf};

/// Where a serialized graph comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    /// A graph document on disk.
    Path(PathBuf),

    /// A graph document already in memory.
    Bytes(Vec<u8>),
}

impl From<&Path> for ModelSource {
    fn from(path: &Path) -> Self {
        ModelSource::Path(path.to_path_buf())
    }
}

impl From<PathBuf> for ModelSource {
    fn from(path: PathBuf) -> Self {
        ModelSource::Path(path)
    }
}

impl From<&str> for ModelSource {
    fn from(path: &str) -> Self {
        ModelSource::Path(PathBuf::from(path))
    }
}

impl From<Vec<u8>> for ModelSource {
    fn from(bytes: Vec<u8>) -> Self {
        ModelSource::Bytes(bytes)
    }
}

/// Load and validate a graph from a path or an in-memory document.
///
/// # Example
///
/// ```no_run
/// use tessel_graph::{ModelSource, load_graph};
///
/// let graph = load_graph(&ModelSource::from("path/to/model.json"))?;
/// # Ok::<(), tessel_graph::GraphError>(())
/// ```
pub fn load_graph(source: &ModelSource) -> Result<Graph> {
    let mut graph: Graph = match source {
        ModelSource::Path(path) => {
            let bytes = fs::read(path)?;
            serde_json::from_slice(&bytes)?
        }
        ModelSource::Bytes(bytes) => serde_json::from_slice(bytes)?,
    };
    graph.reindex()?;
    graph.validate()?;
    tracing::debug!(
        name = %graph.metadata.name,
        nodes = graph.nodes.len(),
        tensors = graph.tensor_info.len(),
        "loaded graph"
    );
    Ok(graph)
}

/// Serialize a graph into an in-memory document.
pub fn to_bytes(graph: &Graph) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(graph)?)
}

/// Write a graph document to disk.
pub fn save_graph<P: AsRef<Path>>(graph: &Graph, path: P) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(graph)?;
    fs::write(path, bytes)?;
    Ok(())
}
