//! Graph representation.
//!
//! This module defines the structured graph that sessions execute and the
//! gradient builder extends. Tensors are addressed by name; the id index is
//! rebuilt after deserialization with [`Graph::reindex`].

use crate::{GraphError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Unique identifier for a node in the graph.
pub type NodeId = usize;

/// Unique identifier for a tensor in the graph.
pub type TensorId = usize;

/// Computation graph: nodes, tensor metadata and the input/output contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Graph {
    /// All nodes (operations) in the graph.
    pub nodes: Vec<Node>,

    /// Name index into `tensor_info`.
    #[serde(skip)]
    pub tensors: HashMap<String, TensorId>,

    /// Tensor metadata.
    pub tensor_info: Vec<TensorInfo>,

    /// Names of input tensors, in declaration order.
    pub inputs: Vec<String>,

    /// Names of output tensors, in declaration order.
    pub outputs: Vec<String>,

    /// Model metadata.
    #[serde(default)]
    pub metadata: ModelMetadata,
}

/// Descriptive metadata about the model a graph came from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// Graph name.
    pub name: String,

    /// IR version.
    pub ir_version: i64,

    /// Producer name.
    pub producer_name: String,

    /// Model version.
    pub model_version: i64,
}

impl Graph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            tensors: HashMap::new(),
            tensor_info: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            metadata: ModelMetadata::default(),
        }
    }

    /// Get tensor ID by name.
    pub fn tensor_id(&self, name: &str) -> Result<TensorId> {
        self.tensors
            .get(name)
            .copied()
            .ok_or_else(|| GraphError::MissingTensor(name.to_string()))
    }

    /// Get tensor info by ID.
    pub fn tensor(&self, id: TensorId) -> Result<&TensorInfo> {
        self.tensor_info
            .get(id)
            .ok_or_else(|| GraphError::InvalidGraph(format!("Invalid tensor ID: {}", id)))
    }

    /// Get tensor info by name.
    pub fn tensor_by_name(&self, name: &str) -> Result<&TensorInfo> {
        let id = self.tensor_id(name)?;
        self.tensor(id)
    }

    /// Get mutable tensor info by name.
    pub fn tensor_by_name_mut(&mut self, name: &str) -> Result<&mut TensorInfo> {
        let id = self.tensor_id(name)?;
        self.tensor_info
            .get_mut(id)
            .ok_or_else(|| GraphError::InvalidGraph(format!("Invalid tensor ID: {}", id)))
    }

    /// Check whether a tensor with this name exists.
    pub fn has_tensor(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    /// Add a tensor to the graph.
    ///
    /// Adding a tensor whose name already exists replaces its metadata in place
    /// and keeps the original id.
    pub fn add_tensor(&mut self, info: TensorInfo) -> TensorId {
        if let Some(&id) = self.tensors.get(&info.name) {
            self.tensor_info[id] = info;
            return id;
        }
        let id = self.tensor_info.len();
        let name = info.name.clone();
        self.tensor_info.push(info);
        self.tensors.insert(name, id);
        id
    }

    /// Add a node to the graph.
    pub fn add_node(&mut self, node: Node) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(node);
        id
    }

    /// Rebuild the name index from `tensor_info`.
    ///
    /// Must be called after deserializing a graph.
    pub fn reindex(&mut self) -> Result<()> {
        self.tensors.clear();
        for (id, info) in self.tensor_info.iter().enumerate() {
            if self.tensors.insert(info.name.clone(), id).is_some() {
                return Err(GraphError::InvalidGraph(format!(
                    "Tensor '{}' is declared more than once",
                    info.name
                )));
            }
        }
        Ok(())
    }

    /// Whether a declared input may be omitted at execution time.
    ///
    /// Inputs that carry an initializer are optional: the initializer is used
    /// unless the caller overrides it.
    pub fn is_optional_input(&self, name: &str) -> bool {
        self.tensor_by_name(name)
            .map(|info| info.initializer.is_some())
            .unwrap_or(false)
    }

    /// Number of graph inputs that must be supplied by the caller.
    pub fn required_input_count(&self) -> usize {
        self.inputs
            .iter()
            .filter(|name| !self.is_optional_input(name))
            .count()
    }

    /// Names of all initializers (weights), in declaration order.
    pub fn initializer_names(&self) -> Vec<String> {
        self.tensor_info
            .iter()
            .filter(|info| info.initializer.is_some() && info.kind == TensorKind::Weight)
            .map(|info| info.name.clone())
            .collect()
    }

    /// Validate graph structure.
    pub fn validate(&self) -> Result<()> {
        // Check that all inputs exist
        for input in &self.inputs {
            self.tensor_id(input)?;
        }

        // Check that all outputs exist
        for output in &self.outputs {
            self.tensor_id(output)?;
        }

        // Check that all node inputs/outputs reference valid tensors
        let mut produced: HashMap<&str, NodeId> = HashMap::new();
        for (node_id, node) in self.nodes.iter().enumerate() {
            for input in &node.inputs {
                // Skip empty inputs ("" marks an omitted optional input)
                if !input.is_empty() {
                    self.tensor_id(input)?;
                }
            }
            for output in &node.outputs {
                if output.is_empty() {
                    continue;
                }
                self.tensor_id(output)?;
                if let Some(previous) = produced.insert(output, node_id) {
                    return Err(GraphError::InvalidGraph(format!(
                        "Tensor '{}' is produced by nodes {} and {}",
                        output, previous, node_id
                    )));
                }
            }
        }

        // Every consumed tensor needs a source
        for node in &self.nodes {
            for input in node.inputs.iter().filter(|i| !i.is_empty()) {
                let info = self.tensor_by_name(input)?;
                let sourced = produced.contains_key(input.as_str())
                    || self.inputs.contains(input)
                    || info.initializer.is_some();
                if !sourced {
                    return Err(GraphError::InvalidGraph(format!(
                        "Tensor '{}' consumed by '{}' has no producer",
                        input,
                        node.display_name()
                    )));
                }
            }
        }

        Ok(())
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

/// A node (operation) in the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Node name (may be empty).
    pub name: String,

    /// Operation type (e.g., "MatMul", "Add").
    pub op_type: String,

    /// Input tensor names.
    pub inputs: Vec<String>,

    /// Output tensor names.
    pub outputs: Vec<String>,

    /// Node attributes.
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeValue>,

    /// Domain (for custom operators).
    #[serde(default)]
    pub domain: String,
}

impl Node {
    /// Create a new node.
    pub fn new(op_type: impl Into<String>) -> Self {
        Self {
            name: String::new(),
            op_type: op_type.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            attributes: BTreeMap::new(),
            domain: String::new(),
        }
    }

    /// Set the node name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the input tensor names.
    pub fn with_inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    /// Set the output tensor names.
    pub fn with_outputs<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs = outputs.into_iter().map(Into::into).collect();
        self
    }

    /// Attach an attribute.
    pub fn with_attr(mut self, name: impl Into<String>, value: AttributeValue) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    /// Name used in diagnostics: the node name, or the op type if unnamed.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.op_type
        } else {
            &self.name
        }
    }

    /// Get an attribute value.
    pub fn attr<T>(&self, name: &str) -> Result<T>
    where
        T: TryFrom<AttributeValue>,
        T::Error: std::fmt::Display,
    {
        let value = self
            .attributes
            .get(name)
            .ok_or_else(|| GraphError::MissingAttribute(name.to_string()))?;

        T::try_from(value.clone()).map_err(|e| GraphError::TypeMismatch {
            expected: std::any::type_name::<T>().to_string(),
            actual: format!("{}", e),
        })
    }

    /// Get an attribute value, falling back to `default` when absent.
    pub fn attr_or<T>(&self, name: &str, default: T) -> Result<T>
    where
        T: TryFrom<AttributeValue>,
        T::Error: std::fmt::Display,
    {
        if self.has_attr(name) {
            self.attr(name)
        } else {
            Ok(default)
        }
    }

    /// Check if an attribute exists.
    pub fn has_attr(&self, name: &str) -> bool {
        self.attributes.contains_key(name)
    }
}

/// Attribute value types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    Float(f32),
    Int(i64),
    String(String),
    Tensor(Vec<u8>),
    Floats(Vec<f32>),
    Ints(Vec<i64>),
    Strings(Vec<String>),
}

impl TryFrom<AttributeValue> for f32 {
    type Error = String;

    fn try_from(value: AttributeValue) -> std::result::Result<Self, Self::Error> {
        match value {
            AttributeValue::Float(v) => Ok(v),
            _ => Err("Not a float".to_string()),
        }
    }
}

impl TryFrom<AttributeValue> for i64 {
    type Error = String;

    fn try_from(value: AttributeValue) -> std::result::Result<Self, Self::Error> {
        match value {
            AttributeValue::Int(v) => Ok(v),
            _ => Err("Not an int".to_string()),
        }
    }
}

impl TryFrom<AttributeValue> for String {
    type Error = String;

    fn try_from(value: AttributeValue) -> std::result::Result<Self, Self::Error> {
        match value {
            AttributeValue::String(v) => Ok(v),
            _ => Err("Not a string".to_string()),
        }
    }
}

impl TryFrom<AttributeValue> for Vec<i64> {
    type Error = String;

    fn try_from(value: AttributeValue) -> std::result::Result<Self, Self::Error> {
        match value {
            AttributeValue::Ints(v) => Ok(v),
            _ => Err("Not an int array".to_string()),
        }
    }
}

/// Information about a tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorInfo {
    /// Tensor name.
    pub name: String,

    /// Data type.
    pub dtype: DataType,

    /// Tensor shape.
    pub shape: TensorShape,

    /// Tensor kind (input, output, weight, intermediate).
    pub kind: TensorKind,

    /// Initializer data (little-endian element bytes).
    #[serde(default)]
    pub initializer: Option<Vec<u8>>,
}

impl TensorInfo {
    /// Describe a tensor without initializer data.
    pub fn new(
        name: impl Into<String>,
        dtype: DataType,
        shape: TensorShape,
        kind: TensorKind,
    ) -> Self {
        Self {
            name: name.into(),
            dtype,
            shape,
            kind,
            initializer: None,
        }
    }

    /// Describe a weight with static shape and raw initializer bytes.
    pub fn weight(name: impl Into<String>, dtype: DataType, dims: &[usize], data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            dtype,
            shape: TensorShape::Static(dims.to_vec()),
            kind: TensorKind::Weight,
            initializer: Some(data),
        }
    }
}

/// Element types understood by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    F32,
    I32,
    I64,
    U8,
    /// Stored as one byte per element (0 or 1).
    Bool,
}

impl DataType {
    /// Size of this data type in bytes.
    pub fn size(&self) -> usize {
        match self {
            DataType::F32 | DataType::I32 => 4,
            DataType::I64 => 8,
            DataType::U8 | DataType::Bool => 1,
        }
    }

    /// Whether gradients can flow through tensors of this type.
    pub fn is_float(&self) -> bool {
        matches!(self, DataType::F32)
    }

    /// ONNX `TensorProto.DataType` code for this type.
    pub fn onnx_code(&self) -> i32 {
        match self {
            DataType::F32 => 1,
            DataType::U8 => 2,
            DataType::I32 => 6,
            DataType::I64 => 7,
            DataType::Bool => 9,
        }
    }

    /// Map an ONNX `TensorProto.DataType` code to a data type.
    pub fn from_onnx_code(code: i32) -> Result<Self> {
        match code {
            1 => Ok(DataType::F32),
            2 => Ok(DataType::U8),
            6 => Ok(DataType::I32),
            7 => Ok(DataType::I64),
            9 => Ok(DataType::Bool),
            other => Err(GraphError::UnsupportedDataType(format!(
                "element type code {}",
                other
            ))),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::F32 => "float32",
            DataType::I32 => "int32",
            DataType::I64 => "int64",
            DataType::U8 => "uint8",
            DataType::Bool => "bool",
        };
        f.write_str(name)
    }
}

/// Tensor shape representation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TensorShape {
    /// Static shape (all dimensions known).
    Static(Vec<usize>),

    /// Dynamic shape with symbolic dimensions.
    Dynamic(Vec<Dimension>),

    /// Unknown/unspecified shape.
    Unknown,

    /// Optional input that is absent.
    Absent,
}

impl TensorShape {
    /// Check if the shape is fully static.
    pub fn is_static(&self) -> bool {
        matches!(self, TensorShape::Static(_))
    }

    /// Get static dimensions if available.
    pub fn as_static(&self) -> Option<&[usize]> {
        match self {
            TensorShape::Static(dims) => Some(dims),
            _ => None,
        }
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> Option<usize> {
        match self {
            TensorShape::Static(dims) => Some(dims.len()),
            TensorShape::Dynamic(dims) => Some(dims.len()),
            TensorShape::Unknown | TensorShape::Absent => None,
        }
    }

    /// Check whether a concrete shape satisfies this declaration.
    ///
    /// Named dimensions match any size; unknown shapes match everything.
    pub fn matches(&self, dims: &[usize]) -> bool {
        match self {
            TensorShape::Static(expected) => expected.as_slice() == dims,
            TensorShape::Dynamic(expected) => {
                expected.len() == dims.len()
                    && expected.iter().zip(dims).all(|(e, &d)| match e {
                        Dimension::Static(n) => *n == d,
                        Dimension::Named(_) => true,
                    })
            }
            TensorShape::Unknown => true,
            TensorShape::Absent => false,
        }
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TensorShape::Static(dims) => write!(f, "{:?}", dims),
            TensorShape::Dynamic(dims) => {
                let parts: Vec<String> = dims
                    .iter()
                    .map(|d| match d {
                        Dimension::Static(n) => n.to_string(),
                        Dimension::Named(name) => name.clone(),
                    })
                    .collect();
                write!(f, "[{}]", parts.join(", "))
            }
            TensorShape::Unknown => f.write_str("?"),
            TensorShape::Absent => f.write_str("<absent>"),
        }
    }
}

/// A single dimension in a tensor shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dimension {
    /// Static dimension with known size.
    Static(usize),

    /// Named symbolic dimension (e.g., "batch").
    Named(String),
}

/// Kind of tensor (determines storage and lifetime).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TensorKind {
    /// Graph input (provided by user).
    Input,

    /// Graph output (returned to user).
    Output,

    /// Weight with initializer data.
    Weight,

    /// Intermediate value computed during execution.
    Intermediate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graph_creation() {
        let mut graph = Graph::new();

        let tensor = TensorInfo::new(
            "input",
            DataType::F32,
            TensorShape::Static(vec![1, 3, 224, 224]),
            TensorKind::Input,
        );

        let id = graph.add_tensor(tensor);
        assert_eq!(id, 0);
        assert_eq!(graph.tensor_id("input").unwrap(), 0);
    }

    #[test]
    fn test_add_tensor_replaces_existing() {
        let mut graph = Graph::new();
        graph.add_tensor(TensorInfo::new("x", DataType::F32, TensorShape::Unknown, TensorKind::Input));
        let id = graph.add_tensor(TensorInfo::new(
            "x",
            DataType::F32,
            TensorShape::Static(vec![2]),
            TensorKind::Input,
        ));
        assert_eq!(id, 0);
        assert_eq!(graph.tensor_info.len(), 1);
        assert_eq!(graph.tensor_by_name("x").unwrap().shape, TensorShape::Static(vec![2]));
    }

    #[test]
    fn test_node_attributes() {
        let node = Node::new("ReduceSum").with_attr("axes", AttributeValue::Ints(vec![0, 1]));

        let axes: Vec<i64> = node.attr("axes").unwrap();
        assert_eq!(axes, vec![0, 1]);
        assert_eq!(node.attr_or("keepdims", 1i64).unwrap(), 1);
        assert!(node.attr::<f32>("axes").is_err());
    }

    #[test]
    fn test_tensor_shape() {
        let static_shape = TensorShape::Static(vec![1, 2, 3]);
        assert!(static_shape.is_static());
        assert_eq!(static_shape.ndim(), Some(3));

        let dynamic_shape = TensorShape::Dynamic(vec![
            Dimension::Named("batch".to_string()),
            Dimension::Static(512),
        ]);
        assert!(!dynamic_shape.is_static());
        assert_eq!(dynamic_shape.ndim(), Some(2));
    }

    #[test]
    fn test_shape_matches() {
        let dynamic = TensorShape::Dynamic(vec![
            Dimension::Named("batch".to_string()),
            Dimension::Static(3),
        ]);
        assert!(dynamic.matches(&[8, 3]));
        assert!(!dynamic.matches(&[8, 4]));
        assert!(!dynamic.matches(&[3]));
        assert!(TensorShape::Static(vec![2, 2]).matches(&[2, 2]));
        assert!(TensorShape::Unknown.matches(&[7]));
    }

    #[test]
    fn test_optional_inputs() {
        let mut graph = Graph::new();
        graph.add_tensor(TensorInfo::new("x", DataType::F32, TensorShape::Unknown, TensorKind::Input));
        let mut w = TensorInfo::weight("w", DataType::F32, &[1], 1.0f32.to_le_bytes().to_vec());
        w.kind = TensorKind::Input;
        graph.add_tensor(w);
        graph.inputs = vec!["x".to_string(), "w".to_string()];

        assert!(!graph.is_optional_input("x"));
        assert!(graph.is_optional_input("w"));
        assert_eq!(graph.required_input_count(), 1);
    }

    #[test]
    fn test_validate_rejects_unsourced_tensor() {
        let mut graph = Graph::new();
        graph.add_tensor(TensorInfo::new("a", DataType::F32, TensorShape::Unknown, TensorKind::Intermediate));
        graph.add_tensor(TensorInfo::new("b", DataType::F32, TensorShape::Unknown, TensorKind::Output));
        graph.add_node(Node::new("Relu").with_inputs(["a"]).with_outputs(["b"]));
        graph.outputs = vec!["b".to_string()];

        assert!(matches!(graph.validate(), Err(GraphError::InvalidGraph(_))));
    }

    #[test]
    fn test_onnx_codes() {
        for dtype in [DataType::F32, DataType::I32, DataType::I64, DataType::U8, DataType::Bool] {
            assert_eq!(DataType::from_onnx_code(dtype.onnx_code()).unwrap(), dtype);
        }
        assert!(DataType::from_onnx_code(16).is_err());
    }
}
