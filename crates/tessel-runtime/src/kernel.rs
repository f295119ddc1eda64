//! Kernel trait and registry.

use crate::error::Result;
use crate::value::Value;
use std::collections::HashMap;
use tessel_graph::Node;

/// A host implementation of one operator.
///
/// Kernels are stateless: everything they need comes from the node's
/// attributes and the input values, which arrive in node input order.
///
/// # Example
///
/// ```ignore
/// struct MyNeg;
///
/// impl Kernel for MyNeg {
///     fn name(&self) -> &str {
///         "Neg"
///     }
///
///     fn compute(&self, _node: &Node, inputs: &[&Value]) -> Result<Vec<Value>> {
///         let x = inputs[0].to_vec::<f32>()?;
///         let y = x.into_iter().map(|v| -v).collect();
///         Ok(vec![Value::from_vec(y, inputs[0].shape())?])
///     }
/// }
/// ```
pub trait Kernel: Send + Sync {
    /// Operator name, for diagnostics.
    fn name(&self) -> &str;

    /// Compute all node outputs, in node output order.
    fn compute(&self, node: &Node, inputs: &[&Value]) -> Result<Vec<Value>>;
}

/// Maps operator type names to kernels.
pub struct KernelRegistry {
    kernels: HashMap<String, Box<dyn Kernel>>,
}

impl KernelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            kernels: HashMap::new(),
        }
    }

    /// A registry holding every built-in CPU kernel.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        crate::kernels::register_all(&mut registry);
        registry
    }

    /// Register a kernel. Returns `self` for chaining.
    pub fn register<K>(&mut self, name: &str, kernel: K) -> &mut Self
    where
        K: Kernel + 'static,
    {
        self.kernels.insert(name.to_string(), Box::new(kernel));
        self
    }

    pub fn get(&self, name: &str) -> Option<&dyn Kernel> {
        self.kernels.get(name).map(|k| k.as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.kernels.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    pub fn kernel_names(&self) -> impl Iterator<Item = &str> {
        self.kernels.keys().map(|s| s.as_str())
    }
}

impl Default for KernelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for KernelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.kernel_names().collect();
        names.sort_unstable();
        f.debug_struct("KernelRegistry").field("kernels", &names).finish()
    }
}
