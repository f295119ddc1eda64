//! Shape specialization of a forward graph to one input shape signature.

use crate::error::{Result, TrainingError};
use std::collections::HashMap;
use tessel_graph::{Dimension, Graph, TensorShape};

/// Fix the user inputs to `signature` and substitute the symbolic
/// dimensions they bind everywhere else.
///
/// Fully resolved shapes become [`TensorShape::Static`]; partially resolved
/// ones stay dynamic with the known dimensions filled in.
pub(crate) fn specialize(
    graph: &mut Graph,
    user_inputs: &[String],
    signature: &[Vec<usize>],
) -> Result<HashMap<String, usize>> {
    if user_inputs.len() != signature.len() {
        return Err(TrainingError::build(format!(
            "shape signature has {} entries but the graph has {} user inputs",
            signature.len(),
            user_inputs.len()
        )));
    }

    let mut bindings: HashMap<String, usize> = HashMap::new();
    for (name, dims) in user_inputs.iter().zip(signature) {
        let info = graph.tensor_by_name_mut(name)?;
        if !info.shape.matches(dims) {
            return Err(TrainingError::build(format!(
                "input '{}' declared {} cannot take shape {:?}",
                name, info.shape, dims
            )));
        }
        if let TensorShape::Dynamic(declared) = &info.shape {
            for (dim, &size) in declared.iter().zip(dims) {
                let Dimension::Named(symbol) = dim else {
                    continue;
                };
                match bindings.get(symbol) {
                    Some(&bound) if bound != size => {
                        return Err(TrainingError::build(format!(
                            "dimension '{}' bound to both {} and {}",
                            symbol, bound, size
                        )));
                    }
                    Some(_) => {}
                    None => {
                        bindings.insert(symbol.clone(), size);
                    }
                }
            }
        }
        info.shape = TensorShape::Static(dims.clone());
    }

    for info in &mut graph.tensor_info {
        if let TensorShape::Dynamic(dims) = &info.shape {
            info.shape = resolve(dims, &bindings);
        }
    }

    tracing::debug!(symbols = bindings.len(), "specialized graph shapes");
    Ok(bindings)
}

fn resolve(dims: &[Dimension], bindings: &HashMap<String, usize>) -> TensorShape {
    let resolved: Vec<Dimension> = dims
        .iter()
        .map(|dim| match dim {
            Dimension::Named(symbol) => bindings
                .get(symbol)
                .map(|&size| Dimension::Static(size))
                .unwrap_or_else(|| dim.clone()),
            Dimension::Static(_) => dim.clone(),
        })
        .collect();

    let fixed: Option<Vec<usize>> = resolved
        .iter()
        .map(|dim| match dim {
            Dimension::Static(n) => Some(*n),
            Dimension::Named(_) => None,
        })
        .collect();
    match fixed {
        Some(dims) => TensorShape::Static(dims),
        None => TensorShape::Dynamic(resolved),
    }
}
