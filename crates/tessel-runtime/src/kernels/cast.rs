//! Cast: element type conversion.
//!
//! The `to` attribute carries the target element type code. Float to integer
//! truncates toward zero; anything to bool maps non-zero to true.

use super::expect_inputs;
use crate::error::{Result, RuntimeError};
use crate::kernel::Kernel;
use crate::value::Value;
use tessel_graph::{DataType, Node};

pub struct CastKernel;

impl Kernel for CastKernel {
    fn name(&self) -> &str {
        "Cast"
    }

    fn compute(&self, node: &Node, inputs: &[&Value]) -> Result<Vec<Value>> {
        expect_inputs("Cast", inputs, 1)?;
        let code: i64 = node
            .attr("to")
            .map_err(|e| RuntimeError::kernel("Cast", e.to_string()))?;
        let target = DataType::from_onnx_code(code as i32)
            .map_err(|e| RuntimeError::kernel("Cast", e.to_string()))?;

        let input = inputs[0];
        if input.dtype() == target {
            return Ok(vec![input.clone()]);
        }

        let wide = widen(input)?;
        let shape = input.shape();
        let out = match target {
            DataType::F32 => Value::from_vec(wide.iter().map(|&v| v as f32).collect(), shape)?,
            DataType::I32 => Value::from_vec(wide.iter().map(|&v| v as i32).collect(), shape)?,
            DataType::I64 => Value::from_vec(wide.iter().map(|&v| v as i64).collect(), shape)?,
            DataType::U8 => Value::from_vec(wide.iter().map(|&v| v as u8).collect(), shape)?,
            DataType::Bool => {
                let bools: Vec<bool> = wide.iter().map(|&v| v != 0.0).collect();
                Value::from_bools(&bools, shape)?
            }
        };
        Ok(vec![out])
    }
}

fn widen(value: &Value) -> Result<Vec<f64>> {
    Ok(match value.dtype() {
        DataType::F32 => value.to_vec::<f32>()?.into_iter().map(f64::from).collect(),
        DataType::I32 => value.to_vec::<i32>()?.into_iter().map(f64::from).collect(),
        DataType::I64 => value.to_vec::<i64>()?.into_iter().map(|v| v as f64).collect(),
        DataType::U8 | DataType::Bool => value.as_bytes().iter().map(|&b| f64::from(b)).collect(),
    })
}
