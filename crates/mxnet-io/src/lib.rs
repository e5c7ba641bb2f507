//! Parameter I/O: safetensors loading/saving and on-disk model bundles.
//!
//! A model bundle is a directory holding `{prefix}-symbol.json` and
//! `{prefix}.safetensors`. Parameter names written by MXNet carry an `arg:`
//! or `aux:` prefix; both are dropped on load so names match graph inputs.

use std::fs;
use std::path::Path;

use half::{bf16, f16};
use memmap2::Mmap;
use safetensors::SafeTensors;
use safetensors::tensor::TensorView;
use tracing::debug;

use mxnet_core::{MxError, NdManager, ParameterSet, Result, Shape, Symbol, SymbolBlock};

const PARAM_PREFIXES: [&str; 2] = ["arg:", "aux:"];

/// Strip the `arg:`/`aux:` prefix MXNet puts on saved parameter names.
pub fn strip_param_prefix(name: &str) -> &str {
    PARAM_PREFIXES
        .iter()
        .find_map(|p| name.strip_prefix(p))
        .unwrap_or(name)
}

/// Load all tensors from a safetensors file into arrays owned by `manager`.
pub fn load_safetensors(path: &Path, manager: &NdManager) -> Result<ParameterSet> {
    let data = fs::read(path)?;
    let st = SafeTensors::deserialize(&data)
        .map_err(|e| MxError::InvalidArgument(format!("safetensors parse error: {e}")))?;
    deserialize_params(&st, manager)
}

/// Load all tensors from a safetensors file using memory-mapped I/O.
pub fn load_safetensors_mmap(path: &Path, manager: &NdManager) -> Result<ParameterSet> {
    let file = fs::File::open(path)?;
    // SAFETY: The file must not be modified while the mmap is alive.
    // Weight files are opened read-only and dropped before returning.
    let mmap = unsafe { Mmap::map(&file)? };
    let st = SafeTensors::deserialize(&mmap)
        .map_err(|e| MxError::InvalidArgument(format!("safetensors parse error: {e}")))?;
    deserialize_params(&st, manager)
}

/// Save parameters as `float32` tensors, keyed by name.
pub fn save_safetensors(path: &Path, params: &ParameterSet) -> Result<()> {
    let mut entries: Vec<(&str, Vec<u8>, Vec<usize>)> = Vec::with_capacity(params.len());
    for (name, array) in params.iter() {
        let values = array.to_vec_f32()?;
        let shape = array
            .shape()?
            .0
            .iter()
            .map(|&d| {
                usize::try_from(d)
                    .map_err(|_| MxError::InvalidArgument(format!("negative dimension in {name}")))
            })
            .collect::<Result<Vec<_>>>()?;
        let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        entries.push((name, bytes, shape));
    }
    entries.sort_by(|a, b| a.0.cmp(b.0));

    let views = entries
        .iter()
        .map(|(name, bytes, shape)| {
            TensorView::new(safetensors::Dtype::F32, shape.clone(), bytes)
                .map(|view| (*name, view))
                .map_err(|e| MxError::InvalidArgument(format!("tensor {name}: {e}")))
        })
        .collect::<Result<Vec<_>>>()?;

    safetensors::serialize_to_file(views, &None, path)
        .map_err(|e| MxError::InvalidArgument(format!("safetensors save error: {e}")))?;
    debug!(path = %path.display(), count = entries.len(), "saved parameters");
    Ok(())
}

/// Load `{prefix}-symbol.json` and `{prefix}.safetensors` from `dir`.
pub fn load_symbol_block(dir: &Path, prefix: &str, manager: &NdManager) -> Result<SymbolBlock> {
    let symbol = Symbol::load(dir.join(format!("{prefix}-symbol.json")))?;
    let params = load_safetensors_mmap(&dir.join(format!("{prefix}.safetensors")), manager)?;
    debug!(
        dir = %dir.display(),
        prefix,
        params = params.len(),
        "loaded symbol block"
    );
    Ok(SymbolBlock::new(symbol, params))
}

fn deserialize_params(st: &SafeTensors<'_>, manager: &NdManager) -> Result<ParameterSet> {
    let mut tensors = st.tensors();
    tensors.sort_by(|a, b| a.0.cmp(&b.0));

    let mut params = ParameterSet::new();
    for (name, view) in tensors {
        let shape = Shape::new(view.shape().iter().map(|&d| d as i64).collect::<Vec<_>>());
        let values = convert_to_f32(view.dtype(), view.data())?;
        let array = manager.from_f32(&values, &shape)?;
        params.insert(strip_param_prefix(&name), array)?;
    }
    Ok(params)
}

fn convert_to_f32(dtype: safetensors::Dtype, data: &[u8]) -> Result<Vec<f32>> {
    use safetensors::Dtype;
    let floats = match dtype {
        Dtype::F32 => data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        Dtype::F64 => data
            .chunks_exact(8)
            .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32)
            .collect(),
        Dtype::F16 => data
            .chunks_exact(2)
            .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        Dtype::BF16 => data
            .chunks_exact(2)
            .map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        Dtype::U8 => data.iter().map(|&b| b as f32).collect(),
        Dtype::I8 => data.iter().map(|&b| b as i8 as f32).collect(),
        Dtype::I32 => data
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f32)
            .collect(),
        Dtype::I64 => data
            .chunks_exact(8)
            .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32)
            .collect(),
        other => {
            return Err(MxError::InvalidArgument(format!(
                "unsupported safetensors dtype: {other:?}"
            )));
        }
    };
    Ok(floats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_prefixes_are_stripped() {
        assert_eq!(strip_param_prefix("arg:fc1_weight"), "fc1_weight");
        assert_eq!(strip_param_prefix("aux:bn_moving_mean"), "bn_moving_mean");
        assert_eq!(strip_param_prefix("w1"), "w1");
    }

    #[test]
    fn half_precision_widens() {
        let bytes: Vec<u8> = [1.5f32, -2.0]
            .iter()
            .flat_map(|v| f16::from_f32(*v).to_le_bytes())
            .collect();
        assert_eq!(convert_to_f32(safetensors::Dtype::F16, &bytes).unwrap(), vec![1.5, -2.0]);
    }

    #[test]
    fn unsupported_dtype_rejected() {
        assert!(matches!(
            convert_to_f32(safetensors::Dtype::BOOL, &[1]),
            Err(MxError::InvalidArgument(_))
        ));
    }
}
