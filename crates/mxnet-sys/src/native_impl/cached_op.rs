//! Cached operators: a symbol plus validated invocation flags.

use libc::{c_char, c_int};

use super::graph::SymbolData;
use super::ndarray::NdArrayData;
use super::{
    EngineError, EngineResult, api_call, box_handle, c_str, free_handle, out_ptr, ref_handle,
    with_returns,
};
use crate::{CachedOpHandle, NDArrayHandle, SymbolHandle};

pub(crate) struct CachedOpState {
    symbol: SymbolData,
    num_inputs: usize,
}

fn flag_error(key: &str, value: &str, expected: &str) -> EngineError {
    EngineError::InvalidArgument(format!("cached op flag {key}={value:?}: expected {expected}"))
}

/// Parses `[0, 1]`, `(0, 1,)` or `0,1`.
fn parse_index_list(key: &str, value: &str) -> EngineResult<Vec<usize>> {
    value
        .trim()
        .trim_start_matches(['[', '('])
        .trim_end_matches([']', ')'])
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.parse::<usize>()
                .map_err(|_| flag_error(key, value, "a list of input positions"))
        })
        .collect()
}

fn parse_bool(key: &str, value: &str) -> EngineResult<bool> {
    match value.trim() {
        "1" | "true" | "True" => Ok(true),
        "0" | "false" | "False" => Ok(false),
        _ => Err(flag_error(key, value, "a boolean")),
    }
}

/// Checks that `data` and `param` together name every input exactly once.
fn check_partition(num_inputs: usize, data: &[usize], param: &[usize]) -> EngineResult<()> {
    let mut seen = vec![false; num_inputs];
    for &i in data.iter().chain(param) {
        match seen.get_mut(i) {
            Some(slot) if !*slot => *slot = true,
            _ => {
                return Err(EngineError::InvalidArgument(format!(
                    "data_indices {data:?} and param_indices {param:?} do not partition \
                     the {num_inputs} graph inputs"
                )));
            }
        }
    }
    if seen.iter().all(|&s| s) {
        Ok(())
    } else {
        Err(EngineError::InvalidArgument(format!(
            "data_indices {data:?} and param_indices {param:?} do not partition \
             the {num_inputs} graph inputs"
        )))
    }
}

impl CachedOpState {
    fn new(symbol: SymbolData, flags: &[(&str, &str)]) -> EngineResult<Self> {
        let num_inputs = symbol.num_inputs();
        let mut data = None;
        let mut param = None;
        for &(key, value) in flags {
            match key {
                "data_indices" => data = Some(parse_index_list(key, value)?),
                "param_indices" => param = Some(parse_index_list(key, value)?),
                "static_alloc" | "static_shape" | "is_dynamic" => {
                    parse_bool(key, value)?;
                }
                "inline_limit" | "forward_bulk_size" | "backward_bulk_size" => {
                    value
                        .trim()
                        .parse::<u32>()
                        .map_err(|_| flag_error(key, value, "a non-negative integer"))?;
                }
                other => {
                    return Err(EngineError::InvalidArgument(format!(
                        "unknown cached op flag {other:?}"
                    )));
                }
            }
        }

        let complement = |taken: &[usize]| -> Vec<usize> {
            (0..num_inputs).filter(|i| !taken.contains(i)).collect()
        };
        let (data, param) = match (data, param) {
            (Some(d), Some(p)) => (d, p),
            (Some(d), None) => {
                let p = complement(&d);
                (d, p)
            }
            (None, Some(p)) => (complement(&p), p),
            (None, None) => ((0..num_inputs).collect(), Vec::new()),
        };
        check_partition(num_inputs, &data, &param)?;

        Ok(Self { symbol, num_inputs })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn MXCreateCachedOpEx(
    handle: SymbolHandle,
    num_flags: c_int,
    keys: *const *const c_char,
    vals: *const *const c_char,
    out: *mut CachedOpHandle,
) -> c_int {
    api_call(|| {
        let symbol: &SymbolData = unsafe { ref_handle(handle, "symbol") }?;
        let out = unsafe { out_ptr(out, "out") }?;
        let num_flags = usize::try_from(num_flags)
            .map_err(|_| EngineError::InvalidArgument(format!("num_flags = {num_flags}")))?;

        let mut flags = Vec::with_capacity(num_flags);
        if num_flags > 0 {
            if keys.is_null() || vals.is_null() {
                return Err(EngineError::NullArgument("keys/vals"));
            }
            let keys = unsafe { std::slice::from_raw_parts(keys, num_flags) };
            let vals = unsafe { std::slice::from_raw_parts(vals, num_flags) };
            for (&k, &v) in keys.iter().zip(vals) {
                flags.push(unsafe { (c_str(k, "key")?, c_str(v, "val")?) });
            }
        }

        *out = box_handle(CachedOpState::new(symbol.clone(), &flags)?);
        Ok(())
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn MXFreeCachedOp(handle: CachedOpHandle) -> c_int {
    api_call(|| {
        unsafe { free_handle::<CachedOpState, _>(handle) };
        Ok(())
    })
}

/// Outputs are freshly allocated; `*outputs` must be null on entry.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn MXInvokeCachedOpEx(
    handle: CachedOpHandle,
    num_inputs: c_int,
    inputs: *mut NDArrayHandle,
    num_outputs: *mut c_int,
    outputs: *mut *mut NDArrayHandle,
    out_stypes: *mut *const c_int,
) -> c_int {
    api_call(|| {
        let op: &CachedOpState = unsafe { ref_handle(handle, "cached op") }?;
        let num_outputs = unsafe { out_ptr(num_outputs, "num_outputs") }?;
        let outputs = unsafe { out_ptr(outputs, "outputs") }?;
        let out_stypes = unsafe { out_ptr(out_stypes, "out_stypes") }?;
        if !outputs.is_null() {
            return Err(EngineError::InvalidArgument(
                "preallocated outputs are not supported".into(),
            ));
        }
        if usize::try_from(num_inputs).ok() != Some(op.num_inputs) {
            return Err(EngineError::InvalidArgument(format!(
                "cached op expects {} inputs, got {num_inputs}",
                op.num_inputs
            )));
        }

        let handles: &[NDArrayHandle] = if op.num_inputs == 0 {
            &[]
        } else if inputs.is_null() {
            return Err(EngineError::NullArgument("inputs"));
        } else {
            unsafe { std::slice::from_raw_parts(inputs, op.num_inputs) }
        };
        let arrays = handles
            .iter()
            .enumerate()
            .map(|(i, &h)| {
                if h.is_null() {
                    Err(EngineError::InvalidArgument(format!("input {i} is null")))
                } else {
                    unsafe { ref_handle::<NdArrayData, _>(h, "input") }
                }
            })
            .collect::<EngineResult<Vec<_>>>()?;

        let context = arrays
            .first()
            .map_or((crate::MX_DEV_CPU, 0), |a| a.context());
        if let Some((i, a)) = arrays.iter().enumerate().find(|(_, a)| a.context() != context) {
            return Err(EngineError::InvalidArgument(format!(
                "input {i} lives on context {:?}, expected {context:?}",
                a.context()
            )));
        }

        let values = op.symbol.evaluate(&arrays)?;
        let mut created = Vec::with_capacity(values.len());
        let mut stypes = Vec::with_capacity(values.len());
        for value in values {
            stypes.push(value.stype);
            created.push(NdArrayData::from_value(value, context)?);
        }

        with_returns(|r| {
            r.stypes = stypes;
            r.handles = created.into_iter().map(box_handle).collect();
            *num_outputs = r.handles.len() as c_int;
            *outputs = r.handles.as_mut_ptr();
            *out_stypes = r.stypes.as_ptr();
        });
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native_impl::graph::Graph;

    fn mlp() -> SymbolData {
        SymbolData::new(Graph::from_json(&mxnet_conformance::fixtures::mlp_symbol_json()).unwrap())
    }

    #[test]
    fn index_lists_accept_tuple_spellings() {
        assert_eq!(parse_index_list("k", "[1, 2, 3]").unwrap(), vec![1, 2, 3]);
        assert_eq!(parse_index_list("k", "(0,)").unwrap(), vec![0]);
        assert_eq!(parse_index_list("k", "[]").unwrap(), Vec::<usize>::new());
        assert!(parse_index_list("k", "[a]").is_err());
    }

    #[test]
    fn missing_param_indices_default_to_complement() {
        let op = CachedOpState::new(mlp(), &[("data_indices", "[0]")]).unwrap();
        assert_eq!(op.num_inputs, 5);
    }

    #[test]
    fn out_of_range_index_rejected() {
        let err = CachedOpState::new(mlp(), &[("data_indices", "[0]"), ("param_indices", "[1, 2, 3, 9]")])
            .err()
            .unwrap();
        assert!(err.to_string().contains("partition"));
    }

    #[test]
    fn unknown_flag_rejected() {
        assert!(CachedOpState::new(mlp(), &[("static_everything", "1")]).is_err());
        assert!(CachedOpState::new(mlp(), &[("static_alloc", "maybe")]).is_err());
    }
}
