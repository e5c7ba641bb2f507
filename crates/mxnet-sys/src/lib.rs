//! C ABI bindings for the MXNet engine.
//!
//! With the default `native` feature, every `MX*` entry point below is
//! implemented in pure Rust by a small reference engine that interprets
//! MXNet symbol JSON on the host. With the `libmxnet` feature, the same
//! declarations link against a real `libmxnet` (see `build.rs`).
//!
//! Every function returns `0` on success and `-1` on failure, in which case
//! `MXGetLastError` describes what went wrong. Arrays returned through
//! out-parameters live in thread-local storage owned by the engine and stay
//! valid until the next call on the same thread.

#![allow(non_camel_case_types)]

use libc::c_int;

#[cfg(all(feature = "native", feature = "libmxnet"))]
compile_error!("features `native` and `libmxnet` are mutually exclusive");

// ── Opaque handle types ─────────────────────────────────────────────────

/// Opaque handle to a symbol (computation graph).
#[repr(C)]
pub struct mx_symbol_t {
    _private: [u8; 0],
}

/// Opaque handle to an NDArray.
#[repr(C)]
pub struct mx_ndarray_t {
    _private: [u8; 0],
}

/// Opaque handle to a cached (optimized, repeatedly callable) operator.
#[repr(C)]
pub struct mx_cached_op_t {
    _private: [u8; 0],
}

/// Opaque handle to an operator creator.
#[repr(C)]
pub struct mx_op_t {
    _private: [u8; 0],
}

pub type mx_uint = u32;
pub type SymbolHandle = *mut mx_symbol_t;
pub type NDArrayHandle = *mut mx_ndarray_t;
pub type CachedOpHandle = *mut mx_cached_op_t;
pub type OpHandle = *mut mx_op_t;

// ── Enumerations passed as plain ints ───────────────────────────────────

pub const MX_DEV_CPU: c_int = 1;
pub const MX_DEV_GPU: c_int = 2;
pub const MX_DEV_CPU_PINNED: c_int = 3;
pub const MX_DEV_CPU_SHARED: c_int = 5;

pub const MX_DTYPE_FLOAT32: c_int = 0;
pub const MX_DTYPE_FLOAT64: c_int = 1;
pub const MX_DTYPE_FLOAT16: c_int = 2;
pub const MX_DTYPE_UINT8: c_int = 3;
pub const MX_DTYPE_INT32: c_int = 4;
pub const MX_DTYPE_INT8: c_int = 5;
pub const MX_DTYPE_INT64: c_int = 6;

pub const MX_STORAGE_UNDEFINED: c_int = -1;
pub const MX_STORAGE_DEFAULT: c_int = 0;
pub const MX_STORAGE_ROW_SPARSE: c_int = 1;
pub const MX_STORAGE_CSR: c_int = 2;

/// `option` values of `NNSymbolListInputNames`.
pub const NN_LIST_INPUTS_ALL: c_int = 0;
pub const NN_LIST_INPUTS_READ_ONLY: c_int = 1;
pub const NN_LIST_INPUTS_AUX: c_int = 2;

// ── libmxnet declarations (enabled with `libmxnet` feature) ─────────────

#[cfg(feature = "libmxnet")]
use libc::{c_char, c_void, size_t};

#[cfg(feature = "libmxnet")]
unsafe extern "C" {
    pub fn MXGetLastError() -> *const c_char;
    pub fn MXGetVersion(out: *mut c_int) -> c_int;
    pub fn MXGetGPUCount(out: *mut c_int) -> c_int;
    pub fn MXNDArrayWaitAll() -> c_int;

    pub fn MXListAllOpNames(out_size: *mut mx_uint, out_array: *mut *mut *const c_char) -> c_int;
    pub fn NNGetOpHandle(op_name: *const c_char, op_out: *mut OpHandle) -> c_int;
    pub fn MXSymbolGetAtomicSymbolInfo(
        creator: OpHandle,
        name: *mut *const c_char,
        description: *mut *const c_char,
        num_args: *mut mx_uint,
        arg_names: *mut *mut *const c_char,
        arg_type_infos: *mut *mut *const c_char,
        arg_descriptions: *mut *mut *const c_char,
        key_var_num_args: *mut *const c_char,
        return_type: *mut *const c_char,
    ) -> c_int;

    pub fn MXSymbolCreateFromFile(fname: *const c_char, out: *mut SymbolHandle) -> c_int;
    pub fn MXSymbolCreateFromJSON(json: *const c_char, out: *mut SymbolHandle) -> c_int;
    pub fn MXSymbolSaveToJSON(symbol: SymbolHandle, out_json: *mut *const c_char) -> c_int;
    pub fn MXSymbolFree(symbol: SymbolHandle) -> c_int;
    pub fn MXSymbolListOutputs(
        symbol: SymbolHandle,
        out_size: *mut mx_uint,
        out_str_array: *mut *mut *const c_char,
    ) -> c_int;
    pub fn MXSymbolGetNumOutputs(symbol: SymbolHandle, output_count: *mut mx_uint) -> c_int;
    pub fn MXSymbolGetOutput(symbol: SymbolHandle, index: mx_uint, out: *mut SymbolHandle)
    -> c_int;
    pub fn MXSymbolGetInternals(symbol: SymbolHandle, out: *mut SymbolHandle) -> c_int;
    pub fn MXSymbolListArguments(
        symbol: SymbolHandle,
        out_size: *mut mx_uint,
        out_str_array: *mut *mut *const c_char,
    ) -> c_int;
    pub fn MXSymbolListAuxiliaryStates(
        symbol: SymbolHandle,
        out_size: *mut mx_uint,
        out_str_array: *mut *mut *const c_char,
    ) -> c_int;
    pub fn NNSymbolListInputNames(
        symbol: SymbolHandle,
        option: c_int,
        out_size: *mut mx_uint,
        out_str_array: *mut *mut *const c_char,
    ) -> c_int;

    pub fn MXNDArrayCreateEx(
        shape: *const mx_uint,
        ndim: mx_uint,
        dev_type: c_int,
        dev_id: c_int,
        delay_alloc: c_int,
        dtype: c_int,
        out: *mut NDArrayHandle,
    ) -> c_int;
    pub fn MXNDArrayFree(handle: NDArrayHandle) -> c_int;
    pub fn MXNDArraySyncCopyFromCPU(handle: NDArrayHandle, data: *const c_void, size: size_t)
    -> c_int;
    pub fn MXNDArraySyncCopyToCPU(handle: NDArrayHandle, data: *mut c_void, size: size_t) -> c_int;
    pub fn MXNDArraySyncCopyFromNDArray(
        handle_dst: NDArrayHandle,
        handle_src: NDArrayHandle,
        i: c_int,
    ) -> c_int;
    pub fn MXNDArrayWaitToRead(handle: NDArrayHandle) -> c_int;
    pub fn MXNDArrayGetShapeEx(
        handle: NDArrayHandle,
        out_dim: *mut c_int,
        out_pdata: *mut *const c_int,
    ) -> c_int;
    pub fn MXNDArrayGetDType(handle: NDArrayHandle, out_dtype: *mut c_int) -> c_int;
    pub fn MXNDArrayGetContext(
        handle: NDArrayHandle,
        out_dev_type: *mut c_int,
        out_dev_id: *mut c_int,
    ) -> c_int;
    pub fn MXNDArrayGetStorageType(handle: NDArrayHandle, out_storage_type: *mut c_int) -> c_int;

    pub fn MXCreateCachedOpEx(
        handle: SymbolHandle,
        num_flags: c_int,
        keys: *const *const c_char,
        vals: *const *const c_char,
        out: *mut CachedOpHandle,
    ) -> c_int;
    pub fn MXFreeCachedOp(handle: CachedOpHandle) -> c_int;
    pub fn MXInvokeCachedOpEx(
        handle: CachedOpHandle,
        num_inputs: c_int,
        inputs: *mut NDArrayHandle,
        num_outputs: *mut c_int,
        outputs: *mut *mut NDArrayHandle,
        out_stypes: *mut *const c_int,
    ) -> c_int;
}

// ── Pure-Rust reference engine (enabled with `native` feature) ──────────

#[cfg(feature = "native")]
mod native_impl;

#[cfg(feature = "native")]
pub use native_impl::*;

#[cfg(test)]
mod tests {
    use super::*;
    use libc::c_char;
    use std::ffi::{CStr, CString};

    fn last_error() -> String {
        unsafe { CStr::from_ptr(MXGetLastError()) }
            .to_string_lossy()
            .into_owned()
    }

    // Helper: turn a thread-local string array into owned strings.
    unsafe fn strings(size: mx_uint, array: *mut *const c_char) -> Vec<String> {
        unsafe {
            (0..size as usize)
                .map(|i| {
                    CStr::from_ptr(*array.add(i))
                        .to_string_lossy()
                        .into_owned()
                })
                .collect()
        }
    }

    unsafe fn load_symbol(json: &str) -> SymbolHandle {
        let json = CString::new(json).unwrap();
        let mut sym: SymbolHandle = std::ptr::null_mut();
        let rc = unsafe { MXSymbolCreateFromJSON(json.as_ptr(), &mut sym) };
        assert_eq!(rc, 0, "MXSymbolCreateFromJSON failed: {}", last_error());
        sym
    }

    unsafe fn make_array(data: &[f32], shape: &[mx_uint], dev_id: c_int) -> NDArrayHandle {
        unsafe {
            let mut out: NDArrayHandle = std::ptr::null_mut();
            let rc = MXNDArrayCreateEx(
                shape.as_ptr(),
                shape.len() as mx_uint,
                MX_DEV_CPU,
                dev_id,
                0,
                MX_DTYPE_FLOAT32,
                &mut out,
            );
            assert_eq!(rc, 0, "MXNDArrayCreateEx failed: {}", last_error());
            let rc = MXNDArraySyncCopyFromCPU(out, data.as_ptr().cast(), data.len());
            assert_eq!(rc, 0, "MXNDArraySyncCopyFromCPU failed: {}", last_error());
            out
        }
    }

    unsafe fn read_f32(handle: NDArrayHandle, len: usize) -> Vec<f32> {
        let mut out = vec![0.0f32; len];
        let rc = unsafe { MXNDArraySyncCopyToCPU(handle, out.as_mut_ptr().cast(), len) };
        assert_eq!(rc, 0, "MXNDArraySyncCopyToCPU failed: {}", last_error());
        out
    }

    unsafe fn read_shape(handle: NDArrayHandle) -> Vec<c_int> {
        unsafe {
            let mut ndim: c_int = 0;
            let mut pdata: *const c_int = std::ptr::null();
            let rc = MXNDArrayGetShapeEx(handle, &mut ndim, &mut pdata);
            assert_eq!(rc, 0, "MXNDArrayGetShapeEx failed: {}", last_error());
            std::slice::from_raw_parts(pdata, ndim as usize).to_vec()
        }
    }

    // ── NDArray tests ────────────────────────────────────────────────

    #[test]
    fn test_ndarray_roundtrip() {
        unsafe {
            let a = make_array(&[1.0, 2.0, 3.0, 4.0], &[2, 2], 0);
            assert_eq!(read_shape(a), vec![2, 2]);
            assert_eq!(read_f32(a, 4), vec![1.0, 2.0, 3.0, 4.0]);

            let mut dtype = -1;
            assert_eq!(MXNDArrayGetDType(a, &mut dtype), 0);
            assert_eq!(dtype, MX_DTYPE_FLOAT32);

            let mut stype = -1;
            assert_eq!(MXNDArrayGetStorageType(a, &mut stype), 0);
            assert_eq!(stype, MX_STORAGE_DEFAULT);
            assert_eq!(MXNDArrayFree(a), 0);
        }
    }

    #[test]
    fn test_copy_size_mismatch_sets_last_error() {
        unsafe {
            let a = make_array(&[1.0, 2.0], &[2], 0);
            let data = [1.0f32; 3];
            let rc = MXNDArraySyncCopyFromCPU(a, data.as_ptr().cast(), data.len());
            assert_eq!(rc, -1);
            assert!(last_error().contains("3"), "got: {}", last_error());
            MXNDArrayFree(a);
        }
    }

    #[test]
    fn test_copy_between_contexts() {
        unsafe {
            let src = make_array(&[5.0, 6.0], &[2], 0);
            let dst = make_array(&[0.0, 0.0], &[2], 1);
            assert_eq!(MXNDArraySyncCopyFromNDArray(dst, src, -1), 0);
            assert_eq!(read_f32(dst, 2), vec![5.0, 6.0]);

            let (mut dev_type, mut dev_id) = (0, 0);
            assert_eq!(MXNDArrayGetContext(dst, &mut dev_type, &mut dev_id), 0);
            assert_eq!((dev_type, dev_id), (MX_DEV_CPU, 1));
            MXNDArrayFree(src);
            MXNDArrayFree(dst);
        }
    }

    #[test]
    fn test_gpu_context_rejected() {
        unsafe {
            let shape = [2 as mx_uint];
            let mut out: NDArrayHandle = std::ptr::null_mut();
            let rc = MXNDArrayCreateEx(shape.as_ptr(), 1, MX_DEV_GPU, 0, 0, 0, &mut out);
            assert_eq!(rc, -1);
            assert!(out.is_null());
            assert!(last_error().contains("GPU"));
        }
    }

    // ── Symbol tests ─────────────────────────────────────────────────

    #[test]
    fn test_list_input_names_in_declaration_order() {
        unsafe {
            let sym = load_symbol(&mxnet_conformance::fixtures::mlp_symbol_json());
            let mut size: mx_uint = 0;
            let mut array: *mut *const c_char = std::ptr::null_mut();
            let rc = NNSymbolListInputNames(sym, NN_LIST_INPUTS_ALL, &mut size, &mut array);
            assert_eq!(rc, 0);
            assert_eq!(
                strings(size, array),
                mxnet_conformance::fixtures::MLP_NAMES
            );
            assert_eq!(MXSymbolFree(sym), 0);
        }
    }

    #[test]
    fn test_internals_expose_every_node_output() {
        unsafe {
            let sym = load_symbol(&mxnet_conformance::fixtures::mlp_symbol_json());
            let mut internals: SymbolHandle = std::ptr::null_mut();
            assert_eq!(MXSymbolGetInternals(sym, &mut internals), 0);

            let mut size: mx_uint = 0;
            let mut array: *mut *const c_char = std::ptr::null_mut();
            assert_eq!(MXSymbolListOutputs(internals, &mut size, &mut array), 0);
            assert_eq!(
                strings(size, array),
                vec![
                    "data",
                    "w1",
                    "b1",
                    "fc1_output",
                    "relu1_output",
                    "w2",
                    "b2",
                    "fc2_output"
                ]
            );

            let mut one: SymbolHandle = std::ptr::null_mut();
            assert_eq!(MXSymbolGetOutput(internals, 4, &mut one), 0);
            assert_eq!(MXSymbolListOutputs(one, &mut size, &mut array), 0);
            assert_eq!(strings(size, array), vec!["relu1_output"]);

            let rc = MXSymbolGetOutput(internals, 8, &mut one);
            assert_eq!(rc, -1);
            assert!(last_error().contains("out of range"));

            MXSymbolFree(one);
            MXSymbolFree(internals);
            MXSymbolFree(sym);
        }
    }

    #[test]
    fn test_malformed_json_rejected() {
        unsafe {
            let json = CString::new("{\"nodes\": 3}").unwrap();
            let mut sym: SymbolHandle = std::ptr::null_mut();
            assert_eq!(MXSymbolCreateFromJSON(json.as_ptr(), &mut sym), -1);
            assert!(sym.is_null());
            assert!(!last_error().is_empty());
        }
    }

    // ── Cached op tests ──────────────────────────────────────────────

    #[test]
    fn test_cached_op_invoke() {
        use mxnet_conformance::fixtures::{MLP_INPUT, MLP_OUTPUT, MlpWeights};

        unsafe {
            let sym = load_symbol(&mxnet_conformance::fixtures::mlp_symbol_json());
            let keys = [
                CString::new("data_indices").unwrap(),
                CString::new("param_indices").unwrap(),
                CString::new("static_alloc").unwrap(),
                CString::new("static_shape").unwrap(),
            ];
            let vals = [
                CString::new("[0]").unwrap(),
                CString::new("[1, 2, 3, 4]").unwrap(),
                CString::new("1").unwrap(),
                CString::new("1").unwrap(),
            ];
            let key_ptrs: Vec<*const c_char> = keys.iter().map(|k| k.as_ptr()).collect();
            let val_ptrs: Vec<*const c_char> = vals.iter().map(|v| v.as_ptr()).collect();
            let mut op: CachedOpHandle = std::ptr::null_mut();
            let rc = MXCreateCachedOpEx(sym, 4, key_ptrs.as_ptr(), val_ptrs.as_ptr(), &mut op);
            assert_eq!(rc, 0, "MXCreateCachedOpEx failed: {}", last_error());

            let w = MlpWeights::deterministic();
            let x = [0.5f32, -1.0, 2.0];
            let mut inputs = vec![make_array(&x, &[1, MLP_INPUT as mx_uint], 0)];
            for (_, dims, values) in w.named() {
                let dims: Vec<mx_uint> = dims.iter().map(|&d| d as mx_uint).collect();
                inputs.push(make_array(values, &dims, 0));
            }

            let mut num_outputs: c_int = 0;
            let mut outputs: *mut NDArrayHandle = std::ptr::null_mut();
            let mut stypes: *const c_int = std::ptr::null();
            let rc = MXInvokeCachedOpEx(
                op,
                inputs.len() as c_int,
                inputs.as_mut_ptr(),
                &mut num_outputs,
                &mut outputs,
                &mut stypes,
            );
            assert_eq!(rc, 0, "MXInvokeCachedOpEx failed: {}", last_error());
            assert_eq!(num_outputs, 1);
            assert_eq!(*stypes, MX_STORAGE_DEFAULT);

            let out = *outputs;
            assert_eq!(read_shape(out), vec![1, MLP_OUTPUT as c_int]);
            mxnet_conformance::assert_allclose(
                &read_f32(out, MLP_OUTPUT),
                &w.forward(&x),
                1e-5,
                1e-5,
            );

            MXNDArrayFree(out);
            for h in inputs {
                MXNDArrayFree(h);
            }
            assert_eq!(MXFreeCachedOp(op), 0);
            MXSymbolFree(sym);
        }
    }

    #[test]
    fn test_cached_op_rejects_overlapping_indices() {
        unsafe {
            let sym = load_symbol(&mxnet_conformance::fixtures::mlp_symbol_json());
            let keys = [
                CString::new("data_indices").unwrap(),
                CString::new("param_indices").unwrap(),
            ];
            let vals = [
                CString::new("[0, 1]").unwrap(),
                CString::new("[1, 2, 3, 4]").unwrap(),
            ];
            let key_ptrs: Vec<*const c_char> = keys.iter().map(|k| k.as_ptr()).collect();
            let val_ptrs: Vec<*const c_char> = vals.iter().map(|v| v.as_ptr()).collect();
            let mut op: CachedOpHandle = std::ptr::null_mut();
            let rc = MXCreateCachedOpEx(sym, 2, key_ptrs.as_ptr(), val_ptrs.as_ptr(), &mut op);
            assert_eq!(rc, -1);
            assert!(op.is_null());
            assert!(last_error().contains("partition"), "got: {}", last_error());
            MXSymbolFree(sym);
        }
    }

    #[test]
    fn test_version_and_gpu_count() {
        unsafe {
            let mut version = 0;
            assert_eq!(MXGetVersion(&mut version), 0);
            assert!(version >= 10000);
            let mut gpus = -1;
            assert_eq!(MXGetGPUCount(&mut gpus), 0);
            assert_eq!(gpus, 0);
        }
    }
}
