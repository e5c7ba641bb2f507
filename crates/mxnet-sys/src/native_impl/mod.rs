//! Pure-Rust reference engine behind the `MX*` C ABI.
//!
//! Symbols are parsed from MXNet's JSON graph format and evaluated on host
//! `f32` buffers. Handles are boxed Rust values cast through the opaque
//! marker types declared in the crate root.
//!
//! # Safety
//!
//! All functions follow the C ABI conventions of libmxnet: callers pass
//! pointers obtained from other `MX*` functions (or null where documented),
//! and free every handle exactly once with the matching `*Free` function.
//! No function unwinds across the ABI; panics are reported as errors.

#![allow(non_snake_case, clippy::missing_safety_doc)]

mod cached_op;
mod graph;
mod ndarray;
mod ops;

pub use cached_op::*;
pub use graph::*;
pub use ndarray::*;
pub use ops::*;

use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::panic::{AssertUnwindSafe, catch_unwind};

use libc::{c_char, c_int};

use crate::{NDArrayHandle, mx_uint};

/// Version reported by `MXGetVersion` (`major * 10000 + minor * 100 + patch`).
pub const NATIVE_ENGINE_VERSION: c_int = 10500;

#[derive(Debug, thiserror::Error)]
pub(crate) enum EngineError {
    #[error("null pointer passed for `{0}`")]
    NullArgument(&'static str),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("invalid symbol json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("cannot read `{path}`: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("operator `{0}` is not registered")]
    UnknownOp(String),
    #[error("operator `{op}`: {message}")]
    Operator { op: String, message: String },
    #[error("shape mismatch: {0}")]
    Shape(String),
}

pub(crate) type EngineResult<T> = Result<T, EngineError>;

// ── Thread-local engine state ───────────────────────────────────────────

/// Storage behind arrays handed out through out-parameters.
#[derive(Default)]
pub(crate) struct ReturnBuffers {
    strings: Vec<CString>,
    charp: Vec<*const c_char>,
    pub(crate) json: CString,
    pub(crate) handles: Vec<NDArrayHandle>,
    pub(crate) stypes: Vec<c_int>,
}

thread_local! {
    static LAST_ERROR: RefCell<CString> = RefCell::new(CString::default());
    static RETURNS: RefCell<ReturnBuffers> = RefCell::new(ReturnBuffers::default());
}

pub(crate) fn with_returns<R>(f: impl FnOnce(&mut ReturnBuffers) -> R) -> R {
    RETURNS.with(|r| f(&mut r.borrow_mut()))
}

fn set_last_error(message: String) {
    let message = CString::new(message.replace('\0', " ")).unwrap_or_default();
    LAST_ERROR.with(|e| *e.borrow_mut() = message);
}

/// Run one API call body, translating errors and panics into `-1`.
pub(crate) fn api_call(body: impl FnOnce() -> EngineResult<()>) -> c_int {
    match catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            set_last_error(e.to_string());
            -1
        }
        Err(payload) => {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            set_last_error(format!("engine panicked: {reason}"));
            -1
        }
    }
}

// ── Pointer conversion helpers ──────────────────────────────────────────

pub(crate) unsafe fn out_ptr<'a, T>(p: *mut T, what: &'static str) -> EngineResult<&'a mut T> {
    unsafe { p.as_mut() }.ok_or(EngineError::NullArgument(what))
}

pub(crate) unsafe fn c_str<'a>(p: *const c_char, what: &'static str) -> EngineResult<&'a str> {
    if p.is_null() {
        return Err(EngineError::NullArgument(what));
    }
    unsafe { CStr::from_ptr(p) }
        .to_str()
        .map_err(|_| EngineError::InvalidArgument(format!("`{what}` is not valid UTF-8")))
}

pub(crate) fn box_handle<T, H>(value: T) -> *mut H {
    Box::into_raw(Box::new(value)).cast()
}

pub(crate) unsafe fn ref_handle<'a, T, H>(p: *mut H, what: &'static str) -> EngineResult<&'a T> {
    if p.is_null() {
        return Err(EngineError::NullArgument(what));
    }
    Ok(unsafe { &*p.cast::<T>() })
}

pub(crate) unsafe fn free_handle<T, H>(p: *mut H) {
    if !p.is_null() {
        drop(unsafe { Box::from_raw(p.cast::<T>()) });
    }
}

/// Publish `names` through the thread-local string array.
pub(crate) unsafe fn return_strings(
    names: Vec<String>,
    out_size: *mut mx_uint,
    out_array: *mut *mut *const c_char,
) -> EngineResult<()> {
    let size = unsafe { out_ptr(out_size, "out_size") }?;
    let array = unsafe { out_ptr(out_array, "out_str_array") }?;
    let strings = to_cstrings(names)?;
    with_returns(|r| {
        r.strings = strings;
        r.charp = r.strings.iter().map(|s| s.as_ptr()).collect();
        *size = r.charp.len() as mx_uint;
        *array = r.charp.as_mut_ptr();
    });
    Ok(())
}

pub(crate) fn to_cstrings(names: Vec<String>) -> EngineResult<Vec<CString>> {
    names
        .into_iter()
        .map(|s| {
            CString::new(s)
                .map_err(|e| EngineError::InvalidArgument(format!("interior NUL in name: {e}")))
        })
        .collect()
}

// ── Engine info ─────────────────────────────────────────────────────────

#[unsafe(no_mangle)]
pub unsafe extern "C" fn MXGetLastError() -> *const c_char {
    LAST_ERROR.with(|e| e.borrow().as_ptr())
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn MXGetVersion(out: *mut c_int) -> c_int {
    api_call(|| {
        *unsafe { out_ptr(out, "out") }? = NATIVE_ENGINE_VERSION;
        Ok(())
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn MXGetGPUCount(out: *mut c_int) -> c_int {
    api_call(|| {
        *unsafe { out_ptr(out, "out") }? = 0;
        Ok(())
    })
}

/// Every operation completes synchronously, so there is nothing to wait for.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn MXNDArrayWaitAll() -> c_int {
    api_call(|| Ok(()))
}
