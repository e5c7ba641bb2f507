//! Status checking and string marshalling shared by the wrappers.

use std::ffi::{CStr, CString};

use libc::{c_char, c_int};
use mxnet_sys as sys;

use crate::{MxError, Result};

/// The engine's description of the most recent failure on this thread.
pub(crate) fn last_error() -> String {
    let ptr = unsafe { sys::MXGetLastError() };
    if ptr.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(ptr) }
        .to_string_lossy()
        .into_owned()
}

pub(crate) fn check_call(rc: c_int) -> Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(MxError::EngineCall(last_error()))
    }
}

/// Copy an engine-owned string array before the next call invalidates it.
pub(crate) unsafe fn string_array(size: sys::mx_uint, array: *mut *const c_char) -> Vec<String> {
    if size == 0 || array.is_null() {
        return Vec::new();
    }
    unsafe { std::slice::from_raw_parts(array, size as usize) }
        .iter()
        .map(|&p| {
            if p.is_null() {
                String::new()
            } else {
                unsafe { CStr::from_ptr(p) }.to_string_lossy().into_owned()
            }
        })
        .collect()
}

pub(crate) unsafe fn c_string(p: *const c_char) -> String {
    if p.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(p) }.to_string_lossy().into_owned()
}

pub(crate) fn to_cstring(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| MxError::InvalidArgument(format!("string contains NUL byte: {s:?}")))
}
