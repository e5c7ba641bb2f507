//! Symbol graph accessor.

use std::path::Path;
use std::ptr::NonNull;
use std::sync::OnceLock;

use libc::{c_char, c_int};
use mxnet_sys as sys;
use tracing::{debug, warn};

use crate::ffi::{c_string, check_call, string_array, to_cstring};
use crate::{MxError, Result};

type ListFn =
    unsafe extern "C" fn(sys::SymbolHandle, *mut sys::mx_uint, *mut *mut *const c_char) -> c_int;

/// An owned computation graph.
///
/// Input names and internal output names are fetched from the engine on
/// first use and cached for the lifetime of the value.
pub struct Symbol {
    handle: Option<NonNull<sys::mx_symbol_t>>,
    all_names: OnceLock<Vec<String>>,
    outputs: OnceLock<Vec<String>>,
}

// SAFETY: a symbol handle is immutable once created and the engine permits
// concurrent reads; release goes through `&mut self` or `Drop`.
unsafe impl Send for Symbol {}
unsafe impl Sync for Symbol {}

impl Symbol {
    fn from_raw(ptr: sys::SymbolHandle) -> Result<Self> {
        let handle = NonNull::new(ptr).ok_or(MxError::NullPtr)?;
        Ok(Self {
            handle: Some(handle),
            all_names: OnceLock::new(),
            outputs: OnceLock::new(),
        })
    }

    /// Load a graph from an MXNet `*-symbol.json` file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let utf8 = path.to_str().ok_or_else(|| {
            MxError::InvalidArgument(format!("symbol path {} is not valid UTF-8", path.display()))
        })?;
        let c_path = to_cstring(utf8)?;
        let mut out: sys::SymbolHandle = std::ptr::null_mut();
        check_call(unsafe { sys::MXSymbolCreateFromFile(c_path.as_ptr(), &mut out) })?;
        debug!(path = %path.display(), "loaded symbol");
        Self::from_raw(out)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let c_json = to_cstring(json)?;
        let mut out: sys::SymbolHandle = std::ptr::null_mut();
        check_call(unsafe { sys::MXSymbolCreateFromJSON(c_json.as_ptr(), &mut out) })?;
        Self::from_raw(out)
    }

    /// Raw handle, or `InvalidState` once the symbol has been closed.
    pub fn handle(&self) -> Result<sys::SymbolHandle> {
        self.handle
            .map(NonNull::as_ptr)
            .ok_or_else(|| MxError::InvalidState("symbol has been closed".into()))
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_none()
    }

    fn list(&self, f: ListFn) -> Result<Vec<String>> {
        let handle = self.handle()?;
        let mut size: sys::mx_uint = 0;
        let mut array: *mut *const c_char = std::ptr::null_mut();
        check_call(unsafe { f(handle, &mut size, &mut array) })?;
        Ok(unsafe { string_array(size, array) })
    }

    /// Every graph input (arguments and auxiliary states), in declaration order.
    pub fn all_names(&self) -> Result<&[String]> {
        if let Some(names) = self.all_names.get() {
            return Ok(names);
        }
        let handle = self.handle()?;
        let mut size: sys::mx_uint = 0;
        let mut array: *mut *const c_char = std::ptr::null_mut();
        check_call(unsafe {
            sys::NNSymbolListInputNames(handle, sys::NN_LIST_INPUTS_ALL, &mut size, &mut array)
        })?;
        let names = unsafe { string_array(size, array) };
        Ok(self.all_names.get_or_init(|| names))
    }

    /// Output names of every internal node.
    pub fn outputs(&self) -> Result<&[String]> {
        if let Some(outputs) = self.outputs.get() {
            return Ok(outputs);
        }
        let outputs = self.internals()?.head_outputs()?;
        Ok(self.outputs.get_or_init(|| outputs))
    }

    /// The internal output at `index`, as a single-output symbol.
    pub fn output_at(&self, index: usize) -> Result<Symbol> {
        let index = sys::mx_uint::try_from(index)
            .map_err(|_| MxError::InvalidArgument(format!("output index {index} too large")))?;
        let internals = self.internals()?;
        let mut out: sys::SymbolHandle = std::ptr::null_mut();
        check_call(unsafe { sys::MXSymbolGetOutput(internals.handle()?, index, &mut out) })?;
        Self::from_raw(out)
    }

    /// The internal output called `name`.
    pub fn output_named(&self, name: &str) -> Result<Symbol> {
        let index = self
            .outputs()?
            .iter()
            .position(|o| o == name)
            .ok_or_else(|| {
                MxError::InvalidArgument(format!("Cannot find output that matches name: {name}"))
            })?;
        self.output_at(index)
    }

    /// Internal outputs that are not graph inputs, in output order.
    pub fn layer_names(&self) -> Result<Vec<String>> {
        let inputs = self.all_names()?;
        Ok(self
            .outputs()?
            .iter()
            .filter(|o| !inputs.contains(*o))
            .cloned()
            .collect())
    }

    /// A symbol whose outputs are every internal node output.
    pub fn internals(&self) -> Result<Symbol> {
        let mut out: sys::SymbolHandle = std::ptr::null_mut();
        check_call(unsafe { sys::MXSymbolGetInternals(self.handle()?, &mut out) })?;
        Self::from_raw(out)
    }

    pub fn arguments(&self) -> Result<Vec<String>> {
        self.list(sys::MXSymbolListArguments)
    }

    pub fn aux_states(&self) -> Result<Vec<String>> {
        self.list(sys::MXSymbolListAuxiliaryStates)
    }

    /// Names of this symbol's own outputs (the graph heads).
    pub fn head_outputs(&self) -> Result<Vec<String>> {
        self.list(sys::MXSymbolListOutputs)
    }

    pub fn num_outputs(&self) -> Result<usize> {
        let mut count: sys::mx_uint = 0;
        check_call(unsafe { sys::MXSymbolGetNumOutputs(self.handle()?, &mut count) })?;
        Ok(count as usize)
    }

    pub fn to_json(&self) -> Result<String> {
        let mut out: *const c_char = std::ptr::null();
        check_call(unsafe { sys::MXSymbolSaveToJSON(self.handle()?, &mut out) })?;
        if out.is_null() {
            return Err(MxError::NullPtr);
        }
        Ok(unsafe { c_string(out) })
    }

    /// Release the native handle. Later calls are no-ops.
    pub fn close(&mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => check_call(unsafe { sys::MXSymbolFree(handle.as_ptr()) }),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Symbol")
            .field("handle", &self.handle)
            .field("all_names", &self.all_names.get())
            .finish()
    }
}

impl Drop for Symbol {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "failed to free symbol");
        }
    }
}
