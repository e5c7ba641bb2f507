//! Cached operator builder and invoker.
//!
//! A cached operator is built once from a symbol and a parameter set. Every
//! graph input whose name appears in the parameter set becomes a *parameter
//! slot*, bound at build time; the remaining inputs become *runtime slots*,
//! filled from the arguments of each [`CachedOp::invoke`] call.

use std::ptr::NonNull;
use std::sync::Arc;

use libc::{c_char, c_int};
use mxnet_sys as sys;
use tracing::{debug, info, warn};

use crate::block::ParameterSet;
use crate::ffi::{check_call, to_cstring};
use crate::manager::NdManager;
use crate::ndarray::NdArray;
use crate::symbol::Symbol;
use crate::types::StorageType;
use crate::{MxError, Result};

/// A graph input supplied on every invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeSlot {
    pub name: String,
    /// 0-based position in the graph's input list.
    pub position: usize,
}

/// Split of the graph inputs into parameter and runtime slots.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputPartition {
    total: usize,
    param_slots: Vec<usize>,
    runtime_slots: Vec<RuntimeSlot>,
}

impl InputPartition {
    /// Classify each of `names` (in order) with `is_param`.
    pub fn new<S: AsRef<str>>(names: &[S], mut is_param: impl FnMut(&str) -> bool) -> Self {
        let mut param_slots = Vec::new();
        let mut runtime_slots = Vec::new();
        for (position, name) in names.iter().enumerate() {
            let name = name.as_ref();
            if is_param(name) {
                param_slots.push(position);
            } else {
                runtime_slots.push(RuntimeSlot {
                    name: name.to_string(),
                    position,
                });
            }
        }
        Self {
            total: names.len(),
            param_slots,
            runtime_slots,
        }
    }

    /// Number of graph inputs.
    pub fn total(&self) -> usize {
        self.total
    }

    pub fn param_slots(&self) -> &[usize] {
        &self.param_slots
    }

    pub fn runtime_slots(&self) -> &[RuntimeSlot] {
        &self.runtime_slots
    }

    pub fn runtime_names(&self) -> Vec<&str> {
        self.runtime_slots.iter().map(|s| s.name.as_str()).collect()
    }
}

/// Creation flags, kept typed until they cross into the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedOpFlags {
    pub data_indices: Vec<usize>,
    pub param_indices: Vec<usize>,
    pub static_alloc: bool,
    pub static_shape: bool,
}

impl CachedOpFlags {
    /// Flags for `partition` with static allocation and static shapes on.
    ///
    /// # Panics
    ///
    /// Panics if the partition's slot counts do not add up to its total.
    pub fn from_partition(partition: &InputPartition) -> Self {
        assert_eq!(
            partition.param_slots.len() + partition.runtime_slots.len(),
            partition.total,
            "malformed input partition"
        );
        Self {
            data_indices: partition.runtime_slots.iter().map(|s| s.position).collect(),
            param_indices: partition.param_slots.clone(),
            static_alloc: true,
            static_shape: true,
        }
    }

    /// Key/value strings in the form `MXCreateCachedOpEx` expects.
    pub fn to_key_values(&self) -> Vec<(&'static str, String)> {
        vec![
            ("data_indices", encode_tuple(&self.data_indices)),
            ("param_indices", encode_tuple(&self.param_indices)),
            ("static_alloc", encode_bool(self.static_alloc)),
            ("static_shape", encode_bool(self.static_shape)),
        ]
    }
}

fn encode_tuple(indices: &[usize]) -> String {
    let items: Vec<String> = indices.iter().map(usize::to_string).collect();
    format!("[{}]", items.join(", "))
}

fn encode_bool(value: bool) -> String {
    String::from(if value { "1" } else { "0" })
}

/// Where parameters end up relative to the builder's manager.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ParameterPlacement {
    /// Copy parameters that live in another context; share the rest.
    #[default]
    CopyToContext,
    /// Fail the build if any parameter lives in another context.
    RequireResident,
}

pub struct CachedOpBuilder<'a> {
    symbol: &'a Symbol,
    manager: NdManager,
    parameters: Option<&'a ParameterSet>,
    placement: ParameterPlacement,
}

impl<'a> CachedOpBuilder<'a> {
    pub fn new(symbol: &'a Symbol, manager: &NdManager) -> Self {
        Self {
            symbol,
            manager: manager.clone(),
            parameters: None,
            placement: ParameterPlacement::default(),
        }
    }

    pub fn parameters(mut self, parameters: &'a ParameterSet) -> Self {
        self.parameters = Some(parameters);
        self
    }

    pub fn placement(mut self, placement: ParameterPlacement) -> Self {
        self.placement = placement;
        self
    }

    fn place(&self, name: &str, array: &Arc<NdArray>) -> Result<Arc<NdArray>> {
        match self.placement {
            ParameterPlacement::CopyToContext => self.manager.ensure_resident(array),
            ParameterPlacement::RequireResident => {
                let ctx = array.context()?;
                if ctx != self.manager.context() {
                    return Err(MxError::InvalidArgument(format!(
                        "parameter {name} lives on {ctx}, expected {}",
                        self.manager.context()
                    )));
                }
                Ok(Arc::clone(array))
            }
        }
    }

    pub fn build(self) -> Result<CachedOp> {
        let empty = ParameterSet::new();
        let params = self.parameters.unwrap_or(&empty);
        let names = self.symbol.all_names()?;

        let partition = InputPartition::new(names, |name| params.contains(name));
        for unused in params.names().filter(|n| !names.iter().any(|g| g == n)) {
            warn!(parameter = unused, "parameter is not a graph input; ignoring it");
        }

        let mut input_handles: Vec<sys::NDArrayHandle> = vec![std::ptr::null_mut(); partition.total];
        let mut bound = Vec::with_capacity(partition.param_slots.len());
        for &position in &partition.param_slots {
            let name = &names[position];
            let array = params.get(name).ok_or_else(|| {
                MxError::InvalidState(format!("parameter {name} vanished during build"))
            })?;
            let placed = self.place(name, array)?;
            input_handles[position] = placed.handle();
            bound.push((position, placed));
        }

        let key_values = CachedOpFlags::from_partition(&partition).to_key_values();
        let keys = key_values
            .iter()
            .map(|(k, _)| to_cstring(k))
            .collect::<Result<Vec<_>>>()?;
        let vals = key_values
            .iter()
            .map(|(_, v)| to_cstring(v))
            .collect::<Result<Vec<_>>>()?;
        let key_ptrs: Vec<*const c_char> = keys.iter().map(|k| k.as_ptr()).collect();
        let val_ptrs: Vec<*const c_char> = vals.iter().map(|v| v.as_ptr()).collect();

        let mut out: sys::CachedOpHandle = std::ptr::null_mut();
        check_call(unsafe {
            sys::MXCreateCachedOpEx(
                self.symbol.handle()?,
                key_ptrs.len() as c_int,
                key_ptrs.as_ptr(),
                val_ptrs.as_ptr(),
                &mut out,
            )
        })?;
        let handle = NonNull::new(out).ok_or(MxError::NullPtr)?;

        info!(
            inputs = partition.total,
            params = partition.param_slots.len(),
            runtime = ?partition.runtime_names(),
            context = %self.manager.context(),
            "built cached op"
        );
        Ok(CachedOp {
            handle: Some(handle),
            manager: self.manager,
            input_handles,
            parameters: bound,
            partition,
        })
    }
}

/// A built operator, callable any number of times.
///
/// Owns the native handle, the parameter arrays bound at build time, and the
/// input-handle array handed to the engine on every call.
pub struct CachedOp {
    handle: Option<NonNull<sys::mx_cached_op_t>>,
    manager: NdManager,
    input_handles: Vec<sys::NDArrayHandle>,
    parameters: Vec<(usize, Arc<NdArray>)>,
    partition: InputPartition,
}

// SAFETY: the raw input handles either point into `parameters`, which this
// value keeps alive, or are null between calls. Calls need `&mut self`.
unsafe impl Send for CachedOp {}
unsafe impl Sync for CachedOp {}

impl CachedOp {
    pub fn builder<'a>(symbol: &'a Symbol, manager: &NdManager) -> CachedOpBuilder<'a> {
        CachedOpBuilder::new(symbol, manager)
    }

    pub fn partition(&self) -> &InputPartition {
        &self.partition
    }

    pub fn manager(&self) -> &NdManager {
        &self.manager
    }

    /// The parameter bound at graph input `position`, if it is a parameter slot.
    pub fn bound_parameter(&self, position: usize) -> Option<&Arc<NdArray>> {
        self.parameters
            .iter()
            .find(|(p, _)| *p == position)
            .map(|(_, a)| a)
    }

    /// Run the operator with one array per runtime slot, in slot order.
    ///
    /// Returns fresh arrays owned by the caller and attributed to the
    /// builder's manager, each tagged with the storage type the engine reported.
    pub fn invoke(&mut self, inputs: &[&NdArray]) -> Result<Vec<NdArray>> {
        let expected = self.partition.runtime_slots.len();
        if inputs.len() != expected {
            return Err(MxError::InvalidArgument(format!(
                "cached op expects {expected} runtime inputs {:?}, got {}",
                self.partition.runtime_names(),
                inputs.len()
            )));
        }
        let handle = self
            .handle
            .ok_or_else(|| MxError::InvalidState("cached op has been freed".into()))?;

        for (slot, input) in self.partition.runtime_slots.iter().zip(inputs) {
            self.input_handles[slot.position] = input.handle();
        }
        let mut num_outputs: c_int = 0;
        let mut outputs: *mut sys::NDArrayHandle = std::ptr::null_mut();
        let mut stypes: *const c_int = std::ptr::null();
        let rc = unsafe {
            sys::MXInvokeCachedOpEx(
                handle.as_ptr(),
                self.input_handles.len() as c_int,
                self.input_handles.as_mut_ptr(),
                &mut num_outputs,
                &mut outputs,
                &mut stypes,
            )
        };
        for slot in &self.partition.runtime_slots {
            self.input_handles[slot.position] = std::ptr::null_mut();
        }
        check_call(rc)?;

        let n = usize::try_from(num_outputs).map_err(|_| {
            MxError::InvalidState(format!("engine reported {num_outputs} outputs"))
        })?;
        if n == 0 {
            return Ok(Vec::new());
        }
        if outputs.is_null() || stypes.is_null() {
            return Err(MxError::NullPtr);
        }
        let raw_outputs = unsafe { std::slice::from_raw_parts(outputs, n) }.to_vec();
        let raw_stypes = unsafe { std::slice::from_raw_parts(stypes, n) }.to_vec();

        // Take ownership of every handle before interpreting anything.
        let mut owned = Vec::with_capacity(n);
        for &h in &raw_outputs {
            if let Some(h) = NonNull::new(h) {
                owned.push(self.manager.attach(h, StorageType::Dense));
            }
        }
        if owned.len() != n {
            return Err(MxError::NullPtr);
        }
        for (array, &code) in owned.iter_mut().zip(&raw_stypes) {
            array.set_storage_type(StorageType::from_code(code)?);
        }
        debug!(outputs = n, "invoked cached op");
        Ok(owned)
    }

    /// Like [`invoke`](Self::invoke), matching inputs to runtime slots by name.
    pub fn invoke_named(&mut self, inputs: &[(&str, &NdArray)]) -> Result<Vec<NdArray>> {
        for (i, (name, _)) in inputs.iter().enumerate() {
            if inputs[..i].iter().any(|(other, _)| other == name) {
                return Err(MxError::InvalidArgument(format!("input {name} given twice")));
            }
            if !self.partition.runtime_slots.iter().any(|s| s.name == *name) {
                return Err(MxError::InvalidArgument(format!(
                    "{name} is not a runtime input; expected one of {:?}",
                    self.partition.runtime_names()
                )));
            }
        }
        let ordered = self
            .partition
            .runtime_slots
            .iter()
            .map(|slot| {
                inputs
                    .iter()
                    .find(|(name, _)| *name == slot.name)
                    .map(|(_, array)| *array)
                    .ok_or_else(|| MxError::InvalidArgument(format!("missing input {}", slot.name)))
            })
            .collect::<Result<Vec<_>>>()?;
        self.invoke(&ordered)
    }

    fn release(&mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => check_call(unsafe { sys::MXFreeCachedOp(handle.as_ptr()) }),
            None => Ok(()),
        }
    }

    /// Release the native operator now, reporting any engine failure.
    pub fn free(mut self) -> Result<()> {
        self.release()
    }
}

impl std::fmt::Debug for CachedOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedOp")
            .field("handle", &self.handle)
            .field("partition", &self.partition)
            .finish()
    }
}

impl Drop for CachedOp {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(error = %e, "failed to free cached op");
        }
    }
}
