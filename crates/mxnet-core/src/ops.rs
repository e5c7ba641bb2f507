//! Registry of the operators the engine provides.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use libc::c_char;
use mxnet_sys as sys;
use tracing::debug;

use crate::ffi::{c_string, check_call, string_array, to_cstring};
use crate::{MxError, Result};

const OP_PREFIXES: [&str; 5] = ["_contrib_", "_linalg_", "_sparse_", "_image_", "_random_"];

/// Drop the namespace prefix the engine uses for grouped operators.
pub fn strip_op_prefix(name: &str) -> &str {
    OP_PREFIXES
        .iter()
        .find_map(|p| name.strip_prefix(p))
        .unwrap_or(name)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpArgument {
    pub name: String,
    pub type_info: String,
    pub description: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpInfo {
    /// Name as registered in the engine, prefix included.
    pub name: String,
    pub description: String,
    pub arguments: Vec<OpArgument>,
    pub key_var_num_args: String,
    pub return_type: String,
}

/// Operators keyed by their prefix-stripped name.
#[derive(Debug)]
pub struct OpRegistry {
    ops: BTreeMap<String, OpInfo>,
}

static REGISTRY: OnceLock<OpRegistry> = OnceLock::new();

/// The process-wide registry, loaded from the engine on first use.
pub fn registry() -> Result<&'static OpRegistry> {
    if let Some(reg) = REGISTRY.get() {
        return Ok(reg);
    }
    let loaded = OpRegistry::load()?;
    Ok(REGISTRY.get_or_init(|| loaded))
}

impl OpRegistry {
    fn load() -> Result<Self> {
        let mut size: sys::mx_uint = 0;
        let mut array: *mut *const c_char = std::ptr::null_mut();
        check_call(unsafe { sys::MXListAllOpNames(&mut size, &mut array) })?;
        let names = unsafe { string_array(size, array) };

        let mut ops = BTreeMap::new();
        for name in names {
            let info = op_info(&name)?;
            let key = strip_op_prefix(&name).to_string();
            // An unprefixed registration wins over a prefixed alias.
            if info.name == key {
                ops.insert(key, info);
            } else {
                ops.entry(key).or_insert(info);
            }
        }
        debug!(count = ops.len(), "loaded operator registry");
        Ok(Self { ops })
    }

    pub fn get(&self, name: &str) -> Result<&OpInfo> {
        self.ops
            .get(strip_op_prefix(name))
            .ok_or_else(|| MxError::InvalidArgument(format!("unknown operator: {name}")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ops.contains_key(strip_op_prefix(name))
    }

    /// Stripped names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.ops.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &OpInfo> {
        self.ops.values()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

fn op_info(name: &str) -> Result<OpInfo> {
    let c_name = to_cstring(name)?;
    let mut handle: sys::OpHandle = std::ptr::null_mut();
    check_call(unsafe { sys::NNGetOpHandle(c_name.as_ptr(), &mut handle) })?;
    if handle.is_null() {
        return Err(MxError::NullPtr);
    }

    let mut real_name: *const c_char = std::ptr::null();
    let mut description: *const c_char = std::ptr::null();
    let mut num_args: sys::mx_uint = 0;
    let mut arg_names: *mut *const c_char = std::ptr::null_mut();
    let mut arg_types: *mut *const c_char = std::ptr::null_mut();
    let mut arg_descs: *mut *const c_char = std::ptr::null_mut();
    let mut key_var: *const c_char = std::ptr::null();
    let mut return_type: *const c_char = std::ptr::null();
    check_call(unsafe {
        sys::MXSymbolGetAtomicSymbolInfo(
            handle,
            &mut real_name,
            &mut description,
            &mut num_args,
            &mut arg_names,
            &mut arg_types,
            &mut arg_descs,
            &mut key_var,
            &mut return_type,
        )
    })?;

    let (names, types, descs) = unsafe {
        (
            string_array(num_args, arg_names),
            string_array(num_args, arg_types),
            string_array(num_args, arg_descs),
        )
    };
    let arguments = names
        .into_iter()
        .zip(types)
        .zip(descs)
        .map(|((name, type_info), description)| OpArgument {
            name,
            type_info,
            description,
        })
        .collect();
    Ok(OpInfo {
        name: name.to_string(),
        description: unsafe { c_string(description) },
        arguments,
        key_var_num_args: unsafe { c_string(key_var) },
        return_type: unsafe { c_string(return_type) },
    })
}
