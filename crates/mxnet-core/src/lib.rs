//! Safe Rust API over the MXNet engine.
//!
//! `mxnet-core` wraps the raw handles of `mxnet-sys` in owning types
//! (`Symbol`, `NdArray`, `CachedOp`) and provides the cached-operator
//! build/invoke path: graph inputs are split into parameters bound once at
//! build time and runtime inputs supplied on every call.
//!
//! # Engines
//!
//! - `native` feature (default): the pure-Rust reference engine in `mxnet-sys`
//! - `libmxnet` feature: a real `libmxnet` shared library

pub mod block;
pub mod cached_op;
pub mod engine;
mod ffi;
pub mod manager;
pub mod ndarray;
pub mod ops;
pub mod symbol;
pub mod types;

pub use block::{ParameterSet, SymbolBlock};
pub use cached_op::{
    CachedOp, CachedOpBuilder, CachedOpFlags, InputPartition, ParameterPlacement, RuntimeSlot,
};
pub use manager::NdManager;
pub use ndarray::NdArray;
pub use symbol::Symbol;
pub use types::{Context, DType, DeviceType, Shape, StorageType};

pub type Result<T> = std::result::Result<T, MxError>;

#[derive(thiserror::Error, Debug)]
pub enum MxError {
    /// A native call returned a non-zero status; carries `MXGetLastError()`.
    #[error("MXNet engine call failed: {0}")]
    EngineCall(String),

    #[error("engine returned null pointer")]
    NullPtr,

    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<i64>, got: Vec<i64> },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
