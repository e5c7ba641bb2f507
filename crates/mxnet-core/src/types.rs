//! Core type definitions: DType, Shape, StorageType, Context.

use std::str::FromStr;

use libc::c_int;
use mxnet_sys as sys;
use tracing::warn;

use crate::{MxError, Result};

/// Element types understood by the engine, with MXNet's type codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F64,
    F16,
    U8,
    I32,
    I8,
    I64,
}

impl DType {
    /// Size in bytes of a single element.
    pub fn size_bytes(self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F64 | DType::I64 => 8,
            DType::F16 => 2,
            DType::U8 | DType::I8 => 1,
        }
    }

    pub fn code(self) -> c_int {
        match self {
            DType::F32 => sys::MX_DTYPE_FLOAT32,
            DType::F64 => sys::MX_DTYPE_FLOAT64,
            DType::F16 => sys::MX_DTYPE_FLOAT16,
            DType::U8 => sys::MX_DTYPE_UINT8,
            DType::I32 => sys::MX_DTYPE_INT32,
            DType::I8 => sys::MX_DTYPE_INT8,
            DType::I64 => sys::MX_DTYPE_INT64,
        }
    }

    pub fn from_code(code: c_int) -> Result<Self> {
        Ok(match code {
            sys::MX_DTYPE_FLOAT32 => DType::F32,
            sys::MX_DTYPE_FLOAT64 => DType::F64,
            sys::MX_DTYPE_FLOAT16 => DType::F16,
            sys::MX_DTYPE_UINT8 => DType::U8,
            sys::MX_DTYPE_INT32 => DType::I32,
            sys::MX_DTYPE_INT8 => DType::I8,
            sys::MX_DTYPE_INT64 => DType::I64,
            other => {
                return Err(MxError::InvalidArgument(format!("unknown dtype code {other}")));
            }
        })
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DType::F32 => write!(f, "float32"),
            DType::F64 => write!(f, "float64"),
            DType::F16 => write!(f, "float16"),
            DType::U8 => write!(f, "uint8"),
            DType::I32 => write!(f, "int32"),
            DType::I8 => write!(f, "int8"),
            DType::I64 => write!(f, "int64"),
        }
    }
}

/// Tensor shape (dimensions).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Shape(pub Vec<i64>);

impl Shape {
    pub fn new(dims: impl Into<Vec<i64>>) -> Self {
        Self(dims.into())
    }

    /// Scalar (rank-0) shape.
    pub fn scalar() -> Self {
        Self(vec![])
    }

    pub fn ndim(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements. Fails if the product overflows `i64`.
    pub fn numel(&self) -> Result<i64> {
        self.0
            .iter()
            .try_fold(1i64, |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| MxError::InvalidArgument(format!("element count of {self} overflows")))
    }

    /// Dimensions as the engine's unsigned shape array.
    pub(crate) fn to_native(&self) -> Result<Vec<sys::mx_uint>> {
        self.0
            .iter()
            .map(|&d| {
                sys::mx_uint::try_from(d)
                    .map_err(|_| MxError::InvalidArgument(format!("invalid dimension {d} in {self}")))
            })
            .collect()
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

/// Storage format tag carried by every array.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum StorageType {
    #[default]
    Dense,
    RowSparse,
    Csr,
}

impl StorageType {
    pub fn code(self) -> c_int {
        match self {
            StorageType::Dense => sys::MX_STORAGE_DEFAULT,
            StorageType::RowSparse => sys::MX_STORAGE_ROW_SPARSE,
            StorageType::Csr => sys::MX_STORAGE_CSR,
        }
    }

    pub fn from_code(code: c_int) -> Result<Self> {
        match code {
            sys::MX_STORAGE_DEFAULT => Ok(StorageType::Dense),
            sys::MX_STORAGE_ROW_SPARSE => Ok(StorageType::RowSparse),
            sys::MX_STORAGE_CSR => Ok(StorageType::Csr),
            other => Err(MxError::InvalidArgument(format!(
                "unknown storage type code {other}"
            ))),
        }
    }

    pub fn is_sparse(self) -> bool {
        self != StorageType::Dense
    }
}

impl std::fmt::Display for StorageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageType::Dense => write!(f, "default"),
            StorageType::RowSparse => write!(f, "row_sparse"),
            StorageType::Csr => write!(f, "csr"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Cpu,
    Gpu,
    CpuPinned,
    CpuShared,
}

impl DeviceType {
    pub fn code(self) -> c_int {
        match self {
            DeviceType::Cpu => sys::MX_DEV_CPU,
            DeviceType::Gpu => sys::MX_DEV_GPU,
            DeviceType::CpuPinned => sys::MX_DEV_CPU_PINNED,
            DeviceType::CpuShared => sys::MX_DEV_CPU_SHARED,
        }
    }

    pub fn from_code(code: c_int) -> Result<Self> {
        match code {
            sys::MX_DEV_CPU => Ok(DeviceType::Cpu),
            sys::MX_DEV_GPU => Ok(DeviceType::Gpu),
            sys::MX_DEV_CPU_PINNED => Ok(DeviceType::CpuPinned),
            sys::MX_DEV_CPU_SHARED => Ok(DeviceType::CpuShared),
            other => Err(MxError::InvalidArgument(format!("unknown device type {other}"))),
        }
    }

    fn name(self) -> &'static str {
        match self {
            DeviceType::Cpu => "cpu",
            DeviceType::Gpu => "gpu",
            DeviceType::CpuPinned => "cpu_pinned",
            DeviceType::CpuShared => "cpu_shared",
        }
    }
}

/// A device plus device id, e.g. `cpu(0)` or `gpu(1)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Context {
    pub device_type: DeviceType,
    pub device_id: i32,
}

impl Context {
    pub fn new(device_type: DeviceType, device_id: i32) -> Self {
        Self {
            device_type,
            device_id,
        }
    }

    pub fn cpu(device_id: i32) -> Self {
        Self::new(DeviceType::Cpu, device_id)
    }

    pub fn gpu(device_id: i32) -> Self {
        Self::new(DeviceType::Gpu, device_id)
    }

    /// Resolve the default context.
    ///
    /// Reads `MXNET_RS_CONTEXT` (`cpu`, `cpu(1)`, `gpu(0)`, ...); unset or
    /// unparsable values fall back to `cpu(0)`.
    pub fn default_context() -> Self {
        match std::env::var("MXNET_RS_CONTEXT") {
            Ok(val) => Self::parse_or_default(&val),
            Err(_) => Self::cpu(0),
        }
    }

    fn parse_or_default(val: &str) -> Self {
        val.parse().unwrap_or_else(|e: MxError| {
            warn!(value = val, error = %e, "ignoring MXNET_RS_CONTEXT; using cpu(0)");
            Self::cpu(0)
        })
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::cpu(0)
    }
}

impl std::fmt::Display for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.device_type.name(), self.device_id)
    }
}

impl FromStr for Context {
    type Err = MxError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_lowercase();
        let (device, id) = match s.split_once('(') {
            Some((device, rest)) => {
                let id = rest
                    .strip_suffix(')')
                    .and_then(|id| id.trim().parse::<i32>().ok())
                    .ok_or_else(|| MxError::InvalidArgument(format!("invalid context {s:?}")))?;
                (device.trim().to_string(), id)
            }
            None => (s.clone(), 0),
        };
        let device_type = match device.as_str() {
            "cpu" => DeviceType::Cpu,
            "gpu" => DeviceType::Gpu,
            "cpu_pinned" => DeviceType::CpuPinned,
            "cpu_shared" => DeviceType::CpuShared,
            _ => return Err(MxError::InvalidArgument(format!("invalid context {s:?}"))),
        };
        if id < 0 {
            return Err(MxError::InvalidArgument(format!("invalid context {s:?}")));
        }
        Ok(Self::new(device_type, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_numel() {
        assert_eq!(Shape::new(vec![2, 3, 4]).numel().unwrap(), 24);
        assert_eq!(Shape::scalar().numel().unwrap(), 1);
        assert_eq!(Shape::new(vec![0, 5]).numel().unwrap(), 0);
    }

    #[test]
    fn test_shape_numel_overflow_is_an_error() {
        let err = Shape::new(vec![4_000_000_000; 3]).numel().unwrap_err();
        assert!(matches!(err, MxError::InvalidArgument(_)));
        assert!(Shape::new(vec![i64::MAX, 2]).numel().is_err());
    }

    #[test]
    fn test_negative_dim_rejected_at_native_boundary() {
        assert!(Shape::new(vec![2, -1]).to_native().is_err());
        assert_eq!(Shape::new(vec![2, 3]).to_native().unwrap(), vec![2, 3]);
    }

    #[test]
    fn test_dtype_codes_roundtrip() {
        for dt in [DType::F32, DType::F64, DType::F16, DType::U8, DType::I32, DType::I8, DType::I64] {
            assert_eq!(DType::from_code(dt.code()).unwrap(), dt);
        }
        assert!(DType::from_code(42).is_err());
    }

    #[test]
    fn test_storage_type_codes() {
        assert_eq!(StorageType::from_code(0).unwrap(), StorageType::Dense);
        assert_eq!(StorageType::from_code(2).unwrap(), StorageType::Csr);
        assert!(StorageType::from_code(1).unwrap().is_sparse());
        assert!(StorageType::from_code(-1).is_err());
    }

    #[test]
    fn test_context_parse_and_display() {
        assert_eq!("cpu".parse::<Context>().unwrap(), Context::cpu(0));
        assert_eq!("GPU(1)".parse::<Context>().unwrap(), Context::gpu(1));
        assert_eq!(
            "cpu_pinned(0)".parse::<Context>().unwrap(),
            Context::new(DeviceType::CpuPinned, 0)
        );
        assert!("tpu(0)".parse::<Context>().is_err());
        assert!("cpu(x)".parse::<Context>().is_err());
        assert_eq!(Context::cpu(2).to_string(), "cpu(2)");
    }

    #[test]
    fn test_bad_context_value_falls_back_to_cpu0() {
        let _ = tracing_subscriber::fmt::try_init();
        assert_eq!(Context::parse_or_default("tpu(3)"), Context::cpu(0));
        assert_eq!(Context::parse_or_default("cpu(2)"), Context::cpu(2));
    }
}
