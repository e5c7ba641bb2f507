//! Host-backed NDArrays.

use libc::{c_int, c_void, size_t};
use parking_lot::RwLock;

use super::ops::Value;
use super::{EngineError, EngineResult, api_call, box_handle, free_handle, out_ptr, ref_handle};
use crate::{
    MX_DEV_CPU, MX_DEV_CPU_PINNED, MX_DEV_CPU_SHARED, MX_DEV_GPU, MX_DTYPE_FLOAT32,
    MX_DTYPE_INT64, MX_STORAGE_DEFAULT, NDArrayHandle, mx_uint,
};

pub(crate) type DeviceContext = (c_int, c_int);

pub(crate) struct NdArrayData {
    shape: Vec<usize>,
    shape_c: Vec<c_int>,
    dtype: c_int,
    context: DeviceContext,
    stype: c_int,
    data: RwLock<Vec<f32>>,
}

fn check_context((dev_type, dev_id): DeviceContext) -> EngineResult<()> {
    match dev_type {
        MX_DEV_CPU | MX_DEV_CPU_PINNED | MX_DEV_CPU_SHARED if dev_id >= 0 => Ok(()),
        MX_DEV_CPU | MX_DEV_CPU_PINNED | MX_DEV_CPU_SHARED => Err(EngineError::InvalidArgument(
            format!("invalid device id {dev_id}"),
        )),
        MX_DEV_GPU => Err(EngineError::InvalidArgument(format!(
            "GPU context gpu({dev_id}) requested but no GPU is available"
        ))),
        other => Err(EngineError::InvalidArgument(format!(
            "unknown device type {other}"
        ))),
    }
}

/// Element count of `shape`, or an error if it does not fit in `usize`.
pub(crate) fn checked_numel(shape: &[usize]) -> EngineResult<usize> {
    shape
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| EngineError::Shape(format!("element count of {shape:?} overflows")))
}

impl NdArrayData {
    pub fn new(
        shape: Vec<usize>,
        dtype: c_int,
        context: DeviceContext,
        data: Vec<f32>,
    ) -> EngineResult<Self> {
        Self::with_storage(shape, dtype, context, MX_STORAGE_DEFAULT, data)
    }

    fn with_storage(
        shape: Vec<usize>,
        dtype: c_int,
        context: DeviceContext,
        stype: c_int,
        data: Vec<f32>,
    ) -> EngineResult<Self> {
        check_context(context)?;
        if !(MX_DTYPE_FLOAT32..=MX_DTYPE_INT64).contains(&dtype) {
            return Err(EngineError::InvalidArgument(format!("unknown dtype code {dtype}")));
        }
        let numel = checked_numel(&shape)?;
        if data.len() != numel {
            return Err(EngineError::Shape(format!(
                "{} values for shape {shape:?}",
                data.len()
            )));
        }
        let shape_c = shape
            .iter()
            .map(|&d| {
                c_int::try_from(d).map_err(|_| {
                    EngineError::InvalidArgument(format!("dimension {d} does not fit in int"))
                })
            })
            .collect::<EngineResult<Vec<_>>>()?;
        Ok(Self {
            shape,
            shape_c,
            dtype,
            context,
            stype,
            data: RwLock::new(data),
        })
    }

    pub fn from_value(value: Value, context: DeviceContext) -> EngineResult<Self> {
        Self::with_storage(value.shape, MX_DTYPE_FLOAT32, context, value.stype, value.data)
    }

    pub fn to_value(&self) -> Value {
        Value {
            shape: self.shape.clone(),
            data: self.data.read().clone(),
            stype: self.stype,
        }
    }

    pub fn context(&self) -> DeviceContext {
        self.context
    }

    fn numel(&self) -> usize {
        self.data.read().len()
    }

    fn check_host_copy(&self, size: size_t) -> EngineResult<()> {
        if self.dtype != MX_DTYPE_FLOAT32 {
            return Err(EngineError::InvalidArgument(format!(
                "host copies support float32 only, array has dtype code {}",
                self.dtype
            )));
        }
        if size != self.numel() {
            return Err(EngineError::Shape(format!(
                "array holds {} elements, host buffer has {size}",
                self.numel()
            )));
        }
        Ok(())
    }
}

unsafe fn array<'a>(handle: NDArrayHandle) -> EngineResult<&'a NdArrayData> {
    unsafe { ref_handle(handle, "handle") }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn MXNDArrayCreateEx(
    shape: *const mx_uint,
    ndim: mx_uint,
    dev_type: c_int,
    dev_id: c_int,
    _delay_alloc: c_int,
    dtype: c_int,
    out: *mut NDArrayHandle,
) -> c_int {
    api_call(|| {
        let out = unsafe { out_ptr(out, "out") }?;
        let dims: Vec<usize> = if ndim == 0 {
            Vec::new()
        } else if shape.is_null() {
            return Err(EngineError::NullArgument("shape"));
        } else {
            unsafe { std::slice::from_raw_parts(shape, ndim as usize) }
                .iter()
                .map(|&d| d as usize)
                .collect()
        };
        let numel = checked_numel(&dims)?;
        *out = box_handle(NdArrayData::new(
            dims,
            dtype,
            (dev_type, dev_id),
            vec![0.0; numel],
        )?);
        Ok(())
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn MXNDArrayFree(handle: NDArrayHandle) -> c_int {
    api_call(|| {
        unsafe { free_handle::<NdArrayData, _>(handle) };
        Ok(())
    })
}

/// `size` counts elements, not bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn MXNDArraySyncCopyFromCPU(
    handle: NDArrayHandle,
    data: *const c_void,
    size: size_t,
) -> c_int {
    api_call(|| {
        let arr = unsafe { array(handle) }?;
        arr.check_host_copy(size)?;
        if size == 0 {
            return Ok(());
        }
        if data.is_null() {
            return Err(EngineError::NullArgument("data"));
        }
        let src = unsafe { std::slice::from_raw_parts(data.cast::<f32>(), size) };
        arr.data.write().copy_from_slice(src);
        Ok(())
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn MXNDArraySyncCopyToCPU(
    handle: NDArrayHandle,
    data: *mut c_void,
    size: size_t,
) -> c_int {
    api_call(|| {
        let arr = unsafe { array(handle) }?;
        arr.check_host_copy(size)?;
        if size == 0 {
            return Ok(());
        }
        if data.is_null() {
            return Err(EngineError::NullArgument("data"));
        }
        let dst = unsafe { std::slice::from_raw_parts_mut(data.cast::<f32>(), size) };
        dst.copy_from_slice(&arr.data.read());
        Ok(())
    })
}

/// Copies the whole of `handle_src` into `handle_dst`; only `i = -1` is supported.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn MXNDArraySyncCopyFromNDArray(
    handle_dst: NDArrayHandle,
    handle_src: NDArrayHandle,
    i: c_int,
) -> c_int {
    api_call(|| {
        let dst = unsafe { array(handle_dst) }?;
        let src = unsafe { array(handle_src) }?;
        if i != -1 {
            return Err(EngineError::InvalidArgument(format!(
                "copying auxiliary data (i = {i}) is not supported"
            )));
        }
        if dst.shape != src.shape || dst.dtype != src.dtype {
            return Err(EngineError::Shape(format!(
                "cannot copy {:?} (dtype {}) into {:?} (dtype {})",
                src.shape, src.dtype, dst.shape, dst.dtype
            )));
        }
        if std::ptr::eq(dst, src) {
            return Ok(());
        }
        let values = src.data.read().clone();
        *dst.data.write() = values;
        Ok(())
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn MXNDArrayWaitToRead(handle: NDArrayHandle) -> c_int {
    api_call(|| {
        unsafe { array(handle) }?;
        Ok(())
    })
}

/// The shape buffer lives as long as the array.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn MXNDArrayGetShapeEx(
    handle: NDArrayHandle,
    out_dim: *mut c_int,
    out_pdata: *mut *const c_int,
) -> c_int {
    api_call(|| {
        let arr = unsafe { array(handle) }?;
        let dim = unsafe { out_ptr(out_dim, "out_dim") }?;
        let pdata = unsafe { out_ptr(out_pdata, "out_pdata") }?;
        *dim = arr.shape_c.len() as c_int;
        *pdata = arr.shape_c.as_ptr();
        Ok(())
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn MXNDArrayGetDType(handle: NDArrayHandle, out_dtype: *mut c_int) -> c_int {
    api_call(|| {
        let arr = unsafe { array(handle) }?;
        *unsafe { out_ptr(out_dtype, "out_dtype") }? = arr.dtype;
        Ok(())
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn MXNDArrayGetContext(
    handle: NDArrayHandle,
    out_dev_type: *mut c_int,
    out_dev_id: *mut c_int,
) -> c_int {
    api_call(|| {
        let arr = unsafe { array(handle) }?;
        let dev_type = unsafe { out_ptr(out_dev_type, "out_dev_type") }?;
        let dev_id = unsafe { out_ptr(out_dev_id, "out_dev_id") }?;
        (*dev_type, *dev_id) = arr.context;
        Ok(())
    })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn MXNDArrayGetStorageType(
    handle: NDArrayHandle,
    out_storage_type: *mut c_int,
) -> c_int {
    api_call(|| {
        let arr = unsafe { array(handle) }?;
        *unsafe { out_ptr(out_storage_type, "out_storage_type") }? = arr.stype;
        Ok(())
    })
}
