//! Owned NDArray handles.

use std::ptr::NonNull;

use libc::c_int;
use mxnet_sys as sys;
use tracing::warn;

use crate::ffi::check_call;
use crate::manager::NdManager;
use crate::types::{Context, DType, DeviceType, Shape, StorageType};
use crate::{MxError, Result};

/// An engine array owned by exactly one value; dropping it frees the handle.
pub struct NdArray {
    handle: NonNull<sys::mx_ndarray_t>,
    storage: StorageType,
    manager: NdManager,
}

// SAFETY: the engine synchronizes access to array contents internally, and
// the handle is only freed by the single owning NdArray.
unsafe impl Send for NdArray {}
unsafe impl Sync for NdArray {}

impl NdArray {
    pub(crate) fn from_parts(
        handle: NonNull<sys::mx_ndarray_t>,
        storage: StorageType,
        manager: NdManager,
    ) -> Self {
        Self {
            handle,
            storage,
            manager,
        }
    }

    /// Raw handle for passing to the engine. Stays owned by `self`.
    pub fn handle(&self) -> sys::NDArrayHandle {
        self.handle.as_ptr()
    }

    /// The manager this array is attributed to.
    pub fn manager(&self) -> &NdManager {
        &self.manager
    }

    /// Storage format recorded when the array was produced.
    pub fn storage_type(&self) -> StorageType {
        self.storage
    }

    pub(crate) fn set_storage_type(&mut self, storage: StorageType) {
        self.storage = storage;
    }

    pub fn shape(&self) -> Result<Shape> {
        let mut ndim: c_int = 0;
        let mut pdata: *const c_int = std::ptr::null();
        check_call(unsafe { sys::MXNDArrayGetShapeEx(self.handle(), &mut ndim, &mut pdata) })?;
        if ndim <= 0 {
            return Ok(Shape::scalar());
        }
        if pdata.is_null() {
            return Err(MxError::NullPtr);
        }
        let dims = unsafe { std::slice::from_raw_parts(pdata, ndim as usize) };
        Ok(Shape::new(dims.iter().map(|&d| d as i64).collect::<Vec<_>>()))
    }

    pub fn dtype(&self) -> Result<DType> {
        let mut code: c_int = -1;
        check_call(unsafe { sys::MXNDArrayGetDType(self.handle(), &mut code) })?;
        DType::from_code(code)
    }

    pub fn context(&self) -> Result<Context> {
        let (mut dev_type, mut dev_id): (c_int, c_int) = (0, 0);
        check_call(unsafe { sys::MXNDArrayGetContext(self.handle(), &mut dev_type, &mut dev_id) })?;
        Ok(Context::new(DeviceType::from_code(dev_type)?, dev_id))
    }

    /// Storage format as currently reported by the engine.
    pub fn native_storage_type(&self) -> Result<StorageType> {
        let mut code: c_int = -1;
        check_call(unsafe { sys::MXNDArrayGetStorageType(self.handle(), &mut code) })?;
        StorageType::from_code(code)
    }

    pub fn wait_to_read(&self) -> Result<()> {
        check_call(unsafe { sys::MXNDArrayWaitToRead(self.handle()) })
    }

    fn numel(&self) -> Result<usize> {
        let n = self.shape()?.numel()?;
        usize::try_from(n).map_err(|_| MxError::InvalidState(format!("negative element count {n}")))
    }

    fn require_f32(&self) -> Result<()> {
        match self.dtype()? {
            DType::F32 => Ok(()),
            other => Err(MxError::InvalidArgument(format!(
                "host copies need a float32 array, got {other}"
            ))),
        }
    }

    pub fn to_vec_f32(&self) -> Result<Vec<f32>> {
        self.require_f32()?;
        self.wait_to_read()?;
        let mut out = vec![0.0f32; self.numel()?];
        check_call(unsafe {
            sys::MXNDArraySyncCopyToCPU(self.handle(), out.as_mut_ptr().cast(), out.len())
        })?;
        Ok(out)
    }

    pub fn copy_from_f32(&self, data: &[f32]) -> Result<()> {
        self.require_f32()?;
        let n = self.numel()?;
        if data.len() != n {
            return Err(MxError::ShapeMismatch {
                expected: self.shape()?.0,
                got: vec![data.len() as i64],
            });
        }
        check_call(unsafe {
            sys::MXNDArraySyncCopyFromCPU(self.handle(), data.as_ptr().cast(), data.len())
        })
    }

    /// Copy into a new array owned by `manager`, in its context.
    pub fn copy_to(&self, manager: &NdManager) -> Result<NdArray> {
        let dst = manager.create(&self.shape()?, self.dtype()?)?;
        check_call(unsafe { sys::MXNDArraySyncCopyFromNDArray(dst.handle(), self.handle(), -1) })?;
        Ok(dst)
    }
}

impl std::fmt::Debug for NdArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NdArray")
            .field("handle", &self.handle)
            .field("storage", &self.storage)
            .finish()
    }
}

impl Drop for NdArray {
    fn drop(&mut self) {
        let rc = unsafe { sys::MXNDArrayFree(self.handle()) };
        if let Err(e) = check_call(rc) {
            warn!(error = %e, "failed to free ndarray");
        }
        self.manager.release();
    }
}
