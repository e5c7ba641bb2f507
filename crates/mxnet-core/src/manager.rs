//! Array ownership scopes.

use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use mxnet_sys as sys;
use tracing::debug;

use crate::ffi::check_call;
use crate::ndarray::NdArray;
use crate::types::{Context, DType, Shape, StorageType};
use crate::{MxError, Result};

#[derive(Debug)]
struct ManagerShared {
    context: Context,
    live: AtomicUsize,
}

/// Creates arrays in one context and keeps count of the ones still alive.
///
/// Cloning is cheap; clones share the same context and counter. Every array
/// created or adopted through a manager keeps it alive.
#[derive(Clone, Debug)]
pub struct NdManager {
    shared: Arc<ManagerShared>,
}

impl NdManager {
    pub fn new(context: Context) -> Self {
        Self {
            shared: Arc::new(ManagerShared {
                context,
                live: AtomicUsize::new(0),
            }),
        }
    }

    pub fn cpu() -> Self {
        Self::new(Context::cpu(0))
    }

    pub fn context(&self) -> Context {
        self.shared.context
    }

    /// Arrays attributed to this manager that have not been dropped yet.
    pub fn live_arrays(&self) -> usize {
        self.shared.live.load(Ordering::Acquire)
    }

    /// Allocate a zero-filled array.
    pub fn create(&self, shape: &Shape, dtype: DType) -> Result<NdArray> {
        let dims = shape.to_native()?;
        let ctx = self.context();
        let mut out: sys::NDArrayHandle = std::ptr::null_mut();
        check_call(unsafe {
            sys::MXNDArrayCreateEx(
                dims.as_ptr(),
                dims.len() as sys::mx_uint,
                ctx.device_type.code(),
                ctx.device_id,
                0,
                dtype.code(),
                &mut out,
            )
        })?;
        let handle = NonNull::new(out).ok_or(MxError::NullPtr)?;
        debug!(%shape, %dtype, context = %ctx, "created ndarray");
        Ok(self.attach(handle, StorageType::Dense))
    }

    pub fn from_f32(&self, data: &[f32], shape: &Shape) -> Result<NdArray> {
        if i64::try_from(data.len()).ok() != Some(shape.numel()?) {
            return Err(MxError::ShapeMismatch {
                expected: shape.0.clone(),
                got: vec![data.len() as i64],
            });
        }
        let array = self.create(shape, DType::F32)?;
        array.copy_from_f32(data)?;
        Ok(array)
    }

    pub fn zeros(&self, shape: &Shape) -> Result<NdArray> {
        self.create(shape, DType::F32)
    }

    pub fn ones(&self, shape: &Shape) -> Result<NdArray> {
        let n = usize::try_from(shape.numel()?)
            .map_err(|_| MxError::InvalidArgument(format!("invalid shape {shape}")))?;
        self.from_f32(&vec![1.0; n], shape)
    }

    /// Take ownership of a handle produced by the engine.
    pub(crate) fn attach(&self, handle: NonNull<sys::mx_ndarray_t>, storage: StorageType) -> NdArray {
        self.shared.live.fetch_add(1, Ordering::AcqRel);
        NdArray::from_parts(handle, storage, self.clone())
    }

    pub(crate) fn release(&self) {
        self.shared.live.fetch_sub(1, Ordering::AcqRel);
    }

    /// Return `array` itself when it already lives in this manager's context,
    /// otherwise a copy placed there.
    pub fn ensure_resident(&self, array: &Arc<NdArray>) -> Result<Arc<NdArray>> {
        if array.context()? == self.context() {
            return Ok(Arc::clone(array));
        }
        Ok(Arc::new(array.copy_to(self)?))
    }
}

impl Default for NdManager {
    fn default() -> Self {
        Self::new(Context::default_context())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_count_tracks_drops() {
        let m = NdManager::cpu();
        let a = m.zeros(&Shape::new(vec![2])).unwrap();
        let b = m.ones(&Shape::new(vec![3])).unwrap();
        assert_eq!(m.live_arrays(), 2);
        drop(a);
        assert_eq!(m.live_arrays(), 1);
        assert_eq!(b.to_vec_f32().unwrap(), vec![1.0; 3]);
        drop(b);
        assert_eq!(m.live_arrays(), 0);
    }

    #[test]
    fn from_f32_checks_length() {
        let m = NdManager::cpu();
        let err = m.from_f32(&[1.0, 2.0, 3.0], &Shape::new(vec![2, 2])).unwrap_err();
        assert!(matches!(err, MxError::ShapeMismatch { .. }));
    }

    #[test]
    fn overflowing_shape_is_rejected() {
        let m = NdManager::cpu();
        let huge = Shape::new(vec![4_000_000_000; 3]);
        assert!(matches!(m.from_f32(&[], &huge), Err(MxError::InvalidArgument(_))));
        assert!(matches!(m.ones(&huge), Err(MxError::InvalidArgument(_))));
        assert_eq!(m.live_arrays(), 0);
    }

    #[test]
    fn ensure_resident_shares_or_copies() {
        let home = NdManager::cpu();
        let away = NdManager::new(Context::cpu(1));
        let a = Arc::new(home.from_f32(&[1.0, 2.0], &Shape::new(vec![2])).unwrap());

        let same = home.ensure_resident(&a).unwrap();
        assert!(Arc::ptr_eq(&same, &a));

        let moved = away.ensure_resident(&a).unwrap();
        assert!(!Arc::ptr_eq(&moved, &a));
        assert_eq!(moved.context().unwrap(), Context::cpu(1));
        assert_eq!(moved.to_vec_f32().unwrap(), vec![1.0, 2.0]);
        assert_eq!(away.live_arrays(), 1);
    }

    #[cfg(feature = "native")]
    #[test]
    fn gpu_manager_fails_to_allocate() {
        let m = NdManager::new(Context::gpu(0));
        assert!(matches!(
            m.zeros(&Shape::new(vec![1])),
            Err(MxError::EngineCall(_))
        ));
    }
}
