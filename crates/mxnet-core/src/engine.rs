//! Engine-wide queries.

use libc::c_int;
use mxnet_sys as sys;

use crate::Result;
use crate::ffi::check_call;

/// Engine version as `major * 10000 + minor * 100 + patch`.
pub fn version() -> Result<i32> {
    let mut out: c_int = 0;
    check_call(unsafe { sys::MXGetVersion(&mut out) })?;
    Ok(out)
}

pub fn gpu_count() -> Result<usize> {
    let mut out: c_int = 0;
    check_call(unsafe { sys::MXGetGPUCount(&mut out) })?;
    Ok(out.max(0) as usize)
}

/// Block until all pending engine work has finished.
pub fn wait_all() -> Result<()> {
    check_call(unsafe { sys::MXNDArrayWaitAll() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_at_least_one_point_oh() {
        assert!(version().unwrap() >= 10000);
    }

    #[test]
    fn wait_all_succeeds_when_idle() {
        wait_all().unwrap();
    }
}
