//! Helpers shared by the pointer-addressed adapters

use crate::backend::{DevicePtr, HostPtr, MallocKind, Mode, NativePtr, QueueId};
use crate::driver::NativeDriver;
use crate::error::{BackendError, Result};

/// Record a marker on `queue` and block on it (issue-then-wait)
pub(crate) fn wait_on_marker(driver: &dyn NativeDriver, queue: QueueId) -> Result<()> {
    let event = driver.record_event(queue)?;
    let waited = driver.wait_event(event);
    driver.destroy_event(event)?;
    waited
}

/// Stream-ordered copies shared by CUDA and HIP
///
/// Both runtimes enqueue `*MemcpyAsync` on a stream and, for blocking
/// copies, record an event right behind it and synchronize on that event.
pub(crate) struct StreamCopy<'a> {
    pub driver: &'a dyn NativeDriver,
    pub queue: QueueId,
    pub is_async: bool,
}

impl StreamCopy<'_> {
    pub fn htod(&self, dst: DevicePtr, src: &[u8]) -> Result<()> {
        self.driver.memcpy_htod(dst, src, self.queue)?;
        self.complete()
    }

    pub fn dtoh(&self, dst: &mut [u8], src: DevicePtr) -> Result<()> {
        self.driver.memcpy_dtoh(dst, src, self.queue)?;
        self.complete()
    }

    pub fn dtod(&self, dst: DevicePtr, src: DevicePtr, bytes: usize) -> Result<()> {
        self.driver.memcpy_dtod(dst, src, bytes, self.queue)?;
        self.complete()
    }

    fn complete(&self) -> Result<()> {
        if self.is_async {
            Ok(())
        } else {
            wait_on_marker(self.driver, self.queue)
        }
    }
}

/// Host alias of a fresh `HostMapped` allocation
///
/// The allocation is released again when the driver cannot map it.
pub(crate) fn host_alias_for(driver: &dyn NativeDriver, ptr: DevicePtr, kind: MallocKind) -> Result<Option<HostPtr>> {
    if kind != MallocKind::HostMapped {
        return Ok(None);
    }
    match driver.host_alias(ptr) {
        Ok(host) => Ok(Some(host)),
        Err(err) => {
            if let Err(free_err) = driver.free(ptr) {
                tracing::warn!(ptr = %ptr, error = %free_err, "unmapped_allocation_leaked");
            }
            Err(err)
        }
    }
}

/// Error for a native pointer that belongs to another accelerator family
pub(crate) fn foreign_pointer(mode: Mode, ptr: &NativePtr) -> BackendError {
    BackendError::unsupported(format!("{mode} adapter cannot address {ptr}"))
}

/// Error for an allocation kind the family has no native equivalent for
pub(crate) fn unsupported_kind(mode: Mode, kind: MallocKind) -> BackendError {
    BackendError::unsupported(format!("{kind:?} allocations are not available on {mode}"))
}
