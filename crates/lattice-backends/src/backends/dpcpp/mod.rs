//! DPC++ (SYCL) adapter
//!
//! Memory is a unified shared memory pointer from `sycl::malloc_device` or
//! `sycl::malloc_shared`. Every `queue.memcpy` hands back an event; a
//! blocking copy waits on that event before the event is released.

use std::sync::Arc;

use crate::backend::{Backend, DevicePtr, MallocKind, Mode, NativeArg, NativeBuffer, NativePtr, QueueId};
use crate::backends::common::{foreign_pointer, unsupported_kind};
use crate::driver::NativeDriver;
use crate::error::Result;

/// Backend adapter for SYCL-class devices
#[derive(Debug, Clone)]
pub struct DpcppAdapter {
    driver: Arc<dyn NativeDriver>,
}

impl DpcppAdapter {
    pub fn new(driver: Arc<dyn NativeDriver>) -> Self {
        Self { driver }
    }

    /// Event returned by the memcpy just enqueued on `queue`
    fn memcpy_event(&self, queue: QueueId, is_async: bool) -> Result<()> {
        let event = self.driver.record_event(queue)?;
        let waited = if is_async { Ok(()) } else { self.driver.wait_event(event) };
        self.driver.destroy_event(event)?;
        waited
    }
}

impl Backend for DpcppAdapter {
    fn mode(&self) -> Mode {
        Mode::Dpcpp
    }

    fn driver(&self) -> &Arc<dyn NativeDriver> {
        &self.driver
    }

    fn allocate(&self, bytes: usize, kind: MallocKind) -> Result<NativeBuffer> {
        let call = match kind {
            MallocKind::Device => "malloc_device",
            MallocKind::Managed => "malloc_shared",
            MallocKind::HostMapped => return Err(unsupported_kind(Mode::Dpcpp, kind)),
        };
        let ptr = self.driver.malloc(bytes, kind)?;
        tracing::debug!(ptr = %ptr, bytes, call, "sycl_allocate");
        Ok(NativeBuffer {
            ptr: NativePtr::Usm(ptr),
            size: bytes,
            kind,
            wrapped: false,
            host_ptr: None,
        })
    }

    fn wrap_external(&self, ptr: NativePtr, bytes: usize) -> Result<NativeBuffer> {
        match ptr {
            NativePtr::Usm(_) => Ok(NativeBuffer {
                ptr,
                size: bytes,
                kind: MallocKind::Device,
                wrapped: true,
                host_ptr: None,
            }),
            other => Err(foreign_pointer(Mode::Dpcpp, &other)),
        }
    }

    fn address(&self, ptr: &NativePtr) -> Result<DevicePtr> {
        match ptr {
            NativePtr::Usm(addr) => Ok(*addr),
            other => Err(foreign_pointer(Mode::Dpcpp, other)),
        }
    }

    fn kernel_arg(&self, ptr: &NativePtr) -> NativeArg {
        NativeArg::Pointer(ptr.raw())
    }

    fn copy_from_host(&self, dst: &NativePtr, src: &[u8], queue: QueueId, is_async: bool) -> Result<()> {
        self.driver.memcpy_htod(self.address(dst)?, src, queue)?;
        self.memcpy_event(queue, is_async)
    }

    fn copy_to_host(&self, dst: &mut [u8], src: &NativePtr, queue: QueueId, is_async: bool) -> Result<()> {
        self.driver.memcpy_dtoh(dst, self.address(src)?, queue)?;
        self.memcpy_event(queue, is_async)
    }

    fn copy_device(
        &self,
        dst: &NativePtr,
        src: &NativePtr,
        bytes: usize,
        queue: QueueId,
        is_async: bool,
    ) -> Result<()> {
        self.driver
            .memcpy_dtod(self.address(dst)?, self.address(src)?, bytes, queue)?;
        self.memcpy_event(queue, is_async)
    }

    fn free(&self, buffer: &NativeBuffer) -> Result<()> {
        if buffer.wrapped {
            return Ok(());
        }
        let ptr = self.address(&buffer.ptr)?;
        tracing::debug!(ptr = %ptr, bytes = buffer.size, "sycl_free");
        self.driver.free(ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::HostDriver;

    #[test]
    fn test_every_memcpy_produces_an_event() {
        let driver = Arc::new(HostDriver::new());
        let sycl = DpcppAdapter::new(driver.clone());
        let buffer = sycl.allocate(8, MallocKind::Managed).unwrap();

        sycl.copy_from_host(&buffer.ptr, &[1u8; 8], QueueId::DEFAULT, true).unwrap();
        sycl.copy_from_host(&buffer.ptr, &[2u8; 8], QueueId::DEFAULT, false).unwrap();

        assert_eq!(driver.stats().events, 2);
        assert_eq!(driver.live_events(), 0);
    }

    #[test]
    fn test_host_mapped_memory_is_rejected() {
        let sycl = DpcppAdapter::new(Arc::new(HostDriver::new()));
        assert!(sycl.allocate(8, MallocKind::HostMapped).is_err());
        assert!(sycl.wrap_external(NativePtr::Device(DevicePtr(0x40)), 8).is_err());
    }
}
