//! HIP adapter
//!
//! HIP mirrors the CUDA model: `hipDeviceptr_t` pointers, stream-ordered
//! `hipMemcpy*Async` and `hipEventRecord` markers for blocking copies.
//! Host-mapped memory (`hipHostMalloc` plus its device alias) is addressed
//! through the same pointer type.

use std::sync::Arc;

use crate::backend::{Backend, DevicePtr, MallocKind, Mode, NativeArg, NativeBuffer, NativePtr, QueueId};
use crate::backends::common::{foreign_pointer, host_alias_for, StreamCopy};
use crate::driver::NativeDriver;
use crate::error::Result;

/// Backend adapter for AMD devices
#[derive(Debug, Clone)]
pub struct HipAdapter {
    driver: Arc<dyn NativeDriver>,
}

impl HipAdapter {
    pub fn new(driver: Arc<dyn NativeDriver>) -> Self {
        Self { driver }
    }
}

impl Backend for HipAdapter {
    fn mode(&self) -> Mode {
        Mode::Hip
    }

    fn driver(&self) -> &Arc<dyn NativeDriver> {
        &self.driver
    }

    fn allocate(&self, bytes: usize, kind: MallocKind) -> Result<NativeBuffer> {
        let ptr = self.driver.malloc(bytes, kind)?;
        let call = match kind {
            MallocKind::Device => "hipMalloc",
            MallocKind::Managed => "hipMallocManaged",
            MallocKind::HostMapped => "hipHostMalloc",
        };
        tracing::debug!(ptr = %ptr, bytes, call, "hip_allocate");
        Ok(NativeBuffer {
            ptr: NativePtr::Device(ptr),
            size: bytes,
            kind,
            wrapped: false,
            host_ptr: host_alias_for(self.driver.as_ref(), ptr, kind)?,
        })
    }

    fn wrap_external(&self, ptr: NativePtr, bytes: usize) -> Result<NativeBuffer> {
        let NativePtr::Device(_) = ptr else {
            return Err(foreign_pointer(Mode::Hip, &ptr));
        };
        Ok(NativeBuffer {
            ptr,
            size: bytes,
            kind: MallocKind::Device,
            wrapped: true,
            host_ptr: None,
        })
    }

    fn address(&self, ptr: &NativePtr) -> Result<DevicePtr> {
        match ptr {
            NativePtr::Device(addr) => Ok(*addr),
            other => Err(foreign_pointer(Mode::Hip, other)),
        }
    }

    fn kernel_arg(&self, ptr: &NativePtr) -> NativeArg {
        NativeArg::Pointer(ptr.raw())
    }

    fn copy_from_host(&self, dst: &NativePtr, src: &[u8], queue: QueueId, is_async: bool) -> Result<()> {
        let dst = self.address(dst)?;
        StreamCopy {
            driver: self.driver.as_ref(),
            queue,
            is_async,
        }
        .htod(dst, src)
    }

    fn copy_to_host(&self, dst: &mut [u8], src: &NativePtr, queue: QueueId, is_async: bool) -> Result<()> {
        let src = self.address(src)?;
        StreamCopy {
            driver: self.driver.as_ref(),
            queue,
            is_async,
        }
        .dtoh(dst, src)
    }

    fn copy_device(
        &self,
        dst: &NativePtr,
        src: &NativePtr,
        bytes: usize,
        queue: QueueId,
        is_async: bool,
    ) -> Result<()> {
        let (dst, src) = (self.address(dst)?, self.address(src)?);
        StreamCopy {
            driver: self.driver.as_ref(),
            queue,
            is_async,
        }
        .dtod(dst, src, bytes)
    }

    fn free(&self, buffer: &NativeBuffer) -> Result<()> {
        if buffer.wrapped {
            return Ok(());
        }
        let ptr = self.address(&buffer.ptr)?;
        tracing::debug!(ptr = %ptr, bytes = buffer.size, "hipFree");
        self.driver.free(ptr)
    }
}
