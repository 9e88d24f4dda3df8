//! CUDA adapter
//!
//! Memory is a `CUdeviceptr`. Slices are interior pointers, kernels receive
//! the pointer value, and blocking copies are `cuMemcpy*Async` followed by
//! an event recorded on the same stream and synchronized on.
//!
//! ```text
//! CudaAdapter
//! ├── NativeDriver   - cuMemAlloc / cuMemcpy*Async / cuEvent*
//! └── Stream         - QueueId chosen by the device's current stream
//! ```

use std::sync::Arc;

use crate::backend::{Backend, DevicePtr, MallocKind, Mode, NativeArg, NativeBuffer, NativePtr, QueueId};
use crate::backends::common::{foreign_pointer, host_alias_for, StreamCopy};
use crate::driver::NativeDriver;
use crate::error::Result;

/// Backend adapter for NVIDIA devices
#[derive(Debug, Clone)]
pub struct CudaAdapter {
    driver: Arc<dyn NativeDriver>,
}

impl CudaAdapter {
    pub fn new(driver: Arc<dyn NativeDriver>) -> Self {
        Self { driver }
    }

    fn copier(&self, queue: QueueId, is_async: bool) -> StreamCopy<'_> {
        StreamCopy {
            driver: self.driver.as_ref(),
            queue,
            is_async,
        }
    }
}

impl Backend for CudaAdapter {
    fn mode(&self) -> Mode {
        Mode::Cuda
    }

    fn driver(&self) -> &Arc<dyn NativeDriver> {
        &self.driver
    }

    fn allocate(&self, bytes: usize, kind: MallocKind) -> Result<NativeBuffer> {
        let ptr = self.driver.malloc(bytes, kind)?;
        tracing::debug!(ptr = %ptr, bytes, ?kind, "cuMemAlloc");
        Ok(NativeBuffer {
            ptr: NativePtr::Device(ptr),
            size: bytes,
            kind,
            wrapped: false,
            host_ptr: host_alias_for(self.driver.as_ref(), ptr, kind)?,
        })
    }

    fn wrap_external(&self, ptr: NativePtr, bytes: usize) -> Result<NativeBuffer> {
        match ptr {
            NativePtr::Device(_) => Ok(NativeBuffer {
                ptr,
                size: bytes,
                kind: MallocKind::Device,
                wrapped: true,
                host_ptr: None,
            }),
            other => Err(foreign_pointer(Mode::Cuda, &other)),
        }
    }

    fn address(&self, ptr: &NativePtr) -> Result<DevicePtr> {
        match ptr {
            NativePtr::Device(addr) => Ok(*addr),
            other => Err(foreign_pointer(Mode::Cuda, other)),
        }
    }

    fn kernel_arg(&self, ptr: &NativePtr) -> NativeArg {
        NativeArg::Pointer(ptr.raw())
    }

    fn copy_from_host(&self, dst: &NativePtr, src: &[u8], queue: QueueId, is_async: bool) -> Result<()> {
        self.copier(queue, is_async).htod(self.address(dst)?, src)
    }

    fn copy_to_host(&self, dst: &mut [u8], src: &NativePtr, queue: QueueId, is_async: bool) -> Result<()> {
        self.copier(queue, is_async).dtoh(dst, self.address(src)?)
    }

    fn copy_device(
        &self,
        dst: &NativePtr,
        src: &NativePtr,
        bytes: usize,
        queue: QueueId,
        is_async: bool,
    ) -> Result<()> {
        self.copier(queue, is_async)
            .dtod(self.address(dst)?, self.address(src)?, bytes)
    }

    fn free(&self, buffer: &NativeBuffer) -> Result<()> {
        if buffer.wrapped {
            return Ok(());
        }
        let ptr = self.address(&buffer.ptr)?;
        tracing::debug!(ptr = %ptr, bytes = buffer.size, "cuMemFree");
        self.driver.free(ptr)
    }
}
