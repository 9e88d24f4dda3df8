//! OpenCL adapter
//!
//! Memory is a `cl_mem` buffer. A slice keeps the memory object and moves
//! its origin, the way a sub-buffer does, so kernels receive the object and
//! the origin separately. Host transfers use the blocking flag of
//! `clEnqueueWriteBuffer`/`clEnqueueReadBuffer`; device copies have no such
//! flag and wait on a marker event instead.

use std::sync::Arc;

use crate::backend::{Backend, ClMem, DevicePtr, MallocKind, Mode, NativeArg, NativeBuffer, NativePtr, QueueId};
use crate::backends::common::{foreign_pointer, unsupported_kind, wait_on_marker};
use crate::driver::NativeDriver;
use crate::error::Result;

/// Backend adapter for OpenCL devices
#[derive(Debug, Clone)]
pub struct OpenClAdapter {
    driver: Arc<dyn NativeDriver>,
    platform_id: u32,
}

impl OpenClAdapter {
    pub fn new(driver: Arc<dyn NativeDriver>, platform_id: u32) -> Self {
        Self { driver, platform_id }
    }

    /// Blocking read/write semantics: the call returns once the queue drains
    fn block_if(&self, queue: QueueId, is_async: bool) -> Result<()> {
        if is_async {
            Ok(())
        } else {
            self.driver.synchronize(queue)
        }
    }
}

impl Backend for OpenClAdapter {
    fn mode(&self) -> Mode {
        Mode::OpenCl
    }

    fn driver(&self) -> &Arc<dyn NativeDriver> {
        &self.driver
    }

    fn allocate(&self, bytes: usize, kind: MallocKind) -> Result<NativeBuffer> {
        if kind == MallocKind::Managed {
            return Err(unsupported_kind(Mode::OpenCl, kind));
        }
        let base = self.driver.malloc(bytes, kind)?;
        let mem = ClMem(base.addr());
        tracing::debug!(
            mem = mem.0,
            bytes,
            alloc_host_ptr = kind == MallocKind::HostMapped,
            platform = self.platform_id,
            "clCreateBuffer"
        );
        Ok(NativeBuffer {
            ptr: NativePtr::MemObject { mem, origin: 0 },
            size: bytes,
            kind,
            wrapped: false,
            host_ptr: None,
        })
    }

    fn wrap_external(&self, ptr: NativePtr, bytes: usize) -> Result<NativeBuffer> {
        if !matches!(ptr, NativePtr::MemObject { .. }) {
            return Err(foreign_pointer(Mode::OpenCl, &ptr));
        }
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
            NativePtr::MemObject { mem, origin } => DevicePtr(mem.0).offset(*origin),
            other => Err(foreign_pointer(Mode::OpenCl, other)),
        }
    }

    fn kernel_arg(&self, ptr: &NativePtr) -> NativeArg {
        match *ptr {
            NativePtr::MemObject { mem, origin } => NativeArg::MemObject { mem, origin },
            other => NativeArg::Pointer(other.raw()),
        }
    }

    fn copy_from_host(&self, dst: &NativePtr, src: &[u8], queue: QueueId, is_async: bool) -> Result<()> {
        self.driver.memcpy_htod(self.address(dst)?, src, queue)?;
        self.block_if(queue, is_async)
    }

    fn copy_to_host(&self, dst: &mut [u8], src: &NativePtr, queue: QueueId, is_async: bool) -> Result<()> {
        self.driver.memcpy_dtoh(dst, self.address(src)?, queue)?;
        self.block_if(queue, is_async)
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
        if is_async {
            Ok(())
        } else {
            wait_on_marker(self.driver.as_ref(), queue)
        }
    }

    fn free(&self, buffer: &NativeBuffer) -> Result<()> {
        if buffer.wrapped {
            return Ok(());
        }
        let NativePtr::MemObject { mem, .. } = buffer.ptr else {
            return Err(foreign_pointer(Mode::OpenCl, &buffer.ptr));
        };
        tracing::debug!(mem = mem.0, bytes = buffer.size, "clReleaseMemObject");
        self.driver.free(DevicePtr(mem.0))
    }
}
