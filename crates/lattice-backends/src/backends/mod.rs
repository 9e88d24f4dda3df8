//! Backend adapter implementations
//!
//! One adapter per accelerator family. [`Adapter`] is the tagged enum a
//! device holds; it is chosen from [`Mode`] once, at device construction.

pub(crate) mod common;
pub mod cuda;
pub mod dpcpp;
pub mod hip;
pub mod opencl;

use std::sync::Arc;

pub use cuda::CudaAdapter;
pub use dpcpp::DpcppAdapter;
pub use hip::HipAdapter;
pub use opencl::OpenClAdapter;

use crate::backend::{Backend, DevicePtr, MallocKind, Mode, NativeArg, NativeBuffer, NativePtr, QueueId};
use crate::driver::NativeDriver;
use crate::error::Result;

/// Backend adapter selected by mode
#[derive(Debug, Clone)]
pub enum Adapter {
    Cuda(CudaAdapter),
    Hip(HipAdapter),
    OpenCl(OpenClAdapter),
    Dpcpp(DpcppAdapter),
}

macro_rules! dispatch {
    ($self:ident, $adapter:ident => $body:expr) => {
        match $self {
            Adapter::Cuda($adapter) => $body,
            Adapter::Hip($adapter) => $body,
            Adapter::OpenCl($adapter) => $body,
            Adapter::Dpcpp($adapter) => $body,
        }
    };
}

impl Adapter {
    /// Build the adapter for `mode` on top of `driver`
    ///
    /// `platform_id` is only meaningful for OpenCL.
    pub fn new(mode: Mode, driver: Arc<dyn NativeDriver>, platform_id: u32) -> Self {
        match mode {
            Mode::Cuda => Adapter::Cuda(CudaAdapter::new(driver)),
            Mode::Hip => Adapter::Hip(HipAdapter::new(driver)),
            Mode::OpenCl => Adapter::OpenCl(OpenClAdapter::new(driver, platform_id)),
            Mode::Dpcpp => Adapter::Dpcpp(DpcppAdapter::new(driver)),
        }
    }
}

impl Backend for Adapter {
    fn mode(&self) -> Mode {
        dispatch!(self, a => a.mode())
    }

    fn driver(&self) -> &Arc<dyn NativeDriver> {
        dispatch!(self, a => a.driver())
    }

    fn allocate(&self, bytes: usize, kind: MallocKind) -> Result<NativeBuffer> {
        dispatch!(self, a => a.allocate(bytes, kind))
    }

    fn wrap_external(&self, ptr: NativePtr, bytes: usize) -> Result<NativeBuffer> {
        dispatch!(self, a => a.wrap_external(ptr, bytes))
    }

    fn slice(&self, base: &NativePtr, offset: usize) -> Result<NativePtr> {
        dispatch!(self, a => a.slice(base, offset))
    }

    fn address(&self, ptr: &NativePtr) -> Result<DevicePtr> {
        dispatch!(self, a => a.address(ptr))
    }

    fn kernel_arg(&self, ptr: &NativePtr) -> NativeArg {
        dispatch!(self, a => a.kernel_arg(ptr))
    }

    fn copy_from_host(&self, dst: &NativePtr, src: &[u8], queue: QueueId, is_async: bool) -> Result<()> {
        dispatch!(self, a => a.copy_from_host(dst, src, queue, is_async))
    }

    fn copy_to_host(&self, dst: &mut [u8], src: &NativePtr, queue: QueueId, is_async: bool) -> Result<()> {
        dispatch!(self, a => a.copy_to_host(dst, src, queue, is_async))
    }

    fn copy_device(
        &self,
        dst: &NativePtr,
        src: &NativePtr,
        bytes: usize,
        queue: QueueId,
        is_async: bool,
    ) -> Result<()> {
        dispatch!(self, a => a.copy_device(dst, src, bytes, queue, is_async))
    }

    fn free(&self, buffer: &NativeBuffer) -> Result<()> {
        dispatch!(self, a => a.free(buffer))
    }

    fn detach(&self, buffer: &NativeBuffer) {
        dispatch!(self, a => a.detach(buffer))
    }
}
