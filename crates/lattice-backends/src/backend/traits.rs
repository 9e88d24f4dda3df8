//! Backend trait for device memory
//!
//! This trait defines the contract every accelerator family implements on
//! top of its [`NativeDriver`]: allocation, wrapping, zero-copy slicing,
//! kernel-argument conversion, copies, release and queue/event handling.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::types::{DevicePtr, EventId, MallocKind, Mode, NativeArg, NativeBuffer, NativePtr, QueueId};
use crate::driver::{DriverStats, NativeDriver};
use crate::error::Result;

/// Backend adapter for one accelerator family
///
/// ```text
/// ┌──────────────────────────────────────────────┐
/// │                Backend Trait                  │
/// │  allocate / wrap_external / slice / free      │
/// │  copy_from_host / copy_to_host / copy_device  │
/// └───────────────────────┬──────────────────────┘
///         ┌───────────┬───┴───────┬───────────┐
///         ▼           ▼           ▼           ▼
///     ┌───────┐   ┌───────┐   ┌────────┐   ┌───────┐
///     │ CUDA  │   │  HIP  │   │ OpenCL │   │ DPC++ │
///     └───┬───┘   └───┬───┘   └───┬────┘   └───┬───┘
///         └───────────┴─────┬─────┴────────────┘
///                           ▼
///                     NativeDriver
/// ```
///
/// Adapters never validate façade-level ranges; callers hand them in-bounds
/// pointers and byte counts. With `is_async = false` a copy returns only
/// after it has completed. With `is_async = true` completion is ordered on
/// `queue` and observed through [`Backend::tag_queue`]/[`Backend::wait_for`].
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use lattice_backends::{Adapter, Backend, HostDriver, MallocKind, Mode, QueueId};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = Adapter::new(Mode::Cuda, Arc::new(HostDriver::new()), 0);
///
/// let buffer = backend.allocate(64, MallocKind::Device)?;
/// let tail = backend.slice(&buffer.ptr, 32)?;
///
/// backend.copy_from_host(&tail, &[7u8; 32], QueueId::DEFAULT, false)?;
/// let mut out = [0u8; 32];
/// backend.copy_to_host(&mut out, &tail, QueueId::DEFAULT, false)?;
/// assert_eq!(out, [7u8; 32]);
///
/// backend.free(&buffer)?;
/// # Ok(())
/// # }
/// ```
pub trait Backend: Send + Sync + fmt::Debug {
    /// Accelerator family this adapter drives
    fn mode(&self) -> Mode;

    /// Driver the adapter issues native calls through
    fn driver(&self) -> &Arc<dyn NativeDriver>;

    /// Allocate `bytes` bytes of `kind` memory
    fn allocate(&self, bytes: usize, kind: MallocKind) -> Result<NativeBuffer>;

    /// Describe externally owned memory; it is never released by this adapter
    fn wrap_external(&self, ptr: NativePtr, bytes: usize) -> Result<NativeBuffer>;

    /// Pointer `offset` bytes into `base` (pure arithmetic, never a copy)
    fn slice(&self, base: &NativePtr, offset: usize) -> Result<NativePtr> {
        base.offset(offset)
    }

    /// Device address a native pointer resolves to for driver calls
    fn address(&self, ptr: &NativePtr) -> Result<DevicePtr>;

    /// Argument representation for kernel launches
    fn kernel_arg(&self, ptr: &NativePtr) -> NativeArg;

    /// Copy `src` into device memory at `dst`
    fn copy_from_host(&self, dst: &NativePtr, src: &[u8], queue: QueueId, is_async: bool) -> Result<()>;

    /// Copy device memory at `src` into `dst`
    fn copy_to_host(&self, dst: &mut [u8], src: &NativePtr, queue: QueueId, is_async: bool) -> Result<()>;

    /// Copy `bytes` bytes between two locations on this device
    fn copy_device(&self, dst: &NativePtr, src: &NativePtr, bytes: usize, queue: QueueId, is_async: bool)
        -> Result<()>;

    /// Release an owned allocation
    fn free(&self, buffer: &NativeBuffer) -> Result<()>;

    /// Give up ownership of an allocation without releasing it
    fn detach(&self, buffer: &NativeBuffer) {
        tracing::debug!(backend = %self.mode(), ptr = %buffer.ptr, size = buffer.size, "detach");
    }

    fn create_queue(&self) -> Result<QueueId> {
        self.driver().create_queue()
    }

    fn destroy_queue(&self, queue: QueueId) -> Result<()> {
        self.driver().destroy_queue(queue)
    }

    /// Place a completion marker on `queue`
    fn tag_queue(&self, queue: QueueId) -> Result<EventId> {
        self.driver().record_event(queue)
    }

    /// Block until the work before `event` has completed
    fn wait_for(&self, event: EventId) -> Result<()> {
        self.driver().wait_event(event)
    }

    fn time_between(&self, start: EventId, end: EventId) -> Result<Duration> {
        self.driver().elapsed(start, end)
    }

    fn release_tag(&self, event: EventId) -> Result<()> {
        self.driver().destroy_event(event)
    }

    /// Block until everything on `queue` has completed
    fn finish(&self, queue: QueueId) -> Result<()> {
        self.driver().synchronize(queue)
    }

    fn total_memory(&self) -> Result<usize> {
        self.driver().total_memory()
    }

    fn stats(&self) -> DriverStats {
        self.driver().stats()
    }
}
