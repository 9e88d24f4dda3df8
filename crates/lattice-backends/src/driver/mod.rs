//! Native driver seam
//!
//! Adapters never talk to a vendor runtime directly. They go through a
//! [`NativeDriver`], which exposes the memory, queue and event calls that
//! CUDA, HIP, OpenCL and SYCL runtimes all share. [`HostDriver`] emulates a
//! device in host memory; `CudarcDriver` (feature `cuda`) binds the CUDA
//! driver API.

mod host;

#[cfg(feature = "cuda")]
mod cuda;

pub use host::HostDriver;

#[cfg(feature = "cuda")]
pub use cuda::CudarcDriver;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::backend::{DevicePtr, EventId, HostPtr, MallocKind, QueueId};
use crate::error::{BackendError, Result};

/// Counters of native calls issued through a driver
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DriverStats {
    pub mallocs: u64,
    pub frees: u64,
    /// Host-to-device copies
    pub htod: u64,
    /// Device-to-host copies
    pub dtoh: u64,
    /// Device-to-device copies
    pub dtod: u64,
    /// Events recorded
    pub events: u64,
}

/// Raw device memory, queue and event operations
///
/// Copies are enqueued on `queue` and ordered FIFO with everything else on
/// that queue. Copies that borrow host memory complete before returning.
pub trait NativeDriver: Send + Sync + fmt::Debug {
    /// Short backend label used in logs and errors
    fn name(&self) -> &'static str;

    fn malloc(&self, bytes: usize, kind: MallocKind) -> Result<DevicePtr>;

    /// Release an allocation by its base address
    fn free(&self, ptr: DevicePtr) -> Result<()>;

    /// Host address of an allocation made with [`MallocKind::HostMapped`]
    fn host_alias(&self, ptr: DevicePtr) -> Result<HostPtr> {
        Err(BackendError::unsupported(format!(
            "{} driver cannot map {ptr} into host memory",
            self.name()
        )))
    }

    fn memcpy_htod(&self, dst: DevicePtr, src: &[u8], queue: QueueId) -> Result<()>;

    fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr, queue: QueueId) -> Result<()>;

    fn memcpy_dtod(&self, dst: DevicePtr, src: DevicePtr, bytes: usize, queue: QueueId) -> Result<()>;

    fn create_queue(&self) -> Result<QueueId>;

    fn destroy_queue(&self, queue: QueueId) -> Result<()>;

    /// Block until all work on `queue` has completed
    fn synchronize(&self, queue: QueueId) -> Result<()>;

    /// Place a completion marker after the work currently on `queue`
    fn record_event(&self, queue: QueueId) -> Result<EventId>;

    /// Block until the work preceding `event` has completed
    fn wait_event(&self, event: EventId) -> Result<()>;

    /// Time between two completed events
    fn elapsed(&self, start: EventId, end: EventId) -> Result<Duration>;

    fn destroy_event(&self, event: EventId) -> Result<()>;

    /// Device memory capacity in bytes
    fn total_memory(&self) -> Result<usize>;

    fn stats(&self) -> DriverStats;
}

/// Open the CUDA driver for device `ordinal`
#[cfg(feature = "cuda")]
pub fn cuda_driver(ordinal: usize) -> Result<Arc<dyn NativeDriver>> {
    Ok(Arc::new(CudarcDriver::new(ordinal)?))
}

/// Open the CUDA driver for device `ordinal`
#[cfg(not(feature = "cuda"))]
pub fn cuda_driver(ordinal: usize) -> Result<Arc<dyn NativeDriver>> {
    Err(BackendError::unsupported(format!(
        "CUDA device {ordinal} requested but lattice-backends was built without the `cuda` feature"
    )))
}
