//! Backend adapters for lattice device memory
//!
//! This crate provides:
//! - **Backend Trait**: the memory contract every accelerator family implements
//! - **Adapters**: CUDA, HIP, OpenCL and DPC++ (SYCL) variants behind [`Adapter`]
//! - **Native Drivers**: the [`NativeDriver`] seam, the host-memory [`HostDriver`]
//!   and, with the `cuda` feature, a `cudarc`-backed driver
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   lattice-core Memory                    │
//! │         (ref-counted handles, slices, bounds checks)     │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!                       ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                 Adapter (Backend trait)                  │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┬─────────────┐
//!         ▼             ▼             ▼             ▼
//!   ┌─────────┐  ┌─────────┐  ┌─────────┐  ┌─────────┐
//!   │  CUDA   │  │   HIP   │  │ OpenCL  │  │  DPC++  │
//!   └────┬────┘  └────┬────┘  └────┬────┘  └────┬────┘
//!        └────────────┴─────┬──────┴────────────┘
//!                           ▼
//!                     NativeDriver
//! ```
//!
//! # Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use lattice_backends::{Adapter, Backend, HostDriver, MallocKind, Mode, QueueId};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let driver = Arc::new(HostDriver::new());
//! let backend = Adapter::new(Mode::OpenCl, driver.clone(), 0);
//!
//! let buffer = backend.allocate(16, MallocKind::Device)?;
//! let data = [1.0f32, 2.0, 3.0, 4.0];
//! backend.copy_from_host(&buffer.ptr, bytemuck::cast_slice(&data), QueueId::DEFAULT, false)?;
//!
//! let mut out = [0.0f32; 4];
//! backend.copy_to_host(bytemuck::cast_slice_mut(&mut out), &buffer.ptr, QueueId::DEFAULT, false)?;
//! assert_eq!(out, data);
//!
//! backend.free(&buffer)?;
//! assert_eq!(driver.live_allocations(), 0);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod backends;
pub mod driver;
pub mod error;

// Re-export public API
pub use backend::{
    Backend, ClMem, DevicePtr, EventId, HostPtr, MallocKind, Mode, NativeArg, NativeBuffer, NativePtr, ParseModeError,
    QueueId,
};
pub use backends::{Adapter, CudaAdapter, DpcppAdapter, HipAdapter, OpenClAdapter};
pub use driver::{cuda_driver, DriverStats, HostDriver, NativeDriver};
pub use error::{BackendError, Result};

#[cfg(feature = "cuda")]
pub use driver::CudarcDriver;
