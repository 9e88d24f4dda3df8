//! # lattice-core - Device Memory Handles
//!
//! Reference-counted memory handles over CUDA, HIP, OpenCL and DPC++ devices.
//!
//! ## Architecture
//!
//! ```text
//! Device ──► Adapter (lattice-backends) ──► NativeDriver
//!   │
//!   ├── current Stream ──► StreamTag
//!   │
//!   └── Buffer (one native allocation)
//!          ▲
//!          ├── MemoryView (whole buffer) ◄── Memory, Memory, ...
//!          ├── MemoryView (slice)        ◄── Memory
//!          └── MemoryView (cast)         ◄── Memory
//! ```
//!
//! - **Memory**: the handle applications hold; clones share a view
//! - **Slices and casts**: new views over the same allocation, never a copy
//! - **Ownership**: owned buffers are released once, by `free()` or when the
//!   last view drops; wrapped and detached buffers are never released
//! - **Copies**: validated before any native call, synchronous unless the
//!   `async` property is set, ordered on the device's current stream
//!
//! ## Example
//!
//! ```rust
//! use lattice_core::{dtype, Device, DeviceProperties, MemoryProperties, Mode, ALL_BYTES};
//!
//! # fn main() -> lattice_core::Result<()> {
//! let device = Device::new(DeviceProperties::new(Mode::Cuda));
//! let props = MemoryProperties::default();
//!
//! // 256 floats
//! let a = device.malloc_typed(256, &dtype::FLOAT, None, &props)?;
//! assert_eq!((a.size(), a.length()), (1024, 256));
//!
//! // Elements [100, 150) of the same allocation
//! let window = a.slice(100, 50)?;
//! window.copy_from_slice(&[1.0f32; 50])?;
//!
//! // Overlap a device copy with host work
//! let b = device.malloc(1024, None, &props)?;
//! b.copy_from(&a, ALL_BYTES, 0, 0, &MemoryProperties::asynchronous())?;
//! let tag = device.tag_stream()?;
//! device.wait_for(&tag)?;
//!
//! assert_eq!(b.cast(&dtype::FLOAT)?.slice(100, 1)?.to_vec::<f32>()?, vec![1.0]);
//! # Ok(())
//! # }
//! ```

mod buffer;
pub mod device;
pub mod dtype;
pub mod error;
pub mod memory;
pub mod properties;
pub mod stream;

// Re-export primary types
pub use device::Device;
pub use dtype::{Dtype, HasDtype};
pub use error::{Error, ErrorKind, Result};
pub use memory::{KernelArg, Memory, ALL_BYTES};
pub use properties::{DeviceProperties, MemoryProperties};
pub use stream::{Stream, StreamTag};

pub use lattice_backends::{
    DevicePtr, DriverStats, HostDriver, HostPtr, MallocKind, Mode, NativeArg, NativeDriver, NativePtr, QueueId,
};
