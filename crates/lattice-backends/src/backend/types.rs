//! Native descriptor types shared by drivers and adapters

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{BackendError, Result};

/// Address in a device's address space
///
/// Interior pointers are valid: `ptr.offset(n)` addresses byte `n` of the
/// allocation `ptr` points into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    pub const NULL: DevicePtr = DevicePtr(0);

    /// Pointer `bytes` past this one
    ///
    /// Fails with [`BackendError::AddressOverflow`] when the result would
    /// leave the 64-bit address space.
    pub fn offset(self, bytes: usize) -> Result<Self> {
        (bytes as u64)
            .checked_add(self.0)
            .map(DevicePtr)
            .ok_or(BackendError::AddressOverflow { addr: self.0, bytes })
    }

    pub const fn addr(self) -> u64 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Host address of pinned memory that is mapped into a device's address space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostPtr(pub u64);

impl HostPtr {
    /// Host address `bytes` past this one
    pub fn offset(self, bytes: usize) -> Result<Self> {
        (bytes as u64)
            .checked_add(self.0)
            .map(HostPtr)
            .ok_or(BackendError::AddressOverflow { addr: self.0, bytes })
    }

    pub const fn addr(self) -> u64 {
        self.0
    }

    pub fn as_ptr(self) -> *const u8 {
        self.0 as usize as *const u8
    }
}

impl fmt::Display for HostPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host:{:#x}", self.0)
    }
}

/// Handle to a native command queue (CUDA/HIP stream, OpenCL command queue, SYCL queue)
///
/// `QueueId::DEFAULT` is the queue every driver provides without creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(pub u64);

impl QueueId {
    pub const DEFAULT: QueueId = QueueId(0);

    pub const fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "queue{}", self.0)
    }
}

/// Handle to a native completion event recorded on a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(pub u64);

impl EventId {
    pub const fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event{}", self.0)
    }
}

/// OpenCL memory object handle (`cl_mem`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClMem(pub u64);

/// What kind of memory a native allocation should be backed by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MallocKind {
    /// Plain device memory
    #[default]
    Device,
    /// Unified/managed memory addressable from host and device
    Managed,
    /// Pinned host memory mapped into the device address space
    HostMapped,
}

/// Accelerator family a device is driven through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Mode {
    Cuda,
    Hip,
    OpenCl,
    /// SYCL-class runtime (DPC++)
    Dpcpp,
}

impl Mode {
    pub const ALL: [Mode; 4] = [Mode::Cuda, Mode::Hip, Mode::OpenCl, Mode::Dpcpp];

    pub const fn as_str(self) -> &'static str {
        match self {
            Mode::Cuda => "CUDA",
            Mode::Hip => "HIP",
            Mode::OpenCl => "OpenCL",
            Mode::Dpcpp => "dpcpp",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mode string that names no known backend
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown backend mode: {0:?}")]
pub struct ParseModeError(pub String);

impl FromStr for Mode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cuda" => Ok(Mode::Cuda),
            "hip" => Ok(Mode::Hip),
            "opencl" => Ok(Mode::OpenCl),
            "dpcpp" | "dpc++" | "sycl" => Ok(Mode::Dpcpp),
            _ => Err(ParseModeError(s.to_string())),
        }
    }
}

impl TryFrom<String> for Mode {
    type Error = ParseModeError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Mode> for String {
    fn from(mode: Mode) -> Self {
        mode.as_str().to_string()
    }
}

/// Backend-specific representation of a memory location
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativePtr {
    /// CUDA `CUdeviceptr` / HIP `hipDeviceptr_t`
    Device(DevicePtr),
    /// OpenCL buffer plus sub-buffer origin
    MemObject { mem: ClMem, origin: usize },
    /// SYCL unified shared memory pointer
    Usm(DevicePtr),
}

impl NativePtr {
    /// Location `bytes` further into the same allocation
    ///
    /// Pointers advance; OpenCL memory objects keep their handle and move
    /// the sub-buffer origin.
    pub fn offset(&self, bytes: usize) -> Result<Self> {
        Ok(match *self {
            NativePtr::Device(ptr) => NativePtr::Device(ptr.offset(bytes)?),
            NativePtr::MemObject { mem, origin } => NativePtr::MemObject {
                mem,
                origin: origin
                    .checked_add(bytes)
                    .ok_or(BackendError::AddressOverflow { addr: mem.0, bytes })?,
            },
            NativePtr::Usm(ptr) => NativePtr::Usm(ptr.offset(bytes)?),
        })
    }

    /// Raw value of the pointer or memory object handle
    pub fn raw(&self) -> u64 {
        match self {
            NativePtr::Device(ptr) | NativePtr::Usm(ptr) => ptr.addr(),
            NativePtr::MemObject { mem, .. } => mem.0,
        }
    }
}

impl fmt::Display for NativePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NativePtr::Device(ptr) => write!(f, "dev:{ptr}"),
            NativePtr::MemObject { mem, origin } => write!(f, "cl_mem:{:#x}+{origin}", mem.0),
            NativePtr::Usm(ptr) => write!(f, "usm:{ptr}"),
        }
    }
}

/// A native allocation as returned by an adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeBuffer {
    pub ptr: NativePtr,
    pub size: usize,
    pub kind: MallocKind,
    /// Externally owned; never released by this crate
    pub wrapped: bool,
    /// Host alias of a `HostMapped` allocation, when the runtime provides one
    pub host_ptr: Option<HostPtr>,
}

/// Kernel launch argument for a memory location
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeArg {
    /// Device address passed by value
    Pointer(u64),
    /// OpenCL memory object with an origin the launcher must apply
    MemObject { mem: ClMem, origin: usize },
}
