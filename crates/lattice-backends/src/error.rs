//! Error types for backend operations

use std::fmt;

/// Result type for backend operations
pub type Result<T> = std::result::Result<T, BackendError>;

/// Errors reported by native drivers and backend adapters
///
/// These never carry façade-level validation failures; range checks happen
/// before a backend is reached. A `BackendError` always means the native
/// layer refused or failed a call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// Device allocation exceeded the remaining capacity
    #[error("out of device memory: requested {requested} bytes, {available} bytes available")]
    OutOfMemory { requested: usize, available: usize },

    /// Address does not fall inside any live allocation
    #[error("invalid device pointer: {0:#x}")]
    InvalidPointer(u64),

    /// Unknown or destroyed queue
    #[error("invalid queue: {0}")]
    InvalidQueue(u64),

    /// Unknown or destroyed event
    #[error("invalid event: {0}")]
    InvalidEvent(u64),

    /// Access runs past the end of the allocation it starts in
    #[error("device access out of bounds: {bytes} bytes at {addr:#x} exceeds allocation of {allocation_size} bytes")]
    AccessOutOfBounds {
        addr: u64,
        bytes: usize,
        allocation_size: usize,
    },

    /// Pointer arithmetic ran past the end of the address space
    #[error("address overflow: {bytes} bytes past {addr:#x}")]
    AddressOverflow { addr: u64, bytes: usize },

    /// A native API call returned an error code
    #[error("{backend} call {call} failed with code {code}: {message}")]
    Native {
        backend: &'static str,
        call: &'static str,
        code: i32,
        message: String,
    },

    /// Operation not available for this backend or build
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

impl BackendError {
    /// Create a native call failure
    pub fn native(backend: &'static str, call: &'static str, code: i32, message: impl fmt::Display) -> Self {
        Self::Native {
            backend,
            call,
            code,
            message: message.to_string(),
        }
    }

    /// Create an unsupported operation error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// True when the failure came from exhausting device memory
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }
}
