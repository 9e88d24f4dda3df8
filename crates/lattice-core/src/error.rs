//! Error types for lattice-core operations

use lattice_backends::BackendError;

/// Result type for lattice-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Plain classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    UninitializedHandle,
    InvalidRange,
    NegativeSize,
    NegativeOffset,
    OutOfBounds,
    AllocationFailed,
    UnregisteredType,
    UseAfterFree,
    TagsNotComparable,
    DeviceMismatch,
    InvalidProperties,
    BackendFailure,
}

/// Errors that can occur in lattice-core operations
///
/// Range and argument errors are raised before any native call is issued,
/// so a failed operation never leaves a partial copy behind.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Operation on a handle that references no memory
    #[error("Memory not initialized")]
    UninitializedHandle,

    /// Negative or overflowing slice offset/length
    #[error("Invalid range: {0}")]
    InvalidRange(String),

    /// Byte count below -1
    #[error("Negative byte count: {0}")]
    NegativeSize(i64),

    /// Offset below 0
    #[error("Negative offset: {0}")]
    NegativeOffset(i64),

    /// Range exceeds the source or destination extent
    #[error("Out of bounds: {bytes} bytes at offset {offset} exceed {side} size {size}")]
    OutOfBounds {
        side: &'static str,
        offset: usize,
        bytes: usize,
        size: usize,
    },

    /// Device could not provide the memory
    #[error("Allocation of {bytes} bytes failed: {reason}")]
    AllocationFailed {
        bytes: usize,
        reason: String,
        #[source]
        source: Option<BackendError>,
    },

    /// Element type has not been registered
    #[error("Unregistered dtype: {0}")]
    UnregisteredType(String),

    /// Memory was explicitly freed
    #[error("Memory used after free")]
    UseAfterFree,

    /// Stream tags from different streams or devices, or out of order
    #[error("Stream tags not comparable: {0}")]
    TagsNotComparable(String),

    /// Stream or memory belongs to another device
    #[error("Device mismatch: {0}")]
    DeviceMismatch(String),

    /// Device or memory properties rejected
    #[error("Invalid properties: {0}")]
    InvalidProperties(String),

    /// Native API call failed
    #[error("Backend failure: {0}")]
    BackendFailure(#[from] BackendError),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::UninitializedHandle => ErrorKind::UninitializedHandle,
            Error::InvalidRange(_) => ErrorKind::InvalidRange,
            Error::NegativeSize(_) => ErrorKind::NegativeSize,
            Error::NegativeOffset(_) => ErrorKind::NegativeOffset,
            Error::OutOfBounds { .. } => ErrorKind::OutOfBounds,
            Error::AllocationFailed { .. } => ErrorKind::AllocationFailed,
            Error::UnregisteredType(_) => ErrorKind::UnregisteredType,
            Error::UseAfterFree => ErrorKind::UseAfterFree,
            Error::TagsNotComparable(_) => ErrorKind::TagsNotComparable,
            Error::DeviceMismatch(_) => ErrorKind::DeviceMismatch,
            Error::InvalidProperties(_) => ErrorKind::InvalidProperties,
            Error::BackendFailure(_) => ErrorKind::BackendFailure,
        }
    }

    pub(crate) fn invalid_range(msg: impl Into<String>) -> Self {
        Error::InvalidRange(msg.into())
    }

    pub(crate) fn allocation(bytes: usize, reason: impl Into<String>) -> Self {
        Error::AllocationFailed {
            bytes,
            reason: reason.into(),
            source: None,
        }
    }

    pub(crate) fn out_of_bounds(side: &'static str, offset: usize, bytes: usize, size: usize) -> Self {
        Error::OutOfBounds {
            side,
            offset,
            bytes,
            size,
        }
    }
}
