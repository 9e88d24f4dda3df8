//! Backend trait and native descriptor types

mod traits;
mod types;

pub use traits::Backend;
pub use types::{
    ClMem, DevicePtr, EventId, HostPtr, MallocKind, Mode, NativeArg, NativeBuffer, NativePtr, ParseModeError,
    QueueId,
};
