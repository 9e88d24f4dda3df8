//! Native allocations owned by a device
//!
//! A [`Buffer`] is the single owner of one native allocation. Every view of
//! the allocation (whole-buffer handles, slices, casts) shares the buffer
//! through an `Arc`, so the native release happens at most once no matter
//! how many handles or views are alive.
//!
//! ```text
//!  Memory ──► MemoryView ──┐
//!  Memory ──► MemoryView ──┼──► Arc<Buffer> ──► NativeBuffer (device)
//!  Memory ──► MemoryView ──┘
//! ```

use lattice_backends::{Backend, HostPtr, NativeBuffer, NativePtr};
use lattice_tracing::performance::record_release;
use parking_lot::Mutex;

use crate::device::Device;
use crate::error::{Error, Result};

/// Who is responsible for releasing the native allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Ownership {
    /// Allocated by lattice; released on `free()` or when the last view drops
    Owned,
    /// Externally owned pointer; never released here
    Wrapped,
    /// Ownership given up through `detach()`
    Detached,
    /// Released through an explicit `free()`
    Freed,
}

#[derive(Debug)]
struct BufferState {
    ownership: Ownership,
    /// Release on last drop; cleared by `dont_use_refs()`
    use_refs: bool,
}

/// One native allocation on one device
#[derive(Debug)]
pub(crate) struct Buffer {
    device: Device,
    native: NativeBuffer,
    state: Mutex<BufferState>,
}

impl Buffer {
    /// Take ownership of a fresh allocation and account it to `device`
    pub(crate) fn owned(device: Device, native: NativeBuffer) -> Self {
        device.track(native.size);
        Self::with_ownership(device, native, Ownership::Owned)
    }

    /// Describe memory lattice must never release
    pub(crate) fn wrapped(device: Device, native: NativeBuffer) -> Self {
        Self::with_ownership(device, native, Ownership::Wrapped)
    }

    fn with_ownership(device: Device, native: NativeBuffer, ownership: Ownership) -> Self {
        Self {
            device,
            native,
            state: Mutex::new(BufferState {
                ownership,
                use_refs: true,
            }),
        }
    }

    pub(crate) fn device(&self) -> &Device {
        &self.device
    }

    pub(crate) fn size(&self) -> usize {
        self.native.size
    }

    pub(crate) fn base(&self) -> &NativePtr {
        &self.native.ptr
    }

    /// Host alias of the first byte, for host-mapped allocations
    pub(crate) fn host_base(&self) -> Option<HostPtr> {
        self.native.host_ptr
    }

    pub(crate) fn ownership(&self) -> Ownership {
        self.state.lock().ownership
    }

    pub(crate) fn is_freed(&self) -> bool {
        self.ownership() == Ownership::Freed
    }

    pub(crate) fn check_live(&self) -> Result<()> {
        if self.is_freed() {
            Err(Error::UseAfterFree)
        } else {
            Ok(())
        }
    }

    pub(crate) fn dont_use_refs(&self) {
        self.state.lock().use_refs = false;
    }

    /// Release the native allocation if this buffer still owns it
    ///
    /// Returns whether a native free was issued. Wrapped, detached and
    /// already-freed buffers are left alone. A failed native free leaves
    /// the buffer owned.
    pub(crate) fn release(&self, explicit: bool) -> Result<bool> {
        let mut state = self.state.lock();
        if state.ownership != Ownership::Owned {
            tracing::trace!(ownership = ?state.ownership, ptr = %self.native.ptr, "release_skipped");
            return Ok(false);
        }

        self.device.backend().free(&self.native)?;
        state.ownership = Ownership::Freed;
        drop(state);

        self.device.untrack(self.native.size);
        record_release(self.native.size, self.device.mode().as_str(), explicit);
        Ok(true)
    }

    /// Stop managing the allocation without releasing it
    pub(crate) fn detach(&self) {
        let mut state = self.state.lock();
        if state.ownership != Ownership::Owned {
            return;
        }
        state.ownership = Ownership::Detached;
        drop(state);

        self.device.untrack(self.native.size);
        self.device.backend().detach(&self.native);
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.ownership != Ownership::Owned {
            return;
        }
        if !state.use_refs {
            tracing::debug!(ptr = %self.native.ptr, size = self.native.size, "buffer_dropped_without_free");
            return;
        }
        if let Err(err) = self.release(false) {
            tracing::warn!(ptr = %self.native.ptr, error = %err, "buffer_release_failed");
        }
    }
}
