#![allow(unused_unsafe)]
//! CUDA driver API binding through `cudarc`
//!
//! Uses the raw `cudarc::driver::result` layer rather than `CudaDevice`
//! because device memory here is addressed by plain `CUdeviceptr` values:
//! slices are interior pointers and wrapped memory is owned elsewhere, so
//! `CudaSlice`'s drop-frees-memory ownership does not fit.

use std::collections::HashMap;
use std::fmt;
use std::ptr;
use std::time::Duration;

use cudarc::driver::{result, sys, DriverError};
use parking_lot::Mutex;

use super::{DriverStats, NativeDriver};
use crate::backend::{DevicePtr, EventId, MallocKind, QueueId};
use crate::error::{BackendError, Result};

fn native(call: &'static str) -> impl FnOnce(DriverError) -> BackendError {
    move |err| BackendError::native("CUDA", call, err.0 as i32, err)
}

struct CudaState {
    streams: HashMap<u64, sys::CUstream>,
    next_queue: u64,
    events: HashMap<u64, sys::CUevent>,
    next_event: u64,
    stats: DriverStats,
}

/// NVIDIA device driven through the CUDA driver API
pub struct CudarcDriver {
    ordinal: usize,
    device: sys::CUdevice,
    context: sys::CUcontext,
    state: Mutex<CudaState>,
}

// SAFETY: the primary context is retained for the driver's lifetime and is
// made current before every call; raw stream and event handles are only
// touched while `state` is locked.
unsafe impl Send for CudarcDriver {}
unsafe impl Sync for CudarcDriver {}

impl fmt::Debug for CudarcDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CudarcDriver")
            .field("ordinal", &self.ordinal)
            .field("streams", &state.streams.len())
            .field("events", &state.events.len())
            .finish()
    }
}

impl CudarcDriver {
    /// Initialize the driver API and retain the primary context of device `ordinal`
    pub fn new(ordinal: usize) -> Result<Self> {
        result::init().map_err(native("cuInit"))?;
        let device = result::device::get(ordinal as i32).map_err(native("cuDeviceGet"))?;
        let context = unsafe { result::primary_ctx::retain(device) }.map_err(native("cuDevicePrimaryCtxRetain"))?;

        let mut streams = HashMap::new();
        streams.insert(QueueId::DEFAULT.id(), ptr::null_mut());

        let driver = Self {
            ordinal,
            device,
            context,
            state: Mutex::new(CudaState {
                streams,
                next_queue: 1,
                events: HashMap::new(),
                next_event: 1,
                stats: DriverStats::default(),
            }),
        };
        driver.bind()?;

        tracing::info!(ordinal, "cuda_driver_initialized");
        Ok(driver)
    }

    fn bind(&self) -> Result<()> {
        unsafe { result::ctx::set_current(self.context) }.map_err(native("cuCtxSetCurrent"))
    }

    fn stream(state: &CudaState, queue: QueueId) -> Result<sys::CUstream> {
        state
            .streams
            .get(&queue.id())
            .copied()
            .ok_or(BackendError::InvalidQueue(queue.id()))
    }
}

impl NativeDriver for CudarcDriver {
    fn name(&self) -> &'static str {
        "CUDA"
    }

    fn malloc(&self, bytes: usize, kind: MallocKind) -> Result<DevicePtr> {
        self.bind()?;
        let raw = match kind {
            MallocKind::Device => unsafe { result::malloc_sync(bytes) }.map_err(native("cuMemAlloc"))?,
            MallocKind::Managed => {
                unsafe { result::malloc_managed(bytes, sys::CUmemAttach_flags::CU_MEM_ATTACH_GLOBAL) }
                    .map_err(native("cuMemAllocManaged"))?
            }
            MallocKind::HostMapped => {
                return Err(BackendError::unsupported("host-mapped allocations through cudarc"));
            }
        };
        self.state.lock().stats.mallocs += 1;
        Ok(DevicePtr(raw))
    }

    fn free(&self, ptr: DevicePtr) -> Result<()> {
        self.bind()?;
        unsafe { result::free_sync(ptr.addr()) }.map_err(native("cuMemFree"))?;
        self.state.lock().stats.frees += 1;
        Ok(())
    }

    fn memcpy_htod(&self, dst: DevicePtr, src: &[u8], queue: QueueId) -> Result<()> {
        self.bind()?;
        let mut state = self.state.lock();
        let stream = Self::stream(&state, queue)?;
        unsafe {
            result::memcpy_htod_async(dst.addr(), src, stream).map_err(native("cuMemcpyHtoDAsync"))?;
            // `src` is only borrowed for this call
            result::stream::synchronize(stream).map_err(native("cuStreamSynchronize"))?;
        }
        state.stats.htod += 1;
        Ok(())
    }

    fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr, queue: QueueId) -> Result<()> {
        self.bind()?;
        let mut state = self.state.lock();
        let stream = Self::stream(&state, queue)?;
        unsafe {
            result::memcpy_dtoh_async(dst, src.addr(), stream).map_err(native("cuMemcpyDtoHAsync"))?;
            result::stream::synchronize(stream).map_err(native("cuStreamSynchronize"))?;
        }
        state.stats.dtoh += 1;
        Ok(())
    }

    fn memcpy_dtod(&self, dst: DevicePtr, src: DevicePtr, bytes: usize, queue: QueueId) -> Result<()> {
        self.bind()?;
        let mut state = self.state.lock();
        let stream = Self::stream(&state, queue)?;
        unsafe { result::memcpy_dtod_async(dst.addr(), src.addr(), bytes, stream) }
            .map_err(native("cuMemcpyDtoDAsync"))?;
        state.stats.dtod += 1;
        Ok(())
    }

    fn create_queue(&self) -> Result<QueueId> {
        self.bind()?;
        let stream = unsafe { result::stream::create(result::stream::StreamKind::NonBlocking) }.map_err(native("cuStreamCreate"))?;
        let mut state = self.state.lock();
        let id = state.next_queue;
        state.next_queue += 1;
        state.streams.insert(id, stream);
        Ok(QueueId(id))
    }

    fn destroy_queue(&self, queue: QueueId) -> Result<()> {
        if queue == QueueId::DEFAULT {
            return Err(BackendError::InvalidQueue(queue.id()));
        }
        self.bind()?;
        let stream = self
            .state
            .lock()
            .streams
            .remove(&queue.id())
            .ok_or(BackendError::InvalidQueue(queue.id()))?;
        unsafe { result::stream::destroy(stream) }.map_err(native("cuStreamDestroy"))
    }

    fn synchronize(&self, queue: QueueId) -> Result<()> {
        self.bind()?;
        let stream = Self::stream(&self.state.lock(), queue)?;
        unsafe { result::stream::synchronize(stream) }.map_err(native("cuStreamSynchronize"))
    }

    fn record_event(&self, queue: QueueId) -> Result<EventId> {
        self.bind()?;
        let mut state = self.state.lock();
        let stream = Self::stream(&state, queue)?;
        let event = unsafe { result::event::create(sys::CUevent_flags::CU_EVENT_DEFAULT) }.map_err(native("cuEventCreate"))?;
        if let Err(err) = unsafe { result::event::record(event, stream) } {
            let _ = unsafe { result::event::destroy(event) };
            return Err(native("cuEventRecord")(err));
        }

        let id = state.next_event;
        state.next_event += 1;
        state.events.insert(id, event);
        state.stats.events += 1;
        Ok(EventId(id))
    }

    fn wait_event(&self, event: EventId) -> Result<()> {
        self.bind()?;
        let recorded = self
            .state
            .lock()
            .events
            .get(&event.id())
            .copied()
            .ok_or(BackendError::InvalidEvent(event.id()))?;
        // Only the work recorded before the marker, not the whole stream
        unsafe { result::event::synchronize(recorded) }.map_err(native("cuEventSynchronize"))
    }

    fn elapsed(&self, start: EventId, end: EventId) -> Result<Duration> {
        self.bind()?;
        let state = self.state.lock();
        let start_event = state
            .events
            .get(&start.id())
            .copied()
            .ok_or(BackendError::InvalidEvent(start.id()))?;
        let end_event = state
            .events
            .get(&end.id())
            .copied()
            .ok_or(BackendError::InvalidEvent(end.id()))?;
        let millis = unsafe { result::event::elapsed(start_event, end_event) }.map_err(native("cuEventElapsedTime"))?;
        Ok(Duration::from_secs_f64(f64::from(millis.max(0.0)) / 1000.0))
    }

    fn destroy_event(&self, event: EventId) -> Result<()> {
        self.bind()?;
        let recorded = self
            .state
            .lock()
            .events
            .remove(&event.id())
            .ok_or(BackendError::InvalidEvent(event.id()))?;
        unsafe { result::event::destroy(recorded) }.map_err(native("cuEventDestroy"))
    }

    fn total_memory(&self) -> Result<usize> {
        self.bind()?;
        let (_free, total) = result::mem_get_info().map_err(native("cuMemGetInfo"))?;
        Ok(total)
    }

    fn stats(&self) -> DriverStats {
        self.state.lock().stats
    }
}

impl Drop for CudarcDriver {
    fn drop(&mut self) {
        if self.bind().is_err() {
            return;
        }
        let state = self.state.get_mut();
        for (_, recorded) in state.events.drain() {
            let _ = unsafe { result::event::destroy(recorded) };
        }
        for (id, stream) in state.streams.drain() {
            if id != QueueId::DEFAULT.id() {
                let _ = unsafe { result::stream::destroy(stream) };
            }
        }
        let _ = unsafe { result::primary_ctx::release(self.device) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn try_driver() -> Option<CudarcDriver> {
        CudarcDriver::new(0).ok()
    }

    #[test]
    fn test_cuda_roundtrip() {
        if let Some(driver) = try_driver() {
            let ptr = driver.malloc(64, MallocKind::Device).unwrap();
            driver.memcpy_htod(ptr.offset(8).unwrap(), b"cuda", QueueId::DEFAULT).unwrap();

            let mut out = [0u8; 4];
            driver.memcpy_dtoh(&mut out, ptr.offset(8).unwrap(), QueueId::DEFAULT).unwrap();
            assert_eq!(&out, b"cuda");

            driver.free(ptr).unwrap();
            assert_eq!(driver.stats().frees, 1);
        }
    }

    #[test]
    fn test_cuda_events_on_created_stream() {
        if let Some(driver) = try_driver() {
            let queue = driver.create_queue().unwrap();
            let start = driver.record_event(queue).unwrap();
            let end = driver.record_event(queue).unwrap();
            driver.wait_event(end).unwrap();
            assert!(driver.elapsed(start, end).is_ok());
            driver.destroy_event(start).unwrap();
            driver.destroy_event(end).unwrap();
            driver.destroy_queue(queue).unwrap();
        }
    }
}
