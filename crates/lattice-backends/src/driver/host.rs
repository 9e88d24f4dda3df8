//! Host-memory emulation of an accelerator driver
//!
//! Allocations live in an ordered map keyed by a synthetic device address.
//! Addresses are 256-byte aligned and never reused, so a stale pointer is
//! reported as invalid instead of silently aliasing a newer allocation.
//! Queues execute commands at enqueue time, which trivially preserves FIFO
//! order; events capture an [`Instant`] so elapsed times are real.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{DriverStats, NativeDriver};
use crate::backend::{DevicePtr, EventId, HostPtr, MallocKind, QueueId};
use crate::error::{BackendError, Result};

const BASE_ADDRESS: u64 = 0x7f00_0000_0000;
const ALIGNMENT: u64 = 256;

/// Default emulated capacity: 1 GiB
pub const DEFAULT_CAPACITY: usize = 1 << 30;

#[derive(Debug)]
struct HostEvent {
    queue: QueueId,
    recorded_at: Instant,
}

#[derive(Debug)]
struct HostState {
    allocations: BTreeMap<u64, Vec<u8>>,
    /// Base addresses of `HostMapped` allocations
    host_mapped: HashSet<u64>,
    next_address: u64,
    used: usize,
    /// Queue id -> commands executed on it
    queues: HashMap<u64, u64>,
    next_queue: u64,
    events: HashMap<u64, HostEvent>,
    next_event: u64,
    stats: DriverStats,
}

impl HostState {
    /// Find the allocation containing `[addr, addr + bytes)`
    fn locate(&self, addr: u64, bytes: usize) -> Result<(u64, usize)> {
        let (&base, data) = self
            .allocations
            .range(..=addr)
            .next_back()
            .ok_or(BackendError::InvalidPointer(addr))?;

        let offset = (addr - base) as usize;
        if offset > data.len() {
            return Err(BackendError::InvalidPointer(addr));
        }
        if offset.checked_add(bytes).is_none_or(|end| end > data.len()) {
            return Err(BackendError::AccessOutOfBounds {
                addr,
                bytes,
                allocation_size: data.len(),
            });
        }
        Ok((base, offset))
    }

    fn enqueue(&mut self, queue: QueueId) -> Result<()> {
        let commands = self
            .queues
            .get_mut(&queue.id())
            .ok_or(BackendError::InvalidQueue(queue.id()))?;
        *commands += 1;
        Ok(())
    }
}

/// Accelerator driver emulated in host memory
///
/// Used when no native runtime is available and throughout the test suites,
/// where [`HostDriver::stats`] lets tests count native frees and copies.
#[derive(Debug)]
pub struct HostDriver {
    capacity: usize,
    state: Mutex<HostState>,
}

impl HostDriver {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a driver whose `malloc` fails once `capacity` bytes are live
    pub fn with_capacity(capacity: usize) -> Self {
        let mut queues = HashMap::new();
        queues.insert(QueueId::DEFAULT.id(), 0);

        Self {
            capacity,
            state: Mutex::new(HostState {
                allocations: BTreeMap::new(),
                host_mapped: HashSet::new(),
                next_address: BASE_ADDRESS,
                used: 0,
                queues,
                next_queue: 1,
                events: HashMap::new(),
                next_event: 1,
                stats: DriverStats::default(),
            }),
        }
    }

    /// Bytes currently allocated
    pub fn used_memory(&self) -> usize {
        self.state.lock().used
    }

    /// Number of live allocations
    pub fn live_allocations(&self) -> usize {
        self.state.lock().allocations.len()
    }

    /// Number of live queues, including the default queue
    pub fn live_queues(&self) -> usize {
        self.state.lock().queues.len()
    }

    /// Number of live events
    pub fn live_events(&self) -> usize {
        self.state.lock().events.len()
    }
}

impl Default for HostDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeDriver for HostDriver {
    fn name(&self) -> &'static str {
        "host"
    }

    fn malloc(&self, bytes: usize, kind: MallocKind) -> Result<DevicePtr> {
        let mut state = self.state.lock();

        let available = self.capacity - state.used;
        if bytes > available {
            return Err(BackendError::OutOfMemory {
                requested: bytes,
                available,
            });
        }

        let addr = state.next_address;
        let span = (bytes.max(1) as u64).div_ceil(ALIGNMENT) * ALIGNMENT;
        state.next_address += span;
        state.used += bytes;
        state.allocations.insert(addr, vec![0u8; bytes]);
        if kind == MallocKind::HostMapped {
            state.host_mapped.insert(addr);
        }
        state.stats.mallocs += 1;

        tracing::trace!(addr = %DevicePtr(addr), bytes, ?kind, "host_malloc");
        Ok(DevicePtr(addr))
    }

    fn free(&self, ptr: DevicePtr) -> Result<()> {
        let mut state = self.state.lock();
        let data = state
            .allocations
            .remove(&ptr.addr())
            .ok_or(BackendError::InvalidPointer(ptr.addr()))?;
        state.used -= data.len();
        state.host_mapped.remove(&ptr.addr());
        state.stats.frees += 1;

        tracing::trace!(addr = %ptr, bytes = data.len(), "host_free");
        Ok(())
    }

    /// Emulated memory is host memory already, so the alias is the backing storage
    fn host_alias(&self, ptr: DevicePtr) -> Result<HostPtr> {
        let state = self.state.lock();
        if !state.host_mapped.contains(&ptr.addr()) {
            return Err(BackendError::unsupported(format!("allocation at {ptr} is not host-mapped")));
        }
        state
            .allocations
            .get(&ptr.addr())
            .map(|data| HostPtr(data.as_ptr() as usize as u64))
            .ok_or(BackendError::InvalidPointer(ptr.addr()))
    }

    fn memcpy_htod(&self, dst: DevicePtr, src: &[u8], queue: QueueId) -> Result<()> {
        let mut state = self.state.lock();
        state.enqueue(queue)?;
        let (base, offset) = state.locate(dst.addr(), src.len())?;
        if let Some(data) = state.allocations.get_mut(&base) {
            data[offset..offset + src.len()].copy_from_slice(src);
        }
        state.stats.htod += 1;
        Ok(())
    }

    fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr, queue: QueueId) -> Result<()> {
        let mut state = self.state.lock();
        state.enqueue(queue)?;
        let (base, offset) = state.locate(src.addr(), dst.len())?;
        if let Some(data) = state.allocations.get(&base) {
            dst.copy_from_slice(&data[offset..offset + dst.len()]);
        }
        state.stats.dtoh += 1;
        Ok(())
    }

    fn memcpy_dtod(&self, dst: DevicePtr, src: DevicePtr, bytes: usize, queue: QueueId) -> Result<()> {
        let mut state = self.state.lock();
        state.enqueue(queue)?;
        let (src_base, src_offset) = state.locate(src.addr(), bytes)?;
        let (dst_base, dst_offset) = state.locate(dst.addr(), bytes)?;

        if src_base == dst_base {
            if let Some(data) = state.allocations.get_mut(&src_base) {
                data.copy_within(src_offset..src_offset + bytes, dst_offset);
            }
        } else {
            let staged = state
                .allocations
                .get(&src_base)
                .map(|data| data[src_offset..src_offset + bytes].to_vec())
                .unwrap_or_default();
            if let Some(data) = state.allocations.get_mut(&dst_base) {
                data[dst_offset..dst_offset + bytes].copy_from_slice(&staged);
            }
        }
        state.stats.dtod += 1;
        Ok(())
    }

    fn create_queue(&self) -> Result<QueueId> {
        let mut state = self.state.lock();
        let id = state.next_queue;
        state.next_queue += 1;
        state.queues.insert(id, 0);
        Ok(QueueId(id))
    }

    fn destroy_queue(&self, queue: QueueId) -> Result<()> {
        if queue == QueueId::DEFAULT {
            return Err(BackendError::InvalidQueue(queue.id()));
        }
        let mut state = self.state.lock();
        state
            .queues
            .remove(&queue.id())
            .map(|_| ())
            .ok_or(BackendError::InvalidQueue(queue.id()))
    }

    fn synchronize(&self, queue: QueueId) -> Result<()> {
        let state = self.state.lock();
        if state.queues.contains_key(&queue.id()) {
            Ok(())
        } else {
            Err(BackendError::InvalidQueue(queue.id()))
        }
    }

    fn record_event(&self, queue: QueueId) -> Result<EventId> {
        let mut state = self.state.lock();
        if !state.queues.contains_key(&queue.id()) {
            return Err(BackendError::InvalidQueue(queue.id()));
        }
        let id = state.next_event;
        state.next_event += 1;
        state.events.insert(
            id,
            HostEvent {
                queue,
                recorded_at: Instant::now(),
            },
        );
        state.stats.events += 1;
        Ok(EventId(id))
    }

    fn wait_event(&self, event: EventId) -> Result<()> {
        let state = self.state.lock();
        let recorded = state
            .events
            .get(&event.id())
            .ok_or(BackendError::InvalidEvent(event.id()))?;
        tracing::trace!(event = %event, queue = %recorded.queue, "host_wait_event");
        Ok(())
    }

    fn elapsed(&self, start: EventId, end: EventId) -> Result<Duration> {
        let state = self.state.lock();
        let start_at = state
            .events
            .get(&start.id())
            .ok_or(BackendError::InvalidEvent(start.id()))?
            .recorded_at;
        let end_at = state
            .events
            .get(&end.id())
            .ok_or(BackendError::InvalidEvent(end.id()))?
            .recorded_at;
        Ok(end_at.saturating_duration_since(start_at))
    }

    fn destroy_event(&self, event: EventId) -> Result<()> {
        let mut state = self.state.lock();
        state
            .events
            .remove(&event.id())
            .map(|_| ())
            .ok_or(BackendError::InvalidEvent(event.id()))
    }

    fn total_memory(&self) -> Result<usize> {
        Ok(self.capacity)
    }

    fn stats(&self) -> DriverStats {
        self.state.lock().stats
    }
}
