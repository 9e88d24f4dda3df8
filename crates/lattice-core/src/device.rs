//! Devices: allocation, accounting and stream selection
//!
//! A [`Device`] pairs a backend adapter with the per-device state memory
//! operations read: the current stream and the byte count of live owned
//! allocations. Devices are cheap to clone; clones share that state.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytemuck::Pod;
use lattice_backends::{
    cuda_driver, Adapter, Backend, DriverStats, HostDriver, Mode, NativeDriver, NativePtr, QueueId,
};
use lattice_tracing::performance::{record_allocation, record_stream_wait};
use lattice_tracing::timed_block;
use parking_lot::RwLock;

use crate::buffer::Buffer;
use crate::dtype::{self, Dtype, HasDtype};
use crate::error::{Error, Result};
use crate::memory::Memory;
use crate::properties::{DeviceProperties, MemoryProperties};
use crate::stream::{Stream, StreamTag};

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);

struct DeviceInner {
    id: u64,
    props: DeviceProperties,
    backend: Adapter,
    current_stream: RwLock<Stream>,
    bytes_allocated: AtomicUsize,
}

/// Handle to one accelerator
///
/// # Example
///
/// ```rust
/// use lattice_core::{Device, DeviceProperties, MemoryProperties, Mode};
///
/// # fn main() -> lattice_core::Result<()> {
/// let device = Device::new(DeviceProperties::new(Mode::Hip));
/// let memory = device.malloc(256, None, &MemoryProperties::default())?;
/// assert_eq!(device.memory_size(), 256);
///
/// memory.free()?;
/// assert_eq!(device.memory_size(), 0);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    /// Open a device for `props.mode`
    ///
    /// CUDA devices bind the CUDA driver when the `cuda` feature is enabled.
    /// Every other case runs on the host-memory emulation.
    pub fn new(props: DeviceProperties) -> Self {
        let driver: Arc<dyn NativeDriver> = match props.mode {
            Mode::Cuda => match cuda_driver(props.device_id as usize) {
                Ok(driver) => driver,
                Err(err) => {
                    tracing::warn!(error = %err, "cuda_driver_unavailable_using_host_emulation");
                    Arc::new(HostDriver::new())
                }
            },
            mode => {
                tracing::warn!(%mode, "no_native_driver_using_host_emulation");
                Arc::new(HostDriver::new())
            }
        };
        Self::with_driver(props, driver)
    }

    /// Open a device from a JSON description such as `{"mode": "OpenCL", "platformID": 0}`
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(Self::new(DeviceProperties::from_json(json)?))
    }

    /// Open a device on an explicit native driver
    pub fn with_driver(props: DeviceProperties, driver: Arc<dyn NativeDriver>) -> Self {
        let id = NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed);
        let backend = Adapter::new(props.mode, driver, props.platform_id);
        let default_stream = Stream::new(id, backend.clone(), QueueId::DEFAULT, false);

        tracing::info!(
            device_id = id,
            mode = %props.mode,
            ordinal = props.device_id,
            platform = props.platform_id,
            driver = backend.driver().name(),
            "device_created"
        );

        Self {
            inner: Arc::new(DeviceInner {
                id,
                props,
                backend,
                current_stream: RwLock::new(default_stream),
                bytes_allocated: AtomicUsize::new(0),
            }),
        }
    }

    /// Process-unique device id
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn mode(&self) -> Mode {
        self.inner.props.mode
    }

    pub fn properties(&self) -> &DeviceProperties {
        &self.inner.props
    }

    pub(crate) fn backend(&self) -> &Adapter {
        &self.inner.backend
    }

    // -------------------------------------------------------------------
    // Allocation
    // -------------------------------------------------------------------

    /// Allocate `bytes` bytes, optionally initialized from `src`
    ///
    /// The returned memory is typed as `byte`. `src` must hold at least
    /// `bytes` bytes; only the first `bytes` are copied.
    #[tracing::instrument(skip(self, src, props), fields(device_id = self.inner.id))]
    pub fn malloc(&self, bytes: i64, src: Option<&[u8]>, props: &MemoryProperties) -> Result<Memory> {
        if bytes < 0 {
            return Err(Error::NegativeSize(bytes));
        }
        self.allocate(bytes as usize, dtype::BYTE.clone(), src, props)
    }

    /// Allocate `count` elements of `dtype`
    pub fn malloc_typed(
        &self,
        count: i64,
        dtype: &Dtype,
        src: Option<&[u8]>,
        props: &MemoryProperties,
    ) -> Result<Memory> {
        if !dtype.is_registered() {
            return Err(Error::UnregisteredType(dtype.name().to_string()));
        }
        if count < 0 {
            return Err(Error::NegativeSize(count));
        }
        let bytes = (count as usize)
            .checked_mul(dtype.bytes())
            .ok_or_else(|| Error::invalid_range(format!("{count} x {dtype} overflows")))?;
        self.allocate(bytes, dtype.clone(), src, props)
    }

    /// Allocate memory holding a copy of `data`, typed after `T`
    pub fn malloc_from<T: Pod + HasDtype>(&self, data: &[T], props: &MemoryProperties) -> Result<Memory> {
        self.malloc_typed(data.len() as i64, &T::dtype(), Some(bytemuck::cast_slice(data)), props)
    }

    pub(crate) fn allocate(
        &self,
        bytes: usize,
        dtype: Dtype,
        src: Option<&[u8]>,
        props: &MemoryProperties,
    ) -> Result<Memory> {
        if bytes == 0 {
            return Err(Error::allocation(0, "zero-byte allocation"));
        }
        if let Some(src) = src {
            if src.len() < bytes {
                return Err(Error::out_of_bounds("source", 0, bytes, src.len()));
            }
        }
        let kind = props.malloc_kind(self.mode())?;

        let (native, duration_us) = timed_block!("malloc", { self.inner.backend.allocate(bytes, kind) });
        let native = native.map_err(|source| {
            let reason = if source.is_out_of_memory() {
                tracing::warn!(bytes, device_id = self.inner.id, "device_out_of_memory");
                "device out of memory".to_string()
            } else {
                source.to_string()
            };
            Error::AllocationFailed {
                bytes,
                reason,
                source: Some(source),
            }
        })?;
        record_allocation(bytes, self.mode().as_str(), false, duration_us);

        let memory = Memory::from_buffer(Arc::new(Buffer::owned(self.clone(), native)), dtype, props.clone());
        if let Some(src) = src {
            memory.copy_from_host(&src[..bytes], bytes as i64, 0, &MemoryProperties::default())?;
        }
        Ok(memory)
    }

    /// Wrap `bytes` bytes of externally owned memory
    ///
    /// Lattice never releases wrapped memory; `free()` on it is a no-op.
    #[tracing::instrument(skip(self, props), fields(device_id = self.inner.id))]
    pub fn wrap_memory(&self, ptr: NativePtr, bytes: i64, props: &MemoryProperties) -> Result<Memory> {
        if bytes < 0 {
            return Err(Error::NegativeSize(bytes));
        }
        let bytes = bytes as usize;
        if ptr.offset(bytes).is_err() {
            let room = match ptr {
                NativePtr::MemObject { origin, .. } => usize::MAX - origin,
                other => (u64::MAX - other.raw()) as usize,
            };
            return Err(Error::out_of_bounds("address space", 0, bytes, room));
        }
        let native = self.inner.backend.wrap_external(ptr, bytes)?;
        record_allocation(native.size, self.mode().as_str(), true, 0);

        let buffer = Buffer::wrapped(self.clone(), native);
        Ok(Memory::from_buffer(Arc::new(buffer), dtype::BYTE.clone(), props.clone()))
    }

    pub(crate) fn track(&self, bytes: usize) {
        self.inner.bytes_allocated.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn untrack(&self, bytes: usize) {
        self.inner.bytes_allocated.fetch_sub(bytes, Ordering::Relaxed);
    }

    /// Bytes held by live allocations this device owns
    pub fn memory_size(&self) -> usize {
        self.inner.bytes_allocated.load(Ordering::Relaxed)
    }

    pub fn memory_allocated(&self) -> usize {
        self.memory_size()
    }

    /// Device memory capacity reported by the driver
    pub fn total_memory(&self) -> Result<usize> {
        Ok(self.inner.backend.total_memory()?)
    }

    pub fn driver_stats(&self) -> DriverStats {
        self.inner.backend.stats()
    }

    // -------------------------------------------------------------------
    // Streams
    // -------------------------------------------------------------------

    /// Create a new queue on this device
    pub fn create_stream(&self) -> Result<Stream> {
        let queue = self.inner.backend.create_queue()?;
        Ok(Stream::new(self.inner.id, self.inner.backend.clone(), queue, true))
    }

    /// Adopt an existing native queue; it is not destroyed with the stream
    pub fn wrap_stream(&self, queue: QueueId) -> Stream {
        Stream::new(self.inner.id, self.inner.backend.clone(), queue, false)
    }

    /// Stream new operations are enqueued on
    pub fn stream(&self) -> Stream {
        self.inner.current_stream.read().clone()
    }

    /// Route subsequent operations to `stream`
    ///
    /// Work already enqueued on the previous stream is unaffected.
    pub fn set_stream(&self, stream: &Stream) -> Result<()> {
        if stream.device_id() != self.inner.id {
            return Err(Error::DeviceMismatch(format!(
                "stream {} belongs to device {}, not {}",
                stream.id(),
                stream.device_id(),
                self.inner.id
            )));
        }
        *self.inner.current_stream.write() = stream.clone();
        tracing::debug!(device_id = self.inner.id, stream_id = stream.id(), "stream_selected");
        Ok(())
    }

    /// Place a completion marker on the current stream
    pub fn tag_stream(&self) -> Result<StreamTag> {
        self.stream().tag()
    }

    /// Block until the work before `tag` has completed
    pub fn wait_for(&self, tag: &StreamTag) -> Result<()> {
        self.check_tag(tag)?;
        let (waited, duration_us) = timed_block!("wait_for", { self.inner.backend.wait_for(tag.event()) });
        waited?;
        record_stream_wait(tag.stream_id(), duration_us);
        Ok(())
    }

    /// Time between two tags of the same stream
    ///
    /// Waits for `end` before measuring.
    pub fn time_between(&self, start: &StreamTag, end: &StreamTag) -> Result<Duration> {
        self.check_tag(start)?;
        self.check_tag(end)?;
        if start.stream_id() != end.stream_id() {
            return Err(Error::TagsNotComparable(format!(
                "tags come from streams {} and {}",
                start.stream_id(),
                end.stream_id()
            )));
        }
        if start.sequence() > end.sequence() {
            return Err(Error::TagsNotComparable(format!(
                "start tag {} was placed after end tag {}",
                start.sequence(),
                end.sequence()
            )));
        }
        self.wait_for(end)?;
        Ok(self.inner.backend.time_between(start.event(), end.event())?)
    }

    fn check_tag(&self, tag: &StreamTag) -> Result<()> {
        if tag.device_id() == self.inner.id {
            Ok(())
        } else {
            Err(Error::TagsNotComparable(format!(
                "tag belongs to device {}, not {}",
                tag.device_id(),
                self.inner.id
            )))
        }
    }

    /// Block until everything on the current stream has completed
    pub fn finish(&self) -> Result<()> {
        self.stream().finish()
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Device {}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.inner.id)
            .field("mode", &self.inner.props.mode)
            .field("device_id", &self.inner.props.device_id)
            .field("memory_size", &self.memory_size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use lattice_backends::{BackendError, MallocKind};

    fn host_device(mode: Mode) -> (Arc<HostDriver>, Device) {
        let driver = Arc::new(HostDriver::new());
        (driver.clone(), Device::with_driver(DeviceProperties::new(mode), driver))
    }

    #[test]
    fn test_new_falls_back_to_host_emulation() {
        let device = Device::new(DeviceProperties::new(Mode::OpenCl).with_platform_id(1));
        assert_eq!(device.mode(), Mode::OpenCl);
        assert_eq!(device.properties().platform_id, 1);
        assert_eq!(device.backend().driver().name(), "host");
    }

    #[test]
    fn test_from_json() {
        let device = Device::from_json(r#"{"mode": "dpcpp", "deviceID": 0}"#).unwrap();
        assert_eq!(device.mode(), Mode::Dpcpp);
        assert!(Device::from_json(r#"{"mode": "Vulkan"}"#).is_err());
    }

    #[test]
    fn test_device_ids_are_unique() {
        let (_, a) = host_device(Mode::Cuda);
        let (_, b) = host_device(Mode::Cuda);
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn test_malloc_accounts_bytes() {
        let (driver, device) = host_device(Mode::Cuda);
        let props = MemoryProperties::default();

        let a = device.malloc(100, None, &props).unwrap();
        let b = device.malloc(28, Some(&[9u8; 64]), &props).unwrap();
        assert_eq!(device.memory_size(), 128);
        assert_eq!(device.memory_allocated(), 128);
        assert_eq!(driver.used_memory(), 128);
        assert_eq!(b.to_vec::<u8>().unwrap(), vec![9u8; 28]);

        drop(a);
        assert_eq!(device.memory_size(), 28);
        drop(b);
        assert_eq!(device.memory_size(), 0);
        assert_eq!(driver.stats().frees, 2);
    }

    #[test]
    fn test_malloc_rejects_bad_sizes() {
        let (driver, device) = host_device(Mode::Hip);
        let props = MemoryProperties::default();

        assert_eq!(device.malloc(-3, None, &props).unwrap_err().kind(), ErrorKind::NegativeSize);
        assert_eq!(device.malloc(0, None, &props).unwrap_err().kind(), ErrorKind::AllocationFailed);
        assert_eq!(
            device.malloc(16, Some(&[0u8; 8]), &props).unwrap_err().kind(),
            ErrorKind::OutOfBounds
        );
        assert_eq!(driver.stats().mallocs, 0);
    }

    #[test]
    fn test_out_of_memory_keeps_native_cause() {
        let driver = Arc::new(HostDriver::with_capacity(1024));
        let device = Device::with_driver(DeviceProperties::new(Mode::Cuda), driver);

        let err = device.malloc(4096, None, &MemoryProperties::default()).unwrap_err();
        match err {
            Error::AllocationFailed {
                bytes,
                ref reason,
                source: Some(BackendError::OutOfMemory { requested, .. }),
            } => {
                assert_eq!(bytes, 4096);
                assert_eq!(requested, 4096);
                assert_eq!(reason, "device out of memory");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(device.memory_size(), 0);
    }

    #[test]
    fn test_unsupported_memory_kind_is_rejected_before_allocating() {
        let (driver, device) = host_device(Mode::Dpcpp);
        let props = MemoryProperties::default().with_host(true);
        assert_eq!(
            device.malloc(64, None, &props).unwrap_err().kind(),
            ErrorKind::InvalidProperties
        );
        assert_eq!(driver.stats().mallocs, 0);
    }

    #[test]
    fn test_malloc_typed() {
        let (_, device) = host_device(Mode::OpenCl);
        let memory = device
            .malloc_typed(16, &dtype::FLOAT, None, &MemoryProperties::default())
            .unwrap();
        assert_eq!(memory.size(), 64);
        assert_eq!(memory.length(), 16);

        let unknown = Dtype::new("device_test_unregistered", 4);
        assert_eq!(
            device
                .malloc_typed(4, &unknown, None, &MemoryProperties::default())
                .unwrap_err()
                .kind(),
            ErrorKind::UnregisteredType
        );
    }

    #[test]
    fn test_malloc_from_typed_slice() {
        let (_, device) = host_device(Mode::Cuda);
        let memory = device
            .malloc_from(&[1.5f64, -2.0, 8.25], &MemoryProperties::default())
            .unwrap();
        assert_eq!(memory.dtype().unwrap(), *dtype::DOUBLE);
        assert_eq!(memory.length(), 3);
        assert_eq!(memory.to_vec::<f64>().unwrap(), vec![1.5, -2.0, 8.25]);
    }

    #[test]
    fn test_wrapped_memory_is_not_accounted() {
        let (driver, device) = host_device(Mode::Cuda);
        let ptr = driver.malloc(64, MallocKind::Device).unwrap();

        let memory = device
            .wrap_memory(NativePtr::Device(ptr), 64, &MemoryProperties::default())
            .unwrap();
        assert_eq!(memory.size(), 64);
        assert_eq!(device.memory_size(), 0);

        drop(memory);
        assert_eq!(driver.stats().frees, 0);
    }

    #[test]
    fn test_wrap_rejects_foreign_pointer() {
        let (_, device) = host_device(Mode::OpenCl);
        let err = device
            .wrap_memory(NativePtr::Usm(lattice_backends::DevicePtr(0x100)), 8, &MemoryProperties::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendFailure);
    }

    #[test]
    fn test_wrap_rejects_ranges_past_the_address_space() {
        let (driver, device) = host_device(Mode::Cuda);
        let top = NativePtr::Device(lattice_backends::DevicePtr(u64::MAX - 16));
        let err = device.wrap_memory(top, 64, &MemoryProperties::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfBounds);

        let memory = device.wrap_memory(top, 16, &MemoryProperties::default()).unwrap();
        assert_eq!(memory.slice_from(8).unwrap().size(), 8);
        assert_eq!(driver.stats(), Default::default());
    }

    #[test]
    fn test_tag_outlives_its_stream() {
        let (driver, device) = host_device(Mode::Cuda);
        let stream = device.create_stream().unwrap();
        device.set_stream(&stream).unwrap();
        let tag = device.tag_stream().unwrap();

        device.set_stream(&device.wrap_stream(QueueId::DEFAULT)).unwrap();
        drop(stream);
        assert_eq!(driver.live_queues(), 2);

        device.wait_for(&tag).unwrap();
        drop(tag);
        assert_eq!(driver.live_queues(), 1);
        assert_eq!(driver.live_events(), 0);
    }

    #[test]
    fn test_stream_selection() {
        let (driver, device) = host_device(Mode::Cuda);
        let default_stream = device.stream();
        assert_eq!(default_stream.queue(), QueueId::DEFAULT);

        let stream = device.create_stream().unwrap();
        device.set_stream(&stream).unwrap();
        assert_eq!(device.stream(), stream);

        device.set_stream(&default_stream).unwrap();
        drop(stream);
        assert_eq!(driver.live_queues(), 1);

        let (_, other) = host_device(Mode::Cuda);
        let foreign = other.create_stream().unwrap();
        assert_eq!(device.set_stream(&foreign).unwrap_err().kind(), ErrorKind::DeviceMismatch);
    }

    #[test]
    fn test_wrapped_stream_queue_survives() {
        let (driver, device) = host_device(Mode::Hip);
        let queue = driver.create_queue().unwrap();
        let stream = device.wrap_stream(queue);
        device.set_stream(&stream).unwrap();
        device.finish().unwrap();

        device.set_stream(&device.wrap_stream(QueueId::DEFAULT)).unwrap();
        drop(stream);
        assert_eq!(driver.live_queues(), 2);
    }

    #[test]
    fn test_time_between_tags() {
        let (_, device) = host_device(Mode::Dpcpp);
        let start = device.tag_stream().unwrap();
        let end = device.tag_stream().unwrap();

        assert!(device.time_between(&start, &end).is_ok());
        assert_eq!(
            device.time_between(&end, &start).unwrap_err().kind(),
            ErrorKind::TagsNotComparable
        );

        let other_stream = device.create_stream().unwrap();
        device.set_stream(&other_stream).unwrap();
        let elsewhere = device.tag_stream().unwrap();
        assert_eq!(
            device.time_between(&start, &elsewhere).unwrap_err().kind(),
            ErrorKind::TagsNotComparable
        );
    }

    #[test]
    fn test_tags_from_other_devices_are_rejected() {
        let (_, a) = host_device(Mode::Cuda);
        let (_, b) = host_device(Mode::Cuda);
        let tag = b.tag_stream().unwrap();
        assert_eq!(a.wait_for(&tag).unwrap_err().kind(), ErrorKind::TagsNotComparable);
        b.wait_for(&tag).unwrap();
    }

    #[test]
    fn test_total_memory_and_stats() {
        let driver = Arc::new(HostDriver::with_capacity(1 << 20));
        let device = Device::with_driver(DeviceProperties::new(Mode::Hip), driver);
        assert_eq!(device.total_memory().unwrap(), 1 << 20);

        let _memory = device.malloc(8, Some(&[1; 8]), &MemoryProperties::default()).unwrap();
        let stats = device.driver_stats();
        assert_eq!((stats.mallocs, stats.htod), (1, 1));
    }
}
