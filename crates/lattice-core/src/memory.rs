//! Reference-counted device memory handles
//!
//! [`Memory`] is the handle applications hold. Clones share one view; slices
//! and casts create new views over the same buffer. The native allocation is
//! released once, either by an explicit `free()` or when the last view of an
//! owning buffer is dropped.
//!
//! All range and argument checks run before a native call is issued:
//!
//! 1. handle initialized, memory not freed
//! 2. `bytes == -1` resolves to the size of the memory the call is made on
//! 3. `bytes < -1` is [`Error::NegativeSize`], negative offsets are [`Error::NegativeOffset`]
//! 4. destination then source extent ([`Error::OutOfBounds`])
//! 5. zero-byte copies return without touching the device

use std::fmt;
use std::ops::Add;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use lattice_backends::{Backend, DevicePtr, HostPtr, Mode, NativeArg, NativePtr};
use lattice_tracing::performance::{record_transfer, TransferDirection};
use lattice_tracing::timed_block;
use parking_lot::RwLock;

use crate::buffer::Buffer;
use crate::device::Device;
use crate::dtype::Dtype;
use crate::error::{Error, Result};
use crate::properties::MemoryProperties;

/// Byte count meaning "the whole memory"
pub const ALL_BYTES: i64 = -1;

/// A typed byte range of one buffer
struct MemoryView {
    buffer: Arc<Buffer>,
    /// Byte offset from the start of the buffer
    offset: usize,
    size: usize,
    ptr: NativePtr,
    dtype: RwLock<Dtype>,
    props: MemoryProperties,
}

impl MemoryView {
    fn dtype(&self) -> Dtype {
        self.dtype.read().clone()
    }

    fn device(&self) -> &Device {
        self.buffer.device()
    }

    /// Native pointer `offset` bytes into this view
    fn at(&self, offset: usize) -> Result<NativePtr> {
        Ok(self.device().backend().slice(&self.ptr, offset)?)
    }
}

/// Memory handed to a kernel launch
#[derive(Debug, Clone)]
pub struct KernelArg {
    pub arg: NativeArg,
    pub bytes: usize,
    pub dtype: Dtype,
}

/// Handle to device memory
///
/// `Memory::default()` is an uninitialized handle: `size()` and `length()`
/// report 0 and every fallible operation fails with
/// [`Error::UninitializedHandle`]. Equality is identity of the view.
///
/// # Example
///
/// ```rust
/// use lattice_core::{dtype, Device, DeviceProperties, MemoryProperties, Mode, ALL_BYTES};
///
/// # fn main() -> lattice_core::Result<()> {
/// let device = Device::new(DeviceProperties::new(Mode::Cuda));
/// let props = MemoryProperties::default();
///
/// let memory = device.malloc_typed(8, &dtype::FLOAT, None, &props)?;
/// memory.copy_from_slice(&[0.0f32, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0])?;
///
/// let middle = memory.slice(2, 4)?;
/// assert_eq!(middle.size(), 16);
/// assert_eq!(middle.to_vec::<f32>()?, vec![2.0, 3.0, 4.0, 5.0]);
///
/// let mut bytes = [0u8; 16];
/// middle.copy_to_host(&mut bytes, ALL_BYTES, 0, &props)?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct Memory {
    view: Option<Arc<MemoryView>>,
}

/// Validated `(bytes, dest_offset, src_offset)` of one copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CopyRange {
    bytes: usize,
    dest_offset: usize,
    src_offset: usize,
}

impl CopyRange {
    /// Resolve a copy request against the destination and source extents
    ///
    /// `whole` is the byte count `ALL_BYTES` stands for.
    fn resolve(
        bytes: i64,
        dest_offset: i64,
        src_offset: i64,
        dest_size: usize,
        src_size: usize,
        whole: usize,
    ) -> Result<Self> {
        if bytes < ALL_BYTES {
            return Err(Error::NegativeSize(bytes));
        }
        if dest_offset < 0 {
            return Err(Error::NegativeOffset(dest_offset));
        }
        if src_offset < 0 {
            return Err(Error::NegativeOffset(src_offset));
        }

        let bytes = if bytes == ALL_BYTES { whole } else { bytes as usize };
        let (dest_offset, src_offset) = (dest_offset as usize, src_offset as usize);

        if dest_offset.checked_add(bytes).is_none_or(|end| end > dest_size) {
            return Err(Error::out_of_bounds("destination", dest_offset, bytes, dest_size));
        }
        if src_offset.checked_add(bytes).is_none_or(|end| end > src_size) {
            return Err(Error::out_of_bounds("source", src_offset, bytes, src_size));
        }

        Ok(Self {
            bytes,
            dest_offset,
            src_offset,
        })
    }
}

impl Memory {
    pub(crate) fn from_buffer(buffer: Arc<Buffer>, dtype: Dtype, props: MemoryProperties) -> Self {
        let view = MemoryView {
            offset: 0,
            size: buffer.size(),
            ptr: *buffer.base(),
            dtype: RwLock::new(dtype),
            props,
            buffer,
        };
        Self {
            view: Some(Arc::new(view)),
        }
    }

    fn view(&self) -> Result<&Arc<MemoryView>> {
        self.view.as_ref().ok_or(Error::UninitializedHandle)
    }

    /// View of memory that has not been freed
    fn live_view(&self) -> Result<&Arc<MemoryView>> {
        let view = self.view()?;
        view.buffer.check_live()?;
        Ok(view)
    }

    fn with_view(view: MemoryView) -> Self {
        Self {
            view: Some(Arc::new(view)),
        }
    }

    // -------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------

    pub fn is_initialized(&self) -> bool {
        self.view.is_some()
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.view.as_ref().map_or(0, |view| view.size)
    }

    /// Number of elements of the current dtype
    pub fn length(&self) -> usize {
        match &self.view {
            Some(view) => {
                let element = view.dtype().bytes();
                if element == 0 {
                    0
                } else {
                    view.size / element
                }
            }
            None => 0,
        }
    }

    /// Byte offset of this view from the start of its allocation
    pub fn offset(&self) -> Result<usize> {
        Ok(self.view()?.offset)
    }

    pub fn dtype(&self) -> Result<Dtype> {
        Ok(self.view()?.dtype())
    }

    /// Retag the elements of this view in place
    ///
    /// Every handle sharing the view sees the new dtype. Use [`Memory::cast`]
    /// for a separately typed view.
    pub fn set_dtype(&self, dtype: &Dtype) -> Result<()> {
        let view = self.view()?;
        if !dtype.is_registered() {
            return Err(Error::UnregisteredType(dtype.name().to_string()));
        }
        *view.dtype.write() = dtype.clone();
        Ok(())
    }

    pub fn mode(&self) -> Result<Mode> {
        Ok(self.view()?.device().mode())
    }

    pub fn device(&self) -> Result<Device> {
        Ok(self.view()?.device().clone())
    }

    pub fn properties(&self) -> Result<MemoryProperties> {
        Ok(self.view()?.props.clone())
    }

    /// Native pointer of the first byte of this view
    pub fn ptr(&self) -> Result<NativePtr> {
        Ok(self.live_view()?.ptr)
    }

    /// Device address of the first byte of this view
    pub fn address(&self) -> Result<DevicePtr> {
        let view = self.live_view()?;
        Ok(view.device().backend().address(&view.ptr)?)
    }

    /// Host address of this view when the allocation is host-mapped
    ///
    /// Memory allocated with the `host` property on CUDA or HIP carries a
    /// pinned host alias; everything else returns `None`.
    pub fn host_ptr(&self) -> Result<Option<HostPtr>> {
        let view = self.live_view()?;
        match view.buffer.host_base() {
            Some(base) => Ok(Some(base.offset(view.offset)?)),
            None => Ok(None),
        }
    }

    /// Kernel-launch representation of this view
    pub fn kernel_arg(&self) -> Result<KernelArg> {
        let view = self.live_view()?;
        Ok(KernelArg {
            arg: view.device().backend().kernel_arg(&view.ptr),
            bytes: view.size,
            dtype: view.dtype(),
        })
    }

    /// Number of handles sharing this view
    pub fn ref_count(&self) -> usize {
        self.view.as_ref().map_or(0, Arc::strong_count)
    }

    pub fn is_freed(&self) -> bool {
        self.view.as_ref().is_some_and(|view| view.buffer.is_freed())
    }

    /// Stop releasing the allocation when the last handle drops
    ///
    /// Only an explicit [`Memory::free`] releases it afterwards.
    pub fn dont_use_refs(&self) -> Result<()> {
        self.view()?.buffer.dont_use_refs();
        Ok(())
    }

    // -------------------------------------------------------------------
    // Views
    // -------------------------------------------------------------------

    /// `count` elements starting at element `offset`; `count = -1` takes the rest
    ///
    /// The slice shares the allocation and keeps the current dtype.
    pub fn slice(&self, offset: i64, count: i64) -> Result<Memory> {
        let view = self.live_view()?;
        let dtype = view.dtype();
        let element = dtype.bytes() as i64;
        if element == 0 {
            return Err(Error::UnregisteredType(dtype.name().to_string()));
        }
        if offset < 0 {
            return Err(Error::invalid_range(format!("negative slice offset {offset}")));
        }

        let size = view.size as i64;
        let start = offset
            .checked_mul(element)
            .ok_or_else(|| Error::invalid_range(format!("slice offset {offset} overflows")))?;
        let span = match count {
            ALL_BYTES => size - start,
            count => count
                .checked_mul(element)
                .ok_or_else(|| Error::invalid_range(format!("slice length {count} overflows")))?,
        };
        if span < 0 {
            return Err(Error::invalid_range(format!(
                "slice ({offset}, {count}) has negative length {span}"
            )));
        }
        let end = start
            .checked_add(span)
            .filter(|&end| end <= size)
            .ok_or_else(|| Error::invalid_range(format!("slice ({offset}, {count}) exceeds size {size}")))?;

        let offset = view.offset + start as usize;
        tracing::trace!(start, end, dtype = %dtype, "slice");
        Ok(Self::with_view(MemoryView {
            buffer: view.buffer.clone(),
            offset,
            size: span as usize,
            ptr: view.device().backend().slice(view.buffer.base(), offset)?,
            dtype: RwLock::new(dtype),
            props: view.props.clone(),
        }))
    }

    /// Everything from element `offset` on
    pub fn slice_from(&self, offset: i64) -> Result<Memory> {
        self.slice(offset, ALL_BYTES)
    }

    /// Exchange the views two handles refer to
    pub fn swap(&mut self, other: &mut Memory) {
        std::mem::swap(&mut self.view, &mut other.view);
    }

    /// Same bytes viewed as `dtype`
    pub fn cast(&self, dtype: &Dtype) -> Result<Memory> {
        let view = self.live_view()?;
        if !dtype.is_registered() {
            return Err(Error::UnregisteredType(dtype.name().to_string()));
        }
        Ok(Self::with_view(MemoryView {
            buffer: view.buffer.clone(),
            offset: view.offset,
            size: view.size,
            ptr: view.ptr,
            dtype: RwLock::new(dtype.clone()),
            props: view.props.clone(),
        }))
    }

    // -------------------------------------------------------------------
    // Copies
    // -------------------------------------------------------------------

    /// Copy `bytes` bytes of `src` (from `src_offset`) into this memory at `dest_offset`
    ///
    /// `bytes = ALL_BYTES` copies `self.size()` bytes.
    #[tracing::instrument(skip(self, src, props), fields(is_async = props.is_async))]
    pub fn copy_from(
        &self,
        src: &Memory,
        bytes: i64,
        dest_offset: i64,
        src_offset: i64,
        props: &MemoryProperties,
    ) -> Result<()> {
        let dest = self.live_view()?;
        let source = src.live_view()?;
        let range = CopyRange::resolve(bytes, dest_offset, src_offset, dest.size, source.size, dest.size)?;
        transfer(dest, source, range, props)
    }

    /// Copy `bytes` bytes of this memory (from `src_offset`) into `dest` at `dest_offset`
    ///
    /// `bytes = ALL_BYTES` copies `self.size()` bytes.
    #[tracing::instrument(skip(self, dest, props), fields(is_async = props.is_async))]
    pub fn copy_to(
        &self,
        dest: &Memory,
        bytes: i64,
        dest_offset: i64,
        src_offset: i64,
        props: &MemoryProperties,
    ) -> Result<()> {
        let source = self.live_view()?;
        let target = dest.live_view()?;
        let range = CopyRange::resolve(bytes, dest_offset, src_offset, target.size, source.size, source.size)?;
        transfer(target, source, range, props)
    }

    /// Copy from host memory into this memory at `offset`
    ///
    /// Completes before returning; `src` is borrowed only for the call.
    #[tracing::instrument(skip(self, src, props), fields(host_bytes = src.len()))]
    pub fn copy_from_host(&self, src: &[u8], bytes: i64, offset: i64, props: &MemoryProperties) -> Result<()> {
        let view = self.live_view()?;
        let range = CopyRange::resolve(bytes, offset, 0, view.size, src.len(), view.size)?;
        if range.bytes == 0 {
            return Ok(());
        }

        let device = view.device();
        let dst = view.at(range.dest_offset)?;
        let queue = device.stream().queue();
        let (copied, duration_us) = timed_block!("copy_from_host", {
            device
                .backend()
                .copy_from_host(&dst, &src[..range.bytes], queue, props.is_async)
        });
        copied?;
        record_transfer(range.bytes, TransferDirection::HostToDevice, duration_us);
        Ok(())
    }

    /// Copy this memory, from `offset`, into host memory
    ///
    /// Completes before returning; `dst` is borrowed only for the call.
    #[tracing::instrument(skip(self, dst, props), fields(host_bytes = dst.len()))]
    pub fn copy_to_host(&self, dst: &mut [u8], bytes: i64, offset: i64, props: &MemoryProperties) -> Result<()> {
        let view = self.live_view()?;
        let range = CopyRange::resolve(bytes, 0, offset, dst.len(), view.size, view.size)?;
        if range.bytes == 0 {
            return Ok(());
        }

        let device = view.device();
        let src = view.at(range.src_offset)?;
        let queue = device.stream().queue();
        let (copied, duration_us) = timed_block!("copy_to_host", {
            device
                .backend()
                .copy_to_host(&mut dst[..range.bytes], &src, queue, props.is_async)
        });
        copied?;
        record_transfer(range.bytes, TransferDirection::DeviceToHost, duration_us);
        Ok(())
    }

    /// Overwrite the start of this memory with `src`
    pub fn copy_from_slice<T: Pod>(&self, src: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(src);
        self.copy_from_host(bytes, bytes.len() as i64, 0, &MemoryProperties::default())
    }

    /// Read this memory as whole elements of `T`
    ///
    /// Trailing bytes that do not fill a `T` are not read.
    pub fn to_vec<T: Pod>(&self) -> Result<Vec<T>> {
        let element = std::mem::size_of::<T>();
        let view = self.live_view()?;
        if element == 0 {
            return Ok(Vec::new());
        }

        let mut out = vec![<T as Zeroable>::zeroed(); view.size / element];
        let dst: &mut [u8] = bytemuck::cast_slice_mut(&mut out);
        let bytes = dst.len() as i64;
        self.copy_to_host(dst, bytes, 0, &MemoryProperties::default())?;
        Ok(out)
    }

    /// Independent copy on the same device with the same size and dtype
    pub fn duplicate(&self) -> Result<Memory> {
        let view = self.live_view()?;
        let _span = lattice_tracing::perf_span!("duplicate", bytes = view.size);
        let copy = view.device().allocate(view.size, view.dtype(), None, &view.props)?;
        copy.copy_from(self, ALL_BYTES, 0, 0, &MemoryProperties::default())?;
        Ok(copy)
    }

    // -------------------------------------------------------------------
    // Ownership
    // -------------------------------------------------------------------

    /// Release the allocation now
    ///
    /// Every view of the allocation then fails with [`Error::UseAfterFree`].
    /// Freeing twice, or freeing wrapped or detached memory, does nothing.
    pub fn free(&self) -> Result<()> {
        let view = self.view()?;
        view.buffer.release(true)?;
        Ok(())
    }

    /// Give up ownership of the allocation without releasing it
    pub fn detach(&self) -> Result<()> {
        self.view()?.buffer.detach();
        Ok(())
    }
}

/// Copy `range` between two views, staging through the host across devices
fn transfer(dest: &MemoryView, source: &MemoryView, range: CopyRange, props: &MemoryProperties) -> Result<()> {
    if range.bytes == 0 {
        return Ok(());
    }
    let dst = dest.at(range.dest_offset)?;
    let src = source.at(range.src_offset)?;

    if dest.device() == source.device() {
        let device = dest.device();
        let queue = device.stream().queue();
        let (copied, duration_us) = timed_block!("copy_device", {
            device
                .backend()
                .copy_device(&dst, &src, range.bytes, queue, props.is_async)
        });
        copied?;
        record_transfer(range.bytes, TransferDirection::DeviceToDevice, duration_us);
        return Ok(());
    }

    let (staged, duration_us) = timed_block!("copy_staged", {
        let mut staging = vec![0u8; range.bytes];
        source
            .device()
            .backend()
            .copy_to_host(&mut staging, &src, source.device().stream().queue(), false)
            .and_then(|()| {
                dest.device()
                    .backend()
                    .copy_from_host(&dst, &staging, dest.device().stream().queue(), false)
            })
    });
    staged?;
    record_transfer(range.bytes, TransferDirection::PeerStaged, duration_us);
    Ok(())
}

/// `&memory + n` is `memory.slice_from(n)`
impl Add<i64> for &Memory {
    type Output = Result<Memory>;

    fn add(self, offset: i64) -> Result<Memory> {
        self.slice_from(offset)
    }
}

impl PartialEq for Memory {
    fn eq(&self, other: &Self) -> bool {
        match (&self.view, &other.view) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl Eq for Memory {}

impl fmt::Debug for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.view {
            None => f.write_str("Memory(uninitialized)"),
            Some(view) => f
                .debug_struct("Memory")
                .field("ptr", &view.ptr)
                .field("offset", &view.offset)
                .field("size", &view.size)
                .field("dtype", &view.dtype())
                .field("ownership", &view.buffer.ownership())
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype;
    use crate::error::ErrorKind;
    use crate::properties::DeviceProperties;
    use lattice_backends::{HostDriver, NativeDriver};

    fn device(mode: Mode) -> (Arc<HostDriver>, Device) {
        let driver = Arc::new(HostDriver::new());
        (driver.clone(), Device::with_driver(DeviceProperties::new(mode), driver))
    }

    fn floats(device: &Device, count: i64) -> Memory {
        device
            .malloc_typed(count, &dtype::FLOAT, None, &MemoryProperties::default())
            .unwrap()
    }

    #[test]
    fn test_copy_range_check_order() {
        assert!(matches!(
            CopyRange::resolve(-2, -1, -1, 8, 8, 8),
            Err(Error::NegativeSize(-2))
        ));
        assert!(matches!(
            CopyRange::resolve(4, -1, 0, 8, 8, 8),
            Err(Error::NegativeOffset(-1))
        ));
        assert!(matches!(
            CopyRange::resolve(4, 0, -3, 8, 8, 8),
            Err(Error::NegativeOffset(-3))
        ));
        assert!(matches!(
            CopyRange::resolve(9, 0, 0, 8, 4, 8),
            Err(Error::OutOfBounds { side: "destination", .. })
        ));
        assert!(matches!(
            CopyRange::resolve(6, 0, 0, 8, 4, 8),
            Err(Error::OutOfBounds { side: "source", .. })
        ));
        assert_eq!(
            CopyRange::resolve(ALL_BYTES, 0, 0, 8, 8, 8).unwrap(),
            CopyRange {
                bytes: 8,
                dest_offset: 0,
                src_offset: 0
            }
        );
        // Whole-size copies still honor the offset
        assert!(CopyRange::resolve(ALL_BYTES, 1, 0, 8, 8, 8).is_err());
        assert!(CopyRange::resolve(i64::MAX, 0, 0, 8, 8, 8).is_err());
    }

    #[test]
    fn test_uninitialized_handle() {
        let memory = Memory::default();
        assert!(!memory.is_initialized());
        assert_eq!(memory.size(), 0);
        assert_eq!(memory.length(), 0);
        assert_eq!(memory.ref_count(), 0);
        assert_eq!(memory, Memory::default());

        for err in [
            memory.dtype().map(|_| ()),
            memory.ptr().map(|_| ()),
            memory.slice(0, 1).map(|_| ()),
            memory.free(),
            memory.detach(),
            memory.copy_from_host(&[0; 4], ALL_BYTES, 0, &MemoryProperties::default()),
        ] {
            assert_eq!(err.unwrap_err().kind(), ErrorKind::UninitializedHandle);
        }
    }

    #[test]
    fn test_clones_share_the_view() {
        let (_, device) = device(Mode::Cuda);
        let a = floats(&device, 4);
        let b = a.clone();
        assert_eq!(a, b);
        assert_eq!(a.ref_count(), 2);

        let slice = a.slice(0, 4).unwrap();
        assert_ne!(a, slice);
        assert_eq!(slice.ref_count(), 1);
    }

    #[test]
    fn test_slice_bounds() {
        let (_, device) = device(Mode::Hip);
        let memory = floats(&device, 16);

        let tail = memory.slice_from(12).unwrap();
        assert_eq!((tail.size(), tail.length(), tail.offset().unwrap()), (16, 4, 48));
        assert_eq!(memory.slice(16, ALL_BYTES).unwrap().size(), 0);

        for (offset, count) in [(-1, 1), (0, -2), (17, ALL_BYTES), (10, 7), (i64::MAX, 1)] {
            assert_eq!(
                memory.slice(offset, count).unwrap_err().kind(),
                ErrorKind::InvalidRange,
                "slice({offset}, {count})"
            );
        }
    }

    #[test]
    fn test_nested_slices_are_flattened() {
        let (_, device) = device(Mode::OpenCl);
        let memory = floats(&device, 32);
        let outer = memory.slice(8, 16).unwrap();
        let inner = outer.slice(4, 2).unwrap();

        assert_eq!(inner.offset().unwrap(), 48);
        assert_eq!(inner.ptr().unwrap(), memory.ptr().unwrap().offset(48).unwrap());

        inner.copy_from_slice(&[3.0f32, 4.0]).unwrap();
        let all = memory.to_vec::<f32>().unwrap();
        assert_eq!(&all[12..14], &[3.0, 4.0]);
    }

    #[test]
    fn test_slice_uses_current_dtype() {
        let (_, device) = device(Mode::Cuda);
        let memory = device.malloc(64, None, &MemoryProperties::default()).unwrap();
        assert_eq!(memory.length(), 64);

        let doubles = memory.cast(&dtype::DOUBLE).unwrap();
        let second = doubles.slice(1, 1).unwrap();
        assert_eq!((second.offset().unwrap(), second.size()), (8, 8));
    }

    #[test]
    fn test_add_offsets_by_elements() {
        let (_, device) = device(Mode::Cuda);
        let memory = device.malloc_from(&[10i32, 11, 12, 13], &MemoryProperties::default()).unwrap();

        let tail = (&memory + 1).unwrap();
        assert_eq!(tail.to_vec::<i32>().unwrap(), vec![11, 12, 13]);
        let tail = (&tail + 2).unwrap();
        assert_eq!((tail.offset().unwrap(), tail.length()), (12, 1));

        assert_eq!((&memory + 5).unwrap_err().kind(), ErrorKind::InvalidRange);
        assert_eq!((&memory + -1).unwrap_err().kind(), ErrorKind::InvalidRange);
    }

    #[test]
    fn test_swap_exchanges_views() {
        let (driver, device) = device(Mode::Hip);
        let mut a = device.malloc(4, Some(b"aaaa"), &MemoryProperties::default()).unwrap();
        let mut b = device.malloc(8, Some(b"bbbbbbbb"), &MemoryProperties::default()).unwrap();
        let a_alias = a.clone();

        a.swap(&mut b);
        assert_eq!((a.size(), b.size()), (8, 4));
        assert_eq!(b, a_alias);
        assert_eq!(a.to_vec::<u8>().unwrap(), b"bbbbbbbb".to_vec());

        let mut empty = Memory::default();
        empty.swap(&mut a);
        assert!(!a.is_initialized());
        assert_eq!(empty.size(), 8);
        assert_eq!(driver.stats().frees, 0);
    }

    #[test]
    fn test_host_mapped_memory_exposes_host_ptr() {
        let host = MemoryProperties::default().with_host(true);
        for mode in [Mode::Cuda, Mode::Hip] {
            let (_, device) = device(mode);
            let memory = device.malloc(32, Some(&[7u8; 32]), &host).unwrap();

            let base = memory.host_ptr().unwrap().expect("pinned host alias");
            let tail = memory.slice_from(16).unwrap();
            assert_eq!(tail.host_ptr().unwrap(), Some(base.offset(16).unwrap()));

            // SAFETY: the allocation stays live for the whole read
            let mapped = unsafe { std::slice::from_raw_parts(base.as_ptr(), 32) };
            assert_eq!(mapped, &[7u8; 32][..], "{mode}");
        }

        let (_, opencl) = device(Mode::OpenCl);
        let pinned = opencl.malloc(32, None, &host).unwrap();
        assert_eq!(pinned.host_ptr().unwrap(), None);

        let (_, hip) = device(Mode::Hip);
        let plain = hip.malloc(32, None, &MemoryProperties::default()).unwrap();
        assert_eq!(plain.host_ptr().unwrap(), None);
        plain.free().unwrap();
        assert_eq!(plain.host_ptr().unwrap_err().kind(), ErrorKind::UseAfterFree);
    }

    #[test]
    fn test_cast_keeps_bytes() {
        let (_, device) = device(Mode::Dpcpp);
        let memory = floats(&device, 8);
        let as_float4 = memory.cast(&dtype::FLOAT4).unwrap();

        assert_eq!(as_float4.size(), memory.size());
        assert_eq!(as_float4.length(), 2);
        assert_eq!(as_float4.ptr().unwrap(), memory.ptr().unwrap());
        assert_eq!(memory.dtype().unwrap(), *dtype::FLOAT);

        let unknown = Dtype::new("memory_test_unregistered", 3);
        assert_eq!(memory.cast(&unknown).unwrap_err().kind(), ErrorKind::UnregisteredType);
    }

    #[test]
    fn test_set_dtype_is_shared_by_clones() {
        let (_, device) = device(Mode::Cuda);
        let memory = floats(&device, 4);
        let clone = memory.clone();
        memory.set_dtype(&dtype::INT2).unwrap();
        assert_eq!(clone.length(), 2);
        assert!(memory.set_dtype(&Dtype::new("memory_test_retag", 2)).is_err());
    }

    #[test]
    fn test_host_round_trip_with_offsets() {
        let (_, device) = device(Mode::Hip);
        let memory = device.malloc(16, None, &MemoryProperties::default()).unwrap();
        let props = MemoryProperties::default();

        memory.copy_from_host(b"abcd", 4, 6, &props).unwrap();
        let mut out = [0u8; 4];
        memory.copy_to_host(&mut out, 4, 6, &props).unwrap();
        assert_eq!(&out, b"abcd");

        assert_eq!(
            memory.copy_from_host(b"abcd", 8, 0, &props).unwrap_err().kind(),
            ErrorKind::OutOfBounds
        );
        assert_eq!(
            memory.copy_to_host(&mut out, 4, 13, &props).unwrap_err().kind(),
            ErrorKind::OutOfBounds
        );
    }

    #[test]
    fn test_zero_byte_copy_issues_no_native_call() {
        let (driver, device) = device(Mode::Cuda);
        let a = device.malloc(8, None, &MemoryProperties::default()).unwrap();
        let b = device.malloc(8, None, &MemoryProperties::default()).unwrap();

        a.copy_from(&b, 0, 8, 8, &MemoryProperties::default()).unwrap();
        a.copy_from_host(&[], 0, 0, &MemoryProperties::default()).unwrap();
        assert_eq!(
            a.copy_from(&b, 0, -1, 0, &MemoryProperties::default()).unwrap_err().kind(),
            ErrorKind::NegativeOffset
        );

        let stats = driver.stats();
        assert_eq!(stats.htod + stats.dtoh + stats.dtod, 0);
    }

    #[test]
    fn test_device_to_device_copy() {
        let (driver, device) = device(Mode::OpenCl);
        let src = device.malloc_from(&[1u32, 2, 3, 4], &MemoryProperties::default()).unwrap();
        let dst = device.malloc_typed(4, &dtype::UINT32, None, &MemoryProperties::default()).unwrap();

        dst.copy_from(&src, 8, 0, 8, &MemoryProperties::default()).unwrap();
        src.copy_to(&dst, 8, 8, 0, &MemoryProperties::default()).unwrap();
        assert_eq!(dst.to_vec::<u32>().unwrap(), vec![3, 4, 1, 2]);
        assert_eq!(driver.stats().dtod, 2);
    }

    #[test]
    fn test_copy_to_defaults_to_source_size() {
        let (_, device) = device(Mode::Cuda);
        let small = device.malloc(4, Some(b"wxyz"), &MemoryProperties::default()).unwrap();
        let large = device.malloc(8, Some(&[0u8; 8]), &MemoryProperties::default()).unwrap();

        small.copy_to(&large, ALL_BYTES, 4, 0, &MemoryProperties::default()).unwrap();
        assert_eq!(large.to_vec::<u8>().unwrap(), b"\0\0\0\0wxyz".to_vec());

        assert_eq!(
            large.copy_to(&small, ALL_BYTES, 0, 0, &MemoryProperties::default()).unwrap_err().kind(),
            ErrorKind::OutOfBounds
        );
    }

    #[test]
    fn test_cross_device_copy_is_staged() {
        let (driver_a, a) = device(Mode::Cuda);
        let (driver_b, b) = device(Mode::OpenCl);
        let src = a.malloc(4, Some(b"ping"), &MemoryProperties::default()).unwrap();
        let dst = b.malloc(4, None, &MemoryProperties::default()).unwrap();

        dst.copy_from(&src, ALL_BYTES, 0, 0, &MemoryProperties::asynchronous()).unwrap();
        assert_eq!(dst.to_vec::<u8>().unwrap(), b"ping".to_vec());
        assert_eq!(driver_a.stats().dtoh, 1);
        assert_eq!(driver_b.stats().htod, 1);
    }

    #[test]
    fn test_free_invalidates_every_view() {
        let (driver, device) = device(Mode::Cuda);
        let memory = floats(&device, 8);
        let slice = memory.slice(2, 2).unwrap();

        slice.free().unwrap();
        assert!(memory.is_freed());
        assert_eq!(memory.ptr().unwrap_err().kind(), ErrorKind::UseAfterFree);
        assert_eq!(memory.to_vec::<f32>().unwrap_err().kind(), ErrorKind::UseAfterFree);
        assert_eq!(
            memory.copy_from(&slice, 4, 0, 0, &MemoryProperties::default()).unwrap_err().kind(),
            ErrorKind::UseAfterFree
        );

        memory.free().unwrap();
        drop((memory, slice));
        assert_eq!(driver.stats().frees, 1);
        assert_eq!(device.memory_size(), 0);
    }

    #[test]
    fn test_dont_use_refs_requires_explicit_free() {
        let (driver, device) = device(Mode::Hip);
        let memory = device.malloc(8, None, &MemoryProperties::default()).unwrap();
        memory.dont_use_refs().unwrap();
        let ptr = memory.address().unwrap();
        drop(memory);

        assert_eq!(driver.stats().frees, 0);
        assert_eq!(driver.live_allocations(), 1);
        assert_eq!(device.memory_size(), 8);
        assert!(!ptr.is_null());
    }

    #[test]
    fn test_detach_leaves_memory_usable() {
        let (driver, device) = device(Mode::Dpcpp);
        let memory = device.malloc(8, Some(b"detached"), &MemoryProperties::default()).unwrap();
        memory.detach().unwrap();
        memory.free().unwrap();

        assert!(!memory.is_freed());
        assert_eq!(memory.to_vec::<u8>().unwrap(), b"detached".to_vec());
        drop(memory);
        assert_eq!(driver.stats().frees, 0);
    }

    #[test]
    fn test_duplicate_is_independent() {
        let (driver, device) = device(Mode::Cuda);
        let original = device.malloc_from(&[1.0f32, 2.0], &MemoryProperties::default()).unwrap();
        let copy = original.duplicate().unwrap();

        assert_ne!(copy, original);
        assert_eq!(copy.dtype().unwrap(), *dtype::FLOAT);
        copy.copy_from_slice(&[9.0f32]).unwrap();
        assert_eq!(original.to_vec::<f32>().unwrap(), vec![1.0, 2.0]);
        assert_eq!(copy.to_vec::<f32>().unwrap(), vec![9.0, 2.0]);

        drop((original, copy));
        assert_eq!(driver.stats().frees, 2);
    }

    #[test]
    fn test_kernel_arg_per_mode() {
        let (_, cuda) = device(Mode::Cuda);
        let memory = floats(&cuda, 4);
        let arg = memory.slice(1, 2).unwrap().kernel_arg().unwrap();
        assert_eq!(arg.bytes, 8);
        assert_eq!(arg.dtype, *dtype::FLOAT);
        assert!(matches!(arg.arg, NativeArg::Pointer(addr) if addr == memory.address().unwrap().addr() + 4));

        let (_, opencl) = device(Mode::OpenCl);
        let memory = floats(&opencl, 4);
        let arg = memory.slice(2, 1).unwrap().kernel_arg().unwrap();
        assert!(matches!(arg.arg, NativeArg::MemObject { origin: 8, .. }));
    }

    #[test]
    fn test_debug_output() {
        let (_, device) = device(Mode::Cuda);
        let memory = device.malloc(4, None, &MemoryProperties::default()).unwrap();
        let text = format!("{memory:?}");
        assert!(text.contains("size: 4"));
        assert!(text.contains("Owned"));
        assert_eq!(format!("{:?}", Memory::default()), "Memory(uninitialized)");
    }
}
