//! Command queues and completion tags
//!
//! A [`Stream`] is an ordered queue on one device; work enqueued on it
//! completes in FIFO order. A [`StreamTag`] marks a point in that order and
//! is only comparable with tags from the same stream.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lattice_backends::{Adapter, Backend, EventId, QueueId};

use crate::error::Result;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

struct StreamInner {
    id: u64,
    device_id: u64,
    queue: QueueId,
    /// Queue was created by lattice and is destroyed with the stream
    owned: bool,
    backend: Adapter,
    next_sequence: AtomicU64,
}

/// Ordered command queue on one device
///
/// Clones share the same native queue.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

impl Stream {
    pub(crate) fn new(device_id: u64, backend: Adapter, queue: QueueId, owned: bool) -> Self {
        let id = NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(stream_id = id, device_id, queue = queue.id(), owned, "stream_created");
        Self {
            inner: Arc::new(StreamInner {
                id,
                device_id,
                queue,
                owned,
                backend,
                next_sequence: AtomicU64::new(0),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn device_id(&self) -> u64 {
        self.inner.device_id
    }

    /// Native queue operations are enqueued on
    pub fn queue(&self) -> QueueId {
        self.inner.queue
    }

    pub(crate) fn tag(&self) -> Result<StreamTag> {
        let event = self.inner.backend.tag_queue(self.inner.queue)?;
        let sequence = self.inner.next_sequence.fetch_add(1, Ordering::Relaxed);
        Ok(StreamTag {
            inner: Arc::new(TagInner {
                stream: self.inner.clone(),
                event,
                sequence,
            }),
        })
    }

    pub(crate) fn finish(&self) -> Result<()> {
        self.inner.backend.finish(self.inner.queue)?;
        Ok(())
    }
}

impl PartialEq for Stream {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Stream {}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.inner.id)
            .field("device_id", &self.inner.device_id)
            .field("queue", &self.inner.queue)
            .field("owned", &self.inner.owned)
            .finish()
    }
}

impl Drop for StreamInner {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }
        if let Err(err) = self.backend.destroy_queue(self.queue) {
            tracing::warn!(stream_id = self.id, error = %err, "stream_destroy_failed");
        }
    }
}

struct TagInner {
    /// Keeps the queue the event was recorded on alive
    stream: Arc<StreamInner>,
    event: EventId,
    sequence: u64,
}

/// Completion marker placed on a stream
///
/// A tag holds its stream, so a created queue outlives the last `Stream`
/// handle until every tag recorded on it has been dropped.
#[derive(Clone)]
pub struct StreamTag {
    inner: Arc<TagInner>,
}

impl StreamTag {
    pub fn device_id(&self) -> u64 {
        self.inner.stream.device_id
    }

    pub fn stream_id(&self) -> u64 {
        self.inner.stream.id
    }

    /// Position of the tag among the tags of its stream
    pub fn sequence(&self) -> u64 {
        self.inner.sequence
    }

    pub(crate) fn event(&self) -> EventId {
        self.inner.event
    }
}

impl fmt::Debug for StreamTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamTag")
            .field("device_id", &self.inner.stream.device_id)
            .field("stream_id", &self.inner.stream.id)
            .field("sequence", &self.inner.sequence)
            .finish()
    }
}

impl Drop for TagInner {
    fn drop(&mut self) {
        if let Err(err) = self.stream.backend.release_tag(self.event) {
            tracing::warn!(stream_id = self.stream.id, error = %err, "stream_tag_release_failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_backends::{HostDriver, Mode};

    fn backend(driver: &Arc<HostDriver>) -> Adapter {
        Adapter::new(Mode::Dpcpp, driver.clone(), 0)
    }

    #[test]
    fn test_owned_stream_destroys_its_queue() {
        let driver = Arc::new(HostDriver::new());
        let backend = backend(&driver);
        let queue = backend.create_queue().unwrap();
        assert_eq!(driver.live_queues(), 2);

        let stream = Stream::new(1, backend, queue, true);
        let copy = stream.clone();
        drop(stream);
        assert_eq!(driver.live_queues(), 2);
        drop(copy);
        assert_eq!(driver.live_queues(), 1);
    }

    #[test]
    fn test_wrapped_stream_keeps_queue() {
        let driver = Arc::new(HostDriver::new());
        let backend = backend(&driver);
        let queue = backend.create_queue().unwrap();

        drop(Stream::new(1, backend, queue, false));
        assert_eq!(driver.live_queues(), 2);
    }

    #[test]
    fn test_tags_are_sequenced_and_released() {
        let driver = Arc::new(HostDriver::new());
        let stream = Stream::new(7, backend(&driver), QueueId::DEFAULT, false);

        let first = stream.tag().unwrap();
        let second = stream.tag().unwrap();
        assert_eq!((first.sequence(), second.sequence()), (0, 1));
        assert_eq!(first.stream_id(), stream.id());
        assert_eq!(second.device_id(), 7);
        assert_eq!(driver.live_events(), 2);

        drop(first);
        drop(second);
        assert_eq!(driver.live_events(), 0);
    }

    #[test]
    fn test_tag_keeps_owned_queue_alive() {
        let driver = Arc::new(HostDriver::new());
        let backend = backend(&driver);
        let queue = backend.create_queue().unwrap();
        let stream = Stream::new(3, backend.clone(), queue, true);

        let tag = stream.tag().unwrap();
        drop(stream);
        assert_eq!(driver.live_queues(), 2);

        backend.wait_for(tag.event()).unwrap();
        assert_eq!(tag.device_id(), 3);

        drop(tag);
        assert_eq!(driver.live_queues(), 1);
        assert_eq!(driver.live_events(), 0);
    }

    #[test]
    fn test_stream_ids_are_unique() {
        let driver = Arc::new(HostDriver::new());
        let a = Stream::new(1, backend(&driver), QueueId::DEFAULT, false);
        let b = Stream::new(1, backend(&driver), QueueId::DEFAULT, false);
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }
}
