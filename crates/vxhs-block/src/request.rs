//! Per-request state
//!
//! A [`RequestBlock`] lives from submission until its completion callback
//! runs. Between those points the driver borrows the caller's [`IoVector`]
//! and hands it back inside the [`Completion`].
//!
//! The segment counter is a join barrier: it is raised once per transport
//! submission and lowered once per transport callback, and whichever
//! callback takes it to zero pushes the request onto the completion queue.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::error;

use crate::error::{BlockError, BlockResult};
use crate::segment::Segment;
use crate::vdisk::VDiskShared;

/// I/O direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
    /// Flushes are synchronous ioctls and never become request blocks
    Flush,
}

/// Lifecycle of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    InProgress,
    Completed,
}

/// Caller-owned scatter/gather list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IoVector {
    bufs: Vec<Vec<u8>>,
}

impl IoVector {
    pub fn new(bufs: Vec<Vec<u8>>) -> Self {
        Self { bufs }
    }

    /// Single contiguous buffer
    pub fn from_buf(buf: Vec<u8>) -> Self {
        Self { bufs: vec![buf] }
    }

    /// Zero-filled single buffer, typically a read target
    pub fn zeroed(len: usize) -> Self {
        Self::from_buf(vec![0; len])
    }

    /// Total length in bytes
    pub fn len(&self) -> usize {
        self.bufs.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn buffers(&self) -> &[Vec<u8>] {
        &self.bufs
    }

    pub fn into_buffers(self) -> Vec<Vec<u8>> {
        self.bufs
    }

    /// Concatenate all buffers
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for buf in &self.bufs {
            out.extend_from_slice(buf);
        }
        out
    }

    /// Copy `src` across the buffers in order; returns bytes copied
    pub fn scatter_from(&mut self, src: &[u8]) -> usize {
        let mut copied = 0;
        for buf in &mut self.bufs {
            if copied == src.len() {
                break;
            }
            let n = buf.len().min(src.len() - copied);
            buf[..n].copy_from_slice(&src[copied..copied + n]);
            copied += n;
        }
        copied
    }
}

/// What the host completion callback receives
#[derive(Debug)]
pub struct Completion {
    pub request_id: u64,
    pub direction: Direction,
    pub offset: u64,
    /// `Ok(())` or [`BlockError::Io`]
    pub status: BlockResult<()>,
    /// The caller's buffers; filled for successful reads
    pub iov: IoVector,
}

/// Host completion callback
pub type CompletionCallback = Box<dyn FnOnce(Completion) + Send + 'static>;

/// Stable contiguous copy of the request data
enum Bounce {
    /// Segments land here and are scattered into the iovec on completion
    Read(Vec<u8>),
    /// Gathered once at submission; segments are slices of it
    Write(Bytes),
}

struct Payload {
    iov: Option<IoVector>,
    bounce: Option<Bounce>,
    callback: Option<CompletionCallback>,
    state: RequestState,
}

/// Per-request control block
pub struct RequestBlock {
    id: u64,
    owner: Arc<VDiskShared>,
    direction: Direction,
    offset: u64,
    length: usize,
    /// Outstanding transport submissions
    segments: AtomicI32,
    /// First non-zero transport error, sticky
    result: AtomicI32,
    /// Linked on the retry queue; only changed under the vdisk lock
    queued: AtomicBool,
    /// Holds one slot of the vdisk's in-flight count
    inflight: AtomicBool,
    payload: Mutex<Payload>,
}

impl RequestBlock {
    pub(crate) fn new(
        id: u64,
        owner: Arc<VDiskShared>,
        direction: Direction,
        offset: u64,
        iov: IoVector,
        callback: CompletionCallback,
    ) -> Self {
        let length = iov.len();
        let bounce = match direction {
            Direction::Read => Some(Bounce::Read(vec![0; length])),
            Direction::Write => Some(Bounce::Write(Bytes::from(iov.to_vec()))),
            Direction::Flush => None,
        };

        Self {
            id,
            owner,
            direction,
            offset,
            length,
            segments: AtomicI32::new(0),
            result: AtomicI32::new(0),
            queued: AtomicBool::new(false),
            inflight: AtomicBool::new(false),
            payload: Mutex::new(Payload {
                iov: Some(iov),
                bounce,
                callback: Some(callback),
                state: RequestState::InProgress,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub(crate) fn owner(&self) -> &Arc<VDiskShared> {
        &self.owner
    }

    pub fn state(&self) -> RequestState {
        self.payload.lock().state
    }

    // ── Segment accounting ───────────────────────────────────────────────────

    pub fn segments(&self) -> i32 {
        self.segments.load(Ordering::Acquire)
    }

    pub(crate) fn increment_segments(&self, count: i32) {
        self.segments.fetch_add(count, Ordering::AcqRel);
    }

    pub(crate) fn decrement_segments(&self, count: i32) {
        self.decrement_and_get(count);
    }

    /// Lower the counter and return the new value. A negative count means a
    /// callback arrived for a segment that was never submitted, and the
    /// process is aborted.
    pub(crate) fn decrement_and_get(&self, count: i32) -> i32 {
        let remaining = self.segments.fetch_sub(count, Ordering::AcqRel) - count;
        if remaining < 0 {
            error!(
                "request {} segment count went negative ({remaining})",
                self.id
            );
            std::process::abort();
        }
        remaining
    }

    /// Record `err` unless an earlier error was already recorded
    pub(crate) fn set_error_once(&self, err: i32) -> bool {
        self.result
            .compare_exchange(0, err, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Sticky transport error, 0 if none
    pub fn result(&self) -> i32 {
        self.result.load(Ordering::Acquire)
    }

    // ── Queue linkage (vdisk lock held) ──────────────────────────────────────

    pub fn is_queued(&self) -> bool {
        self.queued.load(Ordering::Acquire)
    }

    pub(crate) fn mark_queued(&self) {
        self.queued.store(true, Ordering::Release);
    }

    pub(crate) fn clear_queued(&self) {
        self.queued.store(false, Ordering::Release);
    }

    /// Returns the previous value
    pub(crate) fn set_inflight(&self, held: bool) -> bool {
        self.inflight.swap(held, Ordering::AcqRel)
    }

    // ── Data movement ────────────────────────────────────────────────────────

    /// Slice of the write bounce buffer a segment sends
    pub(crate) fn write_payload(&self, segment: &Segment) -> Option<Bytes> {
        match self.payload.lock().bounce.as_ref() {
            Some(Bounce::Write(data)) => Some(data.slice(segment.range())),
            _ => None,
        }
    }

    /// Copy a read segment into the bounce buffer. Returns false when the
    /// agent returned the wrong amount of data.
    pub(crate) fn store_read_data(&self, segment: &Segment, data: &[u8]) -> bool {
        if data.len() != segment.len {
            return false;
        }
        match self.payload.lock().bounce.as_mut() {
            Some(Bounce::Read(buf)) => {
                buf[segment.range()].copy_from_slice(data);
                true
            }
            _ => false,
        }
    }

    /// Move the request to `Completed` and hand out its callback together
    /// with the caller's buffers. Returns `None` if it already completed.
    pub(crate) fn finish(&self) -> Option<(CompletionCallback, Completion)> {
        let mut payload = self.payload.lock();
        if payload.state == RequestState::Completed {
            return None;
        }
        payload.state = RequestState::Completed;

        let mut iov = payload.iov.take().unwrap_or_default();
        let result = self.result();
        if let Some(Bounce::Read(buf)) = payload.bounce.take()
            && result == 0
        {
            iov.scatter_from(&buf);
        }

        let callback = payload.callback.take()?;
        let status = if result == 0 {
            Ok(())
        } else {
            Err(BlockError::Io)
        };

        Some((
            callback,
            Completion {
                request_id: self.id,
                direction: self.direction,
                offset: self.offset,
                status,
                iov,
            },
        ))
    }
}

impl fmt::Debug for RequestBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestBlock")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("segments", &self.segments())
            .field("result", &self.result())
            .field("queued", &self.is_queued())
            .finish_non_exhaustive()
    }
}

/// Caller's view of a submitted request
#[derive(Clone, Debug)]
pub struct RequestHandle(pub(crate) Arc<RequestBlock>);

impl RequestHandle {
    pub fn id(&self) -> u64 {
        self.0.id()
    }

    pub fn state(&self) -> RequestState {
        self.0.state()
    }

    /// Parked on the retry queue while a failover runs
    pub fn is_queued(&self) -> bool {
        self.0.is_queued()
    }

    pub fn segments(&self) -> i32 {
        self.0.segments()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestRig;

    fn noop() -> CompletionCallback {
        Box::new(|_| {})
    }

    #[test]
    fn test_iovector_scatter_gather() {
        let mut iov = IoVector::new(vec![vec![0; 3], vec![0; 2], vec![0; 4]]);
        assert_eq!(iov.len(), 9);

        let copied = iov.scatter_from(&[1, 2, 3, 4, 5, 6]);
        assert_eq!(copied, 6);
        assert_eq!(iov.buffers()[0], vec![1, 2, 3]);
        assert_eq!(iov.buffers()[1], vec![4, 5]);
        assert_eq!(iov.buffers()[2], vec![6, 0, 0, 0]);
        assert_eq!(iov.to_vec(), vec![1, 2, 3, 4, 5, 6, 0, 0, 0]);
    }

    #[test]
    fn test_segment_counter() {
        let rig = TestRig::single_host();
        let req = rig.request(Direction::Read, 0, IoVector::zeroed(512), noop());

        req.increment_segments(3);
        assert_eq!(req.segments(), 3);
        req.decrement_segments(1);
        assert_eq!(req.decrement_and_get(1), 1);
        assert_eq!(req.decrement_and_get(1), 0);
    }

    #[test]
    fn test_error_is_sticky() {
        let rig = TestRig::single_host();
        let req = rig.request(Direction::Read, 0, IoVector::zeroed(512), noop());

        assert_eq!(req.result(), 0);
        assert!(req.set_error_once(5));
        assert!(!req.set_error_once(903));
        assert_eq!(req.result(), 5);
    }

    #[test]
    fn test_finish_scatters_read_and_runs_once() {
        let rig = TestRig::single_host();
        let req = rig.request(
            Direction::Read,
            0,
            IoVector::new(vec![vec![0; 2], vec![0; 2]]),
            noop(),
        );
        let segment = Segment {
            index: 0,
            disk_offset: 0,
            start: 0,
            len: 4,
        };
        assert!(req.store_read_data(&segment, &[9, 8, 7, 6]));
        assert!(!req.store_read_data(&segment, &[1]));

        let (_, completion) = req.finish().unwrap();
        assert!(completion.status.is_ok());
        assert_eq!(completion.iov.to_vec(), vec![9, 8, 7, 6]);
        assert_eq!(req.state(), RequestState::Completed);
        assert!(req.finish().is_none());
    }

    #[test]
    fn test_finish_masks_error() {
        let rig = TestRig::single_host();
        let req = rig.request(Direction::Write, 0, IoVector::from_buf(vec![1; 8]), noop());
        req.set_error_once(5);

        let (_, completion) = req.finish().unwrap();
        assert!(matches!(completion.status, Err(BlockError::Io)));
        assert_eq!(completion.iov.to_vec(), vec![1; 8]);
    }

    #[test]
    fn test_write_payload_slices_bounce() {
        let rig = TestRig::single_host();
        let req = rig.request(
            Direction::Write,
            0,
            IoVector::new(vec![vec![1, 2], vec![3, 4, 5]]),
            noop(),
        );
        let segment = Segment {
            index: 1,
            disk_offset: 2,
            start: 2,
            len: 3,
        };
        assert_eq!(req.write_payload(&segment).unwrap().as_ref(), &[3, 4, 5]);
    }
}
