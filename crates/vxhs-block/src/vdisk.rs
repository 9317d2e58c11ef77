//! Per-vDisk state and the submission path
//!
//! A [`VDisk`] is the handle the host block layer holds for one opened
//! vdisk. Its shared state is reachable from every [`RequestBlock`] through
//! the owner back-reference, which is how transport callbacks and the
//! failover thread find it.
//!
//! Locking: `state` (the vdisk lock) guards host selection, the in-flight
//! count, the retry queue and the failover flags. Per-request bookkeeping
//! lives in atomics and the request payload mutex; the vdisk lock is always
//! taken first when both are needed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use vxhs_common::{DriverConfig, HostAddr, VDiskConfig};

use crate::completion::CompletionSender;
use crate::driver::ChannelPool;
use crate::error::{BlockError, BlockResult};
use crate::failover::{self, FailoverState};
use crate::request::{CompletionCallback, Direction, IoVector, RequestBlock, RequestHandle};
use crate::segment::SegmentMapper;
use crate::stats::{StatsSnapshot, VDiskStats};
use crate::transport::{
    ChannelHandle, DeviceHandle, IoContext, IoFlags, IoctlOp, SegmentContext, TransportError,
    codes,
};

/// One storage agent endpoint and the handles opened on it
#[derive(Debug)]
pub(crate) struct HostInfo {
    pub addr: HostAddr,
    /// Opened lazily, shared process-wide through the channel pool
    pub channel: Option<ChannelHandle>,
    /// Opened on use, closed only on failover
    pub device: Option<DeviceHandle>,
}

/// Channel and device a submission goes to
#[derive(Debug, Clone, Copy)]
pub(crate) struct Target {
    pub channel: ChannelHandle,
    pub device: DeviceHandle,
}

/// How a transport callback ended for one segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SegmentOutcome {
    Ok,
    /// Agent-side failure; the request completes with EIO
    DiskError(i32),
    /// The channel dropped; the request waits for failover
    ChannelDrop(i32),
}

/// Synchronous failure part-way through dispatching a request
#[derive(Debug)]
pub(crate) struct DispatchError {
    pub error: TransportError,
    /// Segments accepted by the transport before the failure
    pub submitted: usize,
    /// Segments counted but never handed to the transport
    pub unsubmitted: i32,
}

/// What became of a request after a synchronous submission failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchFailure {
    /// Parked on the retry queue for the failover thread
    Requeued,
    /// Failed with EIO; completes through the callback
    Completing,
    /// Released without reaching the transport
    Dropped,
}

/// State guarded by the vdisk lock
#[derive(Debug)]
pub(crate) struct VDiskInner {
    pub hosts: Vec<HostInfo>,
    pub current_host_idx: usize,
    pub probe_host_idx: usize,
    pub inflight_count: u32,
    pub retry_queue: VecDeque<Arc<RequestBlock>>,
    pub failover_in_progress: bool,
    pub failed: bool,
    pub closed: bool,
    /// A failover thread owns the FSM
    pub fsm_active: bool,
    /// The FSM is replaying the retry queue
    pub recovering: bool,
}

impl VDiskInner {
    fn new(hosts: Vec<HostInfo>) -> Self {
        Self {
            hosts,
            current_host_idx: 0,
            probe_host_idx: 0,
            inflight_count: 0,
            retry_queue: VecDeque::new(),
            failover_in_progress: false,
            failed: false,
            closed: false,
            fsm_active: false,
            recovering: false,
        }
    }

    pub fn current_target(&self) -> Option<Target> {
        let host = self.hosts.get(self.current_host_idx)?;
        Some(Target {
            channel: host.channel?,
            device: host.device?,
        })
    }

    /// Take one in-flight slot for `req`
    pub fn acquire_inflight(&mut self, req: &RequestBlock) {
        if !req.set_inflight(true) {
            self.inflight_count += 1;
        }
    }

    /// Give back the slot `req` holds, if any. Returns true when the caller
    /// must start the failover FSM.
    pub fn release_inflight(&mut self, req: &RequestBlock) -> bool {
        if !req.set_inflight(false) {
            return false;
        }
        if self.inflight_count == 0 {
            error!("vdisk in-flight count underflow releasing request {}", req.id());
            std::process::abort();
        }
        self.inflight_count -= 1;
        self.claim_failover()
    }

    /// Hand the FSM to the caller if failover is pending and nothing is in
    /// flight any more
    pub fn claim_failover(&mut self) -> bool {
        if self.inflight_count == 0
            && self.failover_in_progress
            && !self.fsm_active
            && !self.failed
            && !self.closed
        {
            self.fsm_active = true;
            true
        } else {
            false
        }
    }

    pub fn enqueue_retry(&mut self, req: &Arc<RequestBlock>, stats: &VDiskStats) {
        if req.is_queued() {
            return;
        }
        req.mark_queued();
        self.retry_queue.push_back(Arc::clone(req));
        stats.record_retry();
    }

    pub fn pop_retry(&mut self) -> Option<Arc<RequestBlock>> {
        let req = self.retry_queue.pop_front()?;
        req.clear_queued();
        Some(req)
    }

    pub fn failover_state(&self) -> FailoverState {
        if self.failed {
            FailoverState::Failed
        } else if self.recovering {
            FailoverState::Recovered
        } else if self.failover_in_progress {
            FailoverState::Switching(self.probe_host_idx)
        } else {
            FailoverState::Idle
        }
    }
}

/// State shared by the vdisk handle, its requests and the failover thread
pub(crate) struct VDiskShared {
    pub vdisk_id: String,
    pub device_path: String,
    pub pool: Arc<ChannelPool>,
    pub settings: DriverConfig,
    pub mapper: SegmentMapper,
    pub state: Mutex<VDiskInner>,
    pub completions: CompletionSender,
    pub stats: VDiskStats,
    redundant: bool,
    size_bytes: AtomicU64,
    next_request_id: AtomicU64,
}

impl VDiskShared {
    pub fn new(
        config: &VDiskConfig,
        pool: Arc<ChannelPool>,
        settings: DriverConfig,
        primary: Target,
        completions: CompletionSender,
    ) -> Self {
        let hosts = config
            .hosts
            .iter()
            .enumerate()
            .map(|(idx, addr)| HostInfo {
                addr: addr.clone(),
                channel: (idx == 0).then_some(primary.channel),
                device: (idx == 0).then_some(primary.device),
            })
            .collect();

        Self {
            vdisk_id: config.vdisk_id.clone(),
            device_path: config.device_path(),
            pool,
            mapper: SegmentMapper::new(settings.max_io_size),
            settings,
            state: Mutex::new(VDiskInner::new(hosts)),
            completions,
            stats: VDiskStats::new(),
            redundant: config.has_redundancy(),
            size_bytes: AtomicU64::new(0),
            next_request_id: AtomicU64::new(1),
        }
    }

    pub fn is_redundant(&self) -> bool {
        self.redundant
    }

    pub fn new_request(
        self: &Arc<Self>,
        direction: Direction,
        offset: u64,
        iov: IoVector,
        callback: CompletionCallback,
    ) -> Arc<RequestBlock> {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        Arc::new(RequestBlock::new(
            id,
            Arc::clone(self),
            direction,
            offset,
            iov,
            callback,
        ))
    }

    // ── Submission ───────────────────────────────────────────────────────────

    fn submit(
        self: &Arc<Self>,
        direction: Direction,
        offset: u64,
        iov: IoVector,
        callback: CompletionCallback,
    ) -> BlockResult<RequestHandle> {
        if direction == Direction::Flush {
            return Err(BlockError::invalid_request(
                "flush is not submitted as a request",
            ));
        }
        if iov.is_empty() {
            self.stats.record_rejected();
            return Err(BlockError::invalid_request("zero-length request"));
        }
        if SegmentMapper::end_offset(offset, iov.len()).is_none() {
            self.stats.record_rejected();
            return Err(BlockError::invalid_request(format!(
                "request of {} bytes at offset {offset} runs past the end of the address space",
                iov.len()
            )));
        }

        let req = self.new_request(direction, offset, iov, callback);

        let target = {
            let mut inner = self.state.lock();
            if inner.closed {
                self.stats.record_rejected();
                return Err(BlockError::Closed(self.vdisk_id.clone()));
            }
            if inner.failed {
                self.stats.record_rejected();
                debug!("vdisk {} has failed, rejecting request", self.vdisk_id);
                return Err(BlockError::VDiskFailed(self.vdisk_id.clone()));
            }
            self.record_accepted(&req);
            if inner.failover_in_progress {
                debug!(
                    "failover in progress on {}, queueing request {}",
                    self.vdisk_id,
                    req.id()
                );
                inner.enqueue_retry(&req, &self.stats);
                // Picks up a failover whose thread could not be started
                let start_failover = inner.claim_failover();
                drop(inner);
                if start_failover {
                    failover::spawn(Arc::clone(self));
                }
                return Ok(RequestHandle(req));
            }
            inner.acquire_inflight(&req);
            inner.current_target()
        };

        match self.dispatch(&req, target) {
            Ok(()) => Ok(RequestHandle(req)),
            Err(err) => {
                self.on_submit_error(&req, err)?;
                Ok(RequestHandle(req))
            }
        }
    }

    fn record_accepted(&self, req: &RequestBlock) {
        let bytes = req.len() as u64;
        match req.direction() {
            Direction::Read => self.stats.record_read(bytes),
            Direction::Write => self.stats.record_write(bytes),
            Direction::Flush => {}
        }
    }

    /// Send every segment of `req` to `target`. The segment counter is
    /// raised for all segments up front so that early callbacks cannot
    /// complete the request while later segments are still being sent.
    pub fn dispatch(
        &self,
        req: &Arc<RequestBlock>,
        target: Option<Target>,
    ) -> Result<(), DispatchError> {
        let segments = self.mapper.split(req.offset(), req.len());
        let total = i32::try_from(segments.len()).unwrap_or(i32::MAX);
        req.increment_segments(total);

        for (idx, segment) in segments.into_iter().enumerate() {
            let result = match target {
                None => Err(TransportError::Submit {
                    code: codes::CHANNEL_HUP,
                }),
                Some(target) => {
                    let ctx = IoContext::Segment(SegmentContext {
                        request: Arc::clone(req),
                        segment,
                    });
                    let transport = self.pool.transport();
                    match req.direction() {
                        Direction::Write => transport.submit_writev(
                            target.channel,
                            target.device,
                            req.write_payload(&segment).unwrap_or_default(),
                            segment.disk_offset,
                            ctx,
                            IoFlags::ASYNC_DONE,
                        ),
                        _ => transport.submit_readv(
                            target.channel,
                            target.device,
                            segment.len,
                            segment.disk_offset,
                            ctx,
                            IoFlags::ASYNC_DONE,
                        ),
                    }
                }
            };

            if let Err(error) = result {
                let submitted = idx;
                return Err(DispatchError {
                    error,
                    submitted,
                    unsubmitted: total - i32::try_from(submitted).unwrap_or(total),
                });
            }
            self.stats.record_segments(1);
        }

        Ok(())
    }

    /// Handle a synchronous failure while submitting a fresh request.
    /// Returns `Err` when the request was dropped without any segment
    /// reaching the transport; the caller reports that error synchronously.
    fn on_submit_error(
        self: &Arc<Self>,
        req: &Arc<RequestBlock>,
        err: DispatchError,
    ) -> BlockResult<()> {
        match self.on_dispatch_error(req, err, false) {
            DispatchFailure::Dropped => Err(BlockError::Io),
            DispatchFailure::Requeued | DispatchFailure::Completing => Ok(()),
        }
    }

    /// Handle a synchronous failure while replaying a queued request. The
    /// caller already holds a handle, so the request is never dropped.
    pub fn on_replay_error(self: &Arc<Self>, req: &Arc<RequestBlock>, err: DispatchError) {
        let outcome = self.on_dispatch_error(req, err, true);
        debug_assert!(outcome != DispatchFailure::Dropped);
    }

    /// `accepted` is true when the caller already holds a handle for the
    /// request, in which case it must be completed through the callback.
    fn on_dispatch_error(
        self: &Arc<Self>,
        req: &Arc<RequestBlock>,
        err: DispatchError,
        accepted: bool,
    ) -> DispatchFailure {
        warn!(
            "vdisk {} request {} submit failed after {} segment(s): {}",
            self.vdisk_id,
            req.id(),
            err.submitted,
            err.error
        );

        let mut complete = false;
        let mut start_failover = false;
        let requeue = {
            let mut inner = self.state.lock();
            let requeue = self.redundant && !inner.failed && !inner.closed;
            if requeue {
                if !inner.failover_in_progress {
                    info!(
                        "vdisk {} starting failover after submit error on host {}",
                        self.vdisk_id, inner.current_host_idx
                    );
                    inner.failover_in_progress = true;
                }
                inner.enqueue_retry(req, &self.stats);
            } else {
                req.set_error_once(libc::EIO);
            }

            if req.decrement_and_get(err.unsubmitted) == 0 {
                if requeue {
                    start_failover = inner.release_inflight(req);
                } else if err.submitted == 0 && !accepted {
                    inner.release_inflight(req);
                    return DispatchFailure::Dropped;
                } else {
                    complete = true;
                }
            }
            requeue
        };

        if complete {
            self.completions.push(Arc::clone(req));
        }
        if start_failover {
            failover::spawn(Arc::clone(self));
        }
        if requeue {
            DispatchFailure::Requeued
        } else {
            DispatchFailure::Completing
        }
    }

    // ── Transport callback side ──────────────────────────────────────────────

    /// Account one finished segment
    pub fn segment_finished(self: &Arc<Self>, req: &Arc<RequestBlock>, outcome: SegmentOutcome) {
        let mut start_failover = false;
        let mut complete = false;

        match outcome {
            SegmentOutcome::ChannelDrop(code) => {
                let mut inner = self.state.lock();
                if inner.failed || inner.closed {
                    req.set_error_once(code);
                    complete = req.decrement_and_get(1) == 0;
                } else {
                    if !inner.failover_in_progress {
                        info!(
                            "vdisk {} channel to host {} dropped (code {code}), failover pending",
                            self.vdisk_id, inner.current_host_idx
                        );
                        inner.failover_in_progress = true;
                    }
                    inner.enqueue_retry(req, &self.stats);
                    if req.decrement_and_get(1) == 0 {
                        start_failover = inner.release_inflight(req);
                    }
                }
            }
            SegmentOutcome::Ok | SegmentOutcome::DiskError(_) => {
                if let SegmentOutcome::DiskError(code) = outcome {
                    debug!(
                        "vdisk {} request {} segment failed with code {code}",
                        self.vdisk_id,
                        req.id()
                    );
                    req.set_error_once(code);
                }
                if req.decrement_and_get(1) == 0 {
                    let mut inner = self.state.lock();
                    if req.is_queued() {
                        start_failover = inner.release_inflight(req);
                    } else {
                        complete = true;
                    }
                }
            }
        }

        if complete {
            self.completions.push(Arc::clone(req));
        }
        if start_failover {
            failover::spawn(Arc::clone(self));
        }
    }

    /// Complete a request that will not be replayed with EIO
    pub fn fail_request(&self, req: &Arc<RequestBlock>) {
        req.set_error_once(libc::EIO);
        if req.segments() == 0 {
            self.completions.push(Arc::clone(req));
        }
    }

    // ── Control operations ───────────────────────────────────────────────────

    fn flush(&self) -> BlockResult<()> {
        let target = {
            let inner = self.state.lock();
            if inner.closed {
                return Err(BlockError::Closed(self.vdisk_id.clone()));
            }
            if inner.failed {
                return Err(BlockError::VDiskFailed(self.vdisk_id.clone()));
            }
            if inner.inflight_count > 0 {
                debug!(
                    "flushing {} with {} request(s) in flight",
                    self.vdisk_id, inner.inflight_count
                );
            }
            inner.current_target()
        };

        let Some(target) = target else {
            warn!("vdisk {} has no open device, flush skipped", self.vdisk_id);
            return Ok(());
        };

        // Acknowledged writes are already durable on the agent
        if let Err(e) = self.pool.transport().ioctl(
            target.channel,
            target.device,
            IoctlOp::Flush,
            None,
            IoFlags::SYNC,
        ) {
            warn!("vdisk {} flush ioctl failed, ignoring: {}", self.vdisk_id, e);
        }
        Ok(())
    }

    fn get_length(&self) -> BlockResult<u64> {
        let cached = self.size_bytes.load(Ordering::Acquire);
        if cached > 0 {
            return Ok(cached);
        }

        let target = {
            let inner = self.state.lock();
            if inner.closed {
                return Err(BlockError::Closed(self.vdisk_id.clone()));
            }
            inner.current_target()
        };
        let Some(target) = target else {
            warn!("vdisk {} has no open device, size unknown", self.vdisk_id);
            return Err(BlockError::Io);
        };

        match self.pool.transport().ioctl(
            target.channel,
            target.device,
            IoctlOp::Stat,
            None,
            IoFlags::SYNC,
        ) {
            Ok(0) => {
                warn!("vdisk {} reported a size of 0 bytes", self.vdisk_id);
                Err(BlockError::Io)
            }
            Ok(size) => {
                debug!("vdisk {} size is {} bytes", self.vdisk_id, size);
                self.size_bytes.store(size, Ordering::Release);
                Ok(size)
            }
            Err(e) => {
                warn!("vdisk {} stat ioctl failed: {}", self.vdisk_id, e);
                Err(BlockError::Io)
            }
        }
    }

    fn close(&self) {
        let (queued, handles) = {
            let mut inner = self.state.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;

            let mut queued = Vec::with_capacity(inner.retry_queue.len());
            while let Some(req) = inner.pop_retry() {
                queued.push(req);
            }
            let handles: Vec<_> = inner
                .hosts
                .iter_mut()
                .filter_map(|host| Some((host.channel?, host.device.take()?)))
                .collect();
            (queued, handles)
        };

        for (channel, device) in handles {
            self.pool.transport().close_device(channel, device);
        }
        self.completions.close();

        if !queued.is_empty() {
            info!(
                "vdisk {} closed with {} queued request(s), failing them",
                self.vdisk_id,
                queued.len()
            );
        }
        for req in queued {
            req.set_error_once(libc::EIO);
            if let Some((callback, completion)) = req.finish() {
                self.stats.record_completion(false);
                callback(completion);
            }
        }
        info!("closed vdisk {}", self.vdisk_id);
    }
}

impl std::fmt::Debug for VDiskShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VDiskShared")
            .field("vdisk_id", &self.vdisk_id)
            .field("device_path", &self.device_path)
            .field("redundant", &self.redundant)
            .finish_non_exhaustive()
    }
}

/// An opened vDisk
///
/// Reads and writes return as soon as the request is handed to the
/// transport; the completion callback runs later on the event loop the
/// vdisk was registered with. Dropping the handle closes the vdisk.
#[derive(Debug)]
pub struct VDisk {
    shared: Arc<VDiskShared>,
}

impl VDisk {
    pub(crate) fn new(shared: Arc<VDiskShared>) -> Self {
        Self { shared }
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<VDiskShared> {
        &self.shared
    }

    /// Read `iov.len()` bytes at `offset` into `iov`
    pub fn read(
        &self,
        offset: u64,
        iov: IoVector,
        callback: CompletionCallback,
    ) -> BlockResult<RequestHandle> {
        self.shared.submit(Direction::Read, offset, iov, callback)
    }

    /// Write the contents of `iov` at `offset`
    pub fn write(
        &self,
        offset: u64,
        iov: IoVector,
        callback: CompletionCallback,
    ) -> BlockResult<RequestHandle> {
        self.shared.submit(Direction::Write, offset, iov, callback)
    }

    /// Synchronous flush. Transport failures are logged and reported as
    /// success; only a failed or closed vdisk returns an error.
    pub fn flush(&self) -> BlockResult<()> {
        self.shared.flush()
    }

    /// Size in bytes, cached after the first successful query
    pub fn get_length(&self) -> BlockResult<u64> {
        self.shared.get_length()
    }

    /// Same as [`get_length`](Self::get_length); the agent does not report
    /// physical allocation
    pub fn get_allocated_length(&self) -> BlockResult<u64> {
        self.shared.get_length()
    }

    /// Close the device handle and stop completion delivery. Requests still
    /// parked on the retry queue complete with EIO before this returns.
    pub fn close(&self) {
        self.shared.close();
    }

    // ── Observability ────────────────────────────────────────────────────────

    pub fn vdisk_id(&self) -> &str {
        &self.shared.vdisk_id
    }

    pub fn device_path(&self) -> &str {
        &self.shared.device_path
    }

    pub fn inflight_count(&self) -> u32 {
        self.shared.state.lock().inflight_count
    }

    pub fn retry_queue_depth(&self) -> usize {
        self.shared.state.lock().retry_queue.len()
    }

    pub fn current_host_idx(&self) -> usize {
        self.shared.state.lock().current_host_idx
    }

    pub fn current_host(&self) -> Option<HostAddr> {
        let inner = self.shared.state.lock();
        inner
            .hosts
            .get(inner.current_host_idx)
            .map(|host| host.addr.clone())
    }

    pub fn is_failover_in_progress(&self) -> bool {
        self.shared.state.lock().failover_in_progress
    }

    pub fn is_failed(&self) -> bool {
        self.shared.state.lock().failed
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    pub fn failover_state(&self) -> FailoverState {
        self.shared.state.lock().failover_state()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }
}

impl Drop for VDisk {
    fn drop(&mut self) {
        self.shared.close();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::request::RequestState;
    use crate::testing::{CompletionLog, TestRig, wait_until};

    const MIB: usize = 1024 * 1024;

    #[test]
    fn test_happy_path_single_read() {
        let rig = TestRig::single_host();
        rig.cluster.fill(&rig.device_path(), 4096, &[0xAA; 4096]);
        let log = CompletionLog::new();

        let handle = rig
            .vdisk
            .read(4096, IoVector::zeroed(4096), log.callback())
            .unwrap();
        rig.settle(|| log.len() == 1);

        let done = log.take();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].request_id, handle.id());
        assert!(done[0].status.is_ok());
        assert_eq!(done[0].iov.to_vec(), vec![0xAA; 4096]);
        assert_eq!(handle.state(), RequestState::Completed);
        assert_eq!(rig.vdisk.inflight_count(), 0);
    }

    #[test]
    fn test_segmented_write_completes_once() {
        let rig = TestRig::single_host_manual();
        let log = CompletionLog::new();

        rig.vdisk
            .write(0, IoVector::from_buf(vec![0x5A; 2 * MIB]), log.callback())
            .unwrap();
        assert_eq!(rig.cluster.pending(), 2);
        assert_eq!(rig.vdisk.inflight_count(), 1);

        // Second segment first
        rig.cluster.deliver_reversed();
        rig.event_loop.poll();

        let done = log.take();
        assert_eq!(done.len(), 1);
        assert!(done[0].status.is_ok());
        assert_eq!(rig.vdisk.inflight_count(), 0);
        assert_eq!(rig.cluster.read_disk(&rig.device_path(), MIB as u64, 4), vec![0x5A; 4]);
        assert_eq!(rig.vdisk.stats().segments_submitted, 2);
    }

    #[test]
    fn test_disk_error_masked_to_eio() {
        let rig = TestRig::single_host();
        rig.cluster.inject_io_error(&rig.host_uri(0), 5, 1);
        let log = CompletionLog::new();

        rig.vdisk
            .read(0, IoVector::zeroed(512), log.callback())
            .unwrap();
        rig.settle(|| log.len() == 1);

        let done = log.take();
        assert!(matches!(done[0].status, Err(BlockError::Io)));
        assert_eq!(done[0].status.as_ref().unwrap_err().errno(), libc::EIO);
        assert_eq!(rig.vdisk.inflight_count(), 0);
        assert!(!rig.vdisk.is_failover_in_progress());
    }

    #[test]
    fn test_single_host_channel_drop_fails_without_failover() {
        let rig = TestRig::single_host();
        rig.cluster.inject_io_error(&rig.host_uri(0), codes::CHANNEL_HUP, 1);
        let log = CompletionLog::new();

        rig.vdisk
            .read(0, IoVector::zeroed(512), log.callback())
            .unwrap();
        rig.settle(|| log.len() == 1);

        assert!(matches!(log.take()[0].status, Err(BlockError::Io)));
        assert_eq!(rig.vdisk.inflight_count(), 0);
        assert_eq!(rig.vdisk.retry_queue_depth(), 0);
        assert_eq!(rig.vdisk.failover_state(), FailoverState::Idle);
        assert_eq!(rig.vdisk.stats().failovers_started, 0);
    }

    #[test]
    fn test_single_host_sync_submit_error_returns_eio() {
        let rig = TestRig::single_host();
        rig.cluster.inject_submit_error(&rig.host_uri(0), 0, codes::CHANNEL_HUP);
        let log = CompletionLog::new();

        let err = rig
            .vdisk
            .read(0, IoVector::zeroed(512), log.callback())
            .unwrap_err();
        assert!(matches!(err, BlockError::Io));
        assert_eq!(rig.vdisk.inflight_count(), 0);

        rig.event_loop.poll();
        assert_eq!(log.len(), 0);
    }

    #[test]
    fn test_partial_submit_error_completes_through_callback() {
        let rig = TestRig::single_host_manual();
        // First segment goes out, second is refused
        rig.cluster.inject_submit_error(&rig.host_uri(0), 1, libc::ENOMEM);
        let log = CompletionLog::new();

        rig.vdisk
            .write(0, IoVector::from_buf(vec![1; 2 * MIB]), log.callback())
            .unwrap();
        assert_eq!(rig.cluster.pending(), 1);

        rig.cluster.deliver_all();
        rig.event_loop.poll();

        let done = log.take();
        assert_eq!(done.len(), 1);
        assert!(matches!(done[0].status, Err(BlockError::Io)));
        assert_eq!(rig.vdisk.inflight_count(), 0);
    }

    #[test]
    fn test_zero_length_rejected() {
        let rig = TestRig::single_host();
        let log = CompletionLog::new();

        let err = rig
            .vdisk
            .write(0, IoVector::default(), log.callback())
            .unwrap_err();
        assert!(matches!(err, BlockError::InvalidRequest(_)));
        assert_eq!(err.errno(), libc::EINVAL);
        assert_eq!(rig.cluster.submit_count(), 0);
        assert_eq!(rig.vdisk.stats().rejected, 1);
    }

    #[test]
    fn test_request_past_address_space_rejected() {
        let rig = TestRig::two_hosts();
        let log = CompletionLog::new();

        let err = rig
            .vdisk
            .read(u64::MAX - 4096, IoVector::zeroed(2 * 1024 * 1024), log.callback())
            .unwrap_err();
        assert!(matches!(err, BlockError::InvalidRequest(_)));
        assert_eq!(err.errno(), libc::EINVAL);
        assert_eq!(rig.vdisk.inflight_count(), 0);
        assert_eq!(rig.cluster.submit_count(), 0);
        assert_eq!(rig.vdisk.stats().rejected, 1);

        // The vdisk keeps serving I/O
        rig.vdisk
            .read(0, IoVector::zeroed(512), log.callback())
            .unwrap();
        rig.settle(|| log.len() == 1);
        assert!(log.take()[0].status.is_ok());
        assert_eq!(rig.vdisk.inflight_count(), 0);
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let rig = TestRig::single_host();
        let data: Vec<u8> = (0..3 * MIB / 2).map(|i| (i % 251) as u8).collect();
        let log = CompletionLog::new();

        rig.vdisk
            .write(8192, IoVector::from_buf(data.clone()), log.callback())
            .unwrap();
        rig.settle(|| log.len() == 1);
        assert!(log.take()[0].status.is_ok());

        let half = data.len() / 2;
        rig.vdisk
            .read(
                8192,
                IoVector::new(vec![vec![0; half], vec![0; data.len() - half]]),
                log.callback(),
            )
            .unwrap();
        rig.settle(|| log.len() == 1);

        let done = log.take();
        assert!(done[0].status.is_ok());
        assert_eq!(done[0].iov.to_vec(), data);
    }

    #[test]
    fn test_flush_swallows_transport_error() {
        let rig = TestRig::single_host();
        assert!(rig.vdisk.flush().is_ok());

        rig.cluster.set_agent_up(&rig.host_uri(0), false);
        assert!(rig.vdisk.flush().is_ok());
        assert!(rig.vdisk.flush().is_ok());
    }

    #[test]
    fn test_get_length_is_cached() {
        let rig = TestRig::single_host();
        assert_eq!(rig.vdisk.get_length().unwrap(), TestRig::DISK_SIZE);
        assert_eq!(rig.vdisk.get_allocated_length().unwrap(), TestRig::DISK_SIZE);

        rig.cluster.set_agent_up(&rig.host_uri(0), false);
        assert_eq!(rig.vdisk.get_length().unwrap(), TestRig::DISK_SIZE);
        assert_eq!(rig.cluster.stat_calls(), 1);
    }

    #[test]
    fn test_get_length_first_failure_is_eio() {
        let rig = TestRig::single_host();
        rig.cluster.set_agent_up(&rig.host_uri(0), false);

        let err = rig.vdisk.get_length().unwrap_err();
        assert_eq!(err.errno(), libc::EIO);

        rig.cluster.set_agent_up(&rig.host_uri(0), true);
        assert_eq!(rig.vdisk.get_length().unwrap(), TestRig::DISK_SIZE);
    }

    #[test]
    fn test_get_length_zero_size_is_eio() {
        let rig = TestRig::single_host();
        rig.cluster.create_disk(&rig.device_path(), 0);

        assert!(matches!(rig.vdisk.get_length(), Err(BlockError::Io)));
        assert!(matches!(rig.vdisk.get_allocated_length(), Err(BlockError::Io)));
        assert_eq!(rig.cluster.stat_calls(), 2);

        rig.cluster.create_disk(&rig.device_path(), 4096);
        assert_eq!(rig.vdisk.get_length().unwrap(), 4096);
        assert_eq!(rig.vdisk.get_length().unwrap(), 4096);
        assert_eq!(rig.cluster.stat_calls(), 3);
    }

    #[test]
    fn test_submit_after_close_rejected() {
        let rig = TestRig::single_host();
        rig.vdisk.close();
        rig.vdisk.close();
        assert!(rig.vdisk.is_closed());

        let err = rig
            .vdisk
            .read(0, IoVector::zeroed(512), Box::new(|_| {}))
            .unwrap_err();
        assert!(matches!(err, BlockError::Closed(_)));
        assert!(matches!(rig.vdisk.flush(), Err(BlockError::Closed(_))));
    }

    #[test]
    fn test_close_fails_queued_requests() {
        let rig = TestRig::two_hosts();
        rig.vdisk.shared().state.lock().failover_in_progress = true;
        let log = CompletionLog::new();

        let handle = rig
            .vdisk
            .read(0, IoVector::zeroed(512), log.callback())
            .unwrap();
        assert!(handle.is_queued());
        assert_eq!(rig.cluster.submit_count(), 0);

        rig.vdisk.close();
        let done = log.take();
        assert_eq!(done.len(), 1);
        assert!(matches!(done[0].status, Err(BlockError::Io)));
        assert!(!handle.is_queued());
    }

    #[test]
    fn test_inflight_tracks_outstanding_requests() {
        let rig = TestRig::single_host_manual();
        let log = CompletionLog::new();

        for i in 0..4 {
            rig.vdisk
                .read(i * 512, IoVector::zeroed(512), log.callback())
                .unwrap();
        }
        assert_eq!(rig.vdisk.inflight_count(), 4);

        rig.cluster.deliver_all();
        // Callbacks only reach the host once the event loop drains
        assert_eq!(log.len(), 0);
        assert_eq!(rig.vdisk.inflight_count(), 4);

        rig.event_loop.poll();
        assert_eq!(log.len(), 4);
        assert_eq!(rig.vdisk.inflight_count(), 0);
        assert!(wait_until(Duration::from_millis(10), || rig.vdisk.stats().completed() == 4));
    }
}
