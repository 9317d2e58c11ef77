//! Storage-agent failover
//!
//! When a channel drop leaves requests parked on the retry queue and the
//! last in-flight request has drained, one failover thread takes over the
//! vdisk. It walks the host list, reopens the vdisk device on each
//! candidate and asks the agent whether it can serve I/O. The first agent
//! that says yes becomes the current host and the queue is replayed
//! against it in FIFO order. If no agent answers before the deadline the
//! vdisk is failed and every queued request completes with EIO.
//!
//! ```text
//!            channel drop, inflight == 0
//!   Idle ─────────────────────────────────► Switching(0)
//!    ▲                                          │
//!    │ queue drained          probe ok          │ probe failed
//!    └──────────── Recovered ◄──────────────────┤ k += 1, pause after a
//!                                               │ full pass
//!                         deadline elapsed      ▼
//!                  Failed ◄──────────────── Switching(k)
//! ```

use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::transport::{IoContext, IoFlags, IoctlOp};
use crate::vdisk::{Target, VDiskShared};

/// Where the failover state machine is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverState {
    /// Serving I/O from the current host
    Idle,
    /// Reopening and probing host `k`
    Switching(usize),
    /// A host accepted the vdisk; the retry queue is being replayed
    Recovered,
    /// No host became ready in time; all I/O fails
    Failed,
}

/// Rendezvous between the failover thread and the probe completion
/// delivered on a transport thread
pub struct ProbeWaiter {
    vdisk_id: String,
    host_idx: usize,
    result: Mutex<Option<i32>>,
    cv: Condvar,
}

impl ProbeWaiter {
    pub(crate) fn new(vdisk_id: &str, host_idx: usize) -> Self {
        Self {
            vdisk_id: vdisk_id.to_string(),
            host_idx,
            result: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    pub fn vdisk_id(&self) -> &str {
        &self.vdisk_id
    }

    pub fn host_idx(&self) -> usize {
        self.host_idx
    }

    /// Record the probe answer; later answers are ignored
    pub(crate) fn complete(&self, err: i32) {
        let mut result = self.result.lock();
        if result.is_none() {
            *result = Some(err);
            self.cv.notify_all();
        }
    }

    /// Wait for the answer; `None` on timeout
    pub(crate) fn wait(&self, timeout: Duration) -> Option<i32> {
        let deadline = Instant::now() + timeout;
        let mut result = self.result.lock();
        while result.is_none() {
            if self.cv.wait_until(&mut result, deadline).timed_out() {
                break;
            }
        }
        *result
    }
}

enum Episode {
    Recovered,
    Failed,
    Closed,
}

/// Run the FSM for `shared` on its own thread. The caller must have
/// claimed it (`fsm_active`) under the vdisk lock.
pub(crate) fn spawn(shared: Arc<VDiskShared>) {
    start(shared, |work| {
        thread::Builder::new()
            .name("vxhs-failover".to_string())
            .spawn(work)
            .map(drop)
    });
}

/// Hand the FSM to `spawner`; it is never run on the calling thread. If the
/// spawn fails the claim is released and the failover stays pending until
/// the next submission claims it again.
fn start<F>(shared: Arc<VDiskShared>, spawner: F)
where
    F: FnOnce(Box<dyn FnOnce() + Send>) -> io::Result<()>,
{
    let worker = Arc::clone(&shared);
    if let Err(e) = spawner(Box::new(move || run(&worker))) {
        error!(
            "failed to spawn failover thread for {}, will retry: {}",
            shared.vdisk_id, e
        );
        shared.state.lock().fsm_active = false;
    }
}

fn run(shared: &Arc<VDiskShared>) {
    loop {
        match switch_until_ready(shared) {
            Episode::Recovered | Episode::Failed => drain_retry_queue(shared),
            Episode::Closed => {
                shared.state.lock().fsm_active = false;
                debug!("vdisk {} closed during failover", shared.vdisk_id);
                return;
            }
        }

        let mut inner = shared.state.lock();
        inner.recovering = false;
        inner.fsm_active = false;
        // Cascading failure during replay with nothing left in flight
        if !inner.claim_failover() {
            return;
        }
        info!(
            "vdisk {} failover re-asserted during replay, probing again",
            shared.vdisk_id
        );
    }
}

fn switch_until_ready(shared: &Arc<VDiskShared>) -> Episode {
    let settings = &shared.settings;
    let deadline = settings.failover_timeout().map(|t| Instant::now() + t);
    let host_count = {
        let mut inner = shared.state.lock();
        inner.probe_host_idx = 0;
        inner.hosts.len()
    };
    shared.stats.record_failover_started();
    info!(
        "vdisk {} failover started, {} candidate host(s)",
        shared.vdisk_id, host_count
    );

    loop {
        let k = {
            let inner = shared.state.lock();
            if inner.closed {
                return Episode::Closed;
            }
            inner.probe_host_idx
        };

        match switch_storage_agent(shared, k) {
            Ok(()) => {
                let mut inner = shared.state.lock();
                inner.current_host_idx = k;
                inner.probe_host_idx = 0;
                inner.failover_in_progress = false;
                inner.recovering = true;
                let addr = inner.hosts[k].addr.clone();
                drop(inner);

                shared.stats.record_failover_recovered();
                info!("vdisk {} failed over to host {} ({})", shared.vdisk_id, k, addr);
                return Episode::Recovered;
            }
            Err(code) => {
                debug!(
                    "vdisk {} host {} not ready for I/O (code {})",
                    shared.vdisk_id, k, code
                );
                let wrapped = {
                    let mut inner = shared.state.lock();
                    inner.probe_host_idx += 1;
                    if inner.probe_host_idx >= host_count {
                        inner.probe_host_idx = 0;
                        true
                    } else {
                        false
                    }
                };

                if wrapped {
                    let mut pause = settings.failover_retry_interval();
                    if let Some(deadline) = deadline {
                        pause = pause.min(deadline.saturating_duration_since(Instant::now()));
                    }
                    debug!(
                        "vdisk {} no host ready, retrying in {:?}",
                        shared.vdisk_id, pause
                    );
                    thread::sleep(pause);
                }

                if deadline.is_some_and(|d| Instant::now() >= d) {
                    return fail_vdisk(shared);
                }
            }
        }
    }
}

fn fail_vdisk(shared: &Arc<VDiskShared>) -> Episode {
    let mut inner = shared.state.lock();
    if inner.closed {
        return Episode::Closed;
    }
    inner.failed = true;
    inner.failover_in_progress = false;
    let queued = inner.retry_queue.len();
    drop(inner);

    shared.stats.record_failover_failed();
    error!(
        "vdisk {} failover timed out, failing {} queued request(s) and all further I/O",
        shared.vdisk_id, queued
    );
    Episode::Failed
}

/// Bring host `k` online and probe it. `Err` carries the failure code.
fn switch_storage_agent(shared: &Arc<VDiskShared>, k: usize) -> Result<(), i32> {
    let target = reopen_vdisk(shared, k)?;

    let probe = Arc::new(ProbeWaiter::new(&shared.vdisk_id, k));
    if let Err(e) = shared.pool.transport().ioctl(
        target.channel,
        target.device,
        IoctlOp::CheckIoFailoverReady,
        Some(IoContext::Probe(Arc::clone(&probe))),
        IoFlags::ASYNC_DONE,
    ) {
        warn!(
            "vdisk {} failover probe to host {} not sent: {}",
            shared.vdisk_id, k, e
        );
        return Err(e.code());
    }

    match probe.wait(shared.settings.probe_timeout()) {
        Some(0) => Ok(()),
        Some(code) => Err(code),
        None => {
            warn!(
                "vdisk {} failover probe to host {} timed out",
                shared.vdisk_id, k
            );
            Err(libc::ETIMEDOUT)
        }
    }
}

/// Close any stale device handle on host `k`, make sure a channel exists
/// and open a fresh device handle on it
fn reopen_vdisk(shared: &Arc<VDiskShared>, k: usize) -> Result<Target, i32> {
    let transport = shared.pool.transport();
    let (addr, channel, stale) = {
        let mut inner = shared.state.lock();
        let host = inner.hosts.get_mut(k).ok_or(libc::EINVAL)?;
        (host.addr.clone(), host.channel, host.device.take())
    };

    if let (Some(channel), Some(device)) = (channel, stale) {
        debug!("vdisk {} closing stale device on host {}", shared.vdisk_id, k);
        transport.close_device(channel, device);
    }

    let channel = match channel {
        Some(channel) => channel,
        None => shared
            .pool
            .get_or_connect(&addr.agent_uri())
            .map_err(|e| {
                warn!("vdisk {} cannot reach host {}: {}", shared.vdisk_id, addr, e);
                libc::ENODEV
            })?,
    };
    {
        let mut inner = shared.state.lock();
        inner.hosts[k].channel = Some(channel);
    }

    let device = transport
        .open_device(channel, &shared.device_path)
        .map_err(|e| {
            warn!(
                "vdisk {} cannot open device on host {}: {}",
                shared.vdisk_id, addr, e
            );
            libc::EIO
        })?;
    shared.state.lock().hosts[k].device = Some(device);

    Ok(Target { channel, device })
}

/// Replay (or fail) parked requests in FIFO order
fn drain_retry_queue(shared: &Arc<VDiskShared>) {
    let mut replayed = 0usize;
    let mut failed = 0usize;

    loop {
        let (req, target) = {
            let mut inner = shared.state.lock();
            if inner.failover_in_progress {
                debug!(
                    "vdisk {} failover re-asserted, halting replay",
                    shared.vdisk_id
                );
                break;
            }
            let Some(req) = inner.pop_retry() else {
                break;
            };
            if inner.failed || inner.closed {
                drop(inner);
                shared.fail_request(&req);
                failed += 1;
                continue;
            }
            inner.acquire_inflight(&req);
            (req, inner.current_target())
        };

        debug!("vdisk {} replaying request {}", shared.vdisk_id, req.id());
        if let Err(err) = shared.dispatch(&req, target) {
            // Requeued at the tail, failover re-asserted
            shared.on_replay_error(&req, err);
            break;
        }
        replayed += 1;
    }

    if replayed > 0 || failed > 0 {
        info!(
            "vdisk {} retry queue drained: {} replayed, {} failed",
            shared.vdisk_id, replayed, failed
        );
    }
}
