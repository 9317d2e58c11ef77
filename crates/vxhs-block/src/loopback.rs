//! In-process storage agents
//!
//! [`LoopbackCluster`] implements [`TransportProvider`] without a network.
//! Every agent serves the same backing store per device path, the way
//! reflected vdisks look from the client, so a request replayed on another
//! agent sees the same data.
//!
//! Completions are delivered on a worker thread, optionally after a fixed
//! latency. In manual mode read and write completions are held until the
//! caller releases them with [`LoopbackCluster::deliver_all`] and friends,
//! which lets tests control callback order. Failover probes always go
//! through the worker.
//!
//! Results are decided at delivery time, so taking an agent down after a
//! submission makes the pending completion report a channel hangup.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, trace, warn};
use vxhs_common::VDiskConfig;

use crate::transport::{
    ChannelHandle, DeviceHandle, IoContext, IoFlags, IoctlOp, Message, Opcode, Reason, Transport,
    TransportCallback, TransportError, TransportProvider, TransportResult, codes,
};

/// Answer of an agent that is up but not ready to take over a vdisk
const NOT_READY: i32 = libc::EBUSY;

/// One accepted read or write submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRecord {
    /// Agent URI the submission went to
    pub agent: String,
    pub offset: u64,
    pub request_id: u64,
}

#[derive(Debug)]
struct Agent {
    up: bool,
    ready: bool,
    /// Code and count of upcoming read/write completions to fail
    io_fault: Option<(i32, usize)>,
    /// Submissions to let through, then the code to fail the next one with
    submit_fault: Option<(usize, i32)>,
}

impl Agent {
    fn new() -> Self {
        Self {
            up: true,
            ready: true,
            io_fault: None,
            submit_fault: None,
        }
    }
}

#[derive(Debug)]
struct Device {
    agent: String,
    path: String,
}

#[derive(Debug, Default)]
struct ClusterState {
    agents: HashMap<String, Agent>,
    disks: HashMap<String, Vec<u8>>,
    channels: HashMap<u32, String>,
    devices: HashMap<u32, Device>,
    next_handle: u32,
    submit_log: Vec<SubmitRecord>,
    held: VecDeque<Job>,
    stat_calls: u64,
    inits: u64,
}

impl ClusterState {
    fn allocate_handle(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }

    fn device(&self, channel: ChannelHandle, device: DeviceHandle) -> TransportResult<&Device> {
        if !self.channels.contains_key(&channel.0) {
            return Err(TransportError::Submit { code: libc::EBADF });
        }
        self.devices
            .get(&device.0)
            .ok_or(TransportError::Submit { code: libc::EBADF })
    }

    fn agent_up(&self, uri: &str) -> bool {
        self.agents.get(uri).is_some_and(|a| a.up)
    }
}

#[derive(Debug)]
enum JobKind {
    Read { len: usize },
    Write { data: Bytes },
    Probe,
}

#[derive(Debug)]
struct Job {
    channel: ChannelHandle,
    agent: String,
    path: String,
    offset: u64,
    kind: JobKind,
    ctx: IoContext,
}

#[derive(Debug, Default)]
struct WorkQueue {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<ClusterState>,
    work: Mutex<WorkQueue>,
    work_cv: Condvar,
    callback: RwLock<Option<TransportCallback>>,
    latency: Mutex<Duration>,
    manual: AtomicBool,
}

impl Shared {
    fn enqueue(&self, job: Job) {
        let held = self.manual.load(Ordering::Acquire) && !matches!(job.kind, JobKind::Probe);
        if held {
            self.state.lock().held.push_back(job);
            return;
        }
        self.work.lock().jobs.push_back(job);
        self.work_cv.notify_one();
    }

    fn worker(&self) {
        loop {
            let job = {
                let mut work = self.work.lock();
                loop {
                    if work.shutdown {
                        return;
                    }
                    if let Some(job) = work.jobs.pop_front() {
                        break job;
                    }
                    self.work_cv.wait(&mut work);
                }
            };

            let latency = *self.latency.lock();
            if !latency.is_zero() {
                thread::sleep(latency);
            }
            self.deliver(job);
        }
    }

    /// Execute a job against the store and run the transport callback
    fn deliver(&self, job: Job) {
        let (reason, msg) = self.execute(&job);
        let callback = self.callback.read().clone();
        match callback {
            Some(callback) => callback(job.channel, reason, Some(job.ctx), msg),
            None => warn!("loopback completion with no callback registered"),
        }
    }

    fn execute(&self, job: &Job) -> (Reason, Message) {
        let mut state = self.state.lock();
        let opcode = match job.kind {
            JobKind::Read { .. } => Opcode::Read,
            JobKind::Write { .. } => Opcode::Write,
            JobKind::Probe => Opcode::FailoverProbeReady,
        };

        let Some(agent) = state.agents.get_mut(&job.agent) else {
            return (Reason::Hup, Message::new(opcode, codes::CHANNEL_HUP));
        };
        if !agent.up {
            return (Reason::Done, Message::new(opcode, codes::CHANNEL_HUP));
        }

        if matches!(job.kind, JobKind::Probe) {
            let error = if agent.ready { 0 } else { NOT_READY };
            return (Reason::Done, Message::new(opcode, error));
        }

        if let Some((code, remaining)) = agent.io_fault {
            agent.io_fault = (remaining > 1).then_some((code, remaining - 1));
            return (Reason::Done, Message::new(opcode, code));
        }

        let Some(disk) = state.disks.get_mut(&job.path) else {
            return (Reason::Done, Message::new(opcode, libc::ENOENT));
        };
        let Ok(start) = usize::try_from(job.offset) else {
            return (Reason::Done, Message::new(opcode, libc::EINVAL));
        };

        match &job.kind {
            JobKind::Read { len } => match disk.get(start..start.saturating_add(*len)) {
                Some(data) => (Reason::Done, Message::read_done(Bytes::copy_from_slice(data))),
                None => (Reason::Done, Message::new(opcode, libc::EIO)),
            },
            JobKind::Write { data } => match disk.get_mut(start..start.saturating_add(data.len())) {
                Some(dst) => {
                    dst.copy_from_slice(data);
                    (Reason::Done, Message::new(opcode, 0))
                }
                None => (Reason::Done, Message::new(opcode, libc::EIO)),
            },
            JobKind::Probe => (Reason::Done, Message::new(opcode, 0)),
        }
    }

    fn submit(
        &self,
        channel: ChannelHandle,
        device: DeviceHandle,
        offset: u64,
        kind: JobKind,
        ctx: IoContext,
    ) -> TransportResult<()> {
        let job = {
            let mut state = self.state.lock();
            let (agent, path) = {
                let dev = state.device(channel, device)?;
                (dev.agent.clone(), dev.path.clone())
            };

            if let Some(a) = state.agents.get_mut(&agent)
                && let Some((skip, code)) = a.submit_fault
            {
                if skip == 0 {
                    a.submit_fault = None;
                    debug!("loopback {} refusing submission with {}", agent, code);
                    return Err(TransportError::Submit { code });
                }
                a.submit_fault = Some((skip - 1, code));
            }

            if let IoContext::Segment(seg) = &ctx {
                state.submit_log.push(SubmitRecord {
                    agent: agent.clone(),
                    offset,
                    request_id: seg.request.id(),
                });
            }

            Job {
                channel,
                agent,
                path,
                offset,
                kind,
                ctx,
            }
        };

        trace!("loopback queued {:?} at {}", job.kind, job.offset);
        self.enqueue(job);
        Ok(())
    }
}

impl Transport for Shared {
    fn open_channel(&self, address: &str) -> TransportResult<ChannelHandle> {
        let mut state = self.state.lock();
        if !state.agent_up(address) {
            return Err(TransportError::Connect {
                address: address.to_string(),
                code: codes::CHANNEL_HUP,
            });
        }
        let handle = state.allocate_handle();
        state.channels.insert(handle, address.to_string());
        Ok(ChannelHandle(handle))
    }

    fn open_device(&self, channel: ChannelHandle, path: &str) -> TransportResult<DeviceHandle> {
        let mut state = self.state.lock();
        let refuse = |code| TransportError::DeviceOpen {
            path: path.to_string(),
            code,
        };

        let agent = state
            .channels
            .get(&channel.0)
            .cloned()
            .ok_or_else(|| refuse(libc::EBADF))?;
        if !state.agent_up(&agent) {
            return Err(refuse(codes::CHANNEL_HUP));
        }
        if !state.disks.contains_key(path) {
            return Err(refuse(libc::ENOENT));
        }

        let handle = state.allocate_handle();
        state.devices.insert(
            handle,
            Device {
                agent,
                path: path.to_string(),
            },
        );
        Ok(DeviceHandle(handle))
    }

    fn close_device(&self, _channel: ChannelHandle, device: DeviceHandle) {
        self.state.lock().devices.remove(&device.0);
    }

    fn submit_readv(
        &self,
        channel: ChannelHandle,
        device: DeviceHandle,
        len: usize,
        offset: u64,
        ctx: IoContext,
        _flags: IoFlags,
    ) -> TransportResult<()> {
        self.submit(channel, device, offset, JobKind::Read { len }, ctx)
    }

    fn submit_writev(
        &self,
        channel: ChannelHandle,
        device: DeviceHandle,
        data: Bytes,
        offset: u64,
        ctx: IoContext,
        _flags: IoFlags,
    ) -> TransportResult<()> {
        self.submit(channel, device, offset, JobKind::Write { data }, ctx)
    }

    fn ioctl(
        &self,
        channel: ChannelHandle,
        device: DeviceHandle,
        op: IoctlOp,
        ctx: Option<IoContext>,
        _flags: IoFlags,
    ) -> TransportResult<u64> {
        let mut state = self.state.lock();
        let (agent, path) = {
            let dev = state
                .device(channel, device)
                .map_err(|e| TransportError::Ioctl { op, code: e.code() })?;
            (dev.agent.clone(), dev.path.clone())
        };
        if op == IoctlOp::Stat {
            state.stat_calls += 1;
        }
        if !state.agent_up(&agent) {
            return Err(TransportError::Ioctl {
                op,
                code: codes::CHANNEL_HUP,
            });
        }

        match op {
            IoctlOp::Flush => Ok(0),
            IoctlOp::Stat => Ok(state.disks.get(&path).map_or(0, |d| d.len() as u64)),
            IoctlOp::CheckIoFailoverReady => {
                let Some(ctx) = ctx else {
                    return Err(TransportError::Ioctl {
                        op,
                        code: libc::EINVAL,
                    });
                };
                drop(state);
                self.enqueue(Job {
                    channel,
                    agent,
                    path,
                    offset: 0,
                    kind: JobKind::Probe,
                    ctx,
                });
                Ok(0)
            }
        }
    }
}

/// A set of in-process storage agents
pub struct LoopbackCluster {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LoopbackCluster {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(ClusterState::default()),
            work: Mutex::new(WorkQueue::default()),
            work_cv: Condvar::new(),
            callback: RwLock::new(None),
            latency: Mutex::new(Duration::ZERO),
            manual: AtomicBool::new(false),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("vxhs-loopback".to_string())
            .spawn(move || worker_shared.worker())
            .map_err(|e| warn!("loopback worker thread not started: {}", e))
            .ok();

        Self {
            shared,
            worker: Mutex::new(worker),
        }
    }

    /// Agents for every host of `config`, serving a zeroed disk of `size`
    /// bytes
    pub fn for_config(config: &VDiskConfig, size: u64) -> Self {
        let cluster = Self::new();
        for host in &config.hosts {
            cluster.add_agent(&host.host, host.port);
        }
        cluster.create_disk(&config.device_path(), size);
        cluster
    }

    /// Add an agent; returns its URI
    pub fn add_agent(&self, host: &str, port: u16) -> String {
        let uri = format!("of://{host}:{port}");
        self.shared
            .state
            .lock()
            .agents
            .insert(uri.clone(), Agent::new());
        uri
    }

    pub fn create_disk(&self, path: &str, size: u64) {
        let size = usize::try_from(size).unwrap_or(usize::MAX);
        self.shared
            .state
            .lock()
            .disks
            .insert(path.to_string(), vec![0; size]);
    }

    /// Overwrite part of a disk directly
    pub fn fill(&self, path: &str, offset: u64, data: &[u8]) {
        let mut state = self.shared.state.lock();
        if let Some(disk) = state.disks.get_mut(path) {
            let start = usize::try_from(offset).unwrap_or(usize::MAX);
            if let Some(dst) = disk.get_mut(start..start.saturating_add(data.len())) {
                dst.copy_from_slice(data);
            }
        }
    }

    /// Read part of a disk directly
    pub fn read_disk(&self, path: &str, offset: u64, len: usize) -> Vec<u8> {
        let state = self.shared.state.lock();
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        state
            .disks
            .get(path)
            .and_then(|disk| disk.get(start..start.saturating_add(len)))
            .map(<[u8]>::to_vec)
            .unwrap_or_default()
    }

    // ── Fault injection ──────────────────────────────────────────────────────

    /// A down agent refuses connections and device opens, fails control
    /// operations and answers pending I/O with a channel hangup
    pub fn set_agent_up(&self, agent: &str, up: bool) {
        if let Some(a) = self.shared.state.lock().agents.get_mut(agent) {
            debug!("loopback agent {} {}", agent, if up { "up" } else { "down" });
            a.up = up;
        }
    }

    /// Whether the agent accepts failover probes
    pub fn set_agent_ready(&self, agent: &str, ready: bool) {
        if let Some(a) = self.shared.state.lock().agents.get_mut(agent) {
            a.ready = ready;
        }
    }

    /// Fail the next `count` read/write completions on `agent` with `code`
    pub fn inject_io_error(&self, agent: &str, code: i32, count: usize) {
        if let Some(a) = self.shared.state.lock().agents.get_mut(agent) {
            a.io_fault = (count > 0).then_some((code, count));
        }
    }

    /// Let `skip` submissions through, then refuse the next one with `code`
    pub fn inject_submit_error(&self, agent: &str, skip: usize, code: i32) {
        if let Some(a) = self.shared.state.lock().agents.get_mut(agent) {
            a.submit_fault = Some((skip, code));
        }
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.shared.latency.lock() = latency;
    }

    // ── Manual delivery ──────────────────────────────────────────────────────

    /// Hold read/write completions until released
    pub fn set_manual_delivery(&self, manual: bool) {
        self.shared.manual.store(manual, Ordering::Release);
    }

    /// Completions held for manual delivery
    pub fn pending(&self) -> usize {
        self.shared.state.lock().held.len()
    }

    /// Deliver held completions in submission order on the calling thread
    pub fn deliver_all(&self) -> usize {
        let jobs: Vec<_> = self.shared.state.lock().held.drain(..).collect();
        let count = jobs.len();
        for job in jobs {
            self.shared.deliver(job);
        }
        count
    }

    /// Deliver held completions newest first
    pub fn deliver_reversed(&self) -> usize {
        let jobs: Vec<_> = self.shared.state.lock().held.drain(..).rev().collect();
        let count = jobs.len();
        for job in jobs {
            self.shared.deliver(job);
        }
        count
    }

    /// Deliver the oldest held completion
    pub fn deliver_one(&self) -> bool {
        let job = self.shared.state.lock().held.pop_front();
        let Some(job) = job else {
            return false;
        };
        self.shared.deliver(job);
        true
    }

    // ── Counters ─────────────────────────────────────────────────────────────

    pub fn submit_log(&self) -> Vec<SubmitRecord> {
        self.shared.state.lock().submit_log.clone()
    }

    pub fn submit_count(&self) -> usize {
        self.shared.state.lock().submit_log.len()
    }

    pub fn stat_calls(&self) -> u64 {
        self.shared.state.lock().stat_calls
    }

    /// Transport contexts created from this cluster
    pub fn init_count(&self) -> u64 {
        self.shared.state.lock().inits
    }
}

impl Default for LoopbackCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportProvider for LoopbackCluster {
    fn init(&self, callback: TransportCallback) -> TransportResult<Arc<dyn Transport>> {
        if self.worker.lock().is_none() {
            return Err(TransportError::Init("loopback worker not running".into()));
        }
        *self.shared.callback.write() = Some(callback);
        self.shared.state.lock().inits += 1;
        let transport: Arc<dyn Transport> = self.shared.clone();
        Ok(transport)
    }
}

impl Drop for LoopbackCluster {
    fn drop(&mut self) {
        {
            let mut work = self.shared.work.lock();
            work.shutdown = true;
            work.jobs.clear();
        }
        self.shared.work_cv.notify_all();
        self.shared.state.lock().held.clear();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}
