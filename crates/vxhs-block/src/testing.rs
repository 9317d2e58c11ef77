//! Shared fixtures for unit tests

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use vxhs_common::{DriverConfig, HostAddr, VDiskConfig};

use crate::completion::ManualEventLoop;
use crate::driver::VxhsDriver;
use crate::loopback::LoopbackCluster;
use crate::request::{Completion, CompletionCallback, Direction, IoVector, RequestBlock};
use crate::vdisk::VDisk;

/// Poll `cond` until it holds or `timeout` passes
pub(crate) fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
}

/// Collects completions handed to host callbacks
#[derive(Clone, Default)]
pub(crate) struct CompletionLog {
    done: Arc<Mutex<Vec<Completion>>>,
}

impl CompletionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&self) -> CompletionCallback {
        let done = Arc::clone(&self.done);
        Box::new(move |completion| done.lock().push(completion))
    }

    pub fn len(&self) -> usize {
        self.done.lock().len()
    }

    pub fn take(&self) -> Vec<Completion> {
        std::mem::take(&mut *self.done.lock())
    }
}

/// A vdisk opened against loopback agents `10.0.0.1`, `10.0.0.2`, ...
pub(crate) struct TestRig {
    pub vdisk: VDisk,
    pub event_loop: ManualEventLoop,
    pub cluster: Arc<LoopbackCluster>,
    pub config: VDiskConfig,
    _driver: VxhsDriver,
}

impl TestRig {
    pub const DISK_SIZE: u64 = 16 * 1024 * 1024;

    /// Short timers so failover tests finish quickly
    pub fn fast_settings() -> DriverConfig {
        DriverConfig {
            failover_retry_interval_ms: 10,
            failover_timeout_ms: 10_000,
            probe_timeout_ms: 1_000,
            ..DriverConfig::default()
        }
    }

    pub fn single_host() -> Self {
        Self::build(1, false, Self::fast_settings())
    }

    pub fn single_host_manual() -> Self {
        Self::build(1, true, Self::fast_settings())
    }

    pub fn two_hosts() -> Self {
        Self::build(2, false, Self::fast_settings())
    }

    pub fn two_hosts_manual() -> Self {
        Self::build(2, true, Self::fast_settings())
    }

    pub fn build(hosts: usize, manual: bool, settings: DriverConfig) -> Self {
        let config = VDiskConfig::new(
            "{test-vdisk}",
            (1..=hosts)
                .map(|i| HostAddr::new(format!("10.0.0.{i}"), 9999))
                .collect(),
        );
        let cluster = Arc::new(LoopbackCluster::for_config(&config, Self::DISK_SIZE));
        cluster.set_manual_delivery(manual);

        let driver = VxhsDriver::with_settings(cluster.clone(), settings);
        let event_loop = ManualEventLoop::new();
        let vdisk = driver.open(&config, &event_loop).unwrap();

        Self {
            vdisk,
            event_loop,
            cluster,
            config,
            _driver: driver,
        }
    }

    pub fn device_path(&self) -> String {
        self.config.device_path()
    }

    pub fn host_uri(&self, idx: usize) -> String {
        self.config.hosts[idx].agent_uri()
    }

    /// A request on this vdisk that has not been submitted
    pub fn request(
        &self,
        direction: Direction,
        offset: u64,
        iov: IoVector,
        callback: CompletionCallback,
    ) -> Arc<RequestBlock> {
        self.vdisk
            .shared()
            .new_request(direction, offset, iov, callback)
    }

    /// Run the event loop until `cond` holds
    pub fn settle(&self, mut cond: impl FnMut() -> bool) {
        let reached = wait_until(Duration::from_secs(10), || {
            self.event_loop.poll();
            cond()
        });
        assert!(reached, "condition not reached");
    }
}
