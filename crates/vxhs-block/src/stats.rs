//! Per-vDisk I/O statistics
//!
//! Counters are updated lock-free from the submission, transport and
//! event-loop threads. [`VDiskStats::snapshot`] reads them into a plain
//! struct; [`StatsSnapshot::render_prometheus`] formats that struct in the
//! Prometheus text format.
//!
//! # Prometheus Metrics
//!
//! - `vxhs_vdisk_read_ops_total` / `vxhs_vdisk_write_ops_total`
//! - `vxhs_vdisk_read_bytes_total` / `vxhs_vdisk_write_bytes_total`
//! - `vxhs_vdisk_segments_submitted_total`
//! - `vxhs_vdisk_completions_total{status="ok|error"}`
//! - `vxhs_vdisk_retries_total` - requests parked on the retry queue
//! - `vxhs_vdisk_failovers_total{outcome="started|recovered|failed"}`
//! - `vxhs_vdisk_rejected_total` - submissions refused synchronously

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Live counters for one vDisk
#[derive(Debug, Default)]
pub struct VDiskStats {
    read_ops: AtomicU64,
    write_ops: AtomicU64,
    read_bytes: AtomicU64,
    write_bytes: AtomicU64,
    segments_submitted: AtomicU64,
    completed_ok: AtomicU64,
    completed_err: AtomicU64,
    retries: AtomicU64,
    failovers_started: AtomicU64,
    failovers_recovered: AtomicU64,
    failovers_failed: AtomicU64,
    rejected: AtomicU64,
}

impl VDiskStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_read(&self, bytes: u64) {
        self.read_ops.fetch_add(1, Ordering::Relaxed);
        self.read_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_write(&self, bytes: u64) {
        self.write_ops.fetch_add(1, Ordering::Relaxed);
        self.write_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_segments(&self, count: u64) {
        self.segments_submitted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_completion(&self, ok: bool) {
        if ok {
            self.completed_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.completed_err.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failover_started(&self) {
        self.failovers_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failover_recovered(&self) {
        self.failovers_recovered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failover_failed(&self) {
        self.failovers_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            read_ops: self.read_ops.load(Ordering::Relaxed),
            write_ops: self.write_ops.load(Ordering::Relaxed),
            read_bytes: self.read_bytes.load(Ordering::Relaxed),
            write_bytes: self.write_bytes.load(Ordering::Relaxed),
            segments_submitted: self.segments_submitted.load(Ordering::Relaxed),
            completed_ok: self.completed_ok.load(Ordering::Relaxed),
            completed_err: self.completed_err.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            failovers_started: self.failovers_started.load(Ordering::Relaxed),
            failovers_recovered: self.failovers_recovered.load(Ordering::Relaxed),
            failovers_failed: self.failovers_failed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`VDiskStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub read_ops: u64,
    pub write_ops: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub segments_submitted: u64,
    pub completed_ok: u64,
    pub completed_err: u64,
    pub retries: u64,
    pub failovers_started: u64,
    pub failovers_recovered: u64,
    pub failovers_failed: u64,
    pub rejected: u64,
}

impl StatsSnapshot {
    /// Completions delivered to the host, successful or not
    pub fn completed(&self) -> u64 {
        self.completed_ok + self.completed_err
    }

    /// Prometheus text format, labelled with the vdisk id
    pub fn render_prometheus(&self, vdisk_id: &str) -> String {
        let mut out = String::with_capacity(2048);
        let vdisk: Labels = &[("vdisk_id", vdisk_id)];

        write_counter(&mut out, "read_ops_total", "Total read requests", &[(vdisk, self.read_ops)]);
        write_counter(
            &mut out,
            "write_ops_total",
            "Total write requests",
            &[(vdisk, self.write_ops)],
        );
        write_counter(
            &mut out,
            "read_bytes_total",
            "Total bytes requested by reads",
            &[(vdisk, self.read_bytes)],
        );
        write_counter(
            &mut out,
            "write_bytes_total",
            "Total bytes requested by writes",
            &[(vdisk, self.write_bytes)],
        );
        write_counter(
            &mut out,
            "segments_submitted_total",
            "Transport submissions, including replays",
            &[(vdisk, self.segments_submitted)],
        );

        let ok: Labels = &[("vdisk_id", vdisk_id), ("status", "ok")];
        let err: Labels = &[("vdisk_id", vdisk_id), ("status", "error")];
        write_counter(
            &mut out,
            "completions_total",
            "Requests completed to the host",
            &[(ok, self.completed_ok), (err, self.completed_err)],
        );

        write_counter(
            &mut out,
            "retries_total",
            "Requests parked for replay after a channel failure",
            &[(vdisk, self.retries)],
        );

        let started: Labels = &[("vdisk_id", vdisk_id), ("outcome", "started")];
        let recovered: Labels = &[("vdisk_id", vdisk_id), ("outcome", "recovered")];
        let failed: Labels = &[("vdisk_id", vdisk_id), ("outcome", "failed")];
        write_counter(
            &mut out,
            "failovers_total",
            "Storage agent failover episodes",
            &[
                (started, self.failovers_started),
                (recovered, self.failovers_recovered),
                (failed, self.failovers_failed),
            ],
        );

        write_counter(
            &mut out,
            "rejected_total",
            "Submissions refused without reaching the transport",
            &[(vdisk, self.rejected)],
        );

        out
    }
}

type Labels<'a> = &'a [(&'a str, &'a str)];

fn write_counter(out: &mut String, name: &str, help: &str, samples: &[(Labels<'_>, u64)]) {
    let _ = writeln!(out, "# HELP vxhs_vdisk_{name} {help}");
    let _ = writeln!(out, "# TYPE vxhs_vdisk_{name} counter");
    for (labels, value) in samples {
        let labels = labels
            .iter()
            .map(|(k, v)| format!("{k}=\"{v}\""))
            .collect::<Vec<_>>()
            .join(",");
        let _ = writeln!(out, "vxhs_vdisk_{name}{{{labels}}} {value}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = VDiskStats::new();
        stats.record_read(4096);
        stats.record_read(4096);
        stats.record_write(8192);
        stats.record_segments(3);
        stats.record_completion(true);
        stats.record_completion(false);

        let snap = stats.snapshot();
        assert_eq!(snap.read_ops, 2);
        assert_eq!(snap.read_bytes, 8192);
        assert_eq!(snap.write_ops, 1);
        assert_eq!(snap.segments_submitted, 3);
        assert_eq!(snap.completed(), 2);
    }

    #[test]
    fn test_prometheus_format() {
        let stats = VDiskStats::new();
        stats.record_failover_started();
        stats.record_failover_recovered();

        let text = stats.snapshot().render_prometheus("{abc}");
        assert!(text.contains("# TYPE vxhs_vdisk_failovers_total counter"));
        assert!(
            text.contains(r#"vxhs_vdisk_failovers_total{vdisk_id="{abc}",outcome="started"} 1"#)
        );
        assert!(
            text.contains(r#"vxhs_vdisk_failovers_total{vdisk_id="{abc}",outcome="failed"} 0"#)
        );
        assert!(text.contains(r#"vxhs_vdisk_completions_total{vdisk_id="{abc}",status="ok"} 0"#));
    }
}
