//! VxHS Bench
//!
//! Opens a vDisk against in-process loopback storage agents, drives a
//! mixed read/write workload through the block driver core, verifies read
//! data against what was written, and prints the vdisk statistics. With
//! `--kill-primary-after` the primary agent is taken down mid-run so the
//! failover path is exercised under load.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use rand::Rng;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;
use vxhs_block::{
    Completion, FailoverState, IoVector, LoopbackCluster, StatsSnapshot, VDisk, VxhsDriver,
};
use vxhs_common::{DriverConfig, VDiskConfig};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Prometheus text format
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "vxhs-bench", about = "VxHS block driver workload generator")]
struct Args {
    /// vDisk target (vxhs:// URI or JSON); defaults to a fresh vdisk on two
    /// loopback agents
    #[arg(long)]
    target: Option<String>,

    /// Backing disk size in bytes
    #[arg(long, default_value_t = 64 * 1024 * 1024)]
    size: u64,

    /// Bytes per request
    #[arg(long, default_value_t = 4096)]
    io_size: usize,

    /// Total requests to issue
    #[arg(long, default_value_t = 10_000)]
    ops: usize,

    /// Requests submitted before waiting for completions
    #[arg(long, default_value_t = 32)]
    queue_depth: usize,

    /// Fraction of requests that are writes
    #[arg(long, default_value_t = 0.5)]
    write_ratio: f64,

    /// Take the primary agent down after this many requests
    #[arg(long)]
    kill_primary_after: Option<usize>,

    /// Per-completion latency of the loopback agents, in microseconds
    #[arg(long, default_value_t = 0)]
    latency_us: u64,

    /// Largest transport submission in bytes
    #[arg(long, default_value_t = 1024 * 1024)]
    max_io_size: usize,

    /// Failover deadline in milliseconds (0 = retry forever)
    #[arg(long, default_value_t = 120_000)]
    failover_timeout_ms: u64,

    /// Pause between full failover passes in milliseconds
    #[arg(long, default_value_t = 5_000)]
    failover_retry_ms: u64,

    /// Statistics output format
    #[arg(long, value_enum, default_value = "text")]
    format: OutputFormat,

    /// Log level (trace / debug / info / warn / error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

// ── Workload ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Serialize)]
struct Summary {
    vdisk_id: String,
    ops: usize,
    io_errors: usize,
    rejected: usize,
    verify_failures: usize,
    elapsed_ms: u128,
    iops: f64,
    current_host: Option<String>,
    failed: bool,
    stats: StatsSnapshot,
}

enum Pending {
    Read { block: u64, verify: bool },
    Write { block: u64, pattern: u8 },
}

fn pattern_for(op: usize) -> u8 {
    // Never zero so unwritten blocks are distinguishable
    u8::try_from(op % 255).unwrap_or(0) + 1
}

async fn run_workload(
    vdisk: &VDisk,
    args: &Args,
    cluster: &LoopbackCluster,
    primary: &str,
) -> Result<Summary> {
    let blocks = args.size / args.io_size as u64;
    if blocks == 0 {
        bail!("disk of {} bytes holds no {}-byte blocks", args.size, args.io_size);
    }

    let mut rng = rand::thread_rng();
    let mut written: HashMap<u64, u8> = HashMap::new();
    let mut summary = Summary {
        vdisk_id: vdisk.vdisk_id().to_string(),
        ..Summary::default()
    };
    let start = Instant::now();
    let mut issued = 0;

    while issued < args.ops {
        let batch = args.queue_depth.min(args.ops - issued).max(1);
        let mut waiting = Vec::with_capacity(batch);
        let mut batch_writes = HashSet::new();

        for _ in 0..batch {
            if args.kill_primary_after == Some(issued) {
                warn!("taking primary agent {} down", primary);
                cluster.set_agent_up(primary, false);
            }

            let block = rng.gen_range(0..blocks);
            let offset = block * args.io_size as u64;
            let (tx, rx) = oneshot::channel::<Completion>();
            let callback = Box::new(move |completion: Completion| {
                let _ = tx.send(completion);
            });

            let (submitted, pending) = if rng.gen_bool(args.write_ratio) {
                let pattern = pattern_for(issued);
                batch_writes.insert(block);
                (
                    vdisk.write(offset, IoVector::from_buf(vec![pattern; args.io_size]), callback),
                    Pending::Write { block, pattern },
                )
            } else {
                (
                    vdisk.read(offset, IoVector::zeroed(args.io_size), callback),
                    Pending::Read {
                        block,
                        verify: !batch_writes.contains(&block),
                    },
                )
            };
            issued += 1;

            match submitted {
                Ok(_) => waiting.push((rx, pending)),
                Err(e) => {
                    summary.rejected += 1;
                    warn!("request at offset {} rejected: {}", offset, e);
                }
            }
        }

        for (rx, pending) in waiting {
            let completion = rx.await.context("completion callback dropped")?;
            summary.ops += 1;
            if completion.status.is_err() {
                summary.io_errors += 1;
                continue;
            }
            match pending {
                Pending::Write { block, pattern } => {
                    written.insert(block, pattern);
                }
                Pending::Read { block, verify } => {
                    let expected = written.get(&block).copied().unwrap_or(0);
                    if verify && completion.iov.to_vec().iter().any(|b| *b != expected) {
                        summary.verify_failures += 1;
                        warn!("block {} read back wrong data", block);
                    }
                }
            }
        }
    }

    let elapsed = start.elapsed();
    summary.elapsed_ms = elapsed.as_millis();
    summary.iops = summary.ops as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    Ok(summary)
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting VxHS bench");

    // ── Target ────────────────────────────────────────────────────────────────
    let target = args.target.clone().unwrap_or_else(|| {
        format!(
            "vxhs://127.0.0.1:9999/{{{}%7Dvxhs://127.0.0.2:9999",
            Uuid::new_v4()
        )
    });
    let config = VDiskConfig::parse(&target).context("parse vdisk target")?;
    let primary = config
        .primary()
        .map(|host| host.agent_uri())
        .context("target has no storage agent")?;

    // ── Loopback agents ───────────────────────────────────────────────────────
    let cluster = Arc::new(LoopbackCluster::for_config(&config, args.size));
    cluster.set_latency(Duration::from_micros(args.latency_us));

    // ── Driver ────────────────────────────────────────────────────────────────
    let settings = DriverConfig {
        max_io_size: args.max_io_size,
        failover_timeout_ms: args.failover_timeout_ms,
        failover_retry_interval_ms: args.failover_retry_ms,
        ..DriverConfig::default()
    };
    let driver = VxhsDriver::with_settings(cluster.clone(), settings);
    let vdisk = driver
        .open(&config, &tokio::runtime::Handle::current())
        .context("open vdisk")?;

    let length = vdisk.get_length().context("query vdisk length")?;
    info!(
        "vdisk {} open: {} bytes, {} host(s)",
        config.vdisk_id,
        length,
        config.hosts.len()
    );

    // ── Workload ──────────────────────────────────────────────────────────────
    let mut summary = run_workload(&vdisk, &args, &cluster, &primary).await?;
    vdisk.flush().context("flush vdisk")?;

    summary.current_host = vdisk.current_host().map(|host| host.to_string());
    summary.failed = vdisk.failover_state() == FailoverState::Failed;
    summary.stats = vdisk.stats();

    info!(
        "{} requests in {} ms ({:.0} IOPS), {} I/O errors, {} verify failures",
        summary.ops, summary.elapsed_ms, summary.iops, summary.io_errors, summary.verify_failures
    );

    match args.format {
        OutputFormat::Text => print!("{}", summary.stats.render_prometheus(&summary.vdisk_id)),
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("serialize summary")?
        ),
    }

    vdisk.close();
    if summary.verify_failures > 0 {
        bail!("{} reads returned unexpected data", summary.verify_failures);
    }
    Ok(())
}
