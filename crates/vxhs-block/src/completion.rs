//! Completion pump
//!
//! Transport threads never run host callbacks. The transport callback does
//! the per-segment accounting, and the segment that takes a request's
//! counter to zero pushes the request onto a FIFO completion queue. The
//! host event loop owns the [`CompletionReader`] at the other end and runs
//! [`complete_request`] for each entry.
//!
//! ```text
//!  transport thread                      event-loop thread
//!  ────────────────                      ─────────────────
//!  transport_callback
//!    └─ segment_finished ─► queue ─────► CompletionReader
//!                                          └─ complete_request
//!                                               └─ host callback
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::failover;
use crate::request::{Direction, RequestBlock};
use crate::transport::{
    ChannelHandle, IoContext, Message, Opcode, Reason, SegmentContext, is_channel_drop,
};
use crate::vdisk::SegmentOutcome;

// ── Transport callback ───────────────────────────────────────────────────────

/// The callback registered with the transport context
pub(crate) fn transport_callback(
    channel: ChannelHandle,
    reason: Reason,
    ctx: Option<IoContext>,
    msg: Message,
) {
    match (msg.opcode, ctx) {
        (Opcode::Read | Opcode::Write, Some(IoContext::Segment(ctx))) => {
            on_segment_done(reason, ctx, msg);
        }
        (Opcode::FailoverProbeReady, Some(IoContext::Probe(probe))) => {
            debug!(
                "failover probe for {} on host {} answered with {}",
                probe.vdisk_id(),
                probe.host_idx(),
                msg.error
            );
            probe.complete(msg.error);
        }
        (_, None) if reason == Reason::Hup => {
            warn!(
                "channel {:?} hung up with no request in flight (error {})",
                channel, msg.error
            );
        }
        (opcode, ctx) => {
            debug!(
                "ignoring {:?} callback for {:?} on channel {:?}: {:?}",
                reason, opcode, channel, ctx
            );
        }
    }
}

fn on_segment_done(reason: Reason, ctx: SegmentContext, msg: Message) {
    let SegmentContext { request, segment } = ctx;
    let owner = Arc::clone(request.owner());

    let mut outcome = classify(reason, msg.error, owner.is_redundant());
    if outcome == SegmentOutcome::Ok && request.direction() == Direction::Read {
        let data = msg.data.unwrap_or_default();
        if !request.store_read_data(&segment, &data) {
            warn!(
                "request {} segment {} returned {} bytes, expected {}",
                request.id(),
                segment.index,
                data.len(),
                segment.len
            );
            outcome = SegmentOutcome::DiskError(libc::EIO);
        }
    }

    trace!(
        "request {} segment {} finished: {:?}",
        request.id(),
        segment.index,
        outcome
    );
    owner.segment_finished(&request, outcome);
}

/// Sort a segment error into success, disk error or channel drop. Channel
/// drops only drive failover when another host exists to fail over to.
pub(crate) fn classify(reason: Reason, error: i32, redundant: bool) -> SegmentOutcome {
    if error == 0 {
        SegmentOutcome::Ok
    } else if redundant
        && is_channel_drop(error)
        && matches!(reason, Reason::Done | Reason::Event)
    {
        SegmentOutcome::ChannelDrop(error)
    } else {
        SegmentOutcome::DiskError(error)
    }
}

// ── Completion queue ─────────────────────────────────────────────────────────

/// Create the queue between transport threads and the event loop
pub(crate) fn completion_queue(vdisk_id: &str) -> (CompletionSender, CompletionReader) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        CompletionSender {
            tx: Mutex::new(Some(tx)),
        },
        CompletionReader {
            vdisk_id: vdisk_id.to_string(),
            rx,
        },
    )
}

/// Producer side, owned by the vdisk
#[derive(Debug)]
pub(crate) struct CompletionSender {
    tx: Mutex<Option<mpsc::UnboundedSender<Arc<RequestBlock>>>>,
}

impl CompletionSender {
    /// Queue a finished request. Returns false if the vdisk is closed or the
    /// reader is gone, in which case the completion is dropped.
    pub fn push(&self, req: Arc<RequestBlock>) -> bool {
        let tx = self.tx.lock();
        let Some(tx) = tx.as_ref() else {
            debug!("vdisk closed, dropping completion of request {}", req.id());
            return false;
        };
        match tx.send(req) {
            Ok(()) => true,
            Err(mpsc::error::SendError(req)) => {
                warn!(
                    "completion reader gone, dropping completion of request {}",
                    req.id()
                );
                false
            }
        }
    }

    /// Stop accepting completions; the reader finishes once drained
    pub fn close(&self) {
        self.tx.lock().take();
    }
}

/// Consumer side, driven by the host event loop
#[derive(Debug)]
pub struct CompletionReader {
    vdisk_id: String,
    rx: mpsc::UnboundedReceiver<Arc<RequestBlock>>,
}

impl CompletionReader {
    pub fn vdisk_id(&self) -> &str {
        &self.vdisk_id
    }

    /// Complete every request queued so far without blocking. Returns the
    /// number of requests taken off the queue.
    pub fn drain(&mut self) -> usize {
        let mut count = 0;
        while let Ok(req) = self.rx.try_recv() {
            complete_request(req);
            count += 1;
        }
        count
    }

    /// Complete requests as they arrive until the vdisk closes
    pub async fn run(mut self) {
        while let Some(req) = self.rx.recv().await {
            complete_request(req);
        }
        debug!("completion reader for {} stopped", self.vdisk_id);
    }
}

/// Deliver a request's result to the host
pub(crate) fn complete_request(req: Arc<RequestBlock>) {
    let owner = Arc::clone(req.owner());
    let Some((callback, completion)) = req.finish() else {
        debug!("request {} already completed", req.id());
        return;
    };

    let start_failover = owner.state.lock().release_inflight(&req);
    owner.stats.record_completion(completion.status.is_ok());
    callback(completion);

    if start_failover {
        failover::spawn(owner);
    }
}

// ── Event loop integration ───────────────────────────────────────────────────

/// Host event loop that drains completion readers
pub trait EventLoop: Send + Sync {
    /// Take ownership of a vdisk's reader
    fn register(&self, reader: CompletionReader);
}

impl EventLoop for tokio::runtime::Handle {
    fn register(&self, reader: CompletionReader) {
        debug!("spawning completion reader for {}", reader.vdisk_id());
        self.spawn(reader.run());
    }
}

/// Event loop the host polls explicitly
#[derive(Debug, Default)]
pub struct ManualEventLoop {
    readers: Mutex<Vec<CompletionReader>>,
}

impl ManualEventLoop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain every registered reader once; returns the number of
    /// completions delivered
    pub fn poll(&self) -> usize {
        self.readers
            .lock()
            .iter_mut()
            .map(CompletionReader::drain)
            .sum()
    }

    pub fn reader_count(&self) -> usize {
        self.readers.lock().len()
    }
}

impl EventLoop for ManualEventLoop {
    fn register(&self, reader: CompletionReader) {
        self.readers.lock().push(reader);
    }
}
