//! Transport interface
//!
//! The driver core never talks to the network itself. A [`Transport`] opens
//! channels to storage agents, opens vdisk devices on those channels and
//! accepts asynchronous read/write/ioctl submissions. Completions come back
//! on transport-owned threads through the single [`TransportCallback`]
//! registered when the transport context was created.
//!
//! ```text
//!  submit_readv / submit_writev / ioctl
//!  ───────────────────────────────────────────►  transport
//!                                                   │
//!  callback(channel, reason, ctx, message)          │ (foreign thread)
//!  ◄────────────────────────────────────────────────┘
//! ```

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use bytes::Bytes;
use thiserror::Error;

use crate::failover::ProbeWaiter;
use crate::request::RequestBlock;
use crate::segment::Segment;

/// Transport-native error codes the driver needs to recognise
pub mod codes {
    /// The agent asks the client to retry against another source
    pub const RETRY_ON_SOURCE: i32 = 44;
    /// The agent hung up
    pub const HUP: i32 = 901;
    /// The channel to the agent dropped
    pub const CHANNEL_HUP: i32 = 903;
    /// Unclassified failure
    pub const GENERIC: i32 = -1;
}

/// Whether a transport error code means the channel to the agent is gone
/// (as opposed to the agent reporting a disk-level failure)
pub fn is_channel_drop(code: i32) -> bool {
    matches!(
        code,
        codes::RETRY_ON_SOURCE | codes::HUP | codes::CHANNEL_HUP | codes::GENERIC
    )
}

/// Handle of a channel to one storage agent
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChannelHandle(pub u32);

/// Handle of a vdisk device opened on a channel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub u32);

bitflags! {
    /// Submission flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IoFlags: u32 {
        /// Complete before returning
        const SYNC = 0x0001;
        /// Return immediately, complete through the callback
        const ASYNC = 0x0002;
        /// Deliver a callback when done
        const DONE = 0x0004;
    }
}

impl IoFlags {
    /// Flags used for every data-path submission
    pub const ASYNC_DONE: Self = Self::ASYNC.union(Self::DONE);
}

/// Why the transport invoked the callback
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reason {
    /// A submitted operation finished
    Done,
    /// The agent raised an event against an operation
    Event,
    /// The channel hung up
    Hup,
}

/// Operation a completion message refers to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opcode {
    Read,
    Write,
    /// Answer to a [`IoctlOp::CheckIoFailoverReady`] probe
    FailoverProbeReady,
    Other(u32),
}

/// Control operations
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoctlOp {
    /// Make acknowledged writes durable
    Flush,
    /// Return the vdisk size in bytes
    Stat,
    /// Ask an agent whether it can take over I/O for the vdisk
    CheckIoFailoverReady,
}

/// Completion message
#[derive(Clone, Debug)]
pub struct Message {
    pub opcode: Opcode,
    /// 0 on success, a transport-native code otherwise
    pub error: i32,
    /// Payload of a successful read
    pub data: Option<Bytes>,
}

impl Message {
    pub fn new(opcode: Opcode, error: i32) -> Self {
        Self {
            opcode,
            error,
            data: None,
        }
    }

    pub fn read_done(data: Bytes) -> Self {
        Self {
            opcode: Opcode::Read,
            error: 0,
            data: Some(data),
        }
    }
}

/// One in-flight segment of a request
#[derive(Clone)]
pub struct SegmentContext {
    pub request: Arc<RequestBlock>,
    pub segment: Segment,
}

/// Opaque context the transport hands back with a completion
#[derive(Clone)]
pub enum IoContext {
    /// Read or write segment
    Segment(SegmentContext),
    /// Failover readiness probe
    Probe(Arc<ProbeWaiter>),
}

impl fmt::Debug for IoContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Segment(ctx) => f
                .debug_struct("Segment")
                .field("request", &ctx.request.id())
                .field("segment", &ctx.segment)
                .finish(),
            Self::Probe(probe) => f
                .debug_struct("Probe")
                .field("vdisk", &probe.vdisk_id())
                .field("host", &probe.host_idx())
                .finish(),
        }
    }
}

/// Transport error
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport init failed: {0}")]
    Init(String),

    #[error("cannot connect to {address} (code {code})")]
    Connect { address: String, code: i32 },

    #[error("cannot open device {path} (code {code})")]
    DeviceOpen { path: String, code: i32 },

    #[error("submission failed (code {code})")]
    Submit { code: i32 },

    #[error("{op:?} ioctl failed (code {code})")]
    Ioctl { op: IoctlOp, code: i32 },
}

impl TransportError {
    /// Transport-native code
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::Init(_) => codes::GENERIC,
            Self::Connect { code, .. }
            | Self::DeviceOpen { code, .. }
            | Self::Submit { code }
            | Self::Ioctl { code, .. } => *code,
        }
    }

    /// Check if the error means the channel dropped
    #[must_use]
    pub fn is_channel_drop(&self) -> bool {
        is_channel_drop(self.code())
    }
}

/// Result type for transport calls
pub type TransportResult<T> = Result<T, TransportError>;

/// Completion callback registered with the transport
pub type TransportCallback =
    Arc<dyn Fn(ChannelHandle, Reason, Option<IoContext>, Message) + Send + Sync>;

/// Message-channel library the driver runs on
///
/// Submissions return `Err` only for synchronous failures; everything
/// else is reported through the callback.
pub trait Transport: Send + Sync {
    /// Open a channel to the agent at `address` (`of://host:port`)
    fn open_channel(&self, address: &str) -> TransportResult<ChannelHandle>;

    /// Open the vdisk device `path` on a channel
    fn open_device(&self, channel: ChannelHandle, path: &str) -> TransportResult<DeviceHandle>;

    /// Close a device handle
    fn close_device(&self, channel: ChannelHandle, device: DeviceHandle);

    /// Read `len` bytes at `offset`; the data arrives in the completion message
    fn submit_readv(
        &self,
        channel: ChannelHandle,
        device: DeviceHandle,
        len: usize,
        offset: u64,
        ctx: IoContext,
        flags: IoFlags,
    ) -> TransportResult<()>;

    /// Write `data` at `offset`
    fn submit_writev(
        &self,
        channel: ChannelHandle,
        device: DeviceHandle,
        data: Bytes,
        offset: u64,
        ctx: IoContext,
        flags: IoFlags,
    ) -> TransportResult<()>;

    /// Control operation. Synchronous calls return the operation's value
    /// (the size for [`IoctlOp::Stat`]); asynchronous calls return 0 and
    /// answer through the callback.
    fn ioctl(
        &self,
        channel: ChannelHandle,
        device: DeviceHandle,
        op: IoctlOp,
        ctx: Option<IoContext>,
        flags: IoFlags,
    ) -> TransportResult<u64>;
}

/// Factory for the process-wide transport context
pub trait TransportProvider: Send + Sync {
    /// Create the transport, registering the completion callback
    fn init(&self, callback: TransportCallback) -> TransportResult<Arc<dyn Transport>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_drop_classification() {
        assert!(is_channel_drop(codes::RETRY_ON_SOURCE));
        assert!(is_channel_drop(codes::HUP));
        assert!(is_channel_drop(codes::CHANNEL_HUP));
        assert!(is_channel_drop(codes::GENERIC));
        assert!(!is_channel_drop(libc::EIO));
        assert!(!is_channel_drop(0));
    }

    #[test]
    fn test_error_code() {
        let err = TransportError::Ioctl {
            op: IoctlOp::Flush,
            code: codes::CHANNEL_HUP,
        };
        assert_eq!(err.code(), codes::CHANNEL_HUP);
        assert!(err.is_channel_drop());
        assert!(!TransportError::Submit { code: libc::ENOSPC }.is_channel_drop());
    }

    #[test]
    fn test_async_done_flags() {
        assert!(IoFlags::ASYNC_DONE.contains(IoFlags::ASYNC));
        assert!(IoFlags::ASYNC_DONE.contains(IoFlags::DONE));
        assert!(!IoFlags::ASYNC_DONE.contains(IoFlags::SYNC));
    }
}
