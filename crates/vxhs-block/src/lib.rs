//! VxHS Block Driver Core
//!
//! This crate implements the client side of a VxHS (HyperScale) network
//! vDisk: guest reads and writes are split into transport-sized segments,
//! sent to a storage agent over an asynchronous message channel, and
//! completed back to the host on its own event loop.
//!
//! # Features
//!
//! - **Segmenting**: Requests larger than `max_io_size` fan out into
//!   segments joined by a per-request counter
//! - **Failover**: A dropped channel parks affected requests on a retry
//!   queue while a background state machine probes the other agents
//! - **Replay**: Parked requests are resubmitted in order once an agent
//!   accepts the vdisk, or failed with `EIO` if none does in time
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   Host (guest)  │  read / write / flush
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐         ┌──────────────────┐
//! │      VDisk      │◄────────┤  Failover FSM    │
//! │  - RequestBlock │  replay │  - probe agents  │
//! │  - retry queue  │         │  - retry queue   │
//! └────────┬────────┘         └──────────────────┘
//!          │ submit                    ▲
//! ┌────────▼────────┐  callback        │ channel drop
//! │    Transport    ├──────────────────┤
//! └────────┬────────┘                  │
//!          │                  ┌────────┴─────────┐
//!          │                  │  Completion pump │  (host event loop)
//!          ▼                  └──────────────────┘
//!   Storage agents
//! ```

pub mod completion;
pub mod driver;
pub mod error;
pub mod failover;
pub mod loopback;
pub mod request;
pub mod segment;
pub mod stats;
pub mod transport;
pub mod vdisk;

#[cfg(test)]
pub(crate) mod testing;

pub use completion::{CompletionReader, EventLoop, ManualEventLoop};
pub use driver::{ChannelPool, VxhsDriver};
pub use error::{BlockError, BlockResult, OpenError};
pub use failover::FailoverState;
pub use loopback::LoopbackCluster;
pub use request::{
    Completion, CompletionCallback, Direction, IoVector, RequestHandle, RequestState,
};
pub use segment::{Segment, SegmentMapper};
pub use stats::{StatsSnapshot, VDiskStats};
pub use transport::{
    ChannelHandle, DeviceHandle, IoContext, IoFlags, IoctlOp, Message, Opcode, Reason, Transport,
    TransportCallback, TransportError, TransportProvider, TransportResult,
};
pub use vdisk::VDisk;

/// Sector size in bytes
pub const SECTOR_SIZE: usize = 512;

/// Default transport submission cap: 1MB
pub const DEFAULT_MAX_IO_SIZE: usize = 1024 * 1024;
