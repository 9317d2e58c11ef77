//! VxHS Common - Shared configuration types
//!
//! This crate holds the pieces of the VxHS block driver that have no
//! dependency on the transport: the vDisk target description produced by
//! the configuration loader, the driver tunables, and their error type.

pub mod config;
pub mod error;

pub use config::{DriverConfig, HostAddr, VDiskConfig};
pub use error::{ConfigError, ConfigResult};

/// Default port a storage agent listens on
pub const DEFAULT_AGENT_PORT: u16 = 9999;

/// Device namespace prefix the storage agents expect in front of a vdisk id
pub const VDISK_PREFIX: &str = "/dev/of/vdisk";
