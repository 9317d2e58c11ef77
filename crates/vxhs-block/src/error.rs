//! Block driver error types

use thiserror::Error;
use vxhs_common::ConfigError;

use crate::transport::TransportError;

/// Failure while opening a vDisk
#[derive(Error, Debug)]
pub enum OpenError {
    /// The process-wide transport context could not be created
    #[error("transport initialization failed: {0}")]
    TransportInit(String),

    /// No channel could be opened to the primary storage agent
    #[error("storage agent {address} unreachable: {source}")]
    Unreachable {
        address: String,
        #[source]
        source: TransportError,
    },

    /// The agent refused to open the vdisk device
    #[error("failed to open vdisk device {path}: {source}")]
    DeviceOpen {
        path: String,
        #[source]
        source: TransportError,
    },
}

/// Block driver error
#[derive(Error, Debug)]
pub enum BlockError {
    /// Invalid vdisk target
    #[error("invalid vdisk configuration: {0}")]
    Config(#[from] ConfigError),

    /// Open failed
    #[error("open failed: {0}")]
    Open(#[from] OpenError),

    /// I/O failed; every transport or disk error is reported as this
    #[error("I/O error")]
    Io,

    /// The vdisk exhausted failover and refuses all I/O
    #[error("vdisk {0} has failed")]
    VDiskFailed(String),

    /// Request rejected before submission
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The vdisk was closed
    #[error("vdisk {0} is closed")]
    Closed(String),

    /// Synchronous transport error
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl BlockError {
    /// Create an invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Errno reported to the host block layer
    ///
    /// Everything that is not a caller mistake is reported as `EIO`.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::Config(_) | Self::InvalidRequest(_) => libc::EINVAL,
            Self::Open(_)
            | Self::Io
            | Self::VDiskFailed(_)
            | Self::Closed(_)
            | Self::Transport(_) => libc::EIO,
        }
    }

    /// Check if this error was raised while opening the vdisk
    #[must_use]
    pub fn is_open_error(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Open(_))
    }
}

/// Result type for block operations
pub type BlockResult<T> = Result<T, BlockError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_masks_to_eio() {
        assert_eq!(BlockError::Io.errno(), libc::EIO);
        assert_eq!(BlockError::VDiskFailed("{a}".into()).errno(), libc::EIO);
        assert_eq!(
            BlockError::Transport(TransportError::Submit { code: 903 }).errno(),
            libc::EIO
        );
        assert_eq!(BlockError::invalid_request("empty").errno(), libc::EINVAL);
    }

    #[test]
    fn test_open_error_kind() {
        let err: BlockError = OpenError::TransportInit("no context".into()).into();
        assert!(err.is_open_error());
        assert!(!BlockError::Io.is_open_error());
    }
}
