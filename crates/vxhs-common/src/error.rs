//! Configuration error types

use thiserror::Error;

/// Result type for configuration loading
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Error raised while turning a URI or JSON target into a [`VDiskConfig`]
///
/// [`VDiskConfig`]: crate::VDiskConfig
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("parameter '{0}' is missing")]
    MissingParameter(&'static str),

    #[error("parameter '{field}' is missing (check 'server' array index {index})")]
    MissingServerField { field: &'static str, index: usize },

    #[error("{0}")]
    UnsupportedOption(&'static str),

    #[error("unsupported driver '{0}', expected 'vxhs'")]
    UnsupportedDriver(String),

    #[error("invalid URI '{uri}': {reason}. Usage: vxhs://[host[:port]]/{{VDISK_UUID}}")]
    InvalidUri { uri: String, reason: String },

    #[error("invalid port '{0}'")]
    InvalidPort(String),

    #[error("vdisk must have at least one storage agent")]
    EmptyHostList,

    #[error("invalid JSON target: {0}")]
    Json(#[from] serde_json::Error),
}

impl ConfigError {
    /// Create an invalid URI error
    pub fn invalid_uri(uri: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUri {
            uri: uri.into(),
            reason: reason.into(),
        }
    }

    /// Check if the error was caused by an option the driver refuses
    #[must_use]
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::UnsupportedOption(_) | Self::UnsupportedDriver(_))
    }
}
