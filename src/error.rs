//! Error types for the emulated accelerator runtime

use thiserror::Error;

/// Main error type for device, queue and graph operations
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Device task-graph support is below the required level
    #[error("device graph support level {found} is insufficient (requires {required})")]
    UnsupportedDevice {
        /// Support level reported by the device
        found: u32,
        /// Minimum level required
        required: u32,
    },

    /// Device is missing a required aspect (fp64, task-graph, ...)
    #[error("device '{device}' lacks required aspect: {aspect}")]
    MissingAspect {
        /// Device name
        device: String,
        /// Missing aspect
        aspect: String,
    },

    /// No enumerated device satisfies the selector
    #[error("no device matches the requested capabilities")]
    NoDevice,

    /// Kernel launch configuration rejected
    #[error("invalid launch configuration: {0}")]
    InvalidLaunch(String),

    /// Buffer misuse (size mismatch, aliasing, ...)
    #[error("buffer error: {0}")]
    Buffer(String),

    /// Device memory budget exhausted
    #[error("device memory exhausted: requested {requested_mb:.2}MB, available {available_mb:.2}MB")]
    OutOfMemory {
        /// Requested size in MB
        requested_mb: f64,
        /// Remaining budget in MB
        available_mb: f64,
    },

    /// Task graph misuse
    #[error("graph error: {0}")]
    Graph(String),

    /// Queue misuse
    #[error("queue error: {0}")]
    Queue(String),

    /// A submitted command failed, or one of its dependencies did
    #[error("command '{name}' failed: {reason}")]
    CommandFailed {
        /// Command label
        name: String,
        /// Failure reason
        reason: String,
    },

    /// Device workers are gone
    #[error("device executor has shut down")]
    ExecutorShutdown,

    /// Invalid sample configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error while reading configuration
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed TOML configuration
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

impl RuntimeError {
    /// True for the startup condition the binary reports and exits on cleanly
    pub fn is_unsupported_device(&self) -> bool {
        matches!(self, Self::UnsupportedDevice { .. } | Self::NoDevice)
    }

    /// Check if the caller can fix this by changing its inputs
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::InvalidLaunch(_) | Self::Config(_) | Self::Graph(_) | Self::Queue(_)
        )
    }

    pub(crate) fn command_failed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CommandFailed {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_device_message() {
        let err = RuntimeError::UnsupportedDevice { found: 0, required: 1 };
        assert!(err.is_unsupported_device());
        assert!(!err.is_recoverable());
        assert_eq!(
            err.to_string(),
            "device graph support level 0 is insufficient (requires 1)"
        );
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(RuntimeError::InvalidLaunch("x".into()).is_recoverable());
        assert!(!RuntimeError::ExecutorShutdown.is_recoverable());
    }
}
