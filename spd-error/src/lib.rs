//! Unified error handling for socpowerd
//!
//! This crate provides a single error type used across all socpowerd
//! components. It uses thiserror for ergonomic error definitions with proper
//! Display and Error trait impls.

use std::io;
use std::path::PathBuf;

/// Result type alias using DaemonError
pub type Result<T> = std::result::Result<T, DaemonError>;

/// Unified error type for all socpowerd operations
#[derive(thiserror::Error, Debug)]
pub enum DaemonError {
    // ============================================================================
    // I/O and Kernel File Interfaces
    // ============================================================================
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Kernel interface not present: {0}")]
    InterfaceMissing(PathBuf),

    #[error("poll() on {path} failed: {source}")]
    Poll {
        path: PathBuf,
        source: io::Error,
    },

    // ============================================================================
    // Parsing
    // ============================================================================
    #[error("Failed to parse value '{value}' from {path}")]
    ValueParse {
        path: PathBuf,
        value: String,
    },

    #[error("Malformed /proc/stat aggregate line: {0}")]
    StatParse(String),

    // ============================================================================
    // Netlink
    // ============================================================================
    #[error("Netlink socket error: {0}")]
    NetlinkSocket(io::Error),

    #[error("Generic netlink family '{family}' not resolvable: {reason}")]
    NetlinkResolve {
        family: String,
        reason: String,
    },

    #[error("Truncated or malformed netlink message ({0})")]
    NetlinkMessage(String),

    // ============================================================================
    // Hint Sink
    // ============================================================================
    #[error("Power service unreachable at {path}: {source}")]
    SinkConnect {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Hint dispatch failed for '{mode}': {reason}")]
    SinkDispatch {
        mode: String,
        reason: String,
    },

    // ============================================================================
    // Configuration and Lifecycle
    // ============================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Monitor '{name}' failed to initialize: {reason}")]
    MonitorInit {
        name: String,
        reason: String,
    },

    #[error("Worker error: {0}")]
    Worker(String),
}

impl DaemonError {
    /// Convenience constructor for read failures with path context
    pub fn file_read(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::FileRead { path: path.into(), source }
    }

    /// Convenience constructor for write failures with path context
    pub fn file_write(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::FileWrite { path: path.into(), source }
    }

    /// Convenience constructor for unparsable sysfs values
    pub fn value_parse(path: impl Into<PathBuf>, value: impl Into<String>) -> Self {
        Self::ValueParse { path: path.into(), value: value.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_path_context() {
        let err = DaemonError::file_read(
            "/proc/stat",
            io::Error::new(io::ErrorKind::NotFound, "missing"),
        );
        let msg = err.to_string();
        assert!(msg.contains("/proc/stat"));
        assert!(msg.contains("missing"));
    }

    #[test]
    fn io_error_converts() {
        fn fails() -> Result<()> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"))?;
            Ok(())
        }
        assert!(matches!(fails(), Err(DaemonError::Io(_))));
    }
}
