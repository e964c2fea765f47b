//! Error types for rar-bridge
//!
//! This module provides error handling for the whole service:
//! - Domain-specific error types (Archive, Database, Mount, etc.)
//! - Retry classification driving the queue's per-item disposition
//! - Exit-code mapping for the binary entry point

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for rar-bridge operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for rar-bridge
///
/// Each variant includes enough context to explain the failure in a log line.
/// Archive errors carry their own sub-enum because they drive the queue's
/// retry-or-quarantine decision.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "paths.watch")
        key: Option<String>,
    },

    /// Archive reader failure (missing volume, corruption, encryption, ...)
    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),

    /// Duplicate-index database failure
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Directory watching error
    #[error("watch error: {0}")]
    Watch(String),

    /// No free port in the configured range for the virtual-HTTP server
    #[error("no free port in range {lo}-{hi}")]
    PortUnavailable {
        /// Lower bound of the configured port range
        lo: u16,
        /// Upper bound of the configured port range
        hi: u16,
    },

    /// External mount helper failure (missing binary, mount timeout, ...)
    #[error("mount error: {0}")]
    Mount(String),

    /// Network error talking to the media server
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// External tool execution failed (unrar, encoder, mount helper)
    #[error("external tool error: {0}")]
    ExternalTool(String),

    /// Shutdown in progress - current work is being abandoned
    #[error("shutdown in progress")]
    ShuttingDown,
}

/// Archive reader failure modes
///
/// These are the non-fatal, per-archive failures of the reader contract.
/// The queue maps them to retry or quarantine; none of them stop the service.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// A referenced volume of the set is absent
    #[error("missing volume {volume} for archive {archive}")]
    MissingVolume {
        /// First volume of the archive set
        archive: PathBuf,
        /// The volume that could not be opened
        volume: PathBuf,
    },

    /// The archive failed its integrity test
    #[error("archive {archive} is corrupt: {reason}")]
    Corrupt {
        /// First volume of the archive set
        archive: PathBuf,
        /// Decoder output explaining the failure
        reason: String,
    },

    /// The archive requires a password
    #[error("archive {archive} is encrypted")]
    Encrypted {
        /// First volume of the archive set
        archive: PathBuf,
    },

    /// The integrity test exceeded its wall-clock budget
    #[error("archive test timed out after {seconds}s for {archive}")]
    Timeout {
        /// First volume of the archive set
        archive: PathBuf,
        /// The configured timeout that elapsed
        seconds: u64,
    },

    /// Read failure against the archive volumes
    #[error("archive I/O error for {archive}: {reason}")]
    Io {
        /// First volume of the archive set
        archive: PathBuf,
        /// Underlying failure
        reason: String,
    },
}

/// Duplicate-index database errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to open the index
    #[error("failed to open duplicate index: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),
}

impl Error {
    /// Whether the queue should reschedule the item at the retry cadence.
    ///
    /// Missing volumes, corruption, test timeouts and archive I/O failures are
    /// usually an in-progress copy or a flaky disk; a constant retry cadence
    /// resolves them. Everything else is permanent for the item.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Archive(e) => matches!(
                e,
                ArchiveError::MissingVolume { .. }
                    | ArchiveError::Corrupt { .. }
                    | ArchiveError::Timeout { .. }
                    | ArchiveError::Io { .. }
            ),
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// Whether the item must be quarantined without any retry attempt.
    ///
    /// Encrypted archives never become readable by waiting; port exhaustion
    /// and mount-helper failures are operator problems, not races.
    pub fn quarantines_immediately(&self) -> bool {
        matches!(
            self,
            Error::Archive(ArchiveError::Encrypted { .. })
                | Error::PortUnavailable { .. }
                | Error::Mount(_)
                | Error::ExternalTool(_)
        )
    }

    /// Process exit code for failures that abort startup.
    ///
    /// Configuration problems exit 2, everything else fatal at runtime exits 3.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config { .. } => 2,
            _ => 3,
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn missing_volume() -> Error {
        Error::Archive(ArchiveError::MissingVolume {
            archive: PathBuf::from("/watch/x.rar"),
            volume: PathBuf::from("/watch/x.r01"),
        })
    }

    // -----------------------------------------------------------------------
    // Retry classification: the per-kind disposition table
    // -----------------------------------------------------------------------

    #[test]
    fn missing_volume_is_retryable() {
        assert!(missing_volume().is_retryable());
        assert!(!missing_volume().quarantines_immediately());
    }

    #[test]
    fn corrupt_and_timeout_are_retryable() {
        let corrupt = Error::Archive(ArchiveError::Corrupt {
            archive: PathBuf::from("x.rar"),
            reason: "CRC failed".into(),
        });
        let timeout = Error::Archive(ArchiveError::Timeout {
            archive: PathBuf::from("x.rar"),
            seconds: 300,
        });
        assert!(corrupt.is_retryable());
        assert!(timeout.is_retryable());
    }

    #[test]
    fn encrypted_quarantines_immediately_without_retry() {
        let err = Error::Archive(ArchiveError::Encrypted {
            archive: PathBuf::from("secret.rar"),
        });
        assert!(!err.is_retryable());
        assert!(err.quarantines_immediately());
    }

    #[test]
    fn port_exhaustion_quarantines_immediately() {
        let err = Error::PortUnavailable { lo: 8765, hi: 8865 };
        assert!(!err.is_retryable());
        assert!(err.quarantines_immediately());
    }

    #[test]
    fn mount_failure_quarantines_immediately() {
        let err = Error::Mount("rar2fs not found".into());
        assert!(err.quarantines_immediately());
    }

    #[test]
    fn config_error_is_neither() {
        let err = Error::Config {
            message: "bad value".into(),
            key: Some("paths.watch".into()),
        };
        assert!(!err.is_retryable());
        assert!(!err.quarantines_immediately());
    }

    // -----------------------------------------------------------------------
    // Exit codes
    // -----------------------------------------------------------------------

    #[test]
    fn config_error_exits_2() {
        let err = Error::Config {
            message: "missing paths.watch".into(),
            key: None,
        };
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn runtime_errors_exit_3() {
        assert_eq!(Error::PortUnavailable { lo: 1, hi: 2 }.exit_code(), 3);
        assert_eq!(missing_volume().exit_code(), 3);
    }

    #[test]
    fn display_includes_context() {
        let msg = missing_volume().to_string();
        assert!(msg.contains("x.r01"), "message was: {msg}");
        assert!(msg.contains("x.rar"), "message was: {msg}");
    }
}
