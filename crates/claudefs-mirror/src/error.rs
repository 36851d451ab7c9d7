//! Error types for the snapshot mirroring subsystem.

use thiserror::Error;

/// Result type alias for mirroring operations.
pub type MirrorResult<T> = Result<T, MirrorError>;

/// Errors that can occur while mirroring snapshots to a peer.
#[derive(Debug, Error)]
pub enum MirrorError {
    /// A filesystem operation against a mount failed.
    #[error("{op} failed on {path}: {source}")]
    Fs {
        /// Operation that failed (e.g. "mkdir", "rename_snapshot").
        op: &'static str,
        /// Path the operation was applied to.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Wraps standard I/O errors without path context.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer's mount session was blocklisted by the remote cluster.
    #[error("peer session is blocklisted")]
    Blocklisted,

    /// The replayer is shutting down.
    #[error("replayer is shutting down")]
    Shutdown,

    /// Work on the directory was canceled because it was removed from mirroring.
    #[error("directory sync canceled")]
    Canceled,

    /// Another worker already holds the directory.
    #[error("directory {dir} is already registered")]
    AlreadyRegistered {
        /// The directory path.
        dir: String,
    },

    /// The directory has no live registration.
    #[error("directory {dir} is not registered")]
    NotRegistered {
        /// The directory path.
        dir: String,
    },

    /// A snapshot on a mount is malformed (e.g. missing primary snapshot id).
    #[error("invalid snapshot {snap} in {dir}: {reason}")]
    InvalidSnapshot {
        /// The mirrored directory.
        dir: String,
        /// The snapshot name.
        snap: String,
        /// Why the snapshot was rejected.
        reason: String,
    },

    /// Status serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration could not be loaded or is out of range.
    #[error("config error: {msg}")]
    Config {
        /// Error message describing the issue.
        msg: String,
    },
}

impl MirrorError {
    /// Wraps an I/O error with the operation and path it came from.
    pub fn fs(op: &'static str, path: impl Into<String>, source: std::io::Error) -> Self {
        MirrorError::Fs {
            op,
            path: path.into(),
            source,
        }
    }

    /// Returns true for the preflight abort signals (blocklisted, shutdown, canceled).
    pub fn is_abort(&self) -> bool {
        matches!(
            self,
            MirrorError::Blocklisted | MirrorError::Shutdown | MirrorError::Canceled
        )
    }

    /// Returns true if the error should count against the directory's
    /// consecutive-failure budget.
    pub fn counts_as_failure(&self) -> bool {
        !matches!(
            self,
            MirrorError::Shutdown | MirrorError::Canceled | MirrorError::AlreadyRegistered { .. }
        )
    }

    /// Returns the `io::ErrorKind` for filesystem errors.
    pub fn io_kind(&self) -> Option<std::io::ErrorKind> {
        match self {
            MirrorError::Fs { source, .. } => Some(source.kind()),
            MirrorError::Io(e) => Some(e.kind()),
            _ => None,
        }
    }
}
