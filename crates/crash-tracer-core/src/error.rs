//! Error types for crash-tracer-core

use thiserror::Error;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Why an attach attempt was rejected by the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachDenied {
    /// The process id does not exist or the process already terminated.
    NoSuchProcess,
    /// The kernel refused the attachment (ptrace scope, privileges).
    PermissionDenied,
    /// Any other errno from the attach request.
    Other,
}

impl std::fmt::Display for AttachDenied {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoSuchProcess => write!(f, "no such process"),
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::Other => write!(f, "attach rejected"),
        }
    }
}

/// Main error type for crash-tracer-core
#[derive(Error, Debug)]
pub enum Error {
    /// The target could not be attached: already gone, never existed, or
    /// the kernel denied the ptrace request. Not retried automatically —
    /// the target's liveness window may already have closed.
    #[error("attach to pid {pid} failed: {denied}: {detail}")]
    AttachFailed {
        pid: u32,
        denied: AttachDenied,
        detail: String,
    },

    /// A second interception attachment was requested for a pid that is
    /// already monitored. Caller error, surfaced immediately.
    #[error("pid {pid} is already attached")]
    AlreadyAttached { pid: u32 },

    /// The crash record for this target was already emitted. Caller
    /// error, surfaced immediately; records are at-most-once.
    #[error("crash record for pid {pid} already emitted")]
    AlreadyEmitted { pid: u32 },

    /// Spawning a target executable failed.
    #[error("failed to spawn `{command}`: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// No session is registered for this pid.
    #[error("no monitored session for pid {pid}")]
    UnknownTarget { pid: u32 },

    /// A session task ended without producing an outcome (panicked or
    /// was aborted out from under us).
    #[error("session for pid {pid} terminated abnormally: {detail}")]
    SessionFailed { pid: u32, detail: String },

    /// Configuration errors
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration loading/validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}
