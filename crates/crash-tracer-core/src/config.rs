//! Configuration for the tracer.
//!
//! A single [`TracerConfig`] covers capture sizing, polling cadence, the
//! per-target liveness budget, and logging. Loaded from a TOML file when
//! one is present (`crash-tracer.toml` in the working directory, unless
//! an explicit path is given) and overridable field-by-field by the CLI.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::LogConfig;

/// Default stderr capture bound: keep the most recent 64 KiB.
pub const DEFAULT_STDERR_CAP_KB: usize = 64;

/// Default wait-loop polling cadence.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10;

/// Tracer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TracerConfig {
    /// Bound on buffered stderr per target, in KiB. Oldest bytes are
    /// dropped on overflow.
    pub stderr_cap_kb: usize,

    /// Cadence of the non-blocking wait loop, in milliseconds. Also the
    /// upper bound on how long detach/timeout requests go unnoticed.
    pub poll_interval_ms: u64,

    /// Per-target liveness budget in seconds. A target still running
    /// when the budget expires is force-detached with a `Timeout`
    /// status. `None` means no budget.
    pub timeout_secs: Option<u64>,

    /// Count SIGTERM deliveries per target. SIGTERM is never classified
    /// as a crash; the count is surfaced as a record note.
    pub track_sigterm: bool,

    /// Logging configuration.
    pub log: LogConfig,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            stderr_cap_kb: DEFAULT_STDERR_CAP_KB,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            timeout_secs: None,
            track_sigterm: false,
            log: LogConfig::default(),
        }
    }
}

impl TracerConfig {
    /// Load from a TOML file.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load `crash-tracer.toml` from the working directory when present,
    /// defaults otherwise.
    pub fn discover() -> Result<Self, ConfigError> {
        let candidate = Path::new("crash-tracer.toml");
        if candidate.exists() {
            Self::from_path(candidate)
        } else {
            Ok(Self::default())
        }
    }

    /// Reject configurations the capture layers cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stderr_cap_kb == 0 {
            return Err(ConfigError::Invalid {
                field: "stderr_cap_kb".to_string(),
                reason: "must be at least 1 KiB".to_string(),
            });
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "poll_interval_ms".to_string(),
                reason: "must be nonzero".to_string(),
            });
        }
        Ok(())
    }

    /// Stderr bound in bytes.
    #[must_use]
    pub fn stderr_cap_bytes(&self) -> usize {
        self.stderr_cap_kb * 1024
    }

    /// Poll cadence as a duration.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Liveness budget as a duration, when configured.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn defaults_are_valid() {
        let config = TracerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.stderr_cap_bytes(), 64 * 1024);
        assert_eq!(config.poll_interval(), Duration::from_millis(10));
        assert_eq!(config.timeout(), None);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "stderr_cap_kb = 8\ntimeout_secs = 30").expect("write");
        let config = TracerConfig::from_path(file.path()).expect("load");
        assert_eq!(config.stderr_cap_kb, 8);
        assert_eq!(config.timeout_secs, Some(30));
        assert_eq!(config.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
        assert!(!config.track_sigterm);
    }

    #[test]
    fn zero_capture_bound_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "stderr_cap_kb = 0").expect("write");
        let err = TracerConfig::from_path(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "stderr_cap_kb = \"lots\"").expect("write");
        let err = TracerConfig::from_path(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
