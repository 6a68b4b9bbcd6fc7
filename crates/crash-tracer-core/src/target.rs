//! Monitored-target identity and launch metadata.
//!
//! A [`TargetHandle`] names one process under observation: its pid, when
//! monitoring began, an optional human-readable command description, and
//! — when the tracer spawned the process itself — the owned read end of
//! its stderr. Targets are opaque beyond this; the tracer never assumes
//! anything about what the process does.

use std::fs;
use std::os::unix::process::ExitStatusExt as _;
use std::process::ChildStderr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Request to spawn-and-trace an executable.
///
/// Actual spawn mechanics live in the interception layer (the child must
/// be forked from the tracer thread); this is just the description.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Program to execute.
    pub program: String,
    /// Arguments, excluding argv\[0\].
    pub args: Vec<String>,
    /// Optional working directory.
    pub cwd: Option<String>,
}

impl SpawnRequest {
    /// New request with no arguments.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    /// Append an argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// One-line rendering for logs and records.
    #[must_use]
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Handle for one monitored process.
///
/// Owned by the session manager for the session's lifetime and
/// exclusively associated with at most one interception attachment.
#[derive(Debug)]
pub struct TargetHandle {
    /// Process id.
    pub pid: u32,
    /// When monitoring of this target began.
    pub launched_at: DateTime<Utc>,
    /// Command description: the spawn request for spawned targets, or
    /// whatever `/proc` offers for attached ones.
    pub command: Option<String>,
    /// Read end of the target's stderr, present only for spawned
    /// targets. Taken by the output correlator at capture start.
    pub stderr: Option<ChildStderr>,
}

impl TargetHandle {
    /// Serializable identity for records.
    #[must_use]
    pub fn target_ref(&self) -> TargetRef {
        TargetRef {
            pid: self.pid,
            command: self.command.clone(),
            launched_at: self.launched_at,
        }
    }
}

/// Serializable subset of a target handle carried in crash records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetRef {
    /// Process id.
    pub pid: u32,
    /// Command description, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// When monitoring began.
    pub launched_at: DateTime<Utc>,
}

/// Best-effort command description from `/proc/<pid>/`.
///
/// Prefers the full cmdline (NUL-separated argv) and falls back to
/// `comm`. Returns `None` when the process is gone or `/proc` is not
/// readable.
#[must_use]
pub fn describe_pid(pid: u32) -> Option<String> {
    let cmdline = fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    if !cmdline.is_empty() {
        let parts: Vec<String> = cmdline
            .split(|b| *b == 0)
            .filter(|part| !part.is_empty())
            .map(|part| String::from_utf8_lossy(part).into_owned())
            .collect();
        if !parts.is_empty() {
            return Some(parts.join(" "));
        }
    }
    // Kernel threads and zombies have an empty cmdline; comm still names them.
    let comm = fs::read_to_string(format!("/proc/{pid}/comm")).ok()?;
    let comm = comm.trim();
    if comm.is_empty() {
        None
    } else {
        Some(comm.to_string())
    }
}

/// Decode a raw `waitpid`-style status word into (exit code, signal).
///
/// Used for the exit-event message ptrace reports for attached
/// non-child targets, which arrives in the same encoding as a wait
/// status.
#[must_use]
pub fn decode_wait_status(raw: i32) -> (Option<i32>, Option<i32>) {
    let status = std::process::ExitStatus::from_raw(raw);
    (status.code(), status.signal())
}
