//! Session manager: concurrent monitoring of independent targets.
//!
//! Owns the mapping from live targets to their interception attachment
//! and output capture. Each target gets one isolated session task; no
//! state is shared between sessions beyond the OS process table and the
//! record sink. A failing target never affects other sessions.
//!
//! Lifecycle per target:
//!
//! ```text
//! spawn_and_trace / attach
//!   ├── interception loop (dedicated blocking thread)
//!   ├── stderr drain (spawned targets)
//!   └── session task: await termination ──► classify ──► emit (≤1 record)
//! wait ──► SessionOutcome
//! ```
//!
//! The one-record-or-none guarantee lives here: a session yields exactly
//! one [`SessionOutcome`], and a [`CrashRecord`] exists iff the
//! classification warrants one. Detach before termination yields
//! `Detached` (no record, evidence preserved); an expired liveness
//! budget yields `Timeout`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::classifier::{Classification, classify};
use crate::config::TracerConfig;
use crate::correlator::{ErrorStreamSnapshot, OutputCorrelator};
use crate::error::{Error, Result};
use crate::interception::{
    AttachInfo, AttachSpec, InterceptOptions, StopFlag, StopReason, Termination, run,
};
use crate::record::{CrashRecord, RecordEmitter, RecordSink, build_record};
use crate::symbolize::SymbolResolver;
use crate::target::{SpawnRequest, TargetHandle, TargetRef};

/// Terminal result of one monitoring session.
///
/// Exactly one per session; carries a record only when a crash verdict
/// was reached.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum SessionOutcome {
    /// A crash verdict was reached and its record emitted.
    Crash {
        /// The emitted record.
        record: Box<CrashRecord>,
    },
    /// The target exited 0 with no signal observed: nothing crashed,
    /// no record.
    CleanExit { pid: u32 },
    /// The session was torn down before the target terminated.
    Detached { pid: u32 },
    /// The liveness budget expired; the target was force-detached.
    Timeout { pid: u32 },
    /// The attachment was lost before termination could be observed.
    /// Never silently reported as a clean exit.
    ObservationLost { pid: u32, reason: String },
}

impl SessionOutcome {
    /// Target pid this outcome belongs to.
    #[must_use]
    pub fn pid(&self) -> u32 {
        match self {
            Self::Crash { record } => record.target.pid,
            Self::CleanExit { pid }
            | Self::Detached { pid }
            | Self::Timeout { pid }
            | Self::ObservationLost { pid, .. } => *pid,
        }
    }

    /// The crash record, when one was produced.
    #[must_use]
    pub fn record(&self) -> Option<&CrashRecord> {
        match self {
            Self::Crash { record } => Some(record),
            _ => None,
        }
    }

    /// The classification, when the session reached a verdict.
    #[must_use]
    pub fn classification(&self) -> Option<Classification> {
        match self {
            Self::Crash { record } => Some(record.classification),
            Self::CleanExit { .. } => Some(Classification::NoSignalCleanExit),
            _ => None,
        }
    }
}

enum SessionSlot {
    /// Attach in flight; the flag already works for early detach.
    Pending(StopFlag),
    Active(Session),
}

struct Session {
    stop: StopFlag,
    task: JoinHandle<SessionOutcome>,
}

/// Owner of all monitoring sessions.
pub struct SessionManager {
    config: TracerConfig,
    sink: Arc<dyn RecordSink>,
    resolver: Option<Arc<dyn SymbolResolver>>,
    sessions: Mutex<HashMap<u32, SessionSlot>>,
}

impl SessionManager {
    /// New manager emitting records into `sink`.
    pub fn new(config: TracerConfig, sink: Arc<dyn RecordSink>) -> Self {
        Self {
            config,
            sink,
            resolver: None,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Attach a symbol resolution backend for record enrichment.
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn SymbolResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Spawn `request` under trace and begin monitoring it.
    ///
    /// Returns the new target's pid once the attachment is confirmed.
    pub async fn spawn_and_trace(&self, request: SpawnRequest) -> Result<u32> {
        self.begin(AttachSpec::Spawn(request), None).await
    }

    /// Attach to an already-running process and begin monitoring it.
    pub async fn attach(&self, pid: u32) -> Result<u32> {
        {
            let mut sessions = self.lock_sessions();
            if sessions.contains_key(&pid) {
                return Err(Error::AlreadyAttached { pid });
            }
            sessions.insert(pid, SessionSlot::Pending(StopFlag::new()));
        }
        match self.begin(AttachSpec::Pid(pid), Some(pid)).await {
            Ok(pid) => Ok(pid),
            Err(err) => {
                self.lock_sessions().remove(&pid);
                Err(err)
            }
        }
    }

    /// Await the session's terminal outcome.
    pub async fn wait(&self, pid: u32) -> Result<SessionOutcome> {
        let slot = {
            let mut sessions = self.lock_sessions();
            // A Pending slot is another caller's in-flight attach; only
            // active sessions can be claimed.
            if matches!(sessions.get(&pid), Some(SessionSlot::Active(_))) {
                sessions.remove(&pid)
            } else {
                None
            }
        };
        match slot {
            Some(SessionSlot::Active(session)) => {
                session.task.await.map_err(|err| Error::SessionFailed {
                    pid,
                    detail: err.to_string(),
                })
            }
            _ => Err(Error::UnknownTarget { pid }),
        }
    }

    /// Request teardown of a session. Safe while the target is alive;
    /// the target's own execution and future signal disposition are
    /// unaffected, and already-captured evidence is retained.
    pub fn detach(&self, pid: u32) -> Result<()> {
        let sessions = self.lock_sessions();
        match sessions.get(&pid) {
            Some(SessionSlot::Active(session)) => {
                session.stop.request(StopReason::Detach);
                Ok(())
            }
            Some(SessionSlot::Pending(stop)) => {
                stop.request(StopReason::Detach);
                Ok(())
            }
            None => Err(Error::UnknownTarget { pid }),
        }
    }

    /// Pids currently monitored.
    #[must_use]
    pub fn active(&self) -> Vec<u32> {
        self.lock_sessions().keys().copied().collect()
    }

    /// Detach everything and collect the outcomes.
    pub async fn shutdown(&self) -> Vec<SessionOutcome> {
        let pids = self.active();
        for pid in &pids {
            let _ = self.detach(*pid);
        }
        let mut outcomes = Vec::with_capacity(pids.len());
        for pid in pids {
            if let Ok(outcome) = self.wait(pid).await {
                outcomes.push(outcome);
            }
        }
        outcomes
    }

    async fn begin(&self, spec: AttachSpec, reserved: Option<u32>) -> Result<u32> {
        let stop = match reserved {
            Some(pid) => match self.lock_sessions().get(&pid) {
                Some(SessionSlot::Pending(stop)) => stop.clone(),
                _ => StopFlag::new(),
            },
            None => StopFlag::new(),
        };
        let opts = InterceptOptions {
            poll_interval: self.config.poll_interval(),
            track_sigterm: self.config.track_sigterm,
        };

        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
        let loop_stop = stop.clone();
        let intercept =
            tokio::task::spawn_blocking(move || run(spec, &opts, &loop_stop, ready_tx));

        let info: AttachInfo = match ready_rx.await {
            Ok(Ok(info)) => info,
            Ok(Err(err)) => {
                let _ = intercept.await;
                return Err(err);
            }
            Err(_) => {
                return Err(Error::SessionFailed {
                    pid: reserved.unwrap_or(0),
                    detail: "interception loop ended before reporting attachment".to_string(),
                });
            }
        };

        let mut handle = TargetHandle {
            pid: info.pid,
            launched_at: chrono::Utc::now(),
            command: info.command,
            stderr: info.stderr,
        };
        let pid = handle.pid;
        let target = handle.target_ref();
        let correlator = handle
            .stderr
            .take()
            .map(|stderr| OutputCorrelator::begin_capture(stderr, self.config.stderr_cap_bytes()));
        let emitter = RecordEmitter::new(pid, Arc::clone(&self.sink));
        let task = tokio::spawn(run_session(SessionParts {
            intercept,
            correlator,
            target,
            emitter,
            resolver: self.resolver.clone(),
            stop: stop.clone(),
            timeout: self.config.timeout(),
        }));

        self.lock_sessions()
            .insert(pid, SessionSlot::Active(Session { stop, task }));
        info!(pid, "monitoring session started");
        Ok(pid)
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<u32, SessionSlot>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct SessionParts {
    intercept: JoinHandle<Option<crate::interception::InterceptionReport>>,
    correlator: Option<OutputCorrelator>,
    target: TargetRef,
    emitter: RecordEmitter,
    resolver: Option<Arc<dyn SymbolResolver>>,
    stop: StopFlag,
    timeout: Option<std::time::Duration>,
}

async fn run_session(parts: SessionParts) -> SessionOutcome {
    let SessionParts {
        mut intercept,
        correlator,
        target,
        emitter,
        resolver,
        stop,
        timeout,
    } = parts;
    let pid = target.pid;

    let joined = if let Some(budget) = timeout {
        tokio::select! {
            joined = &mut intercept => joined,
            () = tokio::time::sleep(budget) => {
                info!(pid, budget_secs = budget.as_secs(), "liveness budget expired");
                stop.request(StopReason::Timeout);
                (&mut intercept).await
            }
        }
    } else {
        (&mut intercept).await
    };

    let report = match joined {
        Ok(Some(report)) => report,
        Ok(None) => {
            return SessionOutcome::ObservationLost {
                pid,
                reason: "interception ended before attachment completed".to_string(),
            };
        }
        Err(err) => {
            return SessionOutcome::ObservationLost {
                pid,
                reason: format!("interception task failed: {err}"),
            };
        }
    };

    // Termination is confirmed; only now may the snapshot be read.
    let snapshot = match correlator {
        Some(correlator) => correlator.finalize().await,
        None => ErrorStreamSnapshot::empty(),
    };

    match classify(&report) {
        None => match &report.termination {
            Termination::Detached {
                reason: StopReason::Timeout,
            } => SessionOutcome::Timeout { pid },
            Termination::Detached {
                reason: StopReason::Detach,
            } => SessionOutcome::Detached { pid },
            Termination::Lost { reason } => SessionOutcome::ObservationLost {
                pid,
                reason: reason.clone(),
            },
            // classify() returns None only for the arms above.
            _ => SessionOutcome::ObservationLost {
                pid,
                reason: "observation ended in an unclassifiable state".to_string(),
            },
        },
        Some(classification) if !classification.produces_record() => {
            info!(pid, %classification, "target exited cleanly; no record");
            SessionOutcome::CleanExit { pid }
        }
        Some(classification) => {
            let record = build_record(target, classification, &report, &snapshot, resolver.as_deref());
            if let Err(err) = emitter.emit(&record) {
                // The record itself is still the session's outcome; a
                // failing consumer must not destroy the verdict.
                warn!(pid, %err, "record sink failed");
            }
            SessionOutcome::Crash {
                record: Box::new(record),
            }
        }
    }
}
