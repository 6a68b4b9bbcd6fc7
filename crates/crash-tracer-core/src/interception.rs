//! Signal interception layer.
//!
//! Observes the actual disposition of signals delivered to a target by
//! attaching as a ptrace supervisor: every delivery stops the tracee
//! *before* its own handler chain runs, so a target that installs a
//! competing handler to alter or suppress the visible effect is still
//! observed receiving the underlying signal. Detection never depends on
//! the target cooperating.
//!
//! The observation loop must run on one dedicated thread: ptrace
//! requests are only honored from the attaching thread, so [`run`] is
//! designed to be executed inside `tokio::task::spawn_blocking` (or a
//! plain thread) and communicates readiness through a oneshot channel.
//!
//! # Delivery vs. termination
//!
//! Two distinct observations feed classification:
//!
//! - **Delivery stops**: the signal arriving, with `siginfo` telling us
//!   who sent it. The first fatal delivery is recorded; re-raises during
//!   default-action processing are counted and discarded.
//! - **Termination**: the wait status (exit code or terminal signal).
//!   SIGKILL never produces a delivery stop and is visible only here.
//!
//! A target that handles a fatal signal and then exits shows up as a
//! delivery stop followed by a normal exit — exactly the evidence the
//! classifier needs for `HandledSignalWithExit`.

use std::io;
use std::process::{ChildStderr, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use chrono::Utc;
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{AttachDenied, Error};
use crate::signals::{DeliveryMechanism, SIGTERM, SignalEvent, is_fatal_signal};
use crate::target::{SpawnRequest, decode_wait_status, describe_pid};

/// Options for one interception attachment.
#[derive(Debug, Clone)]
pub struct InterceptOptions {
    /// Cadence of the non-blocking wait loop.
    pub poll_interval: Duration,
    /// Count SIGTERM deliveries (never classified as crashes).
    pub track_sigterm: bool,
}

impl Default for InterceptOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            track_sigterm: false,
        }
    }
}

/// What to attach to: a fresh spawn or an existing process.
#[derive(Debug)]
pub enum AttachSpec {
    /// Fork the target from the tracer thread with tracing enabled
    /// before exec, so no signal can slip through unobserved.
    Spawn(SpawnRequest),
    /// Attach to an already-running process id.
    Pid(u32),
}

/// Successful attachment, reported back to the session task.
#[derive(Debug)]
pub struct AttachInfo {
    /// Target process id.
    pub pid: u32,
    /// Command description, when known.
    pub command: Option<String>,
    /// Read end of the target's stderr (spawned targets only).
    pub stderr: Option<ChildStderr>,
}

/// Why the observation loop was asked to stop early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    /// Caller-requested teardown.
    Detach,
    /// The session's liveness budget expired.
    Timeout,
}

const STOP_RUN: u8 = 0;
const STOP_DETACH: u8 = 1;
const STOP_TIMEOUT: u8 = 2;

/// Cancellation flag shared between a session task and its observation
/// loop. Requesting a stop is idempotent; the first reason wins.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicU8>);

impl StopFlag {
    /// New flag in the running state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request the loop to detach. First reason wins.
    pub fn request(&self, reason: StopReason) {
        let value = match reason {
            StopReason::Detach => STOP_DETACH,
            StopReason::Timeout => STOP_TIMEOUT,
        };
        let _ = self
            .0
            .compare_exchange(STOP_RUN, value, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// The requested stop reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<StopReason> {
        match self.0.load(Ordering::SeqCst) {
            STOP_DETACH => Some(StopReason::Detach),
            STOP_TIMEOUT => Some(StopReason::Timeout),
            _ => None,
        }
    }
}

/// Register state captured at the first fatal delivery stop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultContext {
    /// Instruction pointer.
    pub ip: u64,
    /// Stack pointer.
    pub sp: u64,
    /// Frame pointer.
    pub bp: u64,
    /// Faulting address from `siginfo`, for fault-origin signals.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault_addr: Option<u64>,
}

/// How the target's lifecycle ended, as far as interception saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Normal or abnormal exit without the default fatal action
    /// completing.
    Exited { code: i32 },
    /// Terminated by a signal's default action.
    FatalSignal { signal: i32, core_dumped: bool },
    /// Observation ended on request while the target was still alive.
    Detached { reason: StopReason },
    /// The attachment was lost before termination could be observed.
    Lost { reason: String },
}

/// Everything one attachment observed, handed to classification.
#[derive(Debug)]
pub struct InterceptionReport {
    /// Target process id.
    pub pid: u32,
    /// First fatal delivery, if any. Later deliveries are discarded.
    pub first_fatal: Option<SignalEvent>,
    /// Register/fault state captured alongside `first_fatal`.
    pub fault: Option<FaultContext>,
    /// Terminal disposition.
    pub termination: Termination,
    /// SIGTERM deliveries counted when tracking is enabled.
    pub sigterm_observed: u32,
    /// Fatal deliveries discarded after the first (handler re-raises).
    pub discarded_deliveries: u32,
}

impl InterceptionReport {
    fn new(pid: u32) -> Self {
        Self {
            pid,
            first_fatal: None,
            fault: None,
            termination: Termination::Lost {
                reason: "observation ended before termination".to_string(),
            },
            sigterm_observed: 0,
            discarded_deliveries: 0,
        }
    }
}

/// Attach per `spec` and observe until termination or stop.
///
/// Sends the attach outcome through `ready` as soon as it is known, so
/// the caller can fail fast on `AttachFailed` while the loop keeps the
/// thread. Returns `None` when the attachment itself failed.
pub fn run(
    spec: AttachSpec,
    opts: &InterceptOptions,
    stop: &StopFlag,
    ready: tokio::sync::oneshot::Sender<Result<AttachInfo, Error>>,
) -> Option<InterceptionReport> {
    let prepared = match spec {
        AttachSpec::Spawn(req) => spawn_traced(&req),
        AttachSpec::Pid(pid) => attach_existing(pid)
            .map(|()| (Pid::from_raw(pid as i32), None, describe_pid(pid))),
    };
    let (pid, stderr, command) = match prepared {
        Ok(parts) => parts,
        Err(err) => {
            let _ = ready.send(Err(err));
            return None;
        }
    };

    let initial = match await_initial_stop(pid) {
        Ok(initial) => initial,
        Err(err) => {
            // Do not leave a half-attached tracee behind.
            let _ = ptrace::detach(pid, None);
            let _ = ready.send(Err(err));
            return None;
        }
    };

    let _ = ready.send(Ok(AttachInfo {
        pid: pid.as_raw() as u32,
        command,
        stderr,
    }));

    let mut report = InterceptionReport::new(pid.as_raw() as u32);
    if let Some(termination) = initial {
        // Died between attach and first stop; nothing left to observe.
        report.termination = termination;
        return Some(report);
    }
    observe(pid, opts, stop, &mut report);
    Some(report)
}

/// Fork-and-exec the target with tracing enabled before exec.
fn spawn_traced(
    req: &SpawnRequest,
) -> Result<(Pid, Option<ChildStderr>, Option<String>), Error> {
    let mut cmd = Command::new(&req.program);
    cmd.args(&req.args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());
    if let Some(cwd) = &req.cwd {
        cmd.current_dir(cwd);
    }
    // The child requests tracing by its parent before exec; the exec
    // itself then traps, so observation covers the program from its
    // first instruction.
    unsafe {
        use std::os::unix::process::CommandExt as _;
        cmd.pre_exec(|| {
            ptrace::traceme().map_err(|errno| io::Error::from_raw_os_error(errno as i32))?;
            Ok(())
        });
    }
    let mut child = cmd.spawn().map_err(|source| Error::SpawnFailed {
        command: req.display(),
        source,
    })?;
    let stderr = child.stderr.take();
    let pid = Pid::from_raw(child.id() as i32);
    info!(pid = pid.as_raw(), command = %req.display(), "target spawned under trace");
    Ok((pid, stderr, Some(req.display())))
}

/// Attach to an already-running process.
fn attach_existing(pid: u32) -> Result<(), Error> {
    let target = Pid::from_raw(pid as i32);
    ptrace::attach(target).map_err(|errno| Error::AttachFailed {
        pid,
        denied: match errno {
            Errno::ESRCH => AttachDenied::NoSuchProcess,
            Errno::EPERM | Errno::EACCES => AttachDenied::PermissionDenied,
            _ => AttachDenied::Other,
        },
        detail: errno.to_string(),
    })?;
    info!(pid, "attached to running target");
    Ok(())
}

/// Consume the initial attach stop and arm exit tracing.
///
/// Returns `Ok(Some(termination))` when the target terminated before a
/// first stop could be consumed (still a valid observation).
fn await_initial_stop(pid: Pid) -> Result<Option<Termination>, Error> {
    loop {
        match waitpid(pid, Some(WaitPidFlag::__WALL)) {
            Ok(WaitStatus::Stopped(_, sig)) => {
                // TRACEEXIT makes the exit status observable even for
                // targets reaped by another parent; TRACEEXEC keeps
                // later execs from surfacing as plain SIGTRAP stops
                // (which would otherwise be reinjected).
                let options = ptrace::Options::PTRACE_O_TRACEEXIT
                    | ptrace::Options::PTRACE_O_TRACEEXEC;
                ptrace::setoptions(pid, options).map_err(
                    |errno| Error::AttachFailed {
                        pid: pid.as_raw() as u32,
                        denied: AttachDenied::Other,
                        detail: format!("failed to arm exit tracing: {errno}"),
                    },
                )?;
                // The exec trap (spawned) and our own attach stop are
                // synthetic; anything else stays in flight.
                let resume = match sig {
                    Signal::SIGTRAP | Signal::SIGSTOP => None,
                    other => Some(other),
                };
                if let Err(errno) = ptrace::cont(pid, resume) {
                    if errno != Errno::ESRCH {
                        return Err(Error::AttachFailed {
                            pid: pid.as_raw() as u32,
                            denied: AttachDenied::Other,
                            detail: format!("failed to resume target: {errno}"),
                        });
                    }
                }
                return Ok(None);
            }
            Ok(WaitStatus::Exited(_, code)) => return Ok(Some(Termination::Exited { code })),
            Ok(WaitStatus::Signaled(_, sig, core_dumped)) => {
                return Ok(Some(Termination::FatalSignal {
                    signal: sig as i32,
                    core_dumped,
                }));
            }
            Ok(_) => {}
            Err(Errno::EINTR) => {}
            Err(errno) => {
                return Err(Error::AttachFailed {
                    pid: pid.as_raw() as u32,
                    denied: match errno {
                        Errno::ECHILD | Errno::ESRCH => AttachDenied::NoSuchProcess,
                        _ => AttachDenied::Other,
                    },
                    detail: format!("waiting for initial stop failed: {errno}"),
                });
            }
        }
    }
}

/// The observation loop: non-blocking waits at the configured cadence so
/// stop requests are honored promptly, with every ptrace-stop handled
/// and the signal reinjected unchanged.
fn observe(pid: Pid, opts: &InterceptOptions, stop: &StopFlag, report: &mut InterceptionReport) {
    let mut event_exit_status: Option<i32> = None;
    loop {
        if let Some(reason) = stop.reason() {
            detach_tracee(pid, reason, report);
            return;
        }
        match waitpid(pid, Some(WaitPidFlag::WNOHANG | WaitPidFlag::__WALL)) {
            Ok(WaitStatus::StillAlive) => std::thread::sleep(opts.poll_interval),
            Ok(WaitStatus::Stopped(_, sig)) => on_signal_stop(pid, sig, opts, report),
            Ok(WaitStatus::PtraceEvent(_, _, event)) => {
                if event == libc::PTRACE_EVENT_EXIT {
                    // The exit status is already determined here, even
                    // for targets whose real parent will reap them.
                    match ptrace::getevent(pid) {
                        Ok(raw) => event_exit_status = Some(raw as i32),
                        Err(errno) => {
                            debug!(pid = pid.as_raw(), %errno, "exit event without status");
                        }
                    }
                }
                if let Err(errno) = ptrace::cont(pid, None) {
                    if errno != Errno::ESRCH {
                        warn!(pid = pid.as_raw(), %errno, "failed to resume after ptrace event");
                    }
                }
            }
            Ok(WaitStatus::Exited(_, code)) => {
                report.termination = Termination::Exited { code };
                return;
            }
            Ok(WaitStatus::Signaled(_, sig, core_dumped)) => {
                report.termination = Termination::FatalSignal {
                    signal: sig as i32,
                    core_dumped,
                };
                return;
            }
            Ok(_) => {}
            Err(Errno::EINTR) => {}
            Err(Errno::ECHILD) => {
                // Non-child tracee: death is reaped by its real parent,
                // so the exit-event status is the only record of it.
                report.termination = event_exit_status.map_or_else(
                    || Termination::Lost {
                        reason: "target disappeared without an observable exit status"
                            .to_string(),
                    },
                    termination_from_raw,
                );
                return;
            }
            Err(errno) => {
                report.termination = Termination::Lost {
                    reason: format!("waitpid failed: {errno}"),
                };
                return;
            }
        }
    }
}

/// Handle one signal-delivery stop: record evidence for fatal signals,
/// then reinject the signal unchanged so the target's own disposition
/// (default action or installed handler) applies.
fn on_signal_stop(
    pid: Pid,
    sig: Signal,
    opts: &InterceptOptions,
    report: &mut InterceptionReport,
) {
    let signo = sig as i32;
    if is_fatal_signal(signo) {
        if report.first_fatal.is_none() {
            let siginfo = ptrace::getsiginfo(pid).ok();
            let mechanism = siginfo.as_ref().map_or(
                // Delivery observed but siginfo unreadable: no
                // distinguishable source.
                DeliveryMechanism::KernelFault,
                |si| DeliveryMechanism::from_siginfo(si, pid.as_raw()),
            );
            report.fault = capture_fault_context(pid, siginfo.as_ref());
            report.first_fatal = Some(SignalEvent {
                pid: pid.as_raw() as u32,
                signal: signo,
                si_code: siginfo.as_ref().map(|si| si.si_code),
                mechanism,
                observed_at: Utc::now(),
            });
            info!(
                pid = pid.as_raw(),
                signal = signo,
                ?mechanism,
                "fatal signal delivery observed"
            );
        } else {
            // First fatal delivery wins; handler re-raises are discarded.
            report.discarded_deliveries += 1;
            debug!(pid = pid.as_raw(), signal = signo, "repeat fatal delivery discarded");
        }
    } else if signo == SIGTERM && opts.track_sigterm {
        report.sigterm_observed += 1;
        debug!(pid = pid.as_raw(), "SIGTERM delivery counted");
    }
    // Reinject unchanged, except job-control stops: under classic
    // ptrace a reinjected SIGSTOP reports the resulting group-stop as
    // another delivery, which livelocks the loop. Those are resumed
    // without reinjection.
    let resume = match sig {
        Signal::SIGSTOP | Signal::SIGTSTP | Signal::SIGTTIN | Signal::SIGTTOU => None,
        other => Some(other),
    };
    if let Err(errno) = ptrace::cont(pid, resume) {
        if errno != Errno::ESRCH {
            warn!(pid = pid.as_raw(), signal = signo, %errno, "failed to reinject signal");
        }
    }
}

/// Release the attachment while the target is still alive.
///
/// The tracee must be stopped for detach, so it is nudged with SIGSTOP
/// and released at the next stop. A different signal arriving first is
/// reinjected at detach time — removal never masks a signal already in
/// flight — and a target that terminates during the dance has its real
/// termination recorded instead.
fn detach_tracee(pid: Pid, reason: StopReason, report: &mut InterceptionReport) {
    if kill(pid, Signal::SIGSTOP).is_err() {
        // Already gone; pick up whatever status is pending.
        match waitpid(pid, Some(WaitPidFlag::WNOHANG | WaitPidFlag::__WALL)) {
            Ok(WaitStatus::Exited(_, code)) => {
                report.termination = Termination::Exited { code };
            }
            Ok(WaitStatus::Signaled(_, sig, core_dumped)) => {
                report.termination = Termination::FatalSignal {
                    signal: sig as i32,
                    core_dumped,
                };
            }
            _ => report.termination = Termination::Detached { reason },
        }
        return;
    }
    loop {
        match waitpid(pid, Some(WaitPidFlag::__WALL)) {
            Ok(WaitStatus::Stopped(_, Signal::SIGSTOP)) => {
                let _ = ptrace::detach(pid, None);
                break;
            }
            Ok(WaitStatus::Stopped(_, sig)) => {
                // A different signal got there first: reinject it and
                // keep waiting for our own SIGSTOP, so detach never
                // leaves a stray stop pending on the released target.
                let _ = ptrace::cont(pid, Some(sig));
            }
            Ok(WaitStatus::PtraceEvent(..)) => {
                let _ = ptrace::cont(pid, None);
            }
            Ok(WaitStatus::Exited(_, code)) => {
                report.termination = Termination::Exited { code };
                return;
            }
            Ok(WaitStatus::Signaled(_, sig, core_dumped)) => {
                report.termination = Termination::FatalSignal {
                    signal: sig as i32,
                    core_dumped,
                };
                return;
            }
            Ok(_) => {}
            Err(Errno::EINTR) => {}
            Err(_) => break,
        }
    }
    info!(pid = pid.as_raw(), ?reason, "detached from target");
    report.termination = Termination::Detached { reason };
}

/// Decode a raw wait-status word from the exit event into a termination.
fn termination_from_raw(raw: i32) -> Termination {
    match decode_wait_status(raw) {
        (Some(code), _) => Termination::Exited { code },
        (None, Some(signal)) => Termination::FatalSignal {
            signal,
            core_dumped: raw & 0x80 != 0,
        },
        (None, None) => Termination::Lost {
            reason: format!("unintelligible exit status {raw:#x}"),
        },
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn capture_fault_context(pid: Pid, siginfo: Option<&libc::siginfo_t>) -> Option<FaultContext> {
    let regs = ptrace::getregs(pid).ok()?;
    let fault_addr = siginfo.and_then(|si| {
        // si_addr is only populated for fault-origin codes.
        (si.si_code > 0).then(|| unsafe { si.si_addr() } as u64)
    });
    Some(FaultContext {
        ip: regs.rip,
        sp: regs.rsp,
        bp: regs.rbp,
        fault_addr,
    })
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
fn capture_fault_context(_pid: Pid, _siginfo: Option<&libc::siginfo_t>) -> Option<FaultContext> {
    None
}
