//! Fatal-signal vocabulary.
//!
//! The set of signals whose default action terminates a process with a
//! core-style crash, plus the metadata the interception layer records
//! about one observed delivery. SIGTERM is deliberately not in the fatal
//! set — orderly termination is not a crash — but deliveries can be
//! counted separately when [`track_sigterm`] is enabled in config.
//!
//! [`track_sigterm`]: crate::config::TracerConfig

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Signals treated as crashes.
pub const SIGILL: i32 = 4;
pub const SIGABRT: i32 = 6;
pub const SIGBUS: i32 = 7;
pub const SIGFPE: i32 = 8;
pub const SIGKILL: i32 = 9;
pub const SIGSEGV: i32 = 11;
pub const SIGTERM: i32 = 15;

/// `si_code` for signals sent with `kill`/`sigsend`.
pub const SI_USER: i32 = 0;
/// `si_code` for signals sent with `sigqueue`.
pub const SI_QUEUE: i32 = -1;
/// `si_code` for signals sent with `tkill`/`tgkill` (`raise`, `abort`,
/// `pthread_kill`).
pub const SI_TKILL: i32 = -6;
/// `si_code` for kernel-originated signals without fault details.
pub const SI_KERNEL: i32 = 0x80;

/// Whether a signal's default action is a fatal crash.
///
/// SIGKILL is excluded: it never produces a delivery stop the
/// interception layer can observe, so it is only ever seen in the
/// terminal wait status.
#[inline]
#[must_use]
pub const fn is_fatal_signal(sig: i32) -> bool {
    matches!(sig, SIGILL | SIGABRT | SIGBUS | SIGFPE | SIGSEGV)
}

/// Human-readable signal name for report output.
#[must_use]
pub fn signal_name(sig: i32) -> &'static str {
    match sig {
        SIGILL => "SIGILL",
        SIGABRT => "SIGABRT",
        SIGBUS => "SIGBUS",
        SIGFPE => "SIGFPE",
        SIGKILL => "SIGKILL",
        SIGSEGV => "SIGSEGV",
        SIGTERM => "SIGTERM",
        _ => "UNKNOWN",
    }
}

/// Decoded `si_code` name for the fault signals we report on.
#[must_use]
pub fn si_code_name(sig: i32, code: i32) -> &'static str {
    match (sig, code) {
        (SIGSEGV, 1) => "SEGV_MAPERR",
        (SIGSEGV, 2) => "SEGV_ACCERR",
        (SIGBUS, 1) => "BUS_ADRALN",
        (SIGBUS, 2) => "BUS_ADRERR",
        (SIGFPE, 1) => "FPE_INTDIV",
        (SIGFPE, 2) => "FPE_INTOVF",
        (SIGFPE, 3) => "FPE_FLTDIV",
        (SIGILL, 1) => "ILL_ILLOPC",
        (_, SI_USER) => "SI_USER",
        (_, SI_TKILL) => "SI_TKILL",
        (_, SI_QUEUE) => "SI_QUEUE",
        (_, SI_KERNEL) => "SI_KERNEL",
        _ => "UNKNOWN",
    }
}

/// How a fatal signal reached the target.
///
/// Derived from the `siginfo` observed at the delivery stop, beneath any
/// handler the target installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryMechanism {
    /// Raised by the kernel in response to a fault (`si_code > 0`,
    /// e.g. `SEGV_MAPERR` for a wild write).
    KernelFault,
    /// Sent by the target to itself (`kill`/`tgkill`/`raise`/`abort`
    /// with sender pid equal to the target pid).
    SelfDirected,
    /// Sent by another process.
    ExternalDelivery,
    /// The delivery itself was never intercepted; the signal is known
    /// only from the termination status (SIGKILL, or a delivery that
    /// completed before the attachment landed). Observed at the handler
    /// layer rather than beneath it.
    HandlerObserved,
}

impl std::fmt::Display for DeliveryMechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            Self::KernelFault => "kernel-fault",
            Self::SelfDirected => "self-directed",
            Self::ExternalDelivery => "external-delivery",
            Self::HandlerObserved => "handler-observed",
        };
        write!(f, "{tag}")
    }
}

impl DeliveryMechanism {
    /// Derive the mechanism from a delivery-stop `siginfo`.
    ///
    /// `si_code` distinguishes kernel faults (positive codes) from
    /// user-initiated signals (`SI_USER`/`SI_TKILL`/`SI_QUEUE`); for the
    /// latter the sender pid tells self-directed from external. Note the
    /// accepted limitation: an `abort()` and a fault-triggered SIGABRT
    /// both arrive through this same path and are not further
    /// distinguishable by call site.
    #[must_use]
    pub fn from_siginfo(info: &libc::siginfo_t, target_pid: i32) -> Self {
        let code = info.si_code;
        if code == SI_USER || code == SI_TKILL || code == SI_QUEUE {
            // User-initiated: the kernel records the sender's pid.
            let sender = unsafe { info.si_pid() };
            if sender == target_pid {
                Self::SelfDirected
            } else {
                Self::ExternalDelivery
            }
        } else {
            // Positive codes are hardware/kernel fault origins
            // (SEGV_MAPERR and friends, or SI_KERNEL); remaining
            // negative codes (timers, async I/O) carry no usable sender.
            Self::KernelFault
        }
    }
}

/// One observed signal delivery for a monitored target.
///
/// Immutable once recorded. At most one `SignalEvent` is terminal for a
/// given target: the first fatal delivery wins and re-raises during
/// default-action processing are discarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEvent {
    /// Target process id.
    pub pid: u32,
    /// Signal number (e.g. 11 for SIGSEGV).
    pub signal: i32,
    /// Raw `si_code` from the delivery stop, when one was observed.
    pub si_code: Option<i32>,
    /// How the signal reached the target.
    pub mechanism: DeliveryMechanism,
    /// When the delivery was observed.
    pub observed_at: DateTime<Utc>,
}

impl SignalEvent {
    /// Human-readable signal name.
    #[must_use]
    pub fn signal_name(&self) -> &'static str {
        signal_name(self.signal)
    }
}
