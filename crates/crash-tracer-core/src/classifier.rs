//! Event classifier.
//!
//! A pure, total function from what interception observed — terminal
//! signal event or its absence, plus exit code — to one of a closed set
//! of crash categories. The classifier consumes evidence; it never
//! gathers any.
//!
//! Decision table:
//!
//! | Observed signal                    | Exit code | Classification            |
//! |------------------------------------|-----------|---------------------------|
//! | fatal, self-directed               | —         | SelfInducedSignal         |
//! | fatal, externally delivered        | —         | ExternallyDeliveredSignal |
//! | fatal, no distinguishable source   | —         | KernelFatalSignal         |
//! | fatal observed, process exited anyway | —      | HandledSignalWithExit     |
//! | none                               | 0         | NoSignalCleanExit         |
//! | none                               | non-zero  | NoSignalNonZeroExit       |
//!
//! Tie-break: only the first fatal delivery counts — the interception
//! layer already discards re-raises, and a terminal signal differing
//! from the first recorded delivery does not change the verdict.

use serde::{Deserialize, Serialize};

use crate::interception::{InterceptionReport, Termination};
use crate::signals::{DeliveryMechanism, SignalEvent};

/// The closed-set verdict for one target lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Classification {
    /// Fatal signal raised by the kernel (or with no distinguishable
    /// source) and the default action terminated the process.
    KernelFatalSignal,
    /// Fatal signal the target sent itself; default action terminated
    /// the process.
    SelfInducedSignal,
    /// Fatal signal delivered by another process; default action
    /// terminated the process.
    ExternallyDeliveredSignal,
    /// A fatal signal was delivered, but the target's own handler ran
    /// and the process still exited (cleanly or not) without the
    /// default fatal action completing. The underlying signal number is
    /// retained.
    HandledSignalWithExit,
    /// No signal involved; exit code 0.
    NoSignalCleanExit,
    /// No signal involved; non-zero exit (language-level failure).
    NoSignalNonZeroExit,
}

impl Classification {
    /// Whether this verdict carries a signal number.
    #[must_use]
    pub fn is_signal_bearing(&self) -> bool {
        !matches!(self, Self::NoSignalCleanExit | Self::NoSignalNonZeroExit)
    }

    /// Whether a crash record is produced for this verdict.
    ///
    /// `NoSignalCleanExit` is the one classification that never yields
    /// a record: nothing crashed.
    #[must_use]
    pub fn produces_record(&self) -> bool {
        !matches!(self, Self::NoSignalCleanExit)
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            Self::KernelFatalSignal => "kernel-fatal-signal",
            Self::SelfInducedSignal => "self-induced-signal",
            Self::ExternallyDeliveredSignal => "externally-delivered-signal",
            Self::HandledSignalWithExit => "handled-signal-with-exit",
            Self::NoSignalCleanExit => "no-signal-clean-exit",
            Self::NoSignalNonZeroExit => "no-signal-non-zero-exit",
        };
        write!(f, "{tag}")
    }
}

/// Classify a completed observation.
///
/// Returns `None` for observations that never reached termination
/// (`Detached`/`Lost`): those end as terminal statuses, not crash
/// verdicts. For every terminated target exactly one classification
/// comes out.
#[must_use]
pub fn classify(report: &InterceptionReport) -> Option<Classification> {
    match &report.termination {
        Termination::Detached { .. } | Termination::Lost { .. } => None,
        Termination::FatalSignal { .. } => Some(match &report.first_fatal {
            Some(event) => classify_mechanism(event),
            // Delivery never intercepted (SIGKILL, or raced the
            // attach): fatal, no distinguishable source.
            None => Classification::KernelFatalSignal,
        }),
        Termination::Exited { code } => Some(match (&report.first_fatal, *code) {
            (Some(_), _) => Classification::HandledSignalWithExit,
            (None, 0) => Classification::NoSignalCleanExit,
            (None, _) => Classification::NoSignalNonZeroExit,
        }),
    }
}

fn classify_mechanism(event: &SignalEvent) -> Classification {
    match event.mechanism {
        DeliveryMechanism::SelfDirected => Classification::SelfInducedSignal,
        DeliveryMechanism::ExternalDelivery => Classification::ExternallyDeliveredSignal,
        DeliveryMechanism::KernelFault | DeliveryMechanism::HandlerObserved => {
            Classification::KernelFatalSignal
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interception::StopReason;
    use crate::signals::SIGSEGV;
    use chrono::Utc;

    fn report(first_fatal: Option<SignalEvent>, termination: Termination) -> InterceptionReport {
        InterceptionReport {
            pid: 4321,
            first_fatal,
            fault: None,
            termination,
            sigterm_observed: 0,
            discarded_deliveries: 0,
        }
    }

    fn event(mechanism: DeliveryMechanism) -> SignalEvent {
        SignalEvent {
            pid: 4321,
            signal: SIGSEGV,
            si_code: Some(0),
            mechanism,
            observed_at: Utc::now(),
        }
    }

    // -- Decision table ----------------------------------------------------------

    #[test]
    fn kernel_fault_terminating_is_kernel_fatal() {
        let r = report(
            Some(event(DeliveryMechanism::KernelFault)),
            Termination::FatalSignal {
                signal: SIGSEGV,
                core_dumped: true,
            },
        );
        assert_eq!(classify(&r), Some(Classification::KernelFatalSignal));
    }

    #[test]
    fn self_directed_terminating_is_self_induced() {
        let r = report(
            Some(event(DeliveryMechanism::SelfDirected)),
            Termination::FatalSignal {
                signal: SIGSEGV,
                core_dumped: false,
            },
        );
        assert_eq!(classify(&r), Some(Classification::SelfInducedSignal));
    }

    #[test]
    fn external_terminating_is_externally_delivered() {
        let r = report(
            Some(event(DeliveryMechanism::ExternalDelivery)),
            Termination::FatalSignal {
                signal: SIGSEGV,
                core_dumped: false,
            },
        );
        assert_eq!(
            classify(&r),
            Some(Classification::ExternallyDeliveredSignal)
        );
    }

    #[test]
    fn unseen_delivery_is_kernel_fatal() {
        // SIGKILL: terminal status only, no delivery stop.
        let r = report(
            None,
            Termination::FatalSignal {
                signal: 9,
                core_dumped: false,
            },
        );
        assert_eq!(classify(&r), Some(Classification::KernelFatalSignal));
    }

    #[test]
    fn delivery_then_exit_is_handled_signal() {
        // Handler printed diagnostics and the process exited on its own.
        for code in [0, 7] {
            let r = report(
                Some(event(DeliveryMechanism::KernelFault)),
                Termination::Exited { code },
            );
            assert_eq!(classify(&r), Some(Classification::HandledSignalWithExit));
        }
    }

    #[test]
    fn clean_exit_without_signal() {
        let r = report(None, Termination::Exited { code: 0 });
        assert_eq!(classify(&r), Some(Classification::NoSignalCleanExit));
    }

    #[test]
    fn nonzero_exit_without_signal() {
        let r = report(None, Termination::Exited { code: 1 });
        assert_eq!(classify(&r), Some(Classification::NoSignalNonZeroExit));
    }

    // -- Non-verdict terminations ------------------------------------------------

    #[test]
    fn detached_and_lost_have_no_verdict() {
        let detached = report(
            None,
            Termination::Detached {
                reason: StopReason::Detach,
            },
        );
        assert_eq!(classify(&detached), None);
        let lost = report(
            None,
            Termination::Lost {
                reason: "gone".to_string(),
            },
        );
        assert_eq!(classify(&lost), None);
    }

    #[test]
    fn captured_evidence_survives_detach_without_verdict() {
        // Evidence retained, but no crash verdict for an incomplete
        // session.
        let r = report(
            Some(event(DeliveryMechanism::KernelFault)),
            Termination::Detached {
                reason: StopReason::Timeout,
            },
        );
        assert_eq!(classify(&r), None);
    }

    // -- Totality over terminated reports ----------------------------------------

    mod props {
        use super::*;
        use proptest::prelude::*;

        fn arb_mechanism() -> impl Strategy<Value = DeliveryMechanism> {
            prop_oneof![
                Just(DeliveryMechanism::KernelFault),
                Just(DeliveryMechanism::SelfDirected),
                Just(DeliveryMechanism::ExternalDelivery),
                Just(DeliveryMechanism::HandlerObserved),
            ]
        }

        proptest! {
            #[test]
            fn every_terminated_report_classifies(
                has_event in any::<bool>(),
                mechanism in arb_mechanism(),
                signal_death in any::<bool>(),
                code in -128i32..256,
                signal in 1i32..32,
            ) {
                let first_fatal = has_event.then(|| SignalEvent {
                    pid: 1,
                    signal,
                    si_code: None,
                    mechanism,
                    observed_at: Utc::now(),
                });
                let termination = if signal_death {
                    Termination::FatalSignal { signal, core_dumped: false }
                } else {
                    Termination::Exited { code }
                };
                let r = report(first_fatal, termination);
                prop_assert!(classify(&r).is_some());
            }
        }
    }
}
