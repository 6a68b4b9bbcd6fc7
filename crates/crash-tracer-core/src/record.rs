//! Crash record construction and emission.
//!
//! Builds the final structured record for one fatal occurrence and
//! hands it to whatever consumes records. Consumers are external; the
//! in-tree [`RecordSink`] implementations are a JSON-lines writer and
//! an in-memory collector for tests.
//!
//! Emission is at-most-once per target. Enrichment — stderr excerpt,
//! fault context, symbol frames — is opportunistic: a failing resolver
//! or an empty capture degrades to an absent field plus a diagnostic
//! note, never a blocked or dropped record.

use std::io::Write;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::classifier::Classification;
use crate::correlator::ErrorStreamSnapshot;
use crate::error::{Error, Result};
use crate::interception::{FaultContext, InterceptionReport, Termination};
use crate::signals::{DeliveryMechanism, SignalEvent, signal_name};
use crate::symbolize::{SymbolResolver, SymbolizedFrame};
use crate::target::TargetRef;

/// Bound on the excerpt attached to a record (bytes).
pub const EXCERPT_MAX_BYTES: usize = 8 * 1024;

/// The structured record of one fatal occurrence.
///
/// Immutable once emitted; at most one per target. Every field is
/// independently omittable except the classification tag and the
/// target identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrashRecord {
    /// Monitored target identity.
    pub target: TargetRef,
    /// Closed-set verdict.
    pub classification: Classification,
    /// Signal number, for signal-bearing classifications.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    /// Human-readable signal name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_name: Option<String>,
    /// Raw `si_code` from the delivery stop, when one was observed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub si_code: Option<i32>,
    /// How the signal reached the target.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mechanism: Option<DeliveryMechanism>,
    /// Exit code, when the process exited rather than dying to a
    /// signal's default action.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Register/fault state from the first fatal delivery.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<FaultContext>,
    /// Symbolized frames, when a resolver was available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frames: Option<Vec<SymbolizedFrame>>,
    /// Tail of the target's error stream, trimmed to whole lines.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr_excerpt: Option<String>,
    /// Best-effort diagnostic notes (enrichment failures, discarded
    /// re-raises, SIGTERM counts).
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub notes: Vec<String>,
    /// When the record was built.
    pub emitted_at: DateTime<Utc>,
}

/// Consumer of emitted records. Storage and transport live behind this
/// seam, outside the core.
pub trait RecordSink: Send + Sync {
    /// Consume one record.
    fn emit(&self, record: &CrashRecord) -> Result<()>;
}

/// JSON-lines sink over any writer (stdout, a file, a socket).
pub struct JsonLinesSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    /// Wrap a writer.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl<W: Write + Send> RecordSink for JsonLinesSink<W> {
    fn emit(&self, record: &CrashRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        writeln!(writer, "{line}")?;
        writer.flush()?;
        Ok(())
    }
}

/// In-memory sink for tests and embedders that poll.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<CrashRecord>>,
}

impl MemorySink {
    /// New empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy out everything emitted so far.
    #[must_use]
    pub fn records(&self) -> Vec<CrashRecord> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl RecordSink for MemorySink {
    fn emit(&self, record: &CrashRecord) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record.clone());
        Ok(())
    }
}

/// At-most-once emitter for one target.
pub struct RecordEmitter {
    pid: u32,
    sink: Arc<dyn RecordSink>,
    emitted: AtomicBool,
}

impl RecordEmitter {
    /// New emitter bound to one target and one sink.
    pub fn new(pid: u32, sink: Arc<dyn RecordSink>) -> Self {
        Self {
            pid,
            sink,
            emitted: AtomicBool::new(false),
        }
    }

    /// Emit the record, exactly once.
    ///
    /// The second and later invocations fail with
    /// [`Error::AlreadyEmitted`] and never reach the sink.
    pub fn emit(&self, record: &CrashRecord) -> Result<()> {
        if self.emitted.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyEmitted { pid: self.pid });
        }
        self.sink.emit(record)?;
        info!(
            pid = self.pid,
            classification = %record.classification,
            signal = record.signal,
            "crash record emitted"
        );
        Ok(())
    }
}

/// Assemble a record from classification plus whatever evidence exists.
#[must_use]
pub fn build_record(
    target: TargetRef,
    classification: Classification,
    report: &InterceptionReport,
    snapshot: &ErrorStreamSnapshot,
    resolver: Option<&dyn SymbolResolver>,
) -> CrashRecord {
    let mut notes = Vec::new();

    let terminal_event = effective_signal_event(report);
    let (signal, si_code, mechanism) = match &terminal_event {
        Some(event) => (Some(event.signal), event.si_code, Some(event.mechanism)),
        None => (None, None, None),
    };
    let exit_code = match report.termination {
        Termination::Exited { code } => Some(code),
        _ => None,
    };

    if report.discarded_deliveries > 0 {
        notes.push(format!(
            "{} repeat fatal deliveries discarded after the first",
            report.discarded_deliveries
        ));
    }
    if report.sigterm_observed > 0 {
        notes.push(format!(
            "SIGTERM delivered {} time(s); tracked, not classified",
            report.sigterm_observed
        ));
    }

    let stderr_excerpt = snapshot.excerpt(EXCERPT_MAX_BYTES);
    if snapshot.truncated() {
        notes.push(format!(
            "error stream capture truncated: kept {} of {} bytes",
            snapshot.len(),
            snapshot.total_seen()
        ));
    }

    let frames = resolve_frames(report, resolver, &mut notes);

    CrashRecord {
        target,
        classification,
        signal,
        signal_name: signal.map(|s| signal_name(s).to_string()),
        si_code,
        mechanism,
        exit_code,
        fault: report.fault.clone(),
        frames,
        stderr_excerpt,
        notes,
        emitted_at: Utc::now(),
    }
}

/// The signal event classification was based on: the first fatal
/// delivery, or one synthesized from the terminal status when the
/// delivery itself was never interceptable (SIGKILL).
#[must_use]
pub fn effective_signal_event(report: &InterceptionReport) -> Option<SignalEvent> {
    if let Some(event) = &report.first_fatal {
        return Some(event.clone());
    }
    match report.termination {
        Termination::FatalSignal { signal, .. } => Some(SignalEvent {
            pid: report.pid,
            signal,
            si_code: None,
            mechanism: DeliveryMechanism::HandlerObserved,
            observed_at: Utc::now(),
        }),
        _ => None,
    }
}

fn resolve_frames(
    report: &InterceptionReport,
    resolver: Option<&dyn SymbolResolver>,
    notes: &mut Vec<String>,
) -> Option<Vec<SymbolizedFrame>> {
    let resolver = resolver?;
    let ip = report.fault.as_ref().map(|fault| fault.ip)?;
    match resolver.resolve(report.pid, &[ip]) {
        Ok(frames) if frames.is_empty() => None,
        Ok(frames) => Some(frames),
        Err(err) => {
            // Non-fatal by contract: the record still goes out.
            debug!(pid = report.pid, %err, "symbol resolution unavailable");
            notes.push(format!("symbol resolution unavailable: {err}"));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::SIGSEGV;
    use crate::symbolize::{NoSymbols, SymbolizeError};

    fn target_ref() -> TargetRef {
        TargetRef {
            pid: 7,
            command: Some("fixture".to_string()),
            launched_at: Utc::now(),
        }
    }

    fn fatal_report() -> InterceptionReport {
        InterceptionReport {
            pid: 7,
            first_fatal: Some(SignalEvent {
                pid: 7,
                signal: SIGSEGV,
                si_code: Some(1),
                mechanism: DeliveryMechanism::KernelFault,
                observed_at: Utc::now(),
            }),
            fault: Some(FaultContext {
                ip: 0x1000,
                sp: 0x7fff_0000,
                bp: 0x7fff_0040,
                fault_addr: Some(0),
            }),
            termination: Termination::FatalSignal {
                signal: SIGSEGV,
                core_dumped: true,
            },
            sigterm_observed: 0,
            discarded_deliveries: 0,
        }
    }

    // -- Emission ----------------------------------------------------------------

    #[test]
    fn second_emission_fails() {
        let sink = Arc::new(MemorySink::new());
        let emitter = RecordEmitter::new(7, sink.clone());
        let record = build_record(
            target_ref(),
            Classification::KernelFatalSignal,
            &fatal_report(),
            &ErrorStreamSnapshot::empty(),
            None,
        );
        emitter.emit(&record).expect("first emission");
        let err = emitter.emit(&record).unwrap_err();
        assert!(matches!(err, Error::AlreadyEmitted { pid: 7 }));
        assert_eq!(sink.records().len(), 1);
    }

    // -- Record building ---------------------------------------------------------

    #[test]
    fn signal_record_carries_signal_fields() {
        let record = build_record(
            target_ref(),
            Classification::KernelFatalSignal,
            &fatal_report(),
            &ErrorStreamSnapshot::empty(),
            None,
        );
        assert_eq!(record.signal, Some(SIGSEGV));
        assert_eq!(record.signal_name.as_deref(), Some("SIGSEGV"));
        assert_eq!(record.mechanism, Some(DeliveryMechanism::KernelFault));
        assert_eq!(record.exit_code, None);
        assert!(record.stderr_excerpt.is_none());
    }

    #[test]
    fn exit_record_has_code_but_no_signal() {
        let report = InterceptionReport {
            pid: 7,
            first_fatal: None,
            fault: None,
            termination: Termination::Exited { code: 1 },
            sigterm_observed: 0,
            discarded_deliveries: 0,
        };
        let record = build_record(
            target_ref(),
            Classification::NoSignalNonZeroExit,
            &report,
            &ErrorStreamSnapshot::empty(),
            None,
        );
        assert_eq!(record.signal, None);
        assert_eq!(record.exit_code, Some(1));
    }

    #[test]
    fn sigkill_synthesizes_handler_observed_event() {
        let report = InterceptionReport {
            pid: 7,
            first_fatal: None,
            fault: None,
            termination: Termination::FatalSignal {
                signal: 9,
                core_dumped: false,
            },
            sigterm_observed: 0,
            discarded_deliveries: 0,
        };
        let record = build_record(
            target_ref(),
            Classification::KernelFatalSignal,
            &report,
            &ErrorStreamSnapshot::empty(),
            None,
        );
        assert_eq!(record.signal, Some(9));
        assert_eq!(record.mechanism, Some(DeliveryMechanism::HandlerObserved));
    }

    #[test]
    fn resolver_failure_degrades_to_note() {
        let record = build_record(
            target_ref(),
            Classification::KernelFatalSignal,
            &fatal_report(),
            &ErrorStreamSnapshot::empty(),
            Some(&NoSymbols),
        );
        assert!(record.frames.is_none());
        assert!(
            record
                .notes
                .iter()
                .any(|note| note.contains("symbol resolution unavailable"))
        );
    }

    #[test]
    fn working_resolver_attaches_frames() {
        struct Fixed;
        impl SymbolResolver for Fixed {
            fn resolve(
                &self,
                _pid: u32,
                addrs: &[u64],
            ) -> std::result::Result<Vec<SymbolizedFrame>, SymbolizeError> {
                Ok(addrs
                    .iter()
                    .map(|&ip| SymbolizedFrame {
                        ip,
                        symbol: Some("main".to_string()),
                        offset: Some(0x10),
                    })
                    .collect())
            }
        }
        let record = build_record(
            target_ref(),
            Classification::KernelFatalSignal,
            &fatal_report(),
            &ErrorStreamSnapshot::empty(),
            Some(&Fixed),
        );
        let frames = record.frames.expect("frames");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].symbol.as_deref(), Some("main"));
    }

    // -- Encoding ----------------------------------------------------------------

    #[test]
    fn optional_fields_are_omitted_from_json() {
        let report = InterceptionReport {
            pid: 7,
            first_fatal: None,
            fault: None,
            termination: Termination::Exited { code: 2 },
            sigterm_observed: 0,
            discarded_deliveries: 0,
        };
        let record = build_record(
            target_ref(),
            Classification::NoSignalNonZeroExit,
            &report,
            &ErrorStreamSnapshot::empty(),
            None,
        );
        let json = serde_json::to_value(&record).expect("serialize");
        let object = json.as_object().expect("object");
        assert!(object.contains_key("classification"));
        assert!(object.contains_key("target"));
        assert!(!object.contains_key("signal"));
        assert!(!object.contains_key("fault"));
        assert!(!object.contains_key("stderr_excerpt"));
        assert!(!object.contains_key("notes"));
        assert_eq!(
            json["classification"],
            serde_json::json!("no-signal-non-zero-exit")
        );
    }
}
