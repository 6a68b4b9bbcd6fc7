//! Human-readable crash report rendering and file sinks.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::error;

use crash_tracer_core::record::{CrashRecord, RecordSink};
use crash_tracer_core::session::SessionOutcome;
use crash_tracer_core::signals::si_code_name;

/// Render a crash record as a text report.
#[must_use]
pub fn render_report(record: &CrashRecord) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Crash Report");
    let _ = writeln!(out, "============");
    let _ = writeln!(out, "Generated: {}", record.emitted_at.to_rfc3339());
    let _ = writeln!(out);
    let command = record.target.command.as_deref().unwrap_or("<unknown>");
    let _ = writeln!(out, "Process: {} (PID: {})", command, record.target.pid);
    let _ = writeln!(out, "Verdict: {}", record.classification);
    if let Some(signal) = record.signal {
        let name = record.signal_name.as_deref().unwrap_or("UNKNOWN");
        let _ = writeln!(out, "Signal:  {name} ({signal})");
    }
    if let Some(mechanism) = &record.mechanism {
        let _ = writeln!(out, "Via:     {mechanism}");
    }
    if let (Some(signal), Some(code)) = (record.signal, record.si_code) {
        let _ = writeln!(out, "Code:    {} ({code})", si_code_name(signal, code));
    }
    if let Some(fault) = &record.fault {
        let _ = writeln!(out);
        let _ = writeln!(out, "Fault Context");
        let _ = writeln!(out, "-------------");
        let _ = writeln!(out, "  IP:  0x{:016x}", fault.ip);
        let _ = writeln!(out, "  SP:  0x{:016x}  BP: 0x{:016x}", fault.sp, fault.bp);
        if let Some(addr) = fault.fault_addr {
            let _ = writeln!(out, "  Addr: 0x{addr:016x}");
        }
    }
    if let Some(code) = record.exit_code {
        let _ = writeln!(out, "Exit code: {code}");
    }
    if let Some(frames) = &record.frames {
        let _ = writeln!(out);
        let _ = writeln!(out, "Frames");
        let _ = writeln!(out, "------");
        for (i, frame) in frames.iter().enumerate() {
            let symbol = frame.symbol.as_deref().unwrap_or("??");
            match frame.offset {
                Some(offset) => {
                    let _ = writeln!(out, "  #{i:2}: 0x{:016x} {symbol}+0x{offset:x}", frame.ip);
                }
                None => {
                    let _ = writeln!(out, "  #{i:2}: 0x{:016x} {symbol}", frame.ip);
                }
            }
        }
    }
    if let Some(excerpt) = &record.stderr_excerpt {
        let _ = writeln!(out);
        let _ = writeln!(out, "Stderr (tail)");
        let _ = writeln!(out, "-------------");
        for line in excerpt.lines() {
            let _ = writeln!(out, "  {line}");
        }
    }
    if !record.notes.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "Notes");
        let _ = writeln!(out, "-----");
        for note in &record.notes {
            let _ = writeln!(out, "  - {note}");
        }
    }
    out
}

/// One-line rendering for outcomes that carry no record.
#[must_use]
pub fn render_status(outcome: &SessionOutcome) -> String {
    match outcome {
        SessionOutcome::Crash { record } => {
            format!("pid {}: {}", record.target.pid, record.classification)
        }
        SessionOutcome::CleanExit { pid } => {
            format!("pid {pid}: clean exit, no crash")
        }
        SessionOutcome::Detached { pid } => format!("pid {pid}: detached"),
        SessionOutcome::Timeout { pid } => {
            format!("pid {pid}: liveness budget expired")
        }
        SessionOutcome::ObservationLost { pid, reason } => {
            format!("pid {pid}: observation lost ({reason})")
        }
    }
}

/// Sink that prints rendered reports to stdout.
#[derive(Default)]
pub struct TextReportSink;

impl TextReportSink {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl RecordSink for TextReportSink {
    fn emit(&self, record: &CrashRecord) -> crash_tracer_core::Result<()> {
        print!("{}", render_report(record));
        Ok(())
    }
}

/// Sink that writes one report file per crash into a directory.
pub struct FileReportSink {
    dir: PathBuf,
}

impl FileReportSink {
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

impl RecordSink for FileReportSink {
    fn emit(&self, record: &CrashRecord) -> crash_tracer_core::Result<()> {
        let timestamp = record.emitted_at.format("%Y%m%d_%H%M%S");
        let filename = format!("crash_{}_{timestamp}.txt", record.target.pid);
        let path = self.dir.join(filename);
        std::fs::write(&path, render_report(record))?;
        tracing::info!(path = %path.display(), "report saved");
        Ok(())
    }
}

/// Fan a record out to several sinks; the first failure is reported,
/// later sinks still run.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn RecordSink>>,
}

impl FanoutSink {
    #[must_use]
    pub fn new(sinks: Vec<Arc<dyn RecordSink>>) -> Self {
        Self { sinks }
    }
}

impl RecordSink for FanoutSink {
    fn emit(&self, record: &CrashRecord) -> crash_tracer_core::Result<()> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(err) = sink.emit(record) {
                error!(%err, "record sink failed");
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }
        match first_err {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}
