//! crash-tracer-core: fatal-event capture and classification engine
//!
//! Observes running processes, detects genuine OS-level fatal signal
//! deliveries, distinguishes them from failures absorbed inside a
//! language runtime, and produces one structured record per fatal
//! occurrence.
//!
//! # Architecture
//!
//! ```text
//! SessionManager ──► TargetHandle ──► Interception (ptrace supervisor)
//!                         │                 │
//!                         └── Correlator ───┤  (stderr, bounded ring)
//!                                           ▼
//!                     Classifier ──► Record Emitter ──► RecordSink
//! ```
//!
//! Interception sits at a control boundary outside the target: a target
//! that installs its own fatal-signal handler is still observed
//! receiving the underlying signal. Targets that never raise a signal
//! classify through their exit code instead — classification is total
//! over terminated targets.
//!
//! # Modules
//!
//! - `session`: concurrent per-target monitoring sessions and outcomes
//! - `interception`: ptrace attachment and the observation loop
//! - `correlator`: bounded error-stream capture
//! - `classifier`: the closed-set crash verdict
//! - `record`: crash record assembly and at-most-once emission
//! - `target`: target identity, spawn requests, `/proc` metadata
//! - `signals`: fatal-signal vocabulary and delivery mechanisms
//! - `symbolize`: symbol resolution seam (absence tolerated)
//! - `byte_ring`: fixed-capacity byte storage for the correlator
//! - `config`: TOML-backed tracer configuration
//! - `logging`: tracing setup (pretty or JSON)
//! - `error`: error taxonomy

pub mod byte_ring;
pub mod classifier;
pub mod config;
pub mod correlator;
pub mod error;
pub mod interception;
pub mod logging;
pub mod record;
pub mod session;
pub mod signals;
pub mod symbolize;
pub mod target;

pub use classifier::Classification;
pub use config::TracerConfig;
pub use error::{Error, Result};
pub use record::{CrashRecord, JsonLinesSink, MemorySink, RecordSink};
pub use session::{SessionManager, SessionOutcome};
pub use signals::{DeliveryMechanism, SignalEvent};
pub use target::SpawnRequest;
