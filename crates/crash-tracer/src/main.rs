//! crash-tracer CLI: thin wrapper over crash-tracer-core.
//!
//! Spawns a target under trace (or attaches to a running pid), waits for
//! its termination, and reports the crash verdict. Records go to stdout
//! as JSON lines or as rendered text reports; logs go to stderr.

mod report;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use crash_tracer_core::config::TracerConfig;
use crash_tracer_core::logging::{self, LogFormat};
use crash_tracer_core::record::{JsonLinesSink, RecordSink};
use crash_tracer_core::session::{SessionManager, SessionOutcome};
use crash_tracer_core::target::SpawnRequest;

use report::{FanoutSink, FileReportSink, TextReportSink};

#[derive(Debug, Parser)]
#[command(name = "crash-tracer")]
#[command(about = "Observe a process and classify how it died", long_about = None)]
struct Cli {
    /// Config file (default: ./crash-tracer.toml, then
    /// ~/.config/crash-tracer/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormatArg>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormatArg {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum OutputFormat {
    /// One JSON object per record on stdout
    #[default]
    Json,
    /// Human-readable crash report on stdout
    Report,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Spawn an executable under trace and report its termination
    Run {
        /// Liveness budget in seconds; the target is force-detached
        /// when it expires
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Bound on buffered target stderr, in KiB
        #[arg(long)]
        stderr_cap_kb: Option<usize>,

        /// Count SIGTERM deliveries (reported as a record note)
        #[arg(long)]
        track_sigterm: bool,

        /// Record output format
        #[arg(long, value_enum, default_value_t)]
        format: OutputFormat,

        /// Also write one report file per crash into this directory
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Command and arguments to execute
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Attach to a running process id and report its termination
    Attach {
        /// Target process id
        pid: u32,

        /// Liveness budget in seconds
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Count SIGTERM deliveries
        #[arg(long)]
        track_sigterm: bool,

        /// Record output format
        #[arg(long, value_enum, default_value_t)]
        format: OutputFormat,

        /// Also write one report file per crash into this directory
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(level) = &cli.log_level {
        config.log.level = level.clone();
    }
    if let Some(format) = cli.log_format {
        config.log.format = match format {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Json => LogFormat::Json,
        };
    }
    logging::init_logging(&config.log).context("initializing logging")?;

    match cli.command {
        Commands::Run {
            timeout_secs,
            stderr_cap_kb,
            track_sigterm,
            format,
            output_dir,
            command,
        } => {
            if let Some(secs) = timeout_secs {
                config.timeout_secs = Some(secs);
            }
            if let Some(cap) = stderr_cap_kb {
                config.stderr_cap_kb = cap;
            }
            config.track_sigterm |= track_sigterm;
            config.validate().context("validating configuration")?;

            let request = spawn_request(&command);
            let manager = Arc::new(SessionManager::new(
                config,
                build_sink(format, output_dir.as_deref())?,
            ));
            let pid = manager
                .spawn_and_trace(request)
                .await
                .context("spawning target under trace")?;
            run_to_outcome(&manager, pid, format).await
        }
        Commands::Attach {
            pid,
            timeout_secs,
            track_sigterm,
            format,
            output_dir,
        } => {
            if let Some(secs) = timeout_secs {
                config.timeout_secs = Some(secs);
            }
            config.track_sigterm |= track_sigterm;
            config.validate().context("validating configuration")?;

            let manager = Arc::new(SessionManager::new(
                config,
                build_sink(format, output_dir.as_deref())?,
            ));
            let pid = manager
                .attach(pid)
                .await
                .with_context(|| format!("attaching to pid {pid}"))?;
            run_to_outcome(&manager, pid, format).await
        }
    }
}

/// Wait for the session's verdict, detaching cleanly on Ctrl-C.
///
/// The wait itself runs in its own task so an interrupt can request
/// detach and still collect the session's final outcome.
async fn run_to_outcome(
    manager: &Arc<SessionManager>,
    pid: u32,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let mut waiter = {
        let manager = Arc::clone(manager);
        tokio::spawn(async move { manager.wait(pid).await })
    };
    let outcome = tokio::select! {
        joined = &mut waiter => joined
            .context("session wait task failed")?
            .context("waiting for target")?,
        _ = tokio::signal::ctrl_c() => {
            info!(pid, "interrupted; detaching from target");
            manager.detach(pid).ok();
            waiter
                .await
                .context("session wait task failed")?
                .context("detaching after interrupt")?
        }
    };

    match &outcome {
        SessionOutcome::Crash { record } => {
            // The record itself already went through the sink.
            info!(
                pid,
                classification = %record.classification,
                "target produced a crash record"
            );
        }
        other => match format {
            OutputFormat::Json => println!("{}", serde_json::to_string(other)?),
            OutputFormat::Report => println!("{}", report::render_status(other)),
        },
    }
    Ok(())
}

fn spawn_request(command: &[String]) -> SpawnRequest {
    let mut request = SpawnRequest::new(command[0].clone());
    if command.len() > 1 {
        request = request.args(command[1..].iter().cloned());
    }
    request
}

/// Resolve the effective config: explicit path, working directory, then
/// the user config directory, then defaults.
fn load_config(explicit: Option<&std::path::Path>) -> anyhow::Result<TracerConfig> {
    if let Some(path) = explicit {
        return TracerConfig::from_path(path)
            .with_context(|| format!("loading config from {}", path.display()));
    }
    if std::path::Path::new("crash-tracer.toml").exists() {
        return TracerConfig::discover().context("loading ./crash-tracer.toml");
    }
    if let Some(config_dir) = dirs::config_dir() {
        let candidate = config_dir.join("crash-tracer").join("config.toml");
        if candidate.exists() {
            return TracerConfig::from_path(&candidate)
                .with_context(|| format!("loading config from {}", candidate.display()));
        }
    }
    Ok(TracerConfig::default())
}

/// Stdout sink per the requested format, optionally fanned out to
/// per-crash report files.
fn build_sink(
    format: OutputFormat,
    output_dir: Option<&std::path::Path>,
) -> anyhow::Result<Arc<dyn RecordSink>> {
    let stdout_sink: Arc<dyn RecordSink> = match format {
        OutputFormat::Json => Arc::new(JsonLinesSink::new(std::io::stdout())),
        OutputFormat::Report => Arc::new(TextReportSink::new()),
    };
    match output_dir {
        None => Ok(stdout_sink),
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating output directory {}", dir.display()))?;
            Ok(Arc::new(FanoutSink::new(vec![
                stdout_sink,
                Arc::new(FileReportSink::new(dir.to_path_buf())),
            ])))
        }
    }
}
