//! End-to-end monitoring scenarios against freshly spawned shell targets.
//!
//! Each test spawns a short-lived `/bin/sh` target that terminates one
//! specific way and checks the session's verdict, the one-record-or-none
//! guarantee, and the captured evidence.

use std::sync::Arc;
use std::time::Duration;

use crash_tracer_core::classifier::Classification;
use crash_tracer_core::config::TracerConfig;
use crash_tracer_core::record::MemorySink;
use crash_tracer_core::session::{SessionManager, SessionOutcome};
use crash_tracer_core::signals::{DeliveryMechanism, SIGABRT, SIGSEGV};
use crash_tracer_core::target::SpawnRequest;

fn manager() -> (SessionManager, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    let manager = SessionManager::new(TracerConfig::default(), sink.clone());
    (manager, sink)
}

fn sh(script: &str) -> SpawnRequest {
    SpawnRequest::new("/bin/sh").arg("-c").arg(script)
}

// -- Signal-bearing terminations ------------------------------------------------

#[tokio::test]
async fn self_directed_segfault_is_self_induced() {
    let (manager, sink) = manager();
    let pid = manager
        .spawn_and_trace(sh("kill -SEGV $$"))
        .await
        .expect("spawn");
    let outcome = manager.wait(pid).await.expect("wait");
    let record = outcome.record().expect("crash record");
    assert_eq!(record.classification, Classification::SelfInducedSignal);
    assert_eq!(record.signal, Some(SIGSEGV));
    assert_eq!(record.mechanism, Some(DeliveryMechanism::SelfDirected));
    assert_eq!(record.exit_code, None);
    assert_eq!(sink.records().len(), 1);
}

#[tokio::test]
async fn self_directed_abort_is_self_induced() {
    let (manager, _sink) = manager();
    let pid = manager
        .spawn_and_trace(sh("kill -ABRT $$"))
        .await
        .expect("spawn");
    let outcome = manager.wait(pid).await.expect("wait");
    let record = outcome.record().expect("crash record");
    assert_eq!(record.classification, Classification::SelfInducedSignal);
    assert_eq!(record.signal, Some(SIGABRT));
}

#[tokio::test]
async fn externally_delivered_signal_is_distinguished() {
    let (manager, _sink) = manager();
    let pid = manager
        .spawn_and_trace(sh("sleep 5"))
        .await
        .expect("spawn");
    // Deliver from this process: a different sender than the target.
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid as i32),
        nix::sys::signal::Signal::SIGSEGV,
    )
    .expect("kill");
    let outcome = manager.wait(pid).await.expect("wait");
    let record = outcome.record().expect("crash record");
    assert_eq!(
        record.classification,
        Classification::ExternallyDeliveredSignal
    );
    // Same signal number as the self-directed case; only the mechanism
    // tag differs.
    assert_eq!(record.signal, Some(SIGSEGV));
    assert_eq!(record.mechanism, Some(DeliveryMechanism::ExternalDelivery));
}

#[tokio::test]
async fn announcement_line_is_captured_for_signal_crash() {
    let (manager, _sink) = manager();
    let pid = manager
        .spawn_and_trace(sh("echo '[fixture] about to fault' >&2; kill -SEGV $$"))
        .await
        .expect("spawn");
    let outcome = manager.wait(pid).await.expect("wait");
    let record = outcome.record().expect("crash record");
    let excerpt = record.stderr_excerpt.as_deref().expect("excerpt");
    assert!(excerpt.contains("[fixture] about to fault"), "excerpt: {excerpt:?}");
}

#[tokio::test]
async fn handler_then_exit_keeps_underlying_signal() {
    let (manager, _sink) = manager();
    // The target traps the fatal signal, prints a diagnostic, and exits
    // on its own: the underlying delivery must still be reported, never
    // downgraded to a plain non-zero exit.
    let pid = manager
        .spawn_and_trace(sh(
            "trap 'echo handled >&2; exit 7' SEGV; kill -SEGV $$; sleep 5",
        ))
        .await
        .expect("spawn");
    let outcome = manager.wait(pid).await.expect("wait");
    let record = outcome.record().expect("crash record");
    assert_eq!(record.classification, Classification::HandledSignalWithExit);
    assert_eq!(record.signal, Some(SIGSEGV));
    assert_eq!(record.exit_code, Some(7));
    let excerpt = record.stderr_excerpt.as_deref().expect("excerpt");
    assert!(excerpt.contains("handled"), "excerpt: {excerpt:?}");
}

// -- Signal-free terminations ---------------------------------------------------

#[tokio::test]
async fn clean_exit_produces_no_record() {
    let (manager, sink) = manager();
    let pid = manager.spawn_and_trace(sh("exit 0")).await.expect("spawn");
    let outcome = manager.wait(pid).await.expect("wait");
    assert!(matches!(outcome, SessionOutcome::CleanExit { .. }));
    assert_eq!(
        outcome.classification(),
        Some(Classification::NoSignalCleanExit)
    );
    assert!(sink.records().is_empty());
}

#[tokio::test]
async fn runtime_failure_without_signal_records_exit_code() {
    let (manager, sink) = manager();
    let pid = manager
        .spawn_and_trace(sh("echo 'Traceback (most recent call last):' >&2; exit 3"))
        .await
        .expect("spawn");
    let outcome = manager.wait(pid).await.expect("wait");
    let record = outcome.record().expect("crash record");
    assert_eq!(record.classification, Classification::NoSignalNonZeroExit);
    assert_eq!(record.signal, None);
    assert_eq!(record.exit_code, Some(3));
    let excerpt = record.stderr_excerpt.as_deref().expect("excerpt");
    assert!(excerpt.contains("Traceback"));
    assert_eq!(sink.records().len(), 1);
}

// -- Teardown paths -------------------------------------------------------------

#[tokio::test]
async fn detach_before_termination_yields_detached() {
    let (manager, sink) = manager();
    let pid = manager
        .spawn_and_trace(sh("sleep 5"))
        .await
        .expect("spawn");
    manager.detach(pid).expect("detach");
    let outcome = manager.wait(pid).await.expect("wait");
    assert!(matches!(outcome, SessionOutcome::Detached { .. }));
    assert!(sink.records().is_empty());
}

#[tokio::test]
async fn liveness_budget_yields_timeout() {
    let sink = Arc::new(MemorySink::new());
    let config = TracerConfig {
        timeout_secs: Some(1),
        ..TracerConfig::default()
    };
    let manager = SessionManager::new(config, sink.clone());
    let pid = manager
        .spawn_and_trace(sh("sleep 30"))
        .await
        .expect("spawn");
    let outcome = manager.wait(pid).await.expect("wait");
    assert!(matches!(outcome, SessionOutcome::Timeout { .. }), "got {outcome:?}");
    assert!(sink.records().is_empty());
}

#[tokio::test]
async fn second_attach_to_monitored_pid_is_rejected() {
    let (manager, _sink) = manager();
    let pid = manager
        .spawn_and_trace(sh("sleep 5"))
        .await
        .expect("spawn");
    let err = manager.attach(pid).await.unwrap_err();
    assert!(matches!(
        err,
        crash_tracer_core::Error::AlreadyAttached { .. }
    ));
    manager.detach(pid).expect("detach");
    let _ = manager.wait(pid).await;
}

// -- Concurrency ----------------------------------------------------------------

#[tokio::test]
async fn concurrent_sessions_stay_isolated() {
    let (manager, sink) = manager();
    let crasher = manager
        .spawn_and_trace(sh("kill -SEGV $$"))
        .await
        .expect("spawn crasher");
    let clean = manager
        .spawn_and_trace(sh("exit 0"))
        .await
        .expect("spawn clean");
    let failing = manager
        .spawn_and_trace(sh("exit 9"))
        .await
        .expect("spawn failing");

    let crash_outcome = manager.wait(crasher).await.expect("wait crasher");
    let clean_outcome = manager.wait(clean).await.expect("wait clean");
    let failing_outcome = manager.wait(failing).await.expect("wait failing");

    assert_eq!(
        crash_outcome.record().expect("record").classification,
        Classification::SelfInducedSignal
    );
    assert!(matches!(clean_outcome, SessionOutcome::CleanExit { .. }));
    assert_eq!(
        failing_outcome.record().expect("record").exit_code,
        Some(9)
    );
    // Exactly one record per crashing target, none for the clean exit.
    assert_eq!(sink.records().len(), 2);
}

#[tokio::test]
async fn shutdown_detaches_all_live_sessions() {
    let (manager, sink) = manager();
    let a = manager
        .spawn_and_trace(sh("sleep 10"))
        .await
        .expect("spawn a");
    let b = manager
        .spawn_and_trace(sh("sleep 10"))
        .await
        .expect("spawn b");
    let outcomes = manager.shutdown().await;
    assert_eq!(outcomes.len(), 2);
    for outcome in &outcomes {
        assert!(matches!(outcome, SessionOutcome::Detached { .. }));
        assert!([a, b].contains(&outcome.pid()));
    }
    assert!(sink.records().is_empty());
    assert!(manager.active().is_empty());
}

// -- Timeout of the wait loop itself -------------------------------------------

#[tokio::test]
async fn outcome_arrives_promptly_after_fast_exit() {
    let (manager, _sink) = manager();
    let pid = manager.spawn_and_trace(sh("exit 0")).await.expect("spawn");
    let outcome = tokio::time::timeout(Duration::from_secs(10), manager.wait(pid))
        .await
        .expect("no hang")
        .expect("wait");
    assert!(matches!(outcome, SessionOutcome::CleanExit { .. }));
}
