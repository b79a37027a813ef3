//! Background runner lifecycle tests
//!
//! Covers the event contract of a run: terminal events, `Finished` exactly
//! once and last, rejection of concurrent starts, and cancellation.

use futures::future::BoxFuture;
use futures::FutureExt;
use speedtest_nextgen::config::{AppSettings, SettingsManager};
use speedtest_nextgen::engine::{EngineFactory, SpeedEngine};
use speedtest_nextgen::error::EngineError;
use speedtest_nextgen::history::ResultStore;
use speedtest_nextgen::models::{EngineKind, MeasurementResult, ServerInfo};
use speedtest_nextgen::orchestrator::{CancellationToken, SpeedtestService};
use speedtest_nextgen::runner::{RunKind, StartStatus, TestEvent, TestRunner};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[derive(Clone, Copy)]
enum Behavior {
    Succeed,
    Fail,
    /// Block until the run is cancelled
    Hang,
}

struct StubEngine {
    behavior: Behavior,
}

impl SpeedEngine for StubEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Builtin
    }

    fn perform_test<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        _server_id: Option<u32>,
    ) -> BoxFuture<'a, Result<MeasurementResult, EngineError>> {
        async move {
            match self.behavior {
                Behavior::Succeed => Ok(MeasurementResult::new(8.0, 200e6, 20e6)),
                Behavior::Fail => Err(EngineError::NoMatchedServers("server 42 not found".into())),
                Behavior::Hang => {
                    cancel.cancelled().await;
                    Err(EngineError::Cancelled)
                }
            }
        }
        .boxed()
    }

    fn list_servers(&self, _limit: usize) -> BoxFuture<'_, Result<Vec<ServerInfo>, EngineError>> {
        async { Ok(Vec::new()) }.boxed()
    }
}

struct StubFactory(Behavior);

impl EngineFactory for StubFactory {
    fn create(&self, _kind: EngineKind, _settings: &AppSettings) -> Arc<dyn SpeedEngine> {
        Arc::new(StubEngine { behavior: self.0 })
    }
}

fn runner(behavior: Behavior, kind: RunKind) -> (TempDir, TestRunner) {
    let temp_dir = TempDir::new().unwrap();
    let settings = Arc::new(SettingsManager::load(temp_dir.path().join("settings.json")).unwrap());
    let store = Arc::new(ResultStore::new(temp_dir.path().join("results.jsonl")));
    let service = SpeedtestService::new(settings, store, Arc::new(StubFactory(behavior)));
    (temp_dir, TestRunner::new(service, kind))
}

/// Collect events up to and including `Finished`.
fn collect_run(runner: &TestRunner) -> Vec<TestEvent> {
    let events = runner.events();
    let mut seen = Vec::new();
    loop {
        let event = events
            .recv_timeout(Duration::from_secs(10))
            .expect("run did not finish in time");
        let done = event == TestEvent::Finished;
        seen.push(event);
        if done {
            return seen;
        }
    }
}

fn terminal_events(events: &[TestEvent]) -> Vec<&TestEvent> {
    events
        .iter()
        .filter(|e| matches!(e, TestEvent::ResultReady(_) | TestEvent::Error(_) | TestEvent::Canceled))
        .collect()
}

#[test]
fn test_successful_run_reports_result_then_finished() {
    let (_dir, runner) = runner(Behavior::Succeed, RunKind::Single { server_id: None });

    assert_eq!(runner.start(), StartStatus::Started);
    let events = collect_run(&runner);
    runner.wait();

    assert_eq!(events.last(), Some(&TestEvent::Finished));
    assert_eq!(events.iter().filter(|e| **e == TestEvent::Finished).count(), 1);

    let terminal = terminal_events(&events);
    assert_eq!(terminal.len(), 1);
    match terminal[0] {
        TestEvent::ResultReady(result) => {
            assert_eq!(result.download_bps, 200e6);
            assert_eq!(result.engine, Some(EngineKind::Builtin));
        }
        other => panic!("unexpected terminal event {:?}", other),
    }
    assert!(events.iter().any(|e| matches!(e, TestEvent::Log(l) if l == "Starting speed test...")));
    assert!(!runner.is_running());
}

#[test]
fn test_failed_run_reports_error_message() {
    let (_dir, runner) = runner(Behavior::Fail, RunKind::Single { server_id: Some(42) });

    runner.start();
    let events = collect_run(&runner);

    assert_eq!(
        terminal_events(&events),
        vec![&TestEvent::Error("No matched servers: server 42 not found".into())]
    );
    assert_eq!(events.last(), Some(&TestEvent::Finished));
}

#[test]
fn test_second_start_while_running_is_rejected() {
    let (_dir, runner) = runner(Behavior::Hang, RunKind::Single { server_id: None });

    assert_eq!(runner.start(), StartStatus::Started);
    assert!(runner.is_running());
    assert_eq!(runner.start(), StartStatus::AlreadyRunning);

    runner.cancel();
    let events = collect_run(&runner);
    runner.wait();

    assert!(events
        .iter()
        .any(|e| matches!(e, TestEvent::Warning(msg) if msg == "A test is already running")));
    assert_eq!(terminal_events(&events), vec![&TestEvent::Canceled]);
    assert_eq!(events.iter().filter(|e| **e == TestEvent::Finished).count(), 1);
}

#[test]
fn test_cancel_is_idempotent_and_runner_is_reusable() {
    let (_dir, runner) = runner(Behavior::Hang, RunKind::Precise);

    // Cancelling before any run is a no-op
    runner.cancel();

    runner.start();
    runner.cancel();
    runner.cancel();
    let first = collect_run(&runner);
    assert_eq!(terminal_events(&first), vec![&TestEvent::Canceled]);

    // A new run gets a fresh token
    assert_eq!(runner.start(), StartStatus::Started);
    assert!(runner.is_running());
    runner.cancel();
    let second = collect_run(&runner);
    runner.wait();
    assert_eq!(terminal_events(&second), vec![&TestEvent::Canceled]);
    assert!(!runner.is_running());
}
