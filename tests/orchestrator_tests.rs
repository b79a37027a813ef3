//! Orchestration service tests against a scripted engine
//!
//! The scripted factory hands out engines that replay canned results, record
//! the server ids they were asked for, and can signal cancellation mid-run.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::json;
use speedtest_nextgen::config::{AppSettings, SettingsManager};
use speedtest_nextgen::engine::{EngineFactory, SpeedEngine};
use speedtest_nextgen::error::{EngineError, TestError};
use speedtest_nextgen::history::ResultStore;
use speedtest_nextgen::models::{EngineKind, MeasurementResult, ServerInfo};
use speedtest_nextgen::orchestrator::{CancellationToken, SpeedtestService, Stage};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

#[derive(Default)]
struct Script {
    responses: Mutex<VecDeque<Result<MeasurementResult, EngineError>>>,
    calls: Mutex<Vec<Option<u32>>>,
    created: Mutex<Vec<EngineKind>>,
    directory: Vec<ServerInfo>,
    /// Signal the caller's token once this many tests have run
    cancel_after: Option<usize>,
    /// Directory lookups never complete
    hang_directory: bool,
}

struct ScriptedEngine {
    kind: EngineKind,
    script: Arc<Script>,
}

impl SpeedEngine for ScriptedEngine {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    fn perform_test<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        server_id: Option<u32>,
    ) -> BoxFuture<'a, Result<MeasurementResult, EngineError>> {
        async move {
            cancel.check()?;
            let calls = {
                let mut calls = self.script.calls.lock().unwrap();
                calls.push(server_id);
                calls.len()
            };
            let response = self
                .script
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(MeasurementResult::new(1.0, 1.0, 1.0)));
            if self.script.cancel_after == Some(calls) {
                cancel.cancel();
            }
            response
        }
        .boxed()
    }

    fn list_servers(&self, limit: usize) -> BoxFuture<'_, Result<Vec<ServerInfo>, EngineError>> {
        let servers: Vec<ServerInfo> = self.script.directory.iter().take(limit).cloned().collect();
        let hang = self.script.hang_directory;
        async move {
            if hang {
                futures::future::pending::<()>().await;
            }
            Ok(servers)
        }
        .boxed()
    }
}

struct ScriptedFactory {
    script: Arc<Script>,
}

impl EngineFactory for ScriptedFactory {
    fn create(&self, kind: EngineKind, _settings: &AppSettings) -> Arc<dyn SpeedEngine> {
        self.script.created.lock().unwrap().push(kind);
        Arc::new(ScriptedEngine {
            kind,
            script: Arc::clone(&self.script),
        })
    }
}

struct Harness {
    _temp_dir: TempDir,
    settings: Arc<SettingsManager>,
    store: Arc<ResultStore>,
    script: Arc<Script>,
    stages: Arc<Mutex<Vec<Stage>>>,
    lines: Arc<Mutex<Vec<String>>>,
    service: SpeedtestService,
}

fn harness(script: Script) -> Harness {
    let temp_dir = TempDir::new().unwrap();
    let settings = Arc::new(SettingsManager::load(temp_dir.path().join("settings.json")).unwrap());
    let store = Arc::new(ResultStore::new(temp_dir.path().join("data").join("results.jsonl")));
    harness_with(temp_dir, settings, store, script)
}

fn harness_with(
    temp_dir: TempDir,
    settings: Arc<SettingsManager>,
    store: Arc<ResultStore>,
    script: Script,
) -> Harness {
    let script = Arc::new(script);
    let stages = Arc::new(Mutex::new(Vec::new()));
    let lines = Arc::new(Mutex::new(Vec::new()));

    let stage_log = Arc::clone(&stages);
    let line_log = Arc::clone(&lines);
    let factory = Arc::new(ScriptedFactory {
        script: Arc::clone(&script),
    });
    let service = SpeedtestService::new(Arc::clone(&settings), Arc::clone(&store), factory)
        .with_stage_sink(move |stage| stage_log.lock().unwrap().push(stage))
        .with_log_sink(move |line| line_log.lock().unwrap().push(line.to_string()));

    Harness {
        _temp_dir: temp_dir,
        settings,
        store,
        script,
        stages,
        lines,
        service,
    }
}

fn server(id: u32) -> ServerInfo {
    ServerInfo {
        id: Some(id),
        sponsor: format!("ISP {}", id),
        ..ServerInfo::default()
    }
}

fn sample(ping: f64, down: f64, up: f64) -> Result<MeasurementResult, EngineError> {
    Ok(MeasurementResult::new(ping, down, up).with_timestamp("2024-06-01T10:00:00"))
}

// ============================================================================
// SINGLE TEST
// ============================================================================

#[tokio::test]
async fn test_single_test_normalizes_and_persists() {
    let h = harness(Script {
        responses: Mutex::new(VecDeque::from([Ok(MeasurementResult::new(12.0, 50e6, 5e6))])),
        ..Script::default()
    });
    let token = CancellationToken::new();

    let result = h.service.run_single_test(&token, None).await.unwrap();

    assert_eq!(result.engine, Some(EngineKind::Builtin));
    assert!(!result.timestamp.is_empty());
    assert!(result.download_bps >= 0.0 && result.upload_bps >= 0.0 && result.ping_ms >= 0.0);
    assert_eq!(h.store.load(None).unwrap(), vec![result]);
    assert_eq!(
        h.stages.lock().unwrap().as_slice(),
        &[Stage::Init, Stage::Servers, Stage::Best, Stage::Download, Stage::Saving, Stage::Done]
    );
    assert!(h.lines.lock().unwrap().iter().any(|l| l.starts_with("Result: Ping 12 ms")));
}

#[tokio::test]
async fn test_single_test_passes_override_and_uses_configured_engine() {
    let h = harness(Script::default());
    h.settings.set("engine", json!("ookla")).unwrap();
    let token = CancellationToken::new();

    let result = h.service.run_single_test(&token, Some(99)).await.unwrap();

    assert_eq!(h.script.calls.lock().unwrap().as_slice(), &[Some(99)]);
    assert_eq!(h.script.created.lock().unwrap().as_slice(), &[EngineKind::Ookla]);
    assert_eq!(result.engine, Some(EngineKind::Ookla));
}

#[tokio::test]
async fn test_single_test_error_propagates_and_writes_nothing() {
    let h = harness(Script {
        responses: Mutex::new(VecDeque::from([Err(EngineError::ProcessFailed("exit code 2".into()))])),
        ..Script::default()
    });
    let token = CancellationToken::new();

    let err = h.service.run_single_test(&token, None).await.unwrap_err();

    assert!(matches!(err, TestError::Engine(EngineError::ProcessFailed(ref m)) if m == "exit code 2"));
    assert_eq!(h.store.count().unwrap(), 0);
    assert_eq!(h.stages.lock().unwrap().last(), Some(&Stage::Error));
}

#[tokio::test]
async fn test_single_test_cancelled_before_start() {
    let h = harness(Script::default());
    let token = CancellationToken::new();
    token.cancel();

    let err = h.service.run_single_test(&token, None).await.unwrap_err();

    assert!(err.is_cancelled());
    assert!(h.script.calls.lock().unwrap().is_empty());
    assert_eq!(h.store.count().unwrap(), 0);
    assert_eq!(h.stages.lock().unwrap().last(), Some(&Stage::Canceled));
}

#[tokio::test]
async fn test_persistence_failure_does_not_fail_the_run() {
    let temp_dir = TempDir::new().unwrap();
    let settings = Arc::new(SettingsManager::load(temp_dir.path().join("settings.json")).unwrap());
    // The store path is a directory, so every append fails
    let store = Arc::new(ResultStore::new(temp_dir.path()));
    let h = harness_with(temp_dir, settings, store, Script::default());
    let token = CancellationToken::new();

    let result = h.service.run_single_test(&token, None).await;

    assert!(result.is_ok());
    assert_eq!(h.stages.lock().unwrap().last(), Some(&Stage::Done));
}

// ============================================================================
// PRECISE TEST
// ============================================================================

#[tokio::test]
async fn test_precise_test_aggregates_means() {
    let h = harness(Script {
        responses: Mutex::new(VecDeque::from([
            sample(10.0, 90e6, 9e6),
            sample(20.0, 100e6, 10e6),
            sample(30.0, 110e6, 11e6),
        ])),
        ..Script::default()
    });
    h.settings.set("favorite_server_ids", json!([11, 22, 33])).unwrap();
    let token = CancellationToken::new();

    let aggregate = h.service.run_precise_test(&token).await.unwrap();

    assert_eq!(aggregate.ping_ms, 20.0);
    assert_eq!(aggregate.download_bps, 100e6);
    assert_eq!(aggregate.upload_bps, 10e6);
    assert_eq!(aggregate.samples, Some(3));
    assert_eq!(aggregate.aggregate, Some(true));
    assert_eq!(aggregate.timestamp, "avg");

    assert_eq!(
        h.script.calls.lock().unwrap().as_slice(),
        &[Some(11), Some(22), Some(33)]
    );
    // Only the aggregate is persisted
    assert_eq!(h.store.load(None).unwrap(), vec![aggregate]);

    let lines = h.lines.lock().unwrap();
    assert_eq!(lines.iter().filter(|l| l.starts_with("Result:")).count(), 3);
    assert!(lines.iter().any(|l| l.starts_with("Average: Ping 20 ms")));
}

#[tokio::test]
async fn test_precise_test_backfills_from_directory() {
    let h = harness(Script {
        directory: vec![server(5), server(6), server(6), server(7), server(8)],
        ..Script::default()
    });
    h.settings.set("favorite_server_ids", json!([5, 5, 0])).unwrap();
    let token = CancellationToken::new();

    h.service.run_precise_test(&token).await.unwrap();

    assert_eq!(
        h.script.calls.lock().unwrap().as_slice(),
        &[Some(5), Some(6), Some(7)]
    );
}

#[tokio::test]
async fn test_precise_test_tops_up_with_automatic_selection() {
    let h = harness(Script {
        directory: vec![server(1)],
        ..Script::default()
    });
    let token = CancellationToken::new();

    let aggregate = h.service.run_precise_test(&token).await.unwrap();

    assert_eq!(h.script.calls.lock().unwrap().as_slice(), &[Some(1), None, None]);
    assert_eq!(aggregate.samples, Some(3));
}

#[tokio::test]
async fn test_precise_test_reselects_engine_per_sample() {
    let h = harness(Script {
        directory: vec![server(1), server(2), server(3)],
        ..Script::default()
    });
    let token = CancellationToken::new();

    h.service.run_precise_test(&token).await.unwrap();

    // One engine for the directory lookup, then one per sample
    assert_eq!(h.script.created.lock().unwrap().len(), 4);
}

#[tokio::test]
async fn test_precise_test_cancel_after_first_sample_writes_nothing() {
    let h = harness(Script {
        responses: Mutex::new(VecDeque::from([sample(10.0, 90e6, 9e6)])),
        directory: vec![server(1), server(2), server(3)],
        cancel_after: Some(1),
        ..Script::default()
    });
    let token = CancellationToken::new();

    let err = h.service.run_precise_test(&token).await.unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(h.script.calls.lock().unwrap().len(), 1);
    assert_eq!(h.store.count().unwrap(), 0);
    let stages = h.stages.lock().unwrap();
    assert_eq!(stages.last(), Some(&Stage::Canceled));
    assert!(!stages.contains(&Stage::Saving));
}

#[tokio::test]
async fn test_precise_test_sample_failure_aborts_run() {
    let h = harness(Script {
        responses: Mutex::new(VecDeque::from([
            sample(10.0, 90e6, 9e6),
            Err(EngineError::Network("connection reset".into())),
        ])),
        directory: vec![server(1), server(2), server(3)],
        ..Script::default()
    });
    let token = CancellationToken::new();

    let err = h.service.run_precise_test(&token).await.unwrap_err();

    assert_eq!(err.to_string(), "Network error: connection reset");
    assert_eq!(h.store.count().unwrap(), 0);
}

#[tokio::test]
async fn test_precise_test_cancel_interrupts_directory_lookup() {
    let h = harness(Script {
        hang_directory: true,
        ..Script::default()
    });
    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let outcome = tokio::time::timeout(Duration::from_secs(5), h.service.run_precise_test(&token))
        .await
        .expect("cancellation must end the directory lookup");

    assert!(outcome.unwrap_err().is_cancelled());
    assert!(h.script.calls.lock().unwrap().is_empty());
    assert_eq!(h.store.count().unwrap(), 0);
    assert_eq!(h.stages.lock().unwrap().last(), Some(&Stage::Canceled));
}
