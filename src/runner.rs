//! Cancellable Background Runner
//!
//! Executes a [`SpeedtestService`] workflow on a dedicated worker thread and
//! relays progress back as [`TestEvent`]s over a crossbeam channel, so the
//! interactive thread never blocks on a test. At most one run is active per
//! runner; `Finished` is always the last event of a run and is sent exactly
//! once.

use crate::error::TestError;
use crate::models::MeasurementResult;
use crate::orchestrator::{CancellationToken, SpeedtestService, Stage};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Which workflow a runner executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    /// One measurement, optionally pinned to a server
    Single { server_id: Option<u32> },
    /// Three samples averaged into one record
    Precise,
}

impl RunKind {
    fn thread_name(&self) -> &'static str {
        match self {
            RunKind::Single { .. } => "speedtest-single",
            RunKind::Precise => "speedtest-precise",
        }
    }
}

/// Events emitted from the background test run
#[derive(Debug, Clone, PartialEq)]
pub enum TestEvent {
    StageChanged(Stage),
    Log(String),
    ResultReady(MeasurementResult),
    Error(String),
    /// The run stopped because it was cancelled
    Canceled,
    /// Non-fatal notice, e.g. a start request while a run is active
    Warning(String),
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartStatus {
    Started,
    AlreadyRunning,
    /// The worker thread could not be created; `Error` and `Finished` were sent
    SpawnFailed,
}

/// Clears the active flag and emits `Finished` when the worker exits, even by panic.
struct FinishGuard {
    active: Arc<AtomicBool>,
    tx: Sender<TestEvent>,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        let _ = self.tx.send(TestEvent::Finished);
    }
}

pub struct TestRunner {
    service: SpeedtestService,
    kind: RunKind,
    events_tx: Sender<TestEvent>,
    events_rx: Receiver<TestEvent>,
    active: Arc<AtomicBool>,
    token: Mutex<Option<CancellationToken>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TestRunner {
    pub fn new(service: SpeedtestService, kind: RunKind) -> Self {
        let (events_tx, events_rx) = unbounded();
        TestRunner {
            service,
            kind,
            events_tx,
            events_rx,
            active: Arc::new(AtomicBool::new(false)),
            token: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> RunKind {
        self.kind
    }

    /// Receiver for run events; drain it with `try_recv`/`recv_timeout`.
    pub fn events(&self) -> Receiver<TestEvent> {
        self.events_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Start a run unless one is already active.
    pub fn start(&self) -> StartStatus {
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            let msg = "A test is already running";
            log::warn!(target: "test", "{}", msg);
            let _ = self.events_tx.send(TestEvent::Warning(msg.to_string()));
            return StartStatus::AlreadyRunning;
        }

        // The previous worker has already signalled Finished; reap it
        self.join_worker();

        let token = CancellationToken::new();
        *lock(&self.token) = Some(token.clone());

        let stage_tx = self.events_tx.clone();
        let log_tx = self.events_tx.clone();
        let service = self
            .service
            .clone()
            .with_stage_sink(move |stage| {
                let _ = stage_tx.send(TestEvent::StageChanged(stage));
            })
            .with_log_sink(move |line| {
                let _ = log_tx.send(TestEvent::Log(line.to_string()));
            });

        let kind = self.kind;
        let active = Arc::clone(&self.active);
        let tx = self.events_tx.clone();

        let spawned = std::thread::Builder::new()
            .name(kind.thread_name().to_string())
            .spawn(move || {
                let _guard = FinishGuard {
                    active,
                    tx: tx.clone(),
                };
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| execute(&service, kind, &token)))
                    .unwrap_or_else(|_| Err(TestError::Worker("test thread panicked".to_string())));
                let _ = tx.send(classify(outcome, &token));
            });

        match spawned {
            Ok(handle) => {
                log::info!(target: "test", "Started {:?} run", kind);
                *lock(&self.worker) = Some(handle);
                StartStatus::Started
            }
            Err(e) => self.abort_start(&e),
        }
    }

    /// Report a run that never got a worker thread: `Error`, then `Finished`.
    fn abort_start(&self, err: &std::io::Error) -> StartStatus {
        log::error!(target: "test", "Failed to spawn test thread: {}", err);
        let _ = self
            .events_tx
            .send(TestEvent::Error(format!("Failed to start test: {}", err)));
        self.active.store(false, Ordering::SeqCst);
        let _ = self.events_tx.send(TestEvent::Finished);
        StartStatus::SpawnFailed
    }

    /// Signal the active run to stop. Idempotent and non-blocking.
    pub fn cancel(&self) {
        if let Some(token) = lock(&self.token).as_ref() {
            if !token.is_cancelled() {
                log::info!(target: "test", "Cancellation requested");
            }
            token.cancel();
        }
    }

    /// Block until the current worker thread has exited.
    pub fn wait(&self) {
        self.join_worker();
    }

    fn join_worker(&self) {
        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!(target: "test", "Test thread terminated abnormally");
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn execute(
    service: &SpeedtestService,
    kind: RunKind,
    token: &CancellationToken,
) -> Result<MeasurementResult, TestError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| TestError::Worker(format!("failed to build runtime: {}", e)))?;

    runtime.block_on(async {
        match kind {
            RunKind::Single { server_id } => service.run_single_test(token, server_id).await,
            RunKind::Precise => service.run_precise_test(token).await,
        }
    })
}

/// Map a run outcome to its terminal event; a set token always means `Canceled`.
fn classify(outcome: Result<MeasurementResult, TestError>, token: &CancellationToken) -> TestEvent {
    match outcome {
        Ok(_) | Err(_) if token.is_cancelled() => TestEvent::Canceled,
        Ok(result) => TestEvent::ResultReady(result),
        Err(e) if e.is_cancelled() => TestEvent::Canceled,
        Err(e) => TestEvent::Error(e.to_string()),
    }
}
