//! Test Orchestration: what a test run consists of.
//!
//! [`SpeedtestService`] owns the policy for the two workflows:
//! - single test: one measurement, normalized and persisted
//! - precise test: three samples on different servers, persisted as one
//!   aggregate record
//!
//! It knows nothing about threads or UI; progress is reported through two
//! optional sinks (stage tokens and free-text log lines) invoked on the
//! calling task.

pub mod cancel;
pub mod state;

pub use cancel::CancellationToken;
pub use state::{RunState, Stage};

use crate::config::{AppSettings, SettingsManager};
use crate::engine::{until_cancelled, EngineFactory, SpeedEngine};
use crate::error::{EngineError, TestError};
use crate::history::ResultStore;
use crate::models::{now_timestamp, EngineKind, MeasurementResult};
use std::sync::Arc;

/// Samples collected by a precise test.
pub const PRECISE_SAMPLES: usize = 3;

/// Directory size used to back-fill precise-test servers.
const PRECISE_DIRECTORY_LIMIT: usize = 300;

pub type StageSink = Arc<dyn Fn(Stage) + Send + Sync>;
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Runs tests against the configured engine and records their results.
#[derive(Clone)]
pub struct SpeedtestService {
    settings: Arc<SettingsManager>,
    store: Arc<ResultStore>,
    engines: Arc<dyn EngineFactory>,
    on_stage: Option<StageSink>,
    on_log: Option<LogSink>,
}

impl SpeedtestService {
    pub fn new(
        settings: Arc<SettingsManager>,
        store: Arc<ResultStore>,
        engines: Arc<dyn EngineFactory>,
    ) -> Self {
        SpeedtestService {
            settings,
            store,
            engines,
            on_stage: None,
            on_log: None,
        }
    }

    /// Receive every stage change.
    pub fn with_stage_sink<F>(mut self, sink: F) -> Self
    where
        F: Fn(Stage) + Send + Sync + 'static,
    {
        self.on_stage = Some(Arc::new(sink));
        self
    }

    /// Receive human-readable progress lines.
    pub fn with_log_sink<F>(mut self, sink: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_log = Some(Arc::new(sink));
        self
    }

    pub fn settings(&self) -> &Arc<SettingsManager> {
        &self.settings
    }

    pub fn store(&self) -> &Arc<ResultStore> {
        &self.store
    }

    /// Engine for the current configuration, built fresh on every call.
    pub fn select_engine(&self) -> (AppSettings, Arc<dyn SpeedEngine>) {
        let settings = self.settings.snapshot();
        let engine = self.engines.create(settings.engine, &settings);
        (settings, engine)
    }

    // ========================================================================
    // SINGLE TEST
    // ========================================================================

    /// Run one measurement and persist it.
    ///
    /// `server_override` beats the configured `server_id`; with neither the
    /// engine picks the best server. Persistence failures are logged only.
    pub async fn run_single_test(
        &self,
        cancel: &CancellationToken,
        server_override: Option<u32>,
    ) -> Result<MeasurementResult, TestError> {
        let mut state = RunState::new();
        self.emit_stage(Stage::Init);
        self.emit_log("Starting speed test...");

        let (settings, engine) = self.select_engine();
        let kind = engine.kind();
        self.emit_log(&format!("Engine: {}", kind.display_name()));

        // Selection happens inside the engine; these markers keep the stage order stable
        self.advance(&mut state, Stage::Servers);
        self.advance(&mut state, Stage::Best);
        self.advance(&mut state, Stage::Download);

        let raw = match engine.perform_test(cancel, server_override).await {
            Ok(result) => result,
            Err(e) => return Err(self.fail(&mut state, cancel, e.into())),
        };
        if cancel.is_cancelled() {
            return Err(self.fail(&mut state, cancel, TestError::Cancelled));
        }

        let result = normalize(raw, kind);
        state.record_sample();
        self.emit_log(&summary_line(&result, &settings));

        self.advance(&mut state, Stage::Saving);
        self.persist(&result, settings.max_history_records);
        self.advance(&mut state, Stage::Done);

        log::info!(target: "test", "Test finished in {:.1}s", state.elapsed().as_secs_f64());
        Ok(result)
    }

    // ========================================================================
    // PRECISE TEST
    // ========================================================================

    /// Run three samples on distinct servers and persist their mean.
    ///
    /// Individual samples are only reported on the log sink. A cancelled run
    /// writes nothing.
    pub async fn run_precise_test(&self, cancel: &CancellationToken) -> Result<MeasurementResult, TestError> {
        let mut state = RunState::new();
        self.emit_stage(Stage::Init);
        self.emit_log("Starting precise test (3 runs on different servers)...");

        let server_ids = self.pick_server_ids(cancel).await;
        if cancel.is_cancelled() {
            return Err(self.fail(&mut state, cancel, TestError::Cancelled));
        }
        if server_ids.len() < PRECISE_SAMPLES {
            self.emit_log("Not enough servers available, fewer than 3 will be pinned.");
        }

        let mut samples: Vec<MeasurementResult> = Vec::with_capacity(PRECISE_SAMPLES);
        for (idx, sid) in server_ids.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(self.fail(&mut state, cancel, TestError::Cancelled));
            }
            self.emit_log(&format!("[{}/{}] Testing on server ID={}...", idx + 1, PRECISE_SAMPLES, sid));
            let sample = self.precise_sample(&mut state, cancel, Some(*sid)).await?;
            samples.push(sample);
        }

        while samples.len() < PRECISE_SAMPLES && !cancel.is_cancelled() {
            self.emit_log(&format!(
                "[{}/{}] Testing with automatic server selection...",
                samples.len() + 1,
                PRECISE_SAMPLES
            ));
            let sample = self.precise_sample(&mut state, cancel, None).await?;
            samples.push(sample);
        }

        if cancel.is_cancelled() {
            return Err(self.fail(&mut state, cancel, TestError::Cancelled));
        }

        let aggregate = MeasurementResult::aggregate_of(&samples);
        let settings = self.settings.snapshot();
        self.advance(&mut state, Stage::Saving);
        self.persist(&aggregate, settings.max_history_records);

        log::info!(
            target: "test",
            "Precise test finished: samples={} ping_avg={:.1}ms download_avg={:.2}Mbps upload_avg={:.2}Mbps",
            samples.len(),
            aggregate.ping_ms,
            aggregate.download_bps / 1e6,
            aggregate.upload_bps / 1e6
        );
        self.emit_log(&format!("Average: {}", aggregate.summary(settings.units)));
        self.advance(&mut state, Stage::Done);
        Ok(aggregate)
    }

    /// One precise-test sample; the engine is re-selected so setting changes apply.
    async fn precise_sample(
        &self,
        state: &mut RunState,
        cancel: &CancellationToken,
        server_id: Option<u32>,
    ) -> Result<MeasurementResult, TestError> {
        self.advance(state, Stage::Servers);
        let (settings, engine) = self.select_engine();
        self.advance(state, Stage::Download);

        let sample = match engine.perform_test(cancel, server_id).await {
            Ok(result) => normalize(result, engine.kind()),
            Err(e) => return Err(self.fail(state, cancel, e.into())),
        };
        state.record_sample();
        self.emit_log(&summary_line(&sample, &settings));
        Ok(sample)
    }

    /// Favorites first (stored order, unique, non-zero), then the engine's directory.
    ///
    /// The directory lookup is abandoned as soon as `cancel` is signalled.
    async fn pick_server_ids(&self, cancel: &CancellationToken) -> Vec<u32> {
        let (settings, engine) = self.select_engine();

        let mut picked: Vec<u32> = Vec::with_capacity(PRECISE_SAMPLES);
        for id in settings.favorite_server_ids.iter().copied() {
            if id != 0 && !picked.contains(&id) {
                picked.push(id);
                if picked.len() == PRECISE_SAMPLES {
                    return picked;
                }
            }
        }

        match until_cancelled(cancel, engine.list_servers(PRECISE_DIRECTORY_LIMIT)).await {
            Ok(servers) => {
                for id in servers.into_iter().filter_map(|s| s.id) {
                    if id != 0 && !picked.contains(&id) {
                        picked.push(id);
                        if picked.len() == PRECISE_SAMPLES {
                            break;
                        }
                    }
                }
            }
            Err(EngineError::Cancelled) => {
                log::debug!(target: "test", "Directory lookup abandoned on cancellation");
            }
            Err(e) => {
                log::warn!(target: "network", "Server directory unavailable for precise test: {}", e);
            }
        }
        picked
    }

    // ========================================================================
    // REPORTING
    // ========================================================================

    fn emit_stage(&self, stage: Stage) {
        log::debug!(target: "test", "Stage: {}", stage);
        if let Some(sink) = &self.on_stage {
            sink(stage);
        }
    }

    fn emit_log(&self, line: &str) {
        log::info!(target: "test", "{}", line);
        if let Some(sink) = &self.on_log {
            sink(line);
        }
    }

    /// Move to `next` and report it; an illegal transition is not reported.
    fn advance(&self, state: &mut RunState, next: Stage) {
        match state.transition_to(next) {
            Ok(()) => self.emit_stage(next),
            Err(msg) => log::error!(target: "test", "{}", msg),
        }
    }

    /// Classify a failure, report the terminal stage and hand back the error.
    fn fail(&self, state: &mut RunState, cancel: &CancellationToken, err: TestError) -> TestError {
        if err.is_cancelled() || cancel.is_cancelled() {
            self.advance(state, Stage::Canceled);
            self.emit_log("Test canceled");
            return TestError::Cancelled;
        }

        let message = err.user_message();
        log::error!(target: "test", "Test failed: {}", message);
        if state.stage.can_transition_to(Stage::Error) {
            state.record_error(message);
            self.emit_stage(Stage::Error);
        }
        err
    }

    fn persist(&self, result: &MeasurementResult, max_records: usize) {
        if let Err(e) = self.store.append_with_retention(result, max_records) {
            log::error!(target: "history", "Failed to save result: {}", e);
        }
    }
}

/// Fill in the timestamp and engine tag when the engine left them out.
pub fn normalize(mut result: MeasurementResult, kind: EngineKind) -> MeasurementResult {
    if result.timestamp.trim().is_empty() {
        result.timestamp = now_timestamp();
    }
    if result.engine.is_none() {
        result.engine = Some(kind);
    }
    result
}

fn summary_line(result: &MeasurementResult, settings: &AppSettings) -> String {
    match &result.server {
        Some(server) => format!("Result: {} | Server: {}", result.summary(settings.units), server.describe()),
        None => format!("Result: {}", result.summary(settings.units)),
    }
}
