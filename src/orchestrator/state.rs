//! Test Run State Management and Stage Tracking
//!
//! This module provides the state tracking structures used by the orchestration
//! service to report progress through a single test run.
//!
//! **Architecture**:
//! - `Stage`: discrete checkpoints of a run, reported to the UI
//! - `RunState`: current stage, samples collected and terminal error
//! - Transitions are validated so a run never reports stages out of order

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Stage of a test run.
///
/// The happy path is `Init -> Servers -> Best -> Download -> Saving -> Done`.
/// A precise (multi-sample) run loops `Servers -> Download` once per sample.
/// `Canceled` and `Error` are reachable from every non-terminal stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Init,
    Servers,
    Best,
    Download,
    Saving,
    Done,
    Canceled,
    Error,
}

impl Stage {
    /// Token sent to stage sinks.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Init => "init",
            Stage::Servers => "servers",
            Stage::Best => "best",
            Stage::Download => "download",
            Stage::Saving => "saving",
            Stage::Done => "done",
            Stage::Canceled => "canceled",
            Stage::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Done | Stage::Canceled | Stage::Error)
    }

    /// Get all valid stage transitions FROM this stage.
    pub fn valid_next_stages(&self) -> Vec<Stage> {
        let mut next = match self {
            Stage::Init => vec![Stage::Servers],
            Stage::Servers => vec![Stage::Best, Stage::Download],
            Stage::Best => vec![Stage::Download],
            Stage::Download => vec![Stage::Saving, Stage::Servers],
            Stage::Saving => vec![Stage::Done],
            Stage::Done | Stage::Canceled | Stage::Error => return vec![],
        };
        next.push(Stage::Canceled);
        next.push(Stage::Error);
        next
    }

    pub fn can_transition_to(&self, next: Stage) -> bool {
        self.valid_next_stages().contains(&next)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress snapshot of one run.
#[derive(Debug, Clone)]
pub struct RunState {
    /// Current stage
    pub stage: Stage,

    /// Measurements completed so far
    pub samples: u32,

    /// Run start
    pub started_at: Instant,

    /// Error message if the run failed
    pub error: Option<String>,
}

impl RunState {
    pub fn new() -> Self {
        RunState {
            stage: Stage::Init,
            samples: 0,
            started_at: Instant::now(),
            error: None,
        }
    }

    /// Attempt to move to `next`.
    pub fn transition_to(&mut self, next: Stage) -> Result<(), String> {
        if !self.stage.can_transition_to(next) {
            return Err(format!(
                "Invalid stage transition: {} -> {}",
                self.stage.as_str(),
                next.as_str()
            ));
        }
        self.stage = next;
        Ok(())
    }

    pub fn record_sample(&mut self) {
        self.samples += 1;
    }

    /// Record an error and mark the run as failed.
    pub fn record_error(&mut self, error: String) {
        self.error = Some(error);
        self.stage = Stage::Error;
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}
