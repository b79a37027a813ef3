//! SpeedtestNextGen core
//!
//! Network speed-test orchestration over two interchangeable measurement
//! engines: an in-process HTTP engine and the official Ookla CLI.
//!
//! The system is organized into functional modules:
//! - **error**: Error enums per concern
//! - **models**: Results, server descriptors, enum-valued settings
//! - **config**: Settings document, defaults, corruption recovery, subscriptions
//! - **history**: Append-only JSON-lines result store with retention
//! - **engine**: `SpeedEngine` trait and its built-in / Ookla implementations
//! - **orchestrator**: Test workflows (single, precise), stages, cancellation
//! - **runner**: Background worker thread with event relay
//! - **log_collector**: Non-blocking structured session logging

// Core foundational modules
pub mod error;
pub mod models;

pub mod config;
pub mod history;

// Measurement engines
pub mod engine;

// Test workflows and run state
pub mod orchestrator;
pub mod runner;

// Robust, decoupled logging system
pub mod log_collector;

// Re-export the log crate for macro usage
pub use log;

// ============================================================================
// PUBLIC RE-EXPORTS FOR CONVENIENCE
// ============================================================================

pub use error::{ConfigError, EngineError, StoreError, TestError};

pub use models::{AccentColor, EngineKind, MeasurementResult, ServerInfo, SpeedUnit, Theme};

pub use config::{AppSettings, SettingsManager};

pub use history::ResultStore;

pub use engine::{DefaultEngineFactory, EngineFactory, SpeedEngine};

pub use orchestrator::{CancellationToken, RunState, SpeedtestService, Stage};

pub use runner::{RunKind, StartStatus, TestEvent, TestRunner};

pub use log_collector::{LogCollector, LogLine};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
