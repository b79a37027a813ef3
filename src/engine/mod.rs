//! Measurement engines.
//!
//! Two engines sit behind the same capability set ([`SpeedEngine`]):
//! - `builtin`: in-process HTTP measurement against the public speed-test
//!   directory ([`builtin::BuiltinEngine`])
//! - `ookla`: the official `speedtest` executable ([`ookla::OoklaEngine`])
//!
//! [`EngineKind`] is the only selector; [`EngineFactory`] maps it to a
//! concrete engine built from the current settings snapshot.

pub mod builtin;
pub mod http_session;
pub mod ookla;

use crate::config::AppSettings;
use crate::error::EngineError;
use crate::models::{EngineKind, MeasurementResult, ServerInfo};
use crate::orchestrator::cancel::CancellationToken;
use futures::future::BoxFuture;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

pub use builtin::{BuiltinEngine, MeasurementSession, SessionConnector, SessionOptions};
pub use http_session::HttpConnector;
pub use ookla::OoklaEngine;

/// Default size of a server listing.
pub const DEFAULT_SERVER_LIMIT: usize = 200;

/// Uniform interface over the measurement engines.
pub trait SpeedEngine: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// Run one measurement.
    ///
    /// `server_id` overrides the configured server; with neither, the engine
    /// picks the best server itself. Fails with `EngineError::Cancelled` once
    /// `cancel` is observed.
    fn perform_test<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        server_id: Option<u32>,
    ) -> BoxFuture<'a, Result<MeasurementResult, EngineError>>;

    /// Directory listing: at most `limit` entries, unique by id, first-seen order.
    fn list_servers(&self, limit: usize) -> BoxFuture<'_, Result<Vec<ServerInfo>, EngineError>>;
}

/// Builds an engine for a kind, honouring the given settings.
pub trait EngineFactory: Send + Sync {
    fn create(&self, kind: EngineKind, settings: &AppSettings) -> Arc<dyn SpeedEngine>;
}

/// Production factory: HTTP sessions for `builtin`, the executable for `ookla`.
pub struct DefaultEngineFactory {
    connector: Arc<dyn SessionConnector>,
}

impl DefaultEngineFactory {
    pub fn new() -> Self {
        DefaultEngineFactory {
            connector: Arc::new(HttpConnector::new()),
        }
    }

    /// Use a custom session connector for the built-in engine.
    pub fn with_connector(connector: Arc<dyn SessionConnector>) -> Self {
        DefaultEngineFactory { connector }
    }
}

impl Default for DefaultEngineFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineFactory for DefaultEngineFactory {
    fn create(&self, kind: EngineKind, settings: &AppSettings) -> Arc<dyn SpeedEngine> {
        match kind {
            EngineKind::Builtin => Arc::new(BuiltinEngine::new(
                Arc::clone(&self.connector),
                settings.server_id,
            )),
            EngineKind::Ookla => Arc::new(OoklaEngine::from_settings(settings)),
        }
    }
}

/// Truncate to `limit`, then drop repeated ids keeping the first occurrence.
pub fn dedupe_servers<I>(servers: I, limit: usize) -> Vec<ServerInfo>
where
    I: IntoIterator<Item = ServerInfo>,
{
    let mut seen = HashSet::new();
    servers
        .into_iter()
        .take(limit)
        .filter(|server| seen.insert(server.id))
        .collect()
}

/// Race `fut` against the cancellation token.
///
/// Dropping the losing future aborts in-flight requests.
pub(crate) async fn until_cancelled<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, EngineError>
where
    F: Future<Output = Result<T, EngineError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(EngineError::Cancelled),
        result = fut => result,
    }
}
