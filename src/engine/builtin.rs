//! Built-in measurement engine.
//!
//! Drives a [`MeasurementSession`] through directory lookup, best-server
//! selection, download and upload. The session itself is opened by a
//! [`SessionConnector`], which lets the network layer be swapped out.
//!
//! Session construction retries across transport variants (default, secure,
//! insecure). When the last failure was a `403 Forbidden`, the whole round is
//! repeated once with a browser-like user agent.

use super::{dedupe_servers, until_cancelled, SpeedEngine};
use crate::error::EngineError;
use crate::models::{now_timestamp, EngineKind, MeasurementResult, ServerInfo};
use crate::orchestrator::cancel::CancellationToken;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::Arc;

/// Transport variants tried, in order, for each client identity.
const TRANSPORT_VARIANTS: [Option<bool>; 3] = [None, Some(true), Some(false)];

/// How a session should be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionOptions {
    /// `None` lets the connector choose; `Some(true)` forces TLS
    pub secure: Option<bool>,
    /// Present a browser user agent instead of the application's own
    pub browser_agent: bool,
}

/// An open measurement session against the speed-test service.
pub trait MeasurementSession: Send {
    /// Load the candidate servers, restricted to `ids` when non-empty.
    ///
    /// Fails with `EngineError::NoMatchedServers` when none of `ids` exist.
    fn fetch_servers<'a>(&'a mut self, ids: &'a [u32]) -> BoxFuture<'a, Result<(), EngineError>>;

    /// Candidates loaded by the last `fetch_servers`.
    fn servers(&self) -> Vec<ServerInfo>;

    /// Pick the best candidate by the session's own ranking.
    fn best_server(&mut self) -> BoxFuture<'_, Result<ServerInfo, EngineError>>;

    /// Download throughput against the best server, bits/second.
    fn download(&mut self) -> BoxFuture<'_, Result<f64, EngineError>>;

    /// Upload throughput against the best server, bits/second.
    fn upload(&mut self) -> BoxFuture<'_, Result<f64, EngineError>>;

    /// Latency measured while ranking servers.
    fn ping_ms(&self) -> f64;
}

pub trait SessionConnector: Send + Sync {
    fn connect(
        &self,
        options: SessionOptions,
    ) -> BoxFuture<'_, Result<Box<dyn MeasurementSession>, EngineError>>;
}

pub struct BuiltinEngine {
    connector: Arc<dyn SessionConnector>,
    configured_server: Option<u32>,
}

impl BuiltinEngine {
    pub fn new(connector: Arc<dyn SessionConnector>, configured_server: Option<u32>) -> Self {
        BuiltinEngine {
            connector,
            configured_server,
        }
    }

    /// Open a session, retrying transport variants and one identity substitution.
    async fn open_session(&self) -> Result<Box<dyn MeasurementSession>, EngineError> {
        let mut last_err: Option<EngineError> = None;

        for browser_agent in [false, true] {
            if browser_agent {
                match &last_err {
                    Some(e) if e.is_forbidden() => {
                        log::warn!(target: "engine", "Request rejected with 403, retrying with a browser user agent");
                    }
                    _ => break,
                }
            }

            for secure in TRANSPORT_VARIANTS {
                let options = SessionOptions {
                    secure,
                    browser_agent,
                };
                match self.connector.connect(options).await {
                    Ok(session) => return Ok(session),
                    Err(e) => {
                        log::debug!(target: "engine", "Session attempt {:?} failed: {}", options, e);
                        last_err = Some(e);
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| EngineError::Network("could not open a session".to_string())))
    }

    async fn run(
        &self,
        cancel: &CancellationToken,
        server_override: Option<u32>,
    ) -> Result<MeasurementResult, EngineError> {
        cancel.check()?;
        log::info!(target: "engine", "Initializing speed test session...");
        let mut session = until_cancelled(cancel, self.open_session()).await?;

        let mut pinned = false;
        match server_override.or(self.configured_server) {
            Some(sid) => {
                log::info!(target: "engine", "Using selected server ID={}...", sid);
                cancel.check()?;
                match until_cancelled(cancel, session.fetch_servers(&[sid])).await {
                    Ok(()) => pinned = true,
                    Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                    Err(e) => {
                        log::warn!(target: "engine", "Server ID={} unavailable ({}), falling back to automatic selection", sid, e);
                        until_cancelled(cancel, session.fetch_servers(&[])).await?;
                    }
                }
            }
            None => {
                log::info!(target: "engine", "Fetching server list...");
                cancel.check()?;
                until_cancelled(cancel, session.fetch_servers(&[])).await?;
            }
        }

        cancel.check()?;
        let best = until_cancelled(cancel, session.best_server()).await?;
        if pinned {
            log::info!(target: "engine", "Selected server: {}", best.describe());
        } else {
            log::info!(target: "engine", "Best server: {}", best.describe());
        }

        cancel.check()?;
        log::info!(target: "engine", "Download test...");
        let download_bps = until_cancelled(cancel, session.download()).await?;

        cancel.check()?;
        log::info!(target: "engine", "Upload test...");
        let upload_bps = until_cancelled(cancel, session.upload()).await?;

        let result = MeasurementResult::new(session.ping_ms(), download_bps, upload_bps)
            .with_server(best)
            .with_timestamp(now_timestamp());
        log::info!(target: "engine", "Test completed successfully");
        Ok(result)
    }

    async fn directory(&self, limit: usize) -> Result<Vec<ServerInfo>, EngineError> {
        let mut session = self.open_session().await?;
        session.fetch_servers(&[]).await?;
        Ok(dedupe_servers(session.servers(), limit))
    }
}

impl SpeedEngine for BuiltinEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Builtin
    }

    fn perform_test<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        server_id: Option<u32>,
    ) -> BoxFuture<'a, Result<MeasurementResult, EngineError>> {
        self.run(cancel, server_id).boxed()
    }

    fn list_servers(&self, limit: usize) -> BoxFuture<'_, Result<Vec<ServerInfo>, EngineError>> {
        self.directory(limit).boxed()
    }
}
