//! Ookla CLI engine.
//!
//! Runs the official `speedtest` executable with JSON output and maps its
//! report onto [`MeasurementResult`]. The child process is raced against the
//! cancellation token and the configured timeout; whichever fires first
//! terminates it.

use super::{dedupe_servers, SpeedEngine};
use crate::config::AppSettings;
use crate::error::EngineError;
use crate::models::{lenient_id, now_timestamp, EngineKind, MeasurementResult, ServerInfo};
use crate::orchestrator::cancel::CancellationToken;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

#[cfg(windows)]
const BINARY_NAME: &str = "speedtest.exe";
#[cfg(not(windows))]
const BINARY_NAME: &str = "speedtest";

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

const LICENSE_FLAGS: [&str; 2] = ["--accept-license", "--accept-gdpr"];

// ============================================================================
// REPORT FORMAT
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct Report {
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    ping: Option<Ping>,
    #[serde(default)]
    download: Option<Transfer>,
    #[serde(default)]
    upload: Option<Transfer>,
    #[serde(default)]
    server: Option<ReportServer>,
}

#[derive(Debug, Default, Deserialize)]
struct Ping {
    #[serde(default)]
    latency: Option<f64>,
}

/// `bandwidth` is bytes/second; `elapsed` is milliseconds.
#[derive(Debug, Default, Deserialize)]
struct Transfer {
    #[serde(default)]
    bandwidth: Option<f64>,
    #[serde(default)]
    bytes: Option<f64>,
    #[serde(default)]
    elapsed: Option<f64>,
}

impl Transfer {
    fn bits_per_second(&self) -> f64 {
        if let Some(bandwidth) = self.bandwidth {
            return bandwidth * 8.0;
        }
        match (self.bytes, self.elapsed) {
            (Some(bytes), Some(elapsed_ms)) if elapsed_ms > 0.0 => bytes * 8.0 / (elapsed_ms / 1000.0),
            _ => 0.0,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ReportServer {
    #[serde(default, deserialize_with = "lenient_id")]
    id: Option<u32>,
    /// Operator, e.g. "Example ISP"
    #[serde(default)]
    name: String,
    /// City
    #[serde(default)]
    location: String,
    #[serde(default)]
    country: String,
    #[serde(default)]
    host: String,
    #[serde(default, deserialize_with = "lenient_id")]
    port: Option<u32>,
}

impl ReportServer {
    fn to_server_info(&self) -> ServerInfo {
        let host = match self.port {
            Some(port) if !self.host.is_empty() => format!("{}:{}", self.host, port),
            _ => self.host.clone(),
        };
        ServerInfo {
            id: self.id,
            sponsor: self.name.clone(),
            name: self.location.clone(),
            country: self.country.clone(),
            host,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ServerList {
    #[serde(default)]
    servers: Vec<ReportServer>,
}

/// Last non-empty line of the CLI output; earlier lines may be progress or log records.
fn last_json_line(stdout: &str) -> Result<&str, EngineError> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .ok_or_else(|| EngineError::Parse("empty output from speedtest".to_string()))
}

/// Map the JSON report onto a result tagged with the `ookla` engine.
pub fn parse_report(stdout: &str) -> Result<MeasurementResult, EngineError> {
    let line = last_json_line(stdout)?;
    let report: Report =
        serde_json::from_str(line).map_err(|e| EngineError::Parse(format!("invalid speedtest JSON: {}", e)))?;

    let ping_ms = report.ping.as_ref().and_then(|p| p.latency).unwrap_or(0.0);
    let download_bps = report.download.as_ref().map_or(0.0, Transfer::bits_per_second);
    let upload_bps = report.upload.as_ref().map_or(0.0, Transfer::bits_per_second);
    let timestamp = report
        .timestamp
        .filter(|ts| !ts.trim().is_empty())
        .unwrap_or_else(now_timestamp);

    let mut result = MeasurementResult::new(ping_ms, download_bps, upload_bps)
        .with_timestamp(timestamp)
        .with_engine(EngineKind::Ookla);
    if let Some(server) = &report.server {
        result = result.with_server(server.to_server_info());
    }
    Ok(result)
}

/// Parse `speedtest --servers --format=json`.
pub fn parse_server_list(stdout: &str) -> Result<Vec<ServerInfo>, EngineError> {
    let line = last_json_line(stdout)?;
    let list: ServerList =
        serde_json::from_str(line).map_err(|e| EngineError::Parse(format!("invalid server list JSON: {}", e)))?;
    Ok(list.servers.iter().map(ReportServer::to_server_info).collect())
}

/// Command-line arguments for a measurement.
pub fn test_args(server_id: Option<u32>) -> Vec<String> {
    let mut args: Vec<String> = LICENSE_FLAGS.iter().map(|s| s.to_string()).collect();
    args.push("--format=json".to_string());
    if let Some(id) = server_id {
        args.push(format!("--server-id={}", id));
    }
    args
}

fn search_path(name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

// ============================================================================
// ENGINE
// ============================================================================

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    Cancelled,
    TimedOut,
}

pub struct OoklaEngine {
    /// Configured executable; empty means "search PATH"
    binary_path: String,
    timeout: Duration,
    configured_server: Option<u32>,
}

impl OoklaEngine {
    pub fn new(binary_path: impl Into<String>, timeout: Duration, configured_server: Option<u32>) -> Self {
        OoklaEngine {
            binary_path: binary_path.into(),
            timeout,
            configured_server,
        }
    }

    pub fn from_settings(settings: &AppSettings) -> Self {
        Self::new(
            settings.ookla_path.clone(),
            Duration::from_secs(settings.ookla_timeout.max(1)),
            settings.server_id,
        )
    }

    /// Locate the executable.
    ///
    /// A configured path must point at an existing file. Without one the OS
    /// search path is consulted, falling back to the bare name.
    pub fn resolve_binary(&self) -> Result<PathBuf, EngineError> {
        let configured = self.binary_path.trim();
        if configured.is_empty() {
            return Ok(search_path(BINARY_NAME).unwrap_or_else(|| PathBuf::from(BINARY_NAME)));
        }

        let path = Path::new(configured);
        if path.is_file() {
            Ok(path.to_path_buf())
        } else {
            Err(EngineError::BinaryNotFound(configured.to_string()))
        }
    }

    /// Run the executable, returning stdout on success.
    async fn run_cli(&self, args: &[String], cancel: Option<&CancellationToken>) -> Result<String, EngineError> {
        if let Some(token) = cancel {
            token.check()?;
        }
        let binary = self.resolve_binary()?;
        log::debug!(target: "engine", "Running {} {}", binary.display(), args.join(" "));

        let mut cmd = Command::new(&binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let mut child = cmd.spawn().map_err(|e| EngineError::Spawn {
            cmd: binary.display().to_string(),
            reason: e.to_string(),
        })?;

        let stdout_task = tokio::spawn(read_to_string(child.stdout.take()));
        let stderr_task = tokio::spawn(read_to_string(child.stderr.take()));

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            _ = wait_for_cancel(cancel) => Outcome::Cancelled,
            _ = tokio::time::sleep(self.timeout) => Outcome::TimedOut,
        };

        let status = match outcome {
            Outcome::Exited(status) => status.map_err(|e| EngineError::ProcessFailed(e.to_string()))?,
            Outcome::Cancelled => {
                log::info!(target: "engine", "Cancellation requested, terminating speedtest");
                let _ = child.kill().await;
                return Err(EngineError::Cancelled);
            }
            Outcome::TimedOut => {
                log::warn!(target: "engine", "speedtest exceeded {}s, terminating", self.timeout.as_secs());
                let _ = child.kill().await;
                return Err(EngineError::Timeout(self.timeout.as_secs()));
            }
        };

        // A token signalled while the process was exiting still wins
        if let Some(token) = cancel {
            token.check()?;
        }

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            let detail = [stderr.trim(), stdout.trim()]
                .into_iter()
                .find(|s| !s.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| match status.code() {
                    Some(code) => format!("exit code {}", code),
                    None => "terminated by signal".to_string(),
                });
            return Err(EngineError::ProcessFailed(detail));
        }
        Ok(stdout)
    }

    async fn run(&self, cancel: &CancellationToken, server_override: Option<u32>) -> Result<MeasurementResult, EngineError> {
        let server_id = server_override.or(self.configured_server);
        match server_id {
            Some(id) => log::info!(target: "engine", "Running Ookla speedtest against server ID={}...", id),
            None => log::info!(target: "engine", "Running Ookla speedtest..."),
        }
        let stdout = self.run_cli(&test_args(server_id), Some(cancel)).await?;
        parse_report(&stdout)
    }

    async fn directory(&self, limit: usize) -> Result<Vec<ServerInfo>, EngineError> {
        let mut args: Vec<String> = LICENSE_FLAGS.iter().map(|s| s.to_string()).collect();
        args.push("--servers".to_string());
        args.push("--format=json".to_string());
        let stdout = self.run_cli(&args, None).await?;
        Ok(dedupe_servers(parse_server_list(&stdout)?, limit))
    }
}

impl SpeedEngine for OoklaEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Ookla
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

async fn wait_for_cancel(cancel: Option<&CancellationToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

async fn read_to_string<R>(reader: Option<R>) -> String
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        let _ = reader.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}
