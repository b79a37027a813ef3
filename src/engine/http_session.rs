//! HTTP session for the built-in engine.
//!
//! Talks to the public speed-test directory (`/api/js/servers`) and to the
//! measurement servers it lists. Each server advertises an `upload.php` URL;
//! its directory also serves `latency.txt` and `random{N}x{N}.jpg`.

use super::builtin::{MeasurementSession, SessionConnector, SessionOptions};
use crate::error::EngineError;
use crate::models::ServerInfo;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use reqwest::Client;
use serde::{Deserialize, Deserializer};
use std::time::{Duration, Instant};

const DIRECTORY_HOST: &str = "www.speedtest.net";
const DIRECTORY_LIMIT: usize = 100;

const APP_USER_AGENT: &str = concat!("speedtest-nextgen/", env!("CARGO_PKG_VERSION"));
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Closest candidates that get latency-probed during best-server selection.
const RANKED_CANDIDATES: usize = 5;
const LATENCY_PROBES: u32 = 3;

const DOWNLOAD_SIZES: [u32; 4] = [350, 750, 1500, 2000];
const UPLOAD_SIZES: [usize; 3] = [250_000, 500_000, 1_000_000];
const TRANSFER_REPEATS: usize = 2;

#[derive(Debug, Clone, Deserialize)]
struct DirectoryEntry {
    #[serde(default)]
    url: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    country: String,
    #[serde(default)]
    sponsor: String,
    #[serde(default, deserialize_with = "crate::models::lenient_id")]
    id: Option<u32>,
    #[serde(default)]
    host: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    distance: Option<f64>,
}

impl DirectoryEntry {
    fn to_server_info(&self) -> ServerInfo {
        ServerInfo {
            id: self.id,
            sponsor: self.sponsor.clone(),
            name: self.name.clone(),
            country: self.country.clone(),
            host: self.host.clone(),
        }
    }

    /// Directory that holds `latency.txt` and the download images.
    fn base_url(&self) -> String {
        match self.url.rsplit_once('/') {
            Some((base, _)) => format!("{}/", base),
            None => format!("{}/", self.url),
        }
    }
}

fn lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

/// Opens [`HttpSession`]s against the public directory or a custom base URL.
pub struct HttpConnector {
    directory_base: Option<String>,
    directory_limit: usize,
}

impl HttpConnector {
    pub fn new() -> Self {
        HttpConnector {
            directory_base: None,
            directory_limit: DIRECTORY_LIMIT,
        }
    }

    /// Point the directory lookup at `base` (scheme and host, no trailing path).
    pub fn with_directory_base(base: impl Into<String>) -> Self {
        HttpConnector {
            directory_base: Some(base.into().trim_end_matches('/').to_string()),
            directory_limit: DIRECTORY_LIMIT,
        }
    }

    fn base_for(&self, options: SessionOptions) -> String {
        match &self.directory_base {
            Some(base) => base.clone(),
            None => {
                let scheme = if options.secure == Some(false) { "http" } else { "https" };
                format!("{}://{}", scheme, DIRECTORY_HOST)
            }
        }
    }

    async fn open(&self, options: SessionOptions) -> Result<Box<dyn MeasurementSession>, EngineError> {
        let user_agent = if options.browser_agent {
            BROWSER_USER_AGENT
        } else {
            APP_USER_AGENT
        };
        let mut builder = Client::builder().user_agent(user_agent).timeout(REQUEST_TIMEOUT);
        if options.secure == Some(false) {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder.build()?;

        let base = self.base_for(options);
        let directory = query_directory(&client, &base, &[("limit", self.directory_limit.to_string())]).await?;
        log::debug!(target: "engine", "Directory at {} returned {} server(s)", base, directory.len());

        Ok(Box::new(HttpSession {
            client,
            directory_base: base,
            directory,
            candidates: Vec::new(),
            best: None,
            force_tls: options.secure == Some(true),
        }))
    }
}

impl Default for HttpConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionConnector for HttpConnector {
    fn connect(
        &self,
        options: SessionOptions,
    ) -> BoxFuture<'_, Result<Box<dyn MeasurementSession>, EngineError>> {
        self.open(options).boxed()
    }
}

async fn query_directory(
    client: &Client,
    base: &str,
    extra: &[(&str, String)],
) -> Result<Vec<DirectoryEntry>, EngineError> {
    let mut query: Vec<(&str, String)> = vec![("engine", "js".to_string())];
    query.extend(extra.iter().cloned());

    let entries = client
        .get(format!("{}/api/js/servers", base))
        .query(&query)
        .send()
        .await?
        .error_for_status()?
        .json::<Vec<DirectoryEntry>>()
        .await?;
    Ok(entries)
}

pub struct HttpSession {
    client: Client,
    directory_base: String,
    directory: Vec<DirectoryEntry>,
    candidates: Vec<DirectoryEntry>,
    best: Option<(DirectoryEntry, f64)>,
    force_tls: bool,
}

impl HttpSession {
    fn adjust_scheme(&self, url: String) -> String {
        match url.strip_prefix("http://") {
            Some(rest) if self.force_tls => format!("https://{}", rest),
            _ => url,
        }
    }

    fn best_entry(&self) -> Result<&DirectoryEntry, EngineError> {
        self.best
            .as_ref()
            .map(|(entry, _)| entry)
            .ok_or_else(|| EngineError::Network("no server selected".to_string()))
    }

    async fn load_candidates(&mut self, ids: &[u32]) -> Result<(), EngineError> {
        self.best = None;

        if ids.is_empty() {
            let mut all = self.directory.clone();
            all.sort_by(|a, b| {
                let da = a.distance.unwrap_or(f64::MAX);
                let db = b.distance.unwrap_or(f64::MAX);
                da.total_cmp(&db)
            });
            self.candidates = all;
            return Ok(());
        }

        let mut matched: Vec<DirectoryEntry> = self
            .directory
            .iter()
            .filter(|entry| entry.id.map_or(false, |id| ids.contains(&id)))
            .cloned()
            .collect();

        // Servers outside the nearby listing are only reachable through search
        if matched.is_empty() {
            for id in ids {
                let search = [("search", id.to_string())];
                match query_directory(&self.client, &self.directory_base, &search).await {
                    Ok(found) => matched.extend(found.into_iter().filter(|e| e.id == Some(*id))),
                    Err(e) => log::debug!(target: "engine", "Directory search for {} failed: {}", id, e),
                }
            }
        }

        if matched.is_empty() {
            let wanted: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
            return Err(EngineError::NoMatchedServers(wanted.join(", ")));
        }
        self.candidates = matched;
        Ok(())
    }

    async fn rank(&mut self) -> Result<ServerInfo, EngineError> {
        let ranked: Vec<DirectoryEntry> = self.candidates.iter().take(RANKED_CANDIDATES).cloned().collect();
        if ranked.is_empty() {
            return Err(EngineError::NoMatchedServers("directory is empty".to_string()));
        }

        let probes = ranked.iter().map(|entry| {
            let url = self.adjust_scheme(format!("{}latency.txt", entry.base_url()));
            probe_latency(&self.client, url)
        });
        let latencies = join_all(probes).await;

        let best = ranked
            .into_iter()
            .zip(latencies)
            .filter_map(|(entry, latency)| latency.map(|ms| (entry, ms)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .ok_or_else(|| EngineError::Network("no candidate server answered the latency probe".to_string()))?;

        let info = best.0.to_server_info();
        self.best = Some(best);
        Ok(info)
    }

    async fn measure_download(&self) -> Result<f64, EngineError> {
        let base = self.best_entry()?.base_url();
        let urls: Vec<String> = DOWNLOAD_SIZES
            .iter()
            .flat_map(|size| std::iter::repeat(format!("{}random{}x{}.jpg", base, size, size)).take(TRANSFER_REPEATS))
            .map(|url| self.adjust_scheme(url))
            .collect();

        let started = Instant::now();
        let received = join_all(urls.iter().map(|url| fetch_len(&self.client, url))).await;
        let total: u64 = received.into_iter().collect::<Result<Vec<u64>, EngineError>>()?.iter().sum();
        Ok(throughput_bps(total, started.elapsed()))
    }

    async fn measure_upload(&self) -> Result<f64, EngineError> {
        let url = self.adjust_scheme(self.best_entry()?.url.clone());
        let payloads: Vec<String> = UPLOAD_SIZES
            .iter()
            .flat_map(|size| std::iter::repeat(*size).take(TRANSFER_REPEATS))
            .map(|size| format!("content1={}", "0".repeat(size)))
            .collect();

        let started = Instant::now();
        let sent = join_all(payloads.into_iter().map(|body| post_len(&self.client, &url, body))).await;
        let total: u64 = sent.into_iter().collect::<Result<Vec<u64>, EngineError>>()?.iter().sum();
        Ok(throughput_bps(total, started.elapsed()))
    }
}

impl MeasurementSession for HttpSession {
    fn fetch_servers<'a>(&'a mut self, ids: &'a [u32]) -> BoxFuture<'a, Result<(), EngineError>> {
        self.load_candidates(ids).boxed()
    }

    fn servers(&self) -> Vec<ServerInfo> {
        self.candidates.iter().map(DirectoryEntry::to_server_info).collect()
    }

    fn best_server(&mut self) -> BoxFuture<'_, Result<ServerInfo, EngineError>> {
        self.rank().boxed()
    }

    fn download(&mut self) -> BoxFuture<'_, Result<f64, EngineError>> {
        self.measure_download().boxed()
    }

    fn upload(&mut self) -> BoxFuture<'_, Result<f64, EngineError>> {
        self.measure_upload().boxed()
    }

    fn ping_ms(&self) -> f64 {
        self.best.as_ref().map_or(0.0, |(_, ms)| *ms)
    }
}

/// Mean round-trip of `latency.txt` in ms, `None` if any probe fails.
async fn probe_latency(client: &Client, url: String) -> Option<f64> {
    let mut total = Duration::ZERO;
    for _ in 0..LATENCY_PROBES {
        let started = Instant::now();
        let response = client.get(&url).send().await.ok()?.error_for_status().ok()?;
        response.bytes().await.ok()?;
        total += started.elapsed();
    }
    Some(total.as_secs_f64() * 1000.0 / f64::from(LATENCY_PROBES))
}

async fn fetch_len(client: &Client, url: &str) -> Result<u64, EngineError> {
    let response = client.get(url).send().await?.error_for_status()?;
    Ok(response.bytes().await?.len() as u64)
}

async fn post_len(client: &Client, url: &str, body: String) -> Result<u64, EngineError> {
    let len = body.len() as u64;
    client
        .post(url)
        .header(reqwest::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(body)
        .send()
        .await?
        .error_for_status()?;
    Ok(len)
}

fn throughput_bps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        bytes as f64 * 8.0 / secs
    } else {
        0.0
    }
}
