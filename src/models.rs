//! Core data types for SpeedtestNextGen.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

/// Timestamp marker stored on aggregated (multi-sample) records.
pub const AGGREGATE_TIMESTAMP: &str = "avg";

/// Measurement engine selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EngineKind {
    /// In-process HTTP measurement against the public speed-test directory
    #[serde(rename = "builtin")]
    Builtin,
    /// Official Ookla `speedtest` executable
    #[serde(rename = "ookla")]
    Ookla,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Builtin => "builtin",
            EngineKind::Ookla => "ookla",
        }
    }

    /// Label used in progress logs.
    pub fn display_name(&self) -> &'static str {
        match self {
            EngineKind::Builtin => "Built-in HTTP engine",
            EngineKind::Ookla => "Ookla CLI",
        }
    }
}

impl<'de> Deserialize<'de> for EngineKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            // "python" is what older settings files and history records carry
            "builtin" | "python" => Ok(EngineKind::Builtin),
            "ookla" => Ok(EngineKind::Ookla),
            _ => Err(format!("Unknown engine: {} (expected builtin or ookla)", s)),
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for EngineKind {
    fn default() -> Self {
        EngineKind::Builtin
    }
}

/// Display unit for bandwidth figures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpeedUnit {
    #[serde(rename = "Mbps")]
    Mbps,
    #[serde(rename = "MB/s")]
    MegabytesPerSec,
}

impl SpeedUnit {
    /// Render a bits-per-second figure in this unit.
    pub fn format(&self, bps: f64) -> String {
        match self {
            SpeedUnit::Mbps => format!("{:.2} Mbps", bps / 1e6),
            SpeedUnit::MegabytesPerSec => format!("{:.2} MB/s", bps / 8e6),
        }
    }
}

impl Default for SpeedUnit {
    fn default() -> Self {
        SpeedUnit::Mbps
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Theme {
    Dark,
    Light,
}

impl Default for Theme {
    fn default() -> Self {
        Theme::Dark
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccentColor {
    Blue,
    Green,
    Purple,
    Red,
    Orange,
    Pink,
}

impl Default for AccentColor {
    fn default() -> Self {
        AccentColor::Blue
    }
}

/// A measurement endpoint as reported by an engine's directory.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ServerInfo {
    #[serde(default, deserialize_with = "lenient_id")]
    pub id: Option<u32>,
    /// Provider operating the server
    #[serde(default)]
    pub sponsor: String,
    /// City / location
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub country: String,
    /// `host[:port]`
    #[serde(default)]
    pub host: String,
}

impl ServerInfo {
    /// One-line description used in logs: `sponsor - name, country (host) [ID id]`
    pub fn describe(&self) -> String {
        let id = self
            .id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        format!(
            "{} - {}, {} ({}) [ID {}]",
            or_dash(&self.sponsor),
            or_dash(&self.name),
            or_dash(&self.country),
            or_dash(&self.host),
            id
        )
    }
}

fn or_dash(s: &str) -> &str {
    if s.is_empty() {
        "-"
    } else {
        s
    }
}

/// Accepts ids written as numbers or numeric strings; anything else becomes `None`.
pub(crate) fn lenient_id<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

/// One test outcome, persisted as a single JSON line in the result store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementResult {
    /// ISO-8601 local time, or [`AGGREGATE_TIMESTAMP`] for aggregated records
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub ping_ms: f64,
    #[serde(default)]
    pub download_bps: f64,
    #[serde(default)]
    pub upload_bps: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<EngineKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub samples: Option<u32>,
}

impl MeasurementResult {
    /// Build a single-sample result; negative inputs are clamped to zero.
    pub fn new(ping_ms: f64, download_bps: f64, upload_bps: f64) -> Self {
        MeasurementResult {
            timestamp: String::new(),
            ping_ms: non_negative(ping_ms),
            download_bps: non_negative(download_bps),
            upload_bps: non_negative(upload_bps),
            server: None,
            engine: None,
            aggregate: None,
            samples: None,
        }
    }

    pub fn with_server(mut self, server: ServerInfo) -> Self {
        self.server = Some(server);
        self
    }

    pub fn with_engine(mut self, engine: EngineKind) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = timestamp.into();
        self
    }

    /// Arithmetic mean of each figure across `samples`. Never carries a server.
    pub fn aggregate_of(samples: &[MeasurementResult]) -> Self {
        let n = samples.len().max(1) as f64;
        let ping = samples.iter().map(|r| r.ping_ms).sum::<f64>() / n;
        let down = samples.iter().map(|r| r.download_bps).sum::<f64>() / n;
        let up = samples.iter().map(|r| r.upload_bps).sum::<f64>() / n;

        MeasurementResult {
            timestamp: AGGREGATE_TIMESTAMP.to_string(),
            ping_ms: ping,
            download_bps: down,
            upload_bps: up,
            server: None,
            engine: None,
            aggregate: Some(true),
            samples: Some(samples.len() as u32),
        }
    }

    pub fn is_aggregate(&self) -> bool {
        self.aggregate.unwrap_or(false)
    }

    /// `Ping N ms | Download X | Upload Y`
    pub fn summary(&self, unit: SpeedUnit) -> String {
        format!(
            "Ping {:.0} ms | Download {} | Upload {}",
            self.ping_ms,
            unit.format(self.download_bps),
            unit.format(self.upload_bps)
        )
    }
}

fn non_negative(v: f64) -> f64 {
    if v.is_finite() && v > 0.0 {
        v
    } else {
        0.0
    }
}

/// Local time in ISO-8601 with second precision, e.g. `2024-05-01T12:30:00`.
pub fn now_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_kind_accepts_legacy_name() {
        let kind: EngineKind = serde_json::from_str("\"python\"").unwrap();
        assert_eq!(kind, EngineKind::Builtin);
        assert_eq!(serde_json::to_string(&kind).unwrap(), "\"builtin\"");
        assert!("speedof.me".parse::<EngineKind>().is_err());
    }

    #[test]
    fn test_speed_unit_format() {
        assert_eq!(SpeedUnit::Mbps.format(94_000_000.0), "94.00 Mbps");
        assert_eq!(SpeedUnit::MegabytesPerSec.format(80_000_000.0), "10.00 MB/s");
        let unit: SpeedUnit = serde_json::from_str("\"MB/s\"").unwrap();
        assert_eq!(unit, SpeedUnit::MegabytesPerSec);
    }

    #[test]
    fn test_server_id_from_string_or_number() {
        let a: ServerInfo = serde_json::from_str(r#"{"id":"4321","host":"a"}"#).unwrap();
        let b: ServerInfo = serde_json::from_str(r#"{"id":4321}"#).unwrap();
        let c: ServerInfo = serde_json::from_str(r#"{"id":"n/a"}"#).unwrap();
        assert_eq!(a.id, Some(4321));
        assert_eq!(b.id, Some(4321));
        assert_eq!(c.id, None);
    }

    #[test]
    fn test_aggregate_of_means_and_marks() {
        let samples = vec![
            MeasurementResult::new(10.0, 90e6, 9e6),
            MeasurementResult::new(20.0, 100e6, 10e6),
            MeasurementResult::new(30.0, 110e6, 11e6),
        ];
        let avg = MeasurementResult::aggregate_of(&samples);
        assert_eq!(avg.ping_ms, 20.0);
        assert_eq!(avg.download_bps, 100e6);
        assert_eq!(avg.upload_bps, 10e6);
        assert_eq!(avg.samples, Some(3));
        assert!(avg.is_aggregate());
        assert!(avg.server.is_none());
        assert_eq!(avg.timestamp, AGGREGATE_TIMESTAMP);
    }

    #[test]
    fn test_aggregate_of_empty_is_zero() {
        let avg = MeasurementResult::aggregate_of(&[]);
        assert_eq!(avg.ping_ms, 0.0);
        assert_eq!(avg.samples, Some(0));
    }

    #[test]
    fn test_negative_inputs_clamped() {
        let r = MeasurementResult::new(-1.0, f64::NAN, 5.0);
        assert_eq!(r.ping_ms, 0.0);
        assert_eq!(r.download_bps, 0.0);
        assert_eq!(r.upload_bps, 5.0);
    }

    #[test]
    fn test_optional_fields_omitted_on_disk() {
        let r = MeasurementResult::new(1.0, 2.0, 3.0).with_timestamp("2024-01-01T00:00:00");
        let json = serde_json::to_string(&r).unwrap();
        assert!(!json.contains("aggregate"));
        assert!(!json.contains("server"));
    }
}
