//! Settings file locations, loading and serialization.

use crate::error::ConfigError;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

/// Folder created under the user's Documents directory.
pub const APP_FOLDER_NAME: &str = "SpeedtestNextGen";
pub const SETTINGS_FILENAME: &str = "settings.json";
pub const RESULTS_FILENAME: &str = "results.jsonl";

/// Application data root: `~/Documents/SpeedtestNextGen`.
///
/// Falls back to the home directory, then the working directory, when the
/// platform has no Documents folder.
pub fn app_data_dir() -> PathBuf {
    dirs::document_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_FOLDER_NAME)
}

/// `~/Documents/SpeedtestNextGen/settings.json`
pub fn default_settings_path() -> PathBuf {
    app_data_dir().join(SETTINGS_FILENAME)
}

/// `~/Documents/SpeedtestNextGen/data/results.jsonl`
pub fn default_results_path() -> PathBuf {
    app_data_dir().join("data").join(RESULTS_FILENAME)
}

/// `~/Documents/SpeedtestNextGen/logs`
pub fn default_logs_dir() -> PathBuf {
    app_data_dir().join("logs")
}

/// Read the raw settings object.
///
/// Returns `Ok(None)` when the file does not exist yet. Invalid JSON (including
/// bytes that are not UTF-8) or a top-level value that is not an object is
/// reported as an error so the caller can run corruption recovery.
pub fn read_settings_file(path: &Path) -> Result<Option<Map<String, Value>>, ConfigError> {
    let content = match fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ConfigError::IoError(e)),
    };

    match serde_json::from_slice::<Value>(&content)? {
        Value::Object(map) => Ok(Some(map)),
        other => Err(ConfigError::ValidationFailed(format!(
            "settings root must be a JSON object, found {}",
            json_kind(&other)
        ))),
    }
}

/// Write the settings object as pretty-printed JSON, creating parent directories.
pub fn write_settings_file(path: &Path, map: &Map<String, Value>) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let content = serde_json::to_string_pretty(map)?;
    fs::write(path, content)?;
    Ok(())
}

/// Move a corrupt settings file aside.
///
/// Picks `<name>.bak`, or `<name>.bak.1`, `<name>.bak.2`, ... when earlier
/// backups already exist. Returns the backup path.
pub fn backup_corrupt_file(path: &Path) -> Result<PathBuf, ConfigError> {
    let backup = next_backup_path(path);
    fs::rename(path, &backup)?;
    Ok(backup)
}

fn next_backup_path(path: &Path) -> PathBuf {
    let base = path.as_os_str().to_string_lossy().into_owned();
    let first = PathBuf::from(format!("{}.bak", base));
    if !first.exists() {
        return first;
    }
    let mut n = 1u32;
    loop {
        let candidate = PathBuf::from(format!("{}.bak.{}", base, n));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
