//! Settings management for SpeedtestNextGen.
//!
//! The settings document is a flat JSON object. Every known key has a built-in
//! default, so the document is always fully populated after load; keys this
//! version does not know about are carried through untouched.
//!
//! # Settings Management
//!
//! The `SettingsManager` provides thread-safe access to `AppSettings`:
//! - Uses `RwLock<AppSettings>` for parallel reads
//! - Persists the whole document on every mutation (no batching)
//! - Notifies subscribers synchronously, in subscription order, after the write
//! - Recovers from a corrupt file by moving it to `settings.json.bak` and
//!   starting from defaults

pub mod loader;

use crate::error::ConfigError;
use crate::models::{AccentColor, EngineKind, SpeedUnit, Theme};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Typed view of the settings document.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub units: SpeedUnit,
    pub theme: Theme,
    pub favorite_server_ids: Vec<u32>,
    pub engine: EngineKind,
    /// Path to the Ookla executable; empty means "search PATH"
    pub ookla_path: String,
    /// Wall-clock budget for one Ookla run (seconds)
    pub ookla_timeout: u64,
    pub accent_color: AccentColor,
    pub max_history_records: usize,
    /// Server used when a test is started without an explicit override
    pub server_id: Option<u32>,

    /// Keys written by other versions, preserved verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for AppSettings {
    fn default() -> Self {
        AppSettings {
            units: SpeedUnit::Mbps,
            theme: Theme::Dark,
            favorite_server_ids: Vec::new(),
            engine: EngineKind::Builtin,
            ookla_path: String::new(),
            ookla_timeout: 90,
            accent_color: AccentColor::Blue,
            max_history_records: 1000,
            server_id: None,
            extra: Map::new(),
        }
    }
}

impl AppSettings {
    /// Range checks serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ookla_timeout == 0 {
            return Err(ConfigError::ValidationFailed(
                "ookla_timeout must be at least 1 second".to_string(),
            ));
        }
        Ok(())
    }

    /// Flat key/value form, as written to disk.
    pub fn to_map(&self) -> Result<Map<String, Value>, ConfigError> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => Err(ConfigError::ValidationFailed(
                "settings did not serialize to an object".to_string(),
            )),
        }
    }

    fn from_map(map: Map<String, Value>) -> Result<Self, ConfigError> {
        let settings: AppSettings = serde_json::from_value(Value::Object(map))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Overlay persisted keys on top of the defaults one key at a time.
    ///
    /// A key whose value does not fit the schema is dropped (and reported) so
    /// a single bad entry cannot wipe the rest of the user's preferences.
    pub fn merge_persisted(persisted: Map<String, Value>) -> (Self, Vec<String>) {
        let defaults = AppSettings::default();
        let mut merged = defaults.to_map().unwrap_or_default();
        let mut rejected = Vec::new();

        for (key, value) in persisted {
            let mut candidate = merged.clone();
            candidate.insert(key.clone(), value);
            if AppSettings::from_map(candidate.clone()).is_ok() {
                merged = candidate;
            } else {
                rejected.push(key);
            }
        }

        let settings = AppSettings::from_map(merged).unwrap_or(defaults);
        (settings, rejected)
    }
}

/// Handle returned by [`SettingsManager::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Subscriber = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// Thread-safe settings manager for AppSettings persistence
pub struct SettingsManager {
    path: PathBuf,
    state: RwLock<AppSettings>,
    subscribers: Mutex<Vec<(SubscriptionId, Subscriber)>>,
    next_subscription: AtomicU64,
}

impl SettingsManager {
    /// Load settings from `path`, back-filling defaults.
    ///
    /// ERROR HANDLING: a file that is not valid JSON is renamed to a `.bak`
    /// sibling and replaced by the defaults; this never fails the caller. Only
    /// an unreadable file (permissions, I/O) is reported as an error.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();

        let settings = match loader::read_settings_file(&path) {
            Ok(Some(persisted)) => {
                let (settings, rejected) = AppSettings::merge_persisted(persisted);
                for key in rejected {
                    log::warn!(target: "settings", "Ignoring invalid value for '{}', using default", key);
                }
                settings
            }
            Ok(None) => {
                log::info!(target: "settings", "No settings file at {}, using defaults", path.display());
                AppSettings::default()
            }
            Err(ConfigError::IoError(e)) => return Err(ConfigError::IoError(e)),
            Err(e) => {
                log::warn!(target: "settings", "Settings file is corrupt ({}), resetting to defaults", e);
                Self::recover_corrupt(&path)
            }
        };

        Ok(SettingsManager {
            path,
            state: RwLock::new(settings),
            subscribers: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
        })
    }

    /// Load from the default location under the user's Documents folder.
    pub fn load_default() -> Result<Self, ConfigError> {
        Self::load(loader::default_settings_path())
    }

    fn recover_corrupt(path: &Path) -> AppSettings {
        match loader::backup_corrupt_file(path) {
            Ok(backup) => {
                log::warn!(target: "settings", "Corrupt settings moved to {}", backup.display());
            }
            Err(e) => {
                log::error!(target: "settings", "Could not move corrupt settings aside: {}", e);
            }
        }

        let defaults = AppSettings::default();
        if let Err(e) = defaults
            .to_map()
            .and_then(|map| loader::write_settings_file(path, &map))
        {
            log::error!(target: "settings", "Could not write default settings: {}", e);
        }
        defaults
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy of the whole document.
    pub fn snapshot(&self) -> AppSettings {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Raw value of one key, including preserved unknown keys.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.snapshot()
            .to_map()
            .ok()
            .and_then(|mut map| map.remove(key))
    }

    /// Set one key, persist, then notify subscribers.
    ///
    /// Setting a key to its current value is a no-op (no write, no
    /// notification). A value that does not fit the schema is rejected with
    /// `ConfigError::ValidationFailed` and nothing changes.
    pub fn set(&self, key: &str, value: Value) -> Result<(), ConfigError> {
        let stored = {
            let mut state = self
                .state
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());

            let mut map = state.to_map()?;
            if map.get(key) == Some(&value) {
                return Ok(());
            }
            map.insert(key.to_string(), value);

            let updated = AppSettings::from_map(map).map_err(|e| {
                ConfigError::ValidationFailed(format!("invalid value for '{}': {}", key, e))
            })?;
            if updated == *state {
                return Ok(());
            }

            // Persist the normalized form, e.g. a legacy engine alias as its canonical name
            let normalized = updated.to_map()?;
            loader::write_settings_file(&self.path, &normalized)?;
            let stored = normalized.get(key).cloned().unwrap_or(Value::Null);
            *state = updated;
            stored
        };

        log::info!(target: "settings", "Setting changed: {} = {}", key, stored);
        self.notify(key, &stored);
        Ok(())
    }

    /// Persist the current document without changing it.
    pub fn save(&self) -> Result<(), ConfigError> {
        let map = self.snapshot().to_map()?;
        loader::write_settings_file(&self.path, &map)
    }

    /// Register a `(key, value)` change callback.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((id, Arc::new(callback)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|(sid, _)| *sid != id);
    }

    // Callbacks run outside the lock so they may call back into the manager.
    fn notify(&self, key: &str, value: &Value) {
        let subscribers: Vec<Subscriber> = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in subscribers {
            callback(key, value);
        }
    }

    /// Add a favorite server id (no duplicates, stored order preserved).
    pub fn add_favorite(&self, server_id: u32) -> Result<(), ConfigError> {
        let mut favorites = self.snapshot().favorite_server_ids;
        if favorites.contains(&server_id) {
            return Ok(());
        }
        favorites.push(server_id);
        self.set("favorite_server_ids", Value::from(favorites))
    }

    pub fn remove_favorite(&self, server_id: u32) -> Result<(), ConfigError> {
        let mut favorites = self.snapshot().favorite_server_ids;
        favorites.retain(|id| *id != server_id);
        self.set("favorite_server_ids", Value::from(favorites))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    #[test]
    fn test_app_settings_default() {
        let settings = AppSettings::default();
        assert_eq!(settings.units, SpeedUnit::Mbps);
        assert_eq!(settings.engine, EngineKind::Builtin);
        assert_eq!(settings.ookla_timeout, 90);
        assert_eq!(settings.max_history_records, 1000);
        assert!(settings.ookla_path.is_empty());
        assert!(settings.favorite_server_ids.is_empty());
    }

    #[test]
    fn test_merge_drops_only_invalid_keys() {
        let persisted = json!({
            "units": "MB/s",
            "engine": "warp-drive",
            "ookla_timeout": 0,
            "window_geometry": [10, 20]
        });
        let Value::Object(map) = persisted else { unreachable!() };

        let (settings, mut rejected) = AppSettings::merge_persisted(map);
        rejected.sort();

        assert_eq!(settings.units, SpeedUnit::MegabytesPerSec);
        assert_eq!(settings.engine, EngineKind::Builtin);
        assert_eq!(settings.ookla_timeout, 90);
        assert_eq!(settings.extra.get("window_geometry"), Some(&json!([10, 20])));
        assert_eq!(rejected, vec!["engine".to_string(), "ookla_timeout".to_string()]);
    }

    #[test]
    fn test_set_persists_and_notifies() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("settings.json");
        let manager = SettingsManager::load(&path).unwrap();

        let seen: Arc<StdMutex<Vec<(String, Value)>>> = Arc::new(StdMutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        manager.subscribe(move |k, v| {
            seen_clone.lock().unwrap().push((k.to_string(), v.clone()));
        });

        manager.set("engine", json!("ookla")).unwrap();
        // Same value again: no write, no notification
        manager.set("engine", json!("ookla")).unwrap();

        assert_eq!(manager.snapshot().engine, EngineKind::Ookla);
        assert_eq!(seen.lock().unwrap().len(), 1);

        let reloaded = SettingsManager::load(&path).unwrap();
        assert_eq!(reloaded.snapshot().engine, EngineKind::Ookla);
    }

    #[test]
    fn test_set_rejects_bad_type() {
        let temp_dir = TempDir::new().unwrap();
        let manager = SettingsManager::load(temp_dir.path().join("settings.json")).unwrap();

        let result = manager.set("max_history_records", json!("lots"));
        assert!(matches!(result, Err(ConfigError::ValidationFailed(_))));
        assert_eq!(manager.snapshot().max_history_records, 1000);
        assert!(!manager.path().exists(), "rejected set must not write");
    }

    #[test]
    fn test_unsubscribe_stops_notifications() {
        let temp_dir = TempDir::new().unwrap();
        let manager = SettingsManager::load(temp_dir.path().join("settings.json")).unwrap();

        let count = Arc::new(AtomicU64::new(0));
        let count_clone = Arc::clone(&count);
        let id = manager.subscribe(move |_, _| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        manager.set("theme", json!("Light")).unwrap();
        manager.unsubscribe(id);
        manager.set("theme", json!("Dark")).unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_favorites_are_deduplicated() {
        let temp_dir = TempDir::new().unwrap();
        let manager = SettingsManager::load(temp_dir.path().join("settings.json")).unwrap();

        manager.add_favorite(7).unwrap();
        manager.add_favorite(3).unwrap();
        manager.add_favorite(7).unwrap();
        assert_eq!(manager.snapshot().favorite_server_ids, vec![7, 3]);

        manager.remove_favorite(7).unwrap();
        assert_eq!(manager.snapshot().favorite_server_ids, vec![3]);
    }
}
