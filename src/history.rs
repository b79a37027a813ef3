//! Measurement History
//!
//! Append-only, newline-delimited JSON log of [`MeasurementResult`] records
//! stored in `~/Documents/SpeedtestNextGen/data/results.jsonl`.
//!
//! Every line is an independent JSON object, so a corrupt line is skipped on
//! read without invalidating the rest of the file. After each append the log
//! is trimmed to the configured retention cap, dropping the oldest records.

use crate::config::loader;
use crate::error::StoreError;
use crate::models::MeasurementResult;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// File-backed result log.
///
/// Appends and trims from this process are serialized; concurrent writers from
/// other processes are not supported.
pub struct ResultStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl ResultStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ResultStore {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Store at the default location next to the settings file.
    pub fn open_default() -> Self {
        Self::new(loader::default_results_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record as a single JSON line.
    pub fn append(&self, result: &MeasurementResult) -> Result<(), StoreError> {
        let _guard = self.lock();
        self.append_locked(result)
    }

    /// Append, then trim to `max_records` (0 disables the cap).
    pub fn append_with_retention(
        &self,
        result: &MeasurementResult,
        max_records: usize,
    ) -> Result<(), StoreError> {
        let _guard = self.lock();
        self.append_locked(result)?;
        if max_records > 0 {
            let removed = self.trim_locked(max_records)?;
            if removed > 0 {
                log::debug!(target: "history", "Retention cap {} reached, dropped {} old record(s)", max_records, removed);
            }
        }
        Ok(())
    }

    /// Load parseable records in file order.
    ///
    /// With `Some(n)` (n > 0) only the last `n` records are returned.
    pub fn load(&self, limit: Option<usize>) -> Result<Vec<MeasurementResult>, StoreError> {
        let lines = match self.read_lines()? {
            Some(lines) => lines,
            None => return Ok(Vec::new()),
        };

        let mut items = Vec::with_capacity(lines.len());
        let mut skipped = 0usize;
        for line in &lines {
            match serde_json::from_slice::<MeasurementResult>(line) {
                Ok(record) => items.push(record),
                Err(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            log::warn!(target: "history", "Skipped {} malformed line(s) in {}", skipped, self.path.display());
        }

        match limit {
            Some(n) if n > 0 && items.len() > n => Ok(items.split_off(items.len() - n)),
            _ => Ok(items),
        }
    }

    /// Number of stored records (non-empty lines), without parsing them.
    pub fn count(&self) -> Result<usize, StoreError> {
        Ok(self.read_lines()?.map_or(0, |lines| lines.len()))
    }

    /// Keep only the most recent `max_records` lines. Returns how many were dropped.
    pub fn trim_to(&self, max_records: usize) -> Result<usize, StoreError> {
        let _guard = self.lock();
        self.trim_locked(max_records)
    }

    /// Remove every record.
    pub fn clear(&self) -> Result<(), StoreError> {
        let _guard = self.lock();
        if self.path.exists() {
            fs::write(&self.path, "")?;
            log::info!(target: "history", "History cleared");
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn append_locked(&self, result: &MeasurementResult) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut line = serde_json::to_string(result)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    fn trim_locked(&self, max_records: usize) -> Result<usize, StoreError> {
        let lines = match self.read_lines()? {
            Some(lines) => lines,
            None => return Ok(0),
        };
        if lines.len() <= max_records {
            return Ok(0);
        }

        let removed = lines.len() - max_records;
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        // Write the survivors next to the log, then swap it in with a rename
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        for line in &lines[removed..] {
            tmp.write_all(line)?;
            tmp.write_all(b"\n")?;
        }
        tmp.flush()?;
        tmp.persist(&self.path)
            .map_err(|e| StoreError::Persist(e.to_string()))?;

        Ok(removed)
    }

    /// Non-empty lines as raw bytes; a line need not be valid UTF-8.
    fn read_lines(&self) -> Result<Option<Vec<Vec<u8>>>, StoreError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut lines = Vec::new();
        for line in BufReader::new(file).split(b'\n') {
            let line = line?;
            let trimmed = trim_whitespace(&line);
            if !trimmed.is_empty() {
                lines.push(trimmed.to_vec());
            }
        }
        Ok(Some(lines))
    }
}

fn trim_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |i| i + 1);
    &bytes[start..end]
}
