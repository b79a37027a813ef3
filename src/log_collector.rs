//! Decoupled logging pipeline.
//!
//! Every `log::info!`/`warn!`/... record is handed to a background writer
//! thread over an unbounded crossbeam channel, so callers on the test worker
//! never block on disk I/O.
//!
//! ```text
//! log::info!(target: "test", ...)
//!     |
//! [LogCollector]  (log::Log, non-blocking)
//!     | crossbeam unbounded channel
//!     v
//! [writer thread] --> logs/session_<ts>.log   (one JSON object per line)
//!                 \-> UI sink (optional)      ("HH:MM:SS LEVEL category message")
//! ```
//!
//! Log targets double as categories: `app`, `test`, `network`, `settings`,
//! `history`, `engine`.

use chrono::Local;
use crossbeam_channel::{unbounded, Sender};
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Session files kept in the logs directory, including the current one.
pub const SESSION_RETENTION: usize = 10;

const SESSION_PREFIX: &str = "session_";

/// Third-party targets that only get through at `Warn` and above.
const NOISY_TARGETS: [&str; 6] = ["hyper", "reqwest", "rustls", "h2", "mio", "tokio"];

enum LogMessage {
    Line(LogLine),
    /// Flush marker; the writer acknowledges once everything before it is on disk
    Flush(std::sync::mpsc::Sender<()>),
}

/// One structured log record as written to the session file.
#[derive(Clone, Debug, Serialize)]
pub struct LogLine {
    pub timestamp: String,
    pub level: String,
    pub category: String,
    pub message: String,
    #[serde(skip)]
    clock: String,
}

impl LogLine {
    pub fn new(level: log::Level, category: impl Into<String>, message: impl Into<String>) -> Self {
        let now = Local::now();
        LogLine {
            timestamp: now.format("%Y-%m-%dT%H:%M:%S%.3f").to_string(),
            level: level.to_string(),
            category: category.into(),
            message: message.into(),
            clock: now.format("%H:%M:%S").to_string(),
        }
    }

    /// `HH:MM:SS LEVEL category message`
    pub fn human(&self) -> String {
        format!("{} {:<5} {} {}", self.clock, self.level, self.category, self.message)
    }
}

/// `log::Log` implementation feeding the writer thread.
#[derive(Clone)]
pub struct LogCollector {
    tx: Sender<LogMessage>,
    session_path: PathBuf,
    max_level: LevelFilter,
}

impl LogCollector {
    /// Open a new session file under `log_dir` and start the writer thread.
    ///
    /// Human-readable lines are forwarded to `ui_tx` when given.
    pub fn new(log_dir: &Path, ui_tx: Option<Sender<String>>, max_level: LevelFilter) -> Result<Self, String> {
        fs::create_dir_all(log_dir).map_err(|e| format!("Failed to create logs directory: {}", e))?;

        let session_path = log_dir.join(format!(
            "{}{}.log",
            SESSION_PREFIX,
            Local::now().format("%Y%m%d_%H%M%S")
        ));
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&session_path)
            .map_err(|e| format!("Failed to open session log {}: {}", session_path.display(), e))?;

        prune_sessions(log_dir, SESSION_RETENTION);

        let (tx, rx) = unbounded::<LogMessage>();

        // Plain OS thread: records arrive from any runtime or none
        std::thread::Builder::new()
            .name("log-writer".to_string())
            .spawn(move || {
                while let Ok(msg) = rx.recv() {
                    match msg {
                        LogMessage::Line(line) => {
                            if let Ok(json) = serde_json::to_string(&line) {
                                let _ = writeln!(file, "{}", json);
                            }
                            if let Some(ui) = &ui_tx {
                                let _ = ui.send(line.human());
                            }
                        }
                        LogMessage::Flush(ack) => {
                            let _ = file.flush();
                            let _ = ack.send(());
                        }
                    }
                }
                let _ = file.flush();
            })
            .map_err(|e| format!("Failed to spawn log writer: {}", e))?;

        Ok(LogCollector {
            tx,
            session_path,
            max_level,
        })
    }

    /// Register as the global logger.
    pub fn install(self) -> Result<(), SetLoggerError> {
        let level = self.max_level;
        log::set_boxed_logger(Box::new(self))?;
        log::set_max_level(level);
        Ok(())
    }

    pub fn session_path(&self) -> &Path {
        &self.session_path
    }

    /// Queue a line. Never blocks.
    pub fn push(&self, line: LogLine) {
        let _ = self.tx.send(LogMessage::Line(line));
    }

    /// Block until every line queued before this call has been written.
    pub fn flush_pending(&self) -> Result<(), String> {
        let (ack_tx, ack_rx) = std::sync::mpsc::channel::<()>();
        self.tx
            .send(LogMessage::Flush(ack_tx))
            .map_err(|e| format!("Failed to send flush marker: {}", e))?;
        ack_rx
            .recv()
            .map_err(|e| format!("Flush signal interrupted: {}", e))
    }
}

impl Log for LogCollector {
    fn enabled(&self, metadata: &Metadata) -> bool {
        let root = metadata.target().split("::").next().unwrap_or_default();
        if NOISY_TARGETS.contains(&root) {
            return metadata.level() <= log::Level::Warn;
        }
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            self.push(LogLine::new(record.level(), record.target(), record.args().to_string()));
        }
    }

    fn flush(&self) {
        let _ = self.flush_pending();
    }
}

/// Delete the oldest session files so that at most `keep` remain.
fn prune_sessions(log_dir: &Path, keep: usize) {
    let mut sessions: Vec<PathBuf> = match fs::read_dir(log_dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.extension().map_or(false, |ext| ext == "log")
                    && p.file_name()
                        .and_then(|n| n.to_str())
                        .map_or(false, |n| n.starts_with(SESSION_PREFIX))
            })
            .collect(),
        Err(_) => return,
    };
    if sessions.len() <= keep {
        return;
    }

    // Names embed a sortable timestamp
    sessions.sort();
    let excess = sessions.len() - keep;
    for old in sessions.into_iter().take(excess) {
        let _ = fs::remove_file(old);
    }
}
