use crate::errors::LiverecError;
use crate::log_retention::{enforce_retention, RetentionPolicy};
use chrono::{DateTime, Local};
use serde::Serialize;
use serde_json::{json, Value};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::SystemTime;

pub const DEFAULT_DISK_BUDGET_BYTES: u64 = 50 * 1024 * 1024;
pub const DEFAULT_RETENTION_DAYS: u64 = 3;

/// Daily-rotated JSONL sink: one `<prefix>-YYYY-MM-DD.jsonl` per local day.
#[derive(Debug, Clone)]
pub struct JsonlLogger {
    pub dir: PathBuf,
    pub file_prefix: String,
    pub max_payload_bytes: usize,
    pub retention: RetentionPolicy,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEvent<'a> {
    pub ts: String,
    pub level: &'a str,
    pub event_type: &'a str,
    pub payload: Value,
}

impl JsonlLogger {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            file_prefix: "liverec".to_string(),
            max_payload_bytes: 4096,
            retention: RetentionPolicy {
                budget_bytes: DEFAULT_DISK_BUDGET_BYTES,
                max_age_days: DEFAULT_RETENTION_DAYS,
            },
        }
    }

    pub fn path_for(&self, now: &DateTime<Local>) -> PathBuf {
        self.dir
            .join(format!("{}-{}.jsonl", self.file_prefix, now.format("%Y-%m-%d")))
    }

    pub fn append(&self, level: &str, event_type: &str, payload: Value) -> Result<(), LiverecError> {
        fs::create_dir_all(&self.dir).map_err(|e| LiverecError::Io(e.to_string()))?;
        let now = Local::now();
        let path = self.path_for(&now);
        let line = serde_json::to_string(&LogEvent {
            ts: now.to_rfc3339(),
            level,
            event_type,
            payload: truncate_json(payload, self.max_payload_bytes),
        })
        .map_err(|e| LiverecError::Io(e.to_string()))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| LiverecError::Io(e.to_string()))?;
        file.write_all(line.as_bytes())
            .map_err(|e| LiverecError::Io(e.to_string()))?;
        file.write_all(b"\n")
            .map_err(|e| LiverecError::Io(e.to_string()))?;
        Ok(())
    }

    /// Prunes expired and over-budget files, never the file currently written.
    pub fn prune(&self) -> Result<Vec<PathBuf>, LiverecError> {
        let current = self.path_for(&Local::now());
        enforce_retention(&self.dir, &self.retention, SystemTime::now(), Some(&current))
    }
}

static RUN_LOGGER: OnceLock<Mutex<Option<JsonlLogger>>> = OnceLock::new();

fn logger_slot() -> &'static Mutex<Option<JsonlLogger>> {
    RUN_LOGGER.get_or_init(|| Mutex::new(None))
}

/// Installs the process-wide run logger and applies retention once.
pub fn init_run_logger(logger: JsonlLogger) -> Result<Vec<PathBuf>, LiverecError> {
    fs::create_dir_all(&logger.dir).map_err(|e| LiverecError::Io(e.to_string()))?;
    let pruned = logger.prune()?;
    let mut slot = logger_slot()
        .lock()
        .map_err(|_| LiverecError::Io("run logger lock poisoned".to_string()))?;
    *slot = Some(logger);
    drop(slot);
    append_run_log(
        "info",
        "logging.initialized",
        json!({ "pruned_files": pruned.len() }),
    );
    Ok(pruned)
}

/// Appends one event to the run log. A no-op until `init_run_logger` runs;
/// write failures are swallowed so logging never aborts a recording.
pub fn append_run_log(level: &str, event_type: &str, payload: Value) {
    let Ok(slot) = logger_slot().lock() else {
        return;
    };
    if let Some(logger) = slot.as_ref() {
        let _ = logger.append(level, event_type, payload);
    }
}

pub fn structured_fallback_line(session: &str, state: &str, message: &str) -> String {
    format!(
        "session={session} state={state} message={} ",
        message.replace('\n', "\\n")
    )
}

fn truncate_json(value: Value, max_bytes: usize) -> Value {
    let rendered = serde_json::to_string(&value).unwrap_or_default();
    if rendered.len() <= max_bytes {
        return value;
    }
    let mut cut = max_bytes.saturating_sub(3);
    while cut > 0 && !rendered.is_char_boundary(cut) {
        cut -= 1;
    }
    Value::String(format!("{}...", &rendered[..cut]))
}
