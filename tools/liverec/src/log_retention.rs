use crate::errors::LiverecError;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub budget_bytes: u64,
    pub max_age_days: u64,
}

/// Deletes log files older than `max_age_days`, then the oldest remaining
/// files until the directory fits in `budget_bytes`. `keep` is never removed.
pub fn enforce_retention(
    dir: &Path,
    policy: &RetentionPolicy,
    now: SystemTime,
    keep: Option<&Path>,
) -> Result<Vec<PathBuf>, LiverecError> {
    let mut files = fs::read_dir(dir)
        .map_err(|e| LiverecError::Io(e.to_string()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter_map(|path| {
            let meta = fs::metadata(&path).ok()?;
            Some((path, meta.modified().ok(), meta.len()))
        })
        .collect::<Vec<_>>();
    files.sort_by(|a, b| a.1.cmp(&b.1));

    let max_age = Duration::from_secs(policy.max_age_days.saturating_mul(24 * 60 * 60));
    let mut total = files.iter().map(|(_, _, len)| *len).sum::<u64>();
    let mut deleted = Vec::new();
    for (path, modified, len) in files {
        if keep == Some(path.as_path()) {
            continue;
        }
        let expired = modified
            .and_then(|at| now.duration_since(at).ok())
            .map(|age| age > max_age)
            .unwrap_or(false);
        if !expired && total <= policy.budget_bytes {
            continue;
        }
        fs::remove_file(&path).map_err(|e| LiverecError::Io(e.to_string()))?;
        total = total.saturating_sub(len);
        deleted.push(path);
    }

    Ok(deleted)
}
