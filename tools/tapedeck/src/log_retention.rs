use crate::errors::TapeError;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Delete the oldest logs next to `active` until their total size fits
/// `budget_bytes`. Only files sharing the active log's stem prefix and
/// extension (`run*.jsonl` for `run.jsonl`) are counted or deleted, and the
/// active log itself is never deleted.
pub fn enforce_total_budget(active: &Path, budget_bytes: u64) -> Result<Vec<PathBuf>, TapeError> {
    let dir = match active.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(dir) => dir,
        None => Path::new("."),
    };
    let mut files: Vec<(PathBuf, u64, Option<SystemTime>)> = fs::read_dir(dir)
        .map_err(|e| TapeError::Io(e.to_string()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| is_log_sibling(active, &entry.path()))
        .filter_map(|entry| {
            let meta = entry.metadata().ok()?;
            meta.is_file()
                .then(|| (entry.path(), meta.len(), meta.modified().ok()))
        })
        .collect();

    let mut total: u64 = files.iter().map(|(_, len, _)| len).sum();
    if total <= budget_bytes {
        return Ok(Vec::new());
    }
    files.sort_by(|a, b| a.2.cmp(&b.2));

    let mut deleted = Vec::new();
    for (path, len, _) in files {
        if total <= budget_bytes {
            break;
        }
        if path.file_name() == active.file_name() {
            continue;
        }
        fs::remove_file(&path).map_err(|e| TapeError::Io(e.to_string()))?;
        total = total.saturating_sub(len);
        deleted.push(path);
    }
    Ok(deleted)
}

fn is_log_sibling(active: &Path, candidate: &Path) -> bool {
    let (Some(stem), Some(candidate_stem)) = (
        active.file_stem().and_then(OsStr::to_str),
        candidate.file_stem().and_then(OsStr::to_str),
    ) else {
        return false;
    };
    candidate.extension() == active.extension() && candidate_stem.starts_with(stem)
}
