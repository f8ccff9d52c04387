use crate::dutycycle::paths::DutyPaths;
use crate::dutycycle::util::now_epoch_secs;
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::Path;

const MAX_AUDIT_LOG_SIZE: u64 = 10 * 1024 * 1024; // 10MB

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub at_epoch_secs: u64,
    pub phase: String,
    pub status: String,
    pub message: String,
}

pub fn append_event(paths: &DutyPaths, phase: &str, status: &str, message: &str) -> Result<()> {
    fs::create_dir_all(&paths.logs_dir)
        .with_context(|| format!("failed to create {}", paths.logs_dir.display()))?;
    let event = AuditEvent {
        at_epoch_secs: now_epoch_secs()?,
        phase: phase.to_string(),
        status: status.to_string(),
        message: message.to_string(),
    };

    let line = format!("{}\n", serde_json::to_string(&event)?);
    let path = paths.logs_dir.join("audit.log");
    let _ = maybe_rotate_log(&path);

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(line.as_bytes())?;
    Ok(())
}

/// Audit logging never fails the caller.
pub fn record(paths: &DutyPaths, phase: &str, status: &str, message: &str) {
    let _ = append_event(paths, phase, status, message);
}

/// Appends one line to the named per-task log stream.
pub fn append_task_log(paths: &DutyPaths, task: &str, line: &str) -> Result<()> {
    let dir = paths.task_log_dir();
    fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let path = paths.task_log_path(task);
    let _ = maybe_rotate_log(&path);
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open task log {}", path.display()))?;
    let at = now_epoch_secs().unwrap_or(0);
    writeln!(file, "[{at}] {line}")?;
    Ok(())
}

fn maybe_rotate_log(path: &Path) -> Result<()> {
    if let Ok(meta) = fs::metadata(path)
        && meta.len() >= MAX_AUDIT_LOG_SIZE
    {
        let backup = format!("{}.1", path.display());
        let _ = fs::rename(path, backup);
    }
    Ok(())
}
