//! Single-instance guards backed by OS advisory file locks.
//!
//! The scheduler lock is only ever taken non-blocking: a held lock means a
//! previous invocation is still dispatching and this cycle is skipped.

use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::dutycycle::util::now_epoch_secs;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockPayload {
    pub pid: u32,
    #[serde(default)]
    pub started_at_epoch_secs: u64,
    #[serde(default)]
    pub build_uuid: String,
    #[serde(default)]
    pub command: String,
}

#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[derive(Debug)]
pub enum LockAttempt {
    Acquired(InstanceLock),
    Held {
        path: PathBuf,
        holder: Option<LockPayload>,
    },
}

pub fn parse_lock_payload(raw: &str) -> Option<LockPayload> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(payload) = serde_json::from_str::<LockPayload>(trimmed) {
        return Some(payload);
    }

    // Bare PID lines are accepted for hand-made lock files.
    let pid = trimmed.lines().next()?.trim().parse::<u32>().ok()?;
    Some(LockPayload {
        pid,
        started_at_epoch_secs: 0,
        build_uuid: String::new(),
        command: String::new(),
    })
}

pub fn read_lock_payload(path: &Path) -> Result<Option<LockPayload>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read lock {}", path.display()))?;
    Ok(parse_lock_payload(&raw))
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("failed to open lock {}", path.display()))
}

fn write_payload(file: &mut File, path: &Path, command: &str) -> Result<()> {
    let payload = LockPayload {
        pid: std::process::id(),
        started_at_epoch_secs: now_epoch_secs().unwrap_or(0),
        build_uuid: env!("BUILD_UUID").to_string(),
        command: command.to_string(),
    };
    file.set_len(0)
        .with_context(|| format!("failed to truncate lock {}", path.display()))?;
    writeln!(file, "{}", serde_json::to_string(&payload)?)
        .with_context(|| format!("failed to write lock {}", path.display()))?;
    Ok(())
}

pub fn try_acquire(path: &Path, command: &str) -> Result<LockAttempt> {
    let mut file = open_lock_file(path)?;
    match file.try_lock_exclusive() {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::WouldBlock => {
            return Ok(LockAttempt::Held {
                path: path.to_path_buf(),
                holder: read_lock_payload(path).ok().flatten(),
            });
        }
        Err(err) => {
            return Err(err).with_context(|| format!("failed to lock {}", path.display()));
        }
    }

    write_payload(&mut file, path, command)?;
    Ok(LockAttempt::Acquired(InstanceLock {
        file,
        path: path.to_path_buf(),
    }))
}

/// Waits for the lock. Used only for short record updates issued by task
/// supervisors, never by the scheduler cycle itself.
pub fn acquire_blocking(path: &Path, command: &str) -> Result<InstanceLock> {
    let mut file = open_lock_file(path)?;
    file.lock_exclusive()
        .with_context(|| format!("failed to lock {}", path.display()))?;
    write_payload(&mut file, path, command)?;
    Ok(InstanceLock {
        file,
        path: path.to_path_buf(),
    })
}

/// Returns the holder when the lock is currently held by another process.
pub fn probe(path: &Path) -> Result<Option<LockPayload>> {
    if !path.exists() {
        return Ok(None);
    }
    let file = open_lock_file(path)?;
    match FileExt::try_lock_shared(&file) {
        Ok(()) => {
            let _ = FileExt::unlock(&file);
            Ok(None)
        }
        Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(Some(
            read_lock_payload(path)?.unwrap_or(LockPayload {
                pid: 0,
                started_at_epoch_secs: 0,
                build_uuid: String::new(),
                command: String::new(),
            }),
        )),
        Err(err) => Err(err).with_context(|| format!("failed to probe lock {}", path.display())),
    }
}
