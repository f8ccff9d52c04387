use anyhow::{Context, Result};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_STATE_DIR: &str = "/var/lib/dutycycle";

#[derive(Debug, Clone)]
pub struct DutyPaths {
    pub state_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub lock_dir: PathBuf,
    pub counter_file: PathBuf,
    pub schedule_file: PathBuf,
    pub state_dir_is_explicit: bool,
}

impl DutyPaths {
    pub fn from_state_dir(state_dir: PathBuf, logs_dir: Option<PathBuf>) -> Self {
        let logs_dir = logs_dir.unwrap_or_else(|| state_dir.join("logs"));
        Self {
            lock_dir: state_dir.join("locks"),
            counter_file: state_dir.join("counter.json"),
            schedule_file: state_dir.join("schedule.json"),
            logs_dir,
            state_dir,
            state_dir_is_explicit: false,
        }
    }

    pub fn task_log_dir(&self) -> PathBuf {
        self.logs_dir.join("tasks")
    }

    pub fn task_log_path(&self, task: &str) -> PathBuf {
        self.task_log_dir().join(format!("{task}.log"))
    }

    pub fn scheduler_lock_path(&self) -> PathBuf {
        self.lock_dir.join("scheduler.lock")
    }

    /// Shared by every writeback mode; its holder owns the volume budgets.
    pub fn writeback_lock_path(&self) -> PathBuf {
        self.lock_dir.join("writeback.lock")
    }

    pub fn task_lock_path(&self, task: &str) -> PathBuf {
        self.lock_dir.join(format!("task-{task}.lock"))
    }

    /// Creates every directory the scheduler writes into. Failure here is the
    /// one hard precondition of `run`.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            &self.state_dir,
            &self.logs_dir,
            &self.lock_dir,
            &self.task_log_dir(),
        ] {
            create_dir(dir)?;
        }
        Ok(())
    }
}

fn create_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))
}

fn env_path(var: &str) -> Option<PathBuf> {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => Some(PathBuf::from(v.trim())),
        _ => None,
    }
}

fn state_dir_from_inputs(state_dir_env: Option<PathBuf>) -> (PathBuf, bool) {
    match state_dir_env {
        Some(dir) => (dir, true),
        None => (PathBuf::from(DEFAULT_STATE_DIR), false),
    }
}

pub fn resolve_paths() -> Result<DutyPaths> {
    let (state_dir, is_explicit) = state_dir_from_inputs(env_path("DUTYCYCLE_STATE_DIR"));
    let mut paths = DutyPaths::from_state_dir(state_dir, env_path("DUTYCYCLE_LOGS_DIR"));
    paths.state_dir_is_explicit = is_explicit;
    Ok(paths)
}
