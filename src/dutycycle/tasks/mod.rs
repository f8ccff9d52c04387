//! Registry of maintenance task bodies. A schedule entry's `target` names one
//! of these; the supervisor runs it in a child process via `exec`.

pub mod nixprofile;
pub mod retention;
pub mod writeback;

use anyhow::Result;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::dutycycle::config::DutyConfig;
use crate::dutycycle::paths::DutyPaths;
use crate::dutycycle::schedule::TaskDefinition;
use crate::error::DutycycleError;

pub struct TaskContext<'a> {
    pub task_name: &'a str,
    pub paths: &'a DutyPaths,
    pub cfg: &'a DutyConfig,
}

impl TaskContext<'_> {
    /// Task output goes to stdout, which the launcher appends to the task log.
    pub fn log(&self, line: &str) {
        println!("{}: {line}", self.task_name);
    }
}

pub trait MaintenanceTask: Sync {
    fn target(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// The entry written into a freshly materialized schedule.
    fn default_definition(&self, cfg: &DutyConfig) -> TaskDefinition;

    /// Paths outside the state directory the task needs write access to when
    /// it runs confined.
    fn writable_paths(&self, _cfg: &DutyConfig) -> Vec<PathBuf> {
        Vec::new()
    }

    /// Runs the task body to completion and returns a one-line summary.
    fn execute(&self, ctx: &TaskContext<'_>) -> Result<String>;

    /// Best-effort undo of any elevated state after a forced termination.
    fn cleanup(&self, _ctx: &TaskContext<'_>) -> Result<()> {
        Ok(())
    }
}

static REGISTRY: [&dyn MaintenanceTask; 3] = [
    &writeback::WritebackThresholdTask,
    &writeback::WritebackDailyTask,
    &retention::GenerationRetentionTask,
];

pub fn registry() -> &'static [&'static dyn MaintenanceTask] {
    &REGISTRY
}

pub fn lookup(target: &str) -> Result<&'static dyn MaintenanceTask, DutycycleError> {
    registry()
        .iter()
        .copied()
        .find(|task| task.target() == target)
        .ok_or_else(|| DutycycleError::UnknownTarget(target.to_string()))
}

pub fn default_definitions(cfg: &DutyConfig) -> BTreeMap<String, TaskDefinition> {
    registry()
        .iter()
        .map(|task| (task.target().to_string(), task.default_definition(cfg)))
        .collect()
}
