use anyhow::Result;

use crate::commands::CommandReport;
use crate::dutycycle::config::load_config;
use crate::dutycycle::paths::resolve_paths;
use crate::dutycycle::scheduler;

pub fn run(task: &str) -> Result<CommandReport> {
    let mut report = CommandReport::new("cleanup");
    let paths = resolve_paths()?;
    let cfg = load_config(&paths)?;

    report.detail(format!("task={task}"));
    match scheduler::cleanup_task(&paths, &cfg, task) {
        Ok(()) => report.detail("cleanup=ok"),
        Err(err) => report.issue(format!("cleanup failed: {err:#}")),
    }
    Ok(report)
}
