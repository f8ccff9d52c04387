use anyhow::Result;

use crate::commands::CommandReport;
use crate::dutycycle::config::load_config;
use crate::dutycycle::paths::resolve_paths;
use crate::dutycycle::scheduler;

pub fn run(task: &str) -> Result<CommandReport> {
    let mut report = CommandReport::new("exec");
    let paths = resolve_paths()?;
    let cfg = load_config(&paths)?;

    report.detail(format!("task={task}"));
    let summary = scheduler::exec_task(&paths, &cfg, task)?;
    report.detail(summary);
    Ok(report)
}
