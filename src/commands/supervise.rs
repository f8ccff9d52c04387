use anyhow::{Context, Result};
use std::env;

use crate::commands::CommandReport;
use crate::dutycycle::config::load_config;
use crate::dutycycle::paths::resolve_paths;
use crate::dutycycle::scheduler::{self, SuperviseOutcome};

pub fn run(task: &str, timeout_secs: u64) -> Result<CommandReport> {
    let mut report = CommandReport::new("supervise");
    let paths = resolve_paths()?;
    let cfg = load_config(&paths)?;
    let exe = env::current_exe().context("failed to resolve current executable")?;

    report.detail(format!("task={task}"));
    report.detail(format!("timeout_secs={timeout_secs}"));
    let outcome = scheduler::supervise(&paths, &cfg, task, timeout_secs, &exe)?;
    report.detail(format!("outcome={}", outcome.as_outcome()));
    match outcome {
        SuperviseOutcome::Succeeded => {}
        SuperviseOutcome::AlreadyRunning { holder } => {
            if let Some(holder) = holder {
                report.detail(format!("holder.pid={}", holder.pid));
            }
        }
        SuperviseOutcome::Failed { outcome } => {
            report.issue(format!("task body failed: {outcome}"));
        }
        SuperviseOutcome::TimedOut { cleanup_ok } => {
            report.detail(format!("cleanup_ok={cleanup_ok}"));
            report.issue(format!("task exceeded {timeout_secs}s and was killed"));
        }
    }
    Ok(report)
}
