use anyhow::Result;

use crate::commands::CommandReport;
use crate::dutycycle::config::load_config;
use crate::dutycycle::launcher::Launcher;
use crate::dutycycle::paths::resolve_paths;
use crate::dutycycle::scheduler::{self, ForceOutcome, WallClock};

pub fn run(task: &str) -> Result<CommandReport> {
    let mut report = CommandReport::new("force");
    let paths = resolve_paths()?;
    let cfg = load_config(&paths)?;
    let launcher = Launcher::new(&paths, &cfg.launcher)?;

    report.detail(format!("task={task}"));
    match scheduler::force_task(&paths, &cfg, task, WallClock::now(), &launcher)? {
        ForceOutcome::UnknownTask(err) => {
            report.issue(format!("{} {err}", err.code().as_str()));
        }
        ForceOutcome::Dispatched {
            was_disabled,
            dispatched,
        } => {
            if was_disabled {
                report.detail("warning=task is disabled; executing anyway");
            }
            match dispatched.result {
                Ok(outcome) => report.detail(format!("dispatched {}", outcome.describe())),
                Err(err) => report.issue(format!("dispatch failed: {err}")),
            }
        }
    }

    Ok(report)
}
