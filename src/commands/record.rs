use anyhow::Result;

use crate::commands::CommandReport;
use crate::dutycycle::config::load_config;
use crate::dutycycle::paths::resolve_paths;
use crate::dutycycle::scheduler::{self, RecordOutcome};

pub fn run(task: &str) -> Result<CommandReport> {
    let mut report = CommandReport::new("record");
    let paths = resolve_paths()?;
    let cfg = load_config(&paths)?;

    report.detail(format!("task={task}"));
    match scheduler::record_success(&paths, &cfg, task)? {
        RecordOutcome::UnknownTask(err) => {
            report.issue(format!("{} {err}", err.code().as_str()));
        }
        RecordOutcome::Recorded(record) => {
            report.detail(format!(
                "last_success_on_minutes={}",
                record.last_success_on_minutes
            ));
            if let Some(at) = record.last_success_epoch_secs {
                report.detail(format!("last_success_epoch_secs={at}"));
            }
        }
    }

    Ok(report)
}
