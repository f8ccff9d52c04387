use anyhow::Result;

use crate::commands::CommandReport;
use crate::dutycycle::config::load_config;
use crate::dutycycle::launcher::Launcher;
use crate::dutycycle::paths::resolve_paths;
use crate::dutycycle::scheduler::{self, CycleOutcome, WallClock};

pub fn run() -> Result<CommandReport> {
    let mut report = CommandReport::new("run");
    let paths = resolve_paths()?;
    let cfg = load_config(&paths)?;
    let launcher = Launcher::new(&paths, &cfg.launcher)?;

    match scheduler::run_cycle(&paths, &cfg, WallClock::now(), &launcher)? {
        CycleOutcome::Skipped { holder } => {
            report.detail("skipped=true");
            match holder {
                Some(holder) => report.detail(format!(
                    "lock.holder=pid={} command={}",
                    holder.pid, holder.command
                )),
                None => report.detail("lock.holder=unknown"),
            }
        }
        CycleOutcome::Completed(cycle) => {
            let counter = &cycle.counter;
            report.detail(format!("on_minutes={}", counter.counter.on_minutes));
            report.detail(format!("delta_minutes={}", counter.delta_minutes));
            report.detail(format!("reboot_detected={}", counter.reboot_detected));
            if counter.clamped {
                report.detail("delta.clamped=true");
            }
            report.detail(format!("odometer={}", counter.odometer.as_str()));
            if cycle.schedule_created {
                report.detail(format!("schedule.created={}", paths.schedule_file.display()));
            }
            if cycle.due.is_empty() {
                report.detail("due=none");
            } else {
                report.detail(format!("due={}", cycle.due.join(",")));
            }
            // Launch failures are recorded per task; the pass itself succeeded.
            for dispatched in &cycle.dispatched {
                match &dispatched.result {
                    Ok(outcome) => report.detail(format!(
                        "dispatched task={} {}",
                        dispatched.task,
                        outcome.describe()
                    )),
                    Err(err) => report.detail(format!(
                        "dispatch_failed task={} error={err}",
                        dispatched.task
                    )),
                }
            }
        }
    }

    Ok(report)
}
