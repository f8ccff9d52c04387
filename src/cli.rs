use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use crate::commands;
use crate::env_loader;

#[derive(Debug, Parser)]
#[command(name = "dutycycle")]
#[command(about = "Uptime-anchored maintenance scheduler")]
pub struct Cli {
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Advance the activity counter and dispatch every due task.
    Run,
    /// Print counter, schedule, due tasks and lock holder as JSON.
    Status,
    /// Dispatch a task now, ignoring whether it is due.
    Force(TaskArgs),
    /// Mark a task successful at the current counter value.
    Record(TaskArgs),
    /// Show the resolved configuration.
    Config,
    #[command(hide = true)]
    Supervise(SuperviseArgs),
    #[command(hide = true)]
    Exec(TaskArgs),
    #[command(hide = true)]
    Cleanup(TaskArgs),
}

#[derive(Debug, Args)]
pub struct TaskArgs {
    pub task: String,
}

#[derive(Debug, Args)]
pub struct SuperviseArgs {
    pub task: String,
    #[arg(long)]
    pub timeout_secs: u64,
}

fn print_report(report: &commands::CommandReport, as_json: bool) -> Result<()> {
    if as_json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("command: {}", report.command);
    println!("ok: {}", report.ok);
    if !report.details.is_empty() {
        println!("details:");
        for detail in &report.details {
            println!("- {detail}");
        }
    }
    if !report.issues.is_empty() {
        println!("issues:");
        for issue in &report.issues {
            println!("- {issue}");
        }
    }
    Ok(())
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let _ = env_loader::load_dotenv();

    let report = match &cli.command {
        Command::Run => commands::run::run()?,
        Command::Status => {
            println!("{}", serde_json::to_string_pretty(&commands::status::run())?);
            return Ok(());
        }
        Command::Force(args) => commands::force::run(&args.task)?,
        Command::Record(args) => commands::record::run(&args.task)?,
        Command::Config => commands::config::run()?,
        Command::Supervise(args) => commands::supervise::run(&args.task, args.timeout_secs)?,
        Command::Exec(args) => commands::exec::run(&args.task)?,
        Command::Cleanup(args) => commands::cleanup::run(&args.task)?,
    };

    print_report(&report, cli.json)?;

    if report.ok {
        Ok(())
    } else {
        std::process::exit(2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supervise_requires_timeout() {
        assert!(Cli::try_parse_from(["dutycycle", "supervise", "writeback-daily"]).is_err());
        let cli = Cli::try_parse_from([
            "dutycycle",
            "supervise",
            "writeback-daily",
            "--timeout-secs",
            "90",
        ])
        .expect("parse");
        match cli.command {
            Command::Supervise(args) => {
                assert_eq!(args.task, "writeback-daily");
                assert_eq!(args.timeout_secs, 90);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn json_flag_is_global() {
        let cli = Cli::try_parse_from(["dutycycle", "record", "x", "--json"]).expect("parse");
        assert!(cli.json);
    }
}
