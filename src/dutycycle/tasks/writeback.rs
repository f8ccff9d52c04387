//! Writeback controller: keeps each managed volume's in-flight writeback
//! budget at 0 and opens a bounded flush window, either when accumulated
//! dirty data crosses a threshold or unconditionally once a day.

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::thread;
use std::time::Duration;

use super::{MaintenanceTask, TaskContext};
use crate::dutycycle::config::{DutyConfig, WritebackConfig};
use crate::dutycycle::lock::{self, LockAttempt, LockPayload};
use crate::dutycycle::schedule::{Recurrence, TaskDefinition, TimeOfDay};
use crate::dutycycle::util::run_command_with_optional_timeout;
use crate::dutycycle::warn::{self, WarnEvent};

const USAGE_COMMAND_TIMEOUT_SECS: u64 = 30;
const TIMEOUT_HEADROOM_SECS: u64 = 300;
const DEFAULT_THRESHOLD_INTERVAL_MINUTES: u64 = 15;
const DEFAULT_DAILY_WINDOW_AT: TimeOfDay = TimeOfDay {
    hour: 3,
    minute: 30,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritebackMode {
    ThresholdWatch,
    DailyWindow,
}

impl WritebackMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ThresholdWatch => "threshold-watch",
            Self::DailyWindow => "daily-window",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub name: String,
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtySource {
    Primary,
    Secondary,
    UsageReport,
    Unavailable,
}

impl DirtySource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
            Self::UsageReport => "usage-report",
            Self::Unavailable => "unavailable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirtyReading {
    pub volume: String,
    pub bytes: u64,
    pub source: DirtySource,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BudgetApply {
    pub written: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WritebackReport {
    pub mode: WritebackMode,
    pub volumes: usize,
    pub dirty_bytes: u64,
    pub readings: Vec<DirtyReading>,
    pub flushed: bool,
    pub raised: BudgetApply,
    pub restored: BudgetApply,
}

impl WritebackReport {
    pub fn summary(&self) -> String {
        let sources = self
            .readings
            .iter()
            .map(|r| format!("{}:{}", r.volume, r.source.as_str()))
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "mode={} volumes={} dirty_bytes={} sources={} flushed={} raised={} raise_failed={} restored={} restore_failed={}",
            self.mode.as_str(),
            self.volumes,
            self.dirty_bytes,
            if sources.is_empty() { "na" } else { &sources },
            self.flushed,
            self.raised.written,
            self.raised.failed,
            self.restored.written,
            self.restored.failed,
        )
    }
}

/// Parses `4096`, `12k`, `1.5G`, `300 MiB`, `7.2GiB` into bytes. Suffixes are
/// binary multiples, matching how sysfs reports human-readable sizes.
pub fn parse_size(raw: &str) -> Option<u64> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return None;
    }
    let split = compact
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(compact.len());
    let (number, unit) = compact.split_at(split);
    let value = number.parse::<f64>().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let multiplier: u64 = match unit.to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => 1 << 10,
        "m" | "mb" | "mib" => 1 << 20,
        "g" | "gb" | "gib" => 1 << 30,
        "t" | "tb" | "tib" => 1 << 40,
        _ => return None,
    };
    Some((value * multiplier as f64).round() as u64)
}

fn is_unit_token(token: &str) -> bool {
    !token.is_empty() && token.chars().all(|c| c.is_ascii_alphabetic()) && parse_size(&format!("1{token}")).is_some()
}

/// Finds the first size figure following `label` on a matching line of a
/// usage report.
pub fn parse_usage_report(report: &str, label: &str) -> Option<u64> {
    let label = label.to_ascii_lowercase();
    for line in report.lines() {
        let lower = line.to_ascii_lowercase();
        let Some(pos) = lower.find(&label) else {
            continue;
        };
        let rest = line[pos + label.len()..].trim_start_matches(|c: char| c == ':' || c.is_whitespace());
        let tokens: Vec<&str> = rest.split_whitespace().collect();
        for (i, token) in tokens.iter().enumerate() {
            let token = token.trim_end_matches(',');
            if let Some(next) = tokens.get(i + 1)
                && is_unit_token(next)
                && let Some(bytes) = parse_size(&format!("{token}{next}"))
            {
                return Some(bytes);
            }
            if let Some(bytes) = parse_size(token) {
                return Some(bytes);
            }
        }
    }
    None
}

pub fn discover_volumes(cfg: &WritebackConfig) -> Vec<Volume> {
    let entries = match fs::read_dir(&cfg.volumes_root) {
        Ok(entries) => entries,
        Err(err) => {
            warn::emit(WarnEvent {
                code: "VOLUMES_UNREADABLE",
                stage: "writeback",
                action: "discover-volumes",
                task: "na",
                source: &cfg.volumes_root.display().to_string(),
                retry: "next-run",
                reason: "read-dir-failed",
                err: &format!("{err:#}"),
            });
            return Vec::new();
        }
    };
    let mut volumes: Vec<Volume> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .map(|e| Volume {
            name: e.file_name().to_string_lossy().to_string(),
            dir: e.path(),
        })
        .collect();
    volumes.sort_by(|a, b| a.name.cmp(&b.name));
    volumes
}

fn read_counter_file(volume: &Volume, rel: &str) -> Option<u64> {
    if rel.trim().is_empty() {
        return None;
    }
    let raw = fs::read_to_string(volume.dir.join(rel)).ok()?;
    parse_size(raw.trim()).filter(|bytes| *bytes > 0)
}

fn read_usage_report(cfg: &WritebackConfig, volume: &Volume) -> Option<u64> {
    let (program, args) = cfg.usage_command.split_first()?;
    let mut cmd = Command::new(program.replace("{volume}", &volume.name));
    cmd.args(args.iter().map(|a| a.replace("{volume}", &volume.name)));
    let output = run_command_with_optional_timeout(&mut cmd, Some(USAGE_COMMAND_TIMEOUT_SECS)).ok()?;
    if !output.status.success() {
        return None;
    }
    parse_usage_report(&String::from_utf8_lossy(&output.stdout), &cfg.usage_label)
        .filter(|bytes| *bytes > 0)
}

/// First non-zero, parseable figure wins; nothing usable reads as zero.
pub fn measure_dirty(cfg: &WritebackConfig, volume: &Volume) -> DirtyReading {
    let (bytes, source) = if let Some(bytes) = read_counter_file(volume, &cfg.dirty_primary_file) {
        (bytes, DirtySource::Primary)
    } else if let Some(bytes) = read_counter_file(volume, &cfg.dirty_secondary_file) {
        (bytes, DirtySource::Secondary)
    } else if let Some(bytes) = read_usage_report(cfg, volume) {
        (bytes, DirtySource::UsageReport)
    } else {
        (0, DirtySource::Unavailable)
    };
    DirtyReading {
        volume: volume.name.clone(),
        bytes,
        source,
    }
}

fn write_budget(cfg: &WritebackConfig, volume: &Volume, bytes: u64) -> Result<()> {
    let path = volume.dir.join(&cfg.budget_file);
    fs::write(&path, format!("{bytes}\n"))
        .with_context(|| format!("failed to write budget {}", path.display()))
}

/// Writes `bytes` to every volume's budget tunable; one failing volume does
/// not stop the others.
pub fn apply_budget(cfg: &WritebackConfig, volumes: &[Volume], bytes: u64) -> BudgetApply {
    let mut out = BudgetApply::default();
    for volume in volumes {
        match write_budget(cfg, volume, bytes) {
            Ok(()) => out.written += 1,
            Err(err) => {
                out.failed += 1;
                warn::emit(WarnEvent {
                    code: "BUDGET_WRITE_FAILED",
                    stage: "writeback",
                    action: "write-budget",
                    task: "na",
                    source: &volume.dir.display().to_string(),
                    retry: "next-run",
                    reason: "tunable-write-failed",
                    err: &format!("{err:#}"),
                });
            }
        }
    }
    out
}

/// Restores budgets to zero when dropped, so an unwinding flush window never
/// leaves them elevated.
struct BudgetRestore<'a> {
    cfg: &'a WritebackConfig,
    volumes: &'a [Volume],
    done: Option<BudgetApply>,
}

impl BudgetRestore<'_> {
    fn finish(mut self) -> BudgetApply {
        let applied = apply_budget(self.cfg, self.volumes, 0);
        self.done = Some(applied.clone());
        applied
    }
}

impl Drop for BudgetRestore<'_> {
    fn drop(&mut self) {
        if self.done.is_none() {
            apply_budget(self.cfg, self.volumes, 0);
        }
    }
}

pub struct WritebackController<'a> {
    cfg: &'a WritebackConfig,
}

impl<'a> WritebackController<'a> {
    pub fn new(cfg: &'a WritebackConfig) -> Self {
        Self { cfg }
    }

    pub fn run(&self, mode: WritebackMode) -> WritebackReport {
        self.run_with_hold(mode, thread::sleep)
    }

    pub fn run_with_hold<H>(&self, mode: WritebackMode, hold: H) -> WritebackReport
    where
        H: FnOnce(Duration),
    {
        let volumes = discover_volumes(self.cfg);
        let readings: Vec<DirtyReading> = match mode {
            WritebackMode::ThresholdWatch => volumes
                .iter()
                .map(|v| measure_dirty(self.cfg, v))
                .collect(),
            WritebackMode::DailyWindow => Vec::new(),
        };
        let dirty_bytes = readings
            .iter()
            .fold(0u64, |acc, r| acc.saturating_add(r.bytes));

        let open_window = match mode {
            WritebackMode::ThresholdWatch => dirty_bytes >= self.cfg.threshold_bytes,
            WritebackMode::DailyWindow => true,
        };

        if !open_window {
            let restored = apply_budget(self.cfg, &volumes, 0);
            return WritebackReport {
                mode,
                volumes: volumes.len(),
                dirty_bytes,
                readings,
                flushed: false,
                raised: BudgetApply::default(),
                restored,
            };
        }

        let guard = BudgetRestore {
            cfg: self.cfg,
            volumes: &volumes,
            done: None,
        };
        let raised = apply_budget(self.cfg, &volumes, self.cfg.flush_bytes);
        if raised.written > 0 {
            hold(Duration::from_secs(self.cfg.window_secs));
        }
        let restored = guard.finish();

        WritebackReport {
            mode,
            volumes: volumes.len(),
            dirty_bytes,
            readings,
            flushed: raised.written > 0,
            raised,
            restored,
        }
    }

    pub fn restore(&self) -> BudgetApply {
        apply_budget(self.cfg, &discover_volumes(self.cfg), 0)
    }
}

fn holder_label(holder: &Option<LockPayload>) -> String {
    match holder {
        Some(holder) => format!("pid={} command={}", holder.pid, holder.command),
        None => "pid=unknown".to_string(),
    }
}

fn execute_mode(ctx: &TaskContext<'_>, mode: WritebackMode) -> Result<String> {
    execute_mode_with_hold(ctx, mode, thread::sleep)
}

/// Both modes share one window lock: whichever run holds it owns the budget
/// until it restores it, and a concurrent pass of either mode skips.
fn execute_mode_with_hold<H>(ctx: &TaskContext<'_>, mode: WritebackMode, hold: H) -> Result<String>
where
    H: FnOnce(Duration),
{
    let cfg = &ctx.cfg.writeback;
    ctx.log(&format!(
        "mode={} root={} threshold_bytes={} flush_bytes={} window_secs={}",
        mode.as_str(),
        cfg.volumes_root.display(),
        cfg.threshold_bytes,
        cfg.flush_bytes,
        cfg.window_secs
    ));
    let lock_path = ctx.paths.writeback_lock_path();
    let _window = match lock::try_acquire(&lock_path, &format!("exec {}", ctx.task_name))? {
        LockAttempt::Acquired(guard) => guard,
        LockAttempt::Held { holder, .. } => {
            let summary = format!(
                "mode={} skipped=window-owned-by {}",
                mode.as_str(),
                holder_label(&holder)
            );
            ctx.log(&summary);
            return Ok(summary);
        }
    };
    let report = WritebackController::new(cfg).run_with_hold(mode, hold);
    let summary = report.summary();
    ctx.log(&summary);
    if report.volumes > 0 && report.raised.failed == report.volumes {
        anyhow::bail!("no volume accepted the flush budget: {summary}");
    }
    Ok(summary)
}

/// Restores budgets after a killed run. A window still owned by a live run
/// is left to that run.
fn cleanup_budgets(ctx: &TaskContext<'_>) -> Result<()> {
    let lock_path = ctx.paths.writeback_lock_path();
    let _window = match lock::try_acquire(&lock_path, &format!("cleanup {}", ctx.task_name))? {
        LockAttempt::Acquired(guard) => guard,
        LockAttempt::Held { holder, .. } => {
            ctx.log(&format!(
                "cleanup skipped: window owned by {}",
                holder_label(&holder)
            ));
            return Ok(());
        }
    };
    let restored = WritebackController::new(&ctx.cfg.writeback).restore();
    ctx.log(&format!(
        "cleanup restored={} restore_failed={}",
        restored.written, restored.failed
    ));
    if restored.failed > 0 {
        anyhow::bail!("{} volume budget(s) could not be restored", restored.failed);
    }
    Ok(())
}

fn writeback_timeout(cfg: &DutyConfig) -> u64 {
    cfg.writeback.window_secs.saturating_add(TIMEOUT_HEADROOM_SECS)
}

pub struct WritebackThresholdTask;

impl MaintenanceTask for WritebackThresholdTask {
    fn target(&self) -> &'static str {
        "writeback-threshold"
    }

    fn description(&self) -> &'static str {
        "Open a flush window when summed dirty bytes reach the threshold"
    }

    fn default_definition(&self, cfg: &DutyConfig) -> TaskDefinition {
        TaskDefinition {
            enabled: true,
            recurrence: Recurrence::Interval {
                minutes: DEFAULT_THRESHOLD_INTERVAL_MINUTES,
            },
            target: self.target().to_string(),
            timeout_seconds: writeback_timeout(cfg),
            description: Some(self.description().to_string()),
        }
    }

    fn execute(&self, ctx: &TaskContext<'_>) -> Result<String> {
        execute_mode(ctx, WritebackMode::ThresholdWatch)
    }

    fn cleanup(&self, ctx: &TaskContext<'_>) -> Result<()> {
        cleanup_budgets(ctx)
    }
}

pub struct WritebackDailyTask;

impl MaintenanceTask for WritebackDailyTask {
    fn target(&self) -> &'static str {
        "writeback-daily"
    }

    fn description(&self) -> &'static str {
        "Open a flush window once a day regardless of dirty bytes"
    }

    fn default_definition(&self, cfg: &DutyConfig) -> TaskDefinition {
        TaskDefinition {
            enabled: true,
            recurrence: Recurrence::Calendar {
                at: DEFAULT_DAILY_WINDOW_AT,
            },
            target: self.target().to_string(),
            timeout_seconds: writeback_timeout(cfg),
            description: Some(self.description().to_string()),
        }
    }

    fn execute(&self, ctx: &TaskContext<'_>) -> Result<String> {
        execute_mode(ctx, WritebackMode::DailyWindow)
    }

    fn cleanup(&self, ctx: &TaskContext<'_>) -> Result<()> {
        cleanup_budgets(ctx)
    }
}
