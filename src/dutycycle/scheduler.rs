//! Scheduler entry points. Every state mutation happens under the scheduler
//! lock: `run` only ever tries it, operator commands and supervisors wait
//! for it briefly.

use anyhow::{Context, Result};
use chrono::{Local, Timelike};
use serde::Serialize;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::dutycycle::audit;
use crate::dutycycle::config::DutyConfig;
use crate::dutycycle::counter::{ActivityCounter, CounterAdvance, CounterStore};
use crate::dutycycle::due::{self, DueInputs};
use crate::dutycycle::launcher::{LaunchOutcome, LaunchRequest, Launcher};
use crate::dutycycle::lock::{self, LockAttempt, LockPayload};
use crate::dutycycle::paths::DutyPaths;
use crate::dutycycle::schedule::{RunRecord, ScheduleDocument, ScheduleStore, TaskDefinition};
use crate::dutycycle::tasks::{self, MaintenanceTask, TaskContext};
use crate::dutycycle::util::{now_epoch_secs, run_command_with_optional_timeout};
use crate::dutycycle::warn::{self, WarnEvent};
use crate::error::DutycycleError;

const SUPERVISOR_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// The wall-clock half of the due inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WallClock {
    pub epoch_secs: u64,
    pub minute_of_day: u16,
}

impl WallClock {
    pub fn now() -> Self {
        let now = Local::now();
        Self {
            epoch_secs: now.timestamp().max(0) as u64,
            minute_of_day: (now.hour() * 60 + now.minute()) as u16,
        }
    }
}

/// Seam between dispatch bookkeeping and actually starting a supervisor.
pub trait Dispatch {
    fn dispatch(&self, req: &LaunchRequest) -> Result<LaunchOutcome>;
}

impl Dispatch for Launcher<'_> {
    fn dispatch(&self, req: &LaunchRequest) -> Result<LaunchOutcome> {
        self.launch(req)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    pub task: String,
    pub result: Result<LaunchOutcome, String>,
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub counter: CounterAdvance,
    pub schedule_created: bool,
    pub due: Vec<String>,
    pub dispatched: Vec<Dispatched>,
}

#[derive(Debug, Clone)]
pub enum CycleOutcome {
    Skipped { holder: Option<LockPayload> },
    Completed(CycleReport),
}

fn holder_label(holder: &Option<LockPayload>) -> String {
    match holder {
        Some(p) => format!("pid={} command={}", p.pid, p.command),
        None => "pid=unknown".to_string(),
    }
}

fn default_schedule(cfg: &DutyConfig) -> ScheduleDocument {
    ScheduleDocument::with_tasks(tasks::default_definitions(cfg))
}

fn record_dispatch_failure(
    paths: &DutyPaths,
    store: &ScheduleStore,
    name: &str,
    outcome: &str,
    code: &str,
    err: &str,
    now: u64,
) {
    warn::emit(WarnEvent {
        code,
        stage: "dispatch",
        action: "launch",
        task: name,
        source: "scheduler",
        retry: "next-due-evaluation",
        reason: outcome,
        err,
    });
    audit::record(paths, "dispatch", "failed", &format!("task={name} outcome={outcome} error={err}"));
    let _ = audit::append_task_log(paths, name, &format!("dispatch failed outcome={outcome} error={err}"));
    if let Err(store_err) = store.mark_outcome(name, outcome, now) {
        warn::emit(WarnEvent {
            code: "RECORD_FAILED",
            stage: "dispatch",
            action: "mark-outcome",
            task: name,
            source: &store.path().display().to_string(),
            retry: "next-run",
            reason: "schedule-write-failed",
            err: &format!("{store_err:#}"),
        });
    }
}

/// Attempt bookkeeping followed by the launch. Failures are recorded against
/// the task and never abort the caller.
#[allow(clippy::too_many_arguments)]
fn dispatch_task(
    paths: &DutyPaths,
    cfg: &DutyConfig,
    store: &ScheduleStore,
    name: &str,
    def: &TaskDefinition,
    on_minutes: u64,
    now: u64,
    dispatcher: &dyn Dispatch,
) -> Dispatched {
    if let Err(err) = store.mark_attempt(name, on_minutes, now) {
        let err = format!("{err:#}");
        record_dispatch_failure(paths, store, name, "attempt-unrecorded", "RECORD_FAILED", &err, now);
        return Dispatched {
            task: name.to_string(),
            result: Err(err),
        };
    }
    audit::record(
        paths,
        "dispatch",
        "attempt",
        &format!("task={name} target={} on_minutes={on_minutes}", def.target),
    );

    let body = match tasks::lookup(&def.target) {
        Ok(body) => body,
        Err(err) => {
            let err = err.to_string();
            record_dispatch_failure(paths, store, name, "unknown-target", "TARGET_MISSING", &err, now);
            return Dispatched {
                task: name.to_string(),
                result: Err(err),
            };
        }
    };

    let req = LaunchRequest {
        task: name.to_string(),
        timeout_secs: def.timeout_seconds,
        writable: body.writable_paths(cfg),
    };
    match dispatcher.dispatch(&req) {
        Ok(outcome) => {
            audit::record(
                paths,
                "dispatch",
                "launched",
                &format!("task={name} {}", outcome.describe()),
            );
            Dispatched {
                task: name.to_string(),
                result: Ok(outcome),
            }
        }
        Err(err) => {
            let err = format!("{err:#}");
            record_dispatch_failure(paths, store, name, "launch-failed", "LAUNCH_FAILED", &err, now);
            Dispatched {
                task: name.to_string(),
                result: Err(err),
            }
        }
    }
}

/// One scheduler pass: update the counter, evaluate the schedule and start
/// every due task. A held lock skips the pass without touching state.
pub fn run_cycle(
    paths: &DutyPaths,
    cfg: &DutyConfig,
    clock: WallClock,
    dispatcher: &dyn Dispatch,
) -> Result<CycleOutcome> {
    paths.ensure_dirs()?;
    let _guard = match lock::try_acquire(&paths.scheduler_lock_path(), "run")? {
        LockAttempt::Acquired(guard) => guard,
        LockAttempt::Held { holder, .. } => {
            audit::record(
                paths,
                "scheduler",
                "skipped",
                &format!("scheduler lock held {}", holder_label(&holder)),
            );
            return Ok(CycleOutcome::Skipped { holder });
        }
    };

    let counter = CounterStore::new(paths).update(cfg)?;
    let store = ScheduleStore::new(paths);
    let (doc, schedule_created) = store.ensure_default(|| tasks::default_definitions(cfg))?;
    if schedule_created {
        audit::record(
            paths,
            "schedule",
            "created",
            &format!("materialized {} default task(s)", doc.tasks.len()),
        );
    }

    let inputs = DueInputs {
        on_minutes: counter.counter.on_minutes,
        now_epoch_secs: clock.epoch_secs,
        now_minute_of_day: clock.minute_of_day,
    };
    let due = due::due_tasks(&doc, &inputs);
    let mut dispatched = Vec::with_capacity(due.len());
    for name in &due {
        let Ok(def) = doc.task(name) else {
            continue;
        };
        dispatched.push(dispatch_task(
            paths,
            cfg,
            &store,
            name,
            def,
            inputs.on_minutes,
            clock.epoch_secs,
            dispatcher,
        ));
    }

    audit::record(
        paths,
        "scheduler",
        "completed",
        &format!(
            "on_minutes={} delta={} reboot={} due={} dispatched_ok={}",
            counter.counter.on_minutes,
            counter.delta_minutes,
            counter.reboot_detected,
            due.len(),
            dispatched.iter().filter(|d| d.result.is_ok()).count()
        ),
    );
    Ok(CycleOutcome::Completed(CycleReport {
        counter,
        schedule_created,
        due,
        dispatched,
    }))
}

/// Resolves a task without writing anything, so unknown names leave state
/// untouched.
fn lookup_definition(
    store: &ScheduleStore,
    cfg: &DutyConfig,
    name: &str,
) -> Result<Result<TaskDefinition, DutycycleError>> {
    let doc = store.peek()?.unwrap_or_else(|| default_schedule(cfg));
    Ok(doc.task(name).cloned())
}

#[derive(Debug, Clone)]
pub enum ForceOutcome {
    UnknownTask(DutycycleError),
    Dispatched { was_disabled: bool, dispatched: Dispatched },
}

/// Operator override: bypasses the due check, still records the attempt.
pub fn force_task(
    paths: &DutyPaths,
    cfg: &DutyConfig,
    name: &str,
    clock: WallClock,
    dispatcher: &dyn Dispatch,
) -> Result<ForceOutcome> {
    paths.ensure_dirs()?;
    let _guard = lock::acquire_blocking(&paths.scheduler_lock_path(), "force")?;
    let store = ScheduleStore::new(paths);
    let def = match lookup_definition(&store, cfg, name)? {
        Ok(def) => def,
        Err(err) => return Ok(ForceOutcome::UnknownTask(err)),
    };

    store.ensure_default(|| tasks::default_definitions(cfg))?;
    let counter = CounterStore::new(paths).update(cfg)?;
    let was_disabled = !def.enabled;
    if was_disabled {
        warn::emit(WarnEvent {
            code: "FORCE_DISABLED_TASK",
            stage: "force",
            action: "dispatch",
            task: name,
            source: "operator",
            retry: "na",
            reason: "task-disabled",
            err: "executing anyway",
        });
    }
    audit::record(
        paths,
        "force",
        "requested",
        &format!("task={name} disabled={was_disabled}"),
    );
    let dispatched = dispatch_task(
        paths,
        cfg,
        &store,
        name,
        &def,
        counter.counter.on_minutes,
        clock.epoch_secs,
        dispatcher,
    );
    Ok(ForceOutcome::Dispatched {
        was_disabled,
        dispatched,
    })
}

#[derive(Debug, Clone)]
pub enum RecordOutcome {
    UnknownTask(DutycycleError),
    Recorded(RunRecord),
}

/// Marks a task successful at the current counter value without running it.
pub fn record_success(paths: &DutyPaths, cfg: &DutyConfig, name: &str) -> Result<RecordOutcome> {
    paths.ensure_dirs()?;
    let _guard = lock::acquire_blocking(&paths.scheduler_lock_path(), "record")?;
    let store = ScheduleStore::new(paths);
    if let Err(err) = lookup_definition(&store, cfg, name)? {
        return Ok(RecordOutcome::UnknownTask(err));
    }
    store.ensure_default(|| tasks::default_definitions(cfg))?;
    let counter = CounterStore::new(paths).load()?;
    let record = store.mark_success(name, counter.on_minutes, now_epoch_secs()?)?;
    audit::record(
        paths,
        "record",
        "success",
        &format!("task={name} on_minutes={}", counter.on_minutes),
    );
    Ok(RecordOutcome::Recorded(record))
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub counter: ActivityCounter,
    pub schedule: ScheduleDocument,
    pub due: Vec<String>,
    pub lock: Option<LockPayload>,
    #[serde(skip)]
    pub counter_refreshed: bool,
}

/// Best-effort view of the scheduler. The counter is refreshed only when the
/// scheduler lock is free; the schedule is never materialized here.
pub fn status(paths: &DutyPaths, cfg: &DutyConfig, clock: WallClock) -> Result<StatusSnapshot> {
    let counter_store = CounterStore::new(paths);
    let holder = lock::probe(&paths.scheduler_lock_path()).unwrap_or(None);

    let mut counter_refreshed = false;
    let counter = match holder {
        Some(_) => counter_store.peek()?,
        None => match paths
            .ensure_dirs()
            .and_then(|_| lock::try_acquire(&paths.scheduler_lock_path(), "status"))
        {
            Ok(LockAttempt::Acquired(_guard)) => match counter_store.update(cfg) {
                Ok(advance) => {
                    counter_refreshed = true;
                    advance.counter
                }
                Err(err) => {
                    warn::emit(WarnEvent {
                        code: "COUNTER_REFRESH_FAILED",
                        stage: "status",
                        action: "update-counter",
                        task: "na",
                        source: &counter_store.path().display().to_string(),
                        retry: "next-run",
                        reason: "counter-write-failed",
                        err: &format!("{err:#}"),
                    });
                    counter_store.load()?
                }
            },
            _ => counter_store.peek()?,
        },
    };

    let schedule = ScheduleStore::new(paths)
        .peek()?
        .unwrap_or_else(|| default_schedule(cfg));
    let due = due::due_tasks(
        &schedule,
        &DueInputs {
            on_minutes: counter.on_minutes,
            now_epoch_secs: clock.epoch_secs,
            now_minute_of_day: clock.minute_of_day,
        },
    );
    Ok(StatusSnapshot {
        counter,
        schedule,
        due,
        lock: holder,
        counter_refreshed,
    })
}

fn resolve_body(
    paths: &DutyPaths,
    name: &str,
) -> Result<&'static dyn MaintenanceTask> {
    let doc = ScheduleStore::new(paths).load_or_empty()?;
    let def = doc.task(name)?;
    Ok(tasks::lookup(&def.target)?)
}

/// Runs the task body in this process.
pub fn exec_task(paths: &DutyPaths, cfg: &DutyConfig, name: &str) -> Result<String> {
    let body = resolve_body(paths, name)?;
    body.execute(&TaskContext {
        task_name: name,
        paths,
        cfg,
    })
}

pub fn cleanup_task(paths: &DutyPaths, cfg: &DutyConfig, name: &str) -> Result<()> {
    let body = resolve_body(paths, name)?;
    body.cleanup(&TaskContext {
        task_name: name,
        paths,
        cfg,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuperviseOutcome {
    AlreadyRunning { holder: Option<LockPayload> },
    Succeeded,
    Failed { outcome: String },
    TimedOut { cleanup_ok: bool },
}

impl SuperviseOutcome {
    pub fn as_outcome(&self) -> &str {
        match self {
            Self::AlreadyRunning { .. } => "already-running",
            Self::Succeeded => "success",
            Self::Failed { outcome } => outcome,
            Self::TimedOut { .. } => "timeout",
        }
    }
}

fn exit_outcome(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit={code}"),
        None => "killed-by-signal".to_string(),
    }
}

fn kill_process_group(pid: u32) {
    let mut cmd = Command::new("kill");
    cmd.arg("-KILL").arg("--").arg(format!("-{pid}"));
    let _ = run_command_with_optional_timeout(&mut cmd, Some(2));
}

enum ChildEnd {
    Exited(ExitStatus),
    TimedOut,
}

fn wait_with_deadline(child: &mut std::process::Child, timeout_secs: u64) -> Result<ChildEnd> {
    let started = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(ChildEnd::Exited(status));
        }
        if started.elapsed() >= Duration::from_secs(timeout_secs) {
            kill_process_group(child.id());
            let _ = child.kill();
            let _ = child.wait();
            return Ok(ChildEnd::TimedOut);
        }
        thread::sleep(SUPERVISOR_POLL_INTERVAL);
    }
}

fn record_supervised_result(paths: &DutyPaths, name: &str, outcome: &SuperviseOutcome) -> Result<()> {
    let _guard = lock::acquire_blocking(&paths.scheduler_lock_path(), &format!("supervise {name}"))?;
    let store = ScheduleStore::new(paths);
    let now = now_epoch_secs()?;
    match outcome {
        SuperviseOutcome::Succeeded => {
            let counter = CounterStore::new(paths).load()?;
            store.mark_success(name, counter.on_minutes, now)?;
        }
        other => {
            store.mark_outcome(name, other.as_outcome(), now)?;
        }
    }
    Ok(())
}

/// Owns one execution of a task: single-flight per task, runs the body as a
/// child `exec` process, enforces the timeout, and records the result.
pub fn supervise(
    paths: &DutyPaths,
    cfg: &DutyConfig,
    name: &str,
    timeout_secs: u64,
    exe: &Path,
) -> Result<SuperviseOutcome> {
    paths.ensure_dirs()?;
    let _task_guard = match lock::try_acquire(&paths.task_lock_path(name), &format!("supervise {name}"))? {
        LockAttempt::Acquired(guard) => guard,
        LockAttempt::Held { holder, .. } => {
            let _ = audit::append_task_log(
                paths,
                name,
                &format!("already running ({}); skipping", holder_label(&holder)),
            );
            audit::record(paths, "supervise", "skipped", &format!("task={name} already running"));
            return Ok(SuperviseOutcome::AlreadyRunning { holder });
        }
    };

    let _ = audit::append_task_log(paths, name, &format!("start timeout_secs={timeout_secs}"));
    let started = Instant::now();
    let mut child = Command::new(exe)
        .arg("exec")
        .arg(name)
        .stdin(Stdio::null())
        .process_group(0)
        .spawn()
        .with_context(|| format!("failed to spawn task body for {name}"))?;

    let outcome = match wait_with_deadline(&mut child, timeout_secs)? {
        ChildEnd::Exited(status) if status.success() => SuperviseOutcome::Succeeded,
        ChildEnd::Exited(status) => SuperviseOutcome::Failed {
            outcome: exit_outcome(status),
        },
        ChildEnd::TimedOut => {
            let cleanup_ok = match cleanup_task(paths, cfg, name) {
                Ok(()) => true,
                Err(err) => {
                    warn::emit(WarnEvent {
                        code: "CLEANUP_FAILED",
                        stage: "supervise",
                        action: "cleanup",
                        task: name,
                        source: "supervisor",
                        retry: "next-run",
                        reason: "cleanup-hook-failed",
                        err: &format!("{err:#}"),
                    });
                    false
                }
            };
            SuperviseOutcome::TimedOut { cleanup_ok }
        }
    };

    record_supervised_result(paths, name, &outcome)?;
    let elapsed = started.elapsed().as_secs();
    let _ = audit::append_task_log(
        paths,
        name,
        &format!("end outcome={} elapsed_secs={elapsed}", outcome.as_outcome()),
    );
    audit::record(
        paths,
        "supervise",
        if outcome == SuperviseOutcome::Succeeded { "success" } else { "failed" },
        &format!("task={name} outcome={} elapsed_secs={elapsed}", outcome.as_outcome()),
    );
    Ok(outcome)
}
