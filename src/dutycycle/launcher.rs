//! Starts a task supervisor outside the scheduler's process lifetime.
//!
//! With systemd available the supervisor runs in a transient, confined unit
//! that systemd itself bounds in time; otherwise it is spawned directly into
//! its own process group at reduced CPU and IO priority. Either way the
//! scheduler never waits for the task.

use anyhow::{Context, Result};
use std::env;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::dutycycle::config::{LaunchMode, LauncherConfig};
use crate::dutycycle::paths::DutyPaths;
use crate::dutycycle::util::{now_epoch_secs, run_command_with_timeout};

const SYSTEMD_RUNTIME_DIR: &str = "/run/systemd/system";
const FORWARDED_ENV_PREFIX: &str = "DUTYCYCLE_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    Systemd { systemd_run: PathBuf },
    Direct,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Systemd { .. } => "systemd",
            Self::Direct => "direct",
        }
    }
}

/// `auto` prefers systemd only when `systemd-run` is on PATH and systemd is
/// the running init.
pub fn resolve_backend(mode: LaunchMode) -> Result<Backend> {
    match mode {
        LaunchMode::Direct => Ok(Backend::Direct),
        LaunchMode::Systemd => {
            let systemd_run =
                which::which("systemd-run").context("launch mode systemd: systemd-run not in PATH")?;
            Ok(Backend::Systemd { systemd_run })
        }
        LaunchMode::Auto => match which::which("systemd-run") {
            Ok(systemd_run) if Path::new(SYSTEMD_RUNTIME_DIR).is_dir() => {
                Ok(Backend::Systemd { systemd_run })
            }
            _ => Ok(Backend::Direct),
        },
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub task: String,
    pub timeout_secs: u64,
    /// Extra paths the confined unit may write; missing ones are tolerated.
    pub writable: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOutcome {
    pub backend: &'static str,
    pub unit: Option<String>,
    pub pid: Option<u32>,
}

impl LaunchOutcome {
    pub fn describe(&self) -> String {
        match (&self.unit, self.pid) {
            (Some(unit), _) => format!("backend={} unit={unit}", self.backend),
            (None, Some(pid)) => format!("backend={} pid={pid}", self.backend),
            (None, None) => format!("backend={}", self.backend),
        }
    }
}

/// Systemd unit names tolerate a small alphabet; everything else becomes `_`.
pub fn unit_name(task: &str, epoch: u64) -> String {
    let safe: String = task
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("dutycycle-{safe}-{epoch}")
}

pub struct Launcher<'a> {
    paths: &'a DutyPaths,
    cfg: &'a LauncherConfig,
    exe: PathBuf,
}

impl<'a> Launcher<'a> {
    pub fn new(paths: &'a DutyPaths, cfg: &'a LauncherConfig) -> Result<Self> {
        let exe = env::current_exe().context("failed to resolve own executable")?;
        Ok(Self::with_exe(paths, cfg, exe))
    }

    pub fn with_exe(paths: &'a DutyPaths, cfg: &'a LauncherConfig, exe: PathBuf) -> Self {
        Self { paths, cfg, exe }
    }

    pub fn supervise_argv(&self, req: &LaunchRequest) -> Vec<OsString> {
        vec![
            self.exe.clone().into_os_string(),
            OsString::from("supervise"),
            OsString::from(&req.task),
            OsString::from("--timeout-secs"),
            OsString::from(req.timeout_secs.to_string()),
        ]
    }

    pub fn systemd_run_args(
        &self,
        req: &LaunchRequest,
        unit: &str,
        forwarded_env: &[(String, String)],
    ) -> Vec<OsString> {
        let log = self.paths.task_log_path(&req.task);
        let mut properties = vec![
            format!(
                "RuntimeMaxSec={}s",
                req.timeout_secs.saturating_add(self.cfg.grace_secs)
            ),
            "NoNewPrivileges=yes".to_string(),
            "ProtectSystem=strict".to_string(),
            "ProtectHome=read-only".to_string(),
            "PrivateTmp=yes".to_string(),
            format!("ReadWritePaths={}", self.paths.state_dir.display()),
            format!("ReadWritePaths=-{}", self.paths.logs_dir.display()),
            format!("Nice={}", self.cfg.nice),
            format!("StandardOutput=append:{}", log.display()),
            format!("StandardError=append:{}", log.display()),
            format!(
                "ExecStopPost={} cleanup {}",
                self.exe.display(),
                req.task
            ),
        ];
        for path in &req.writable {
            properties.push(format!("ReadWritePaths=-{}", path.display()));
        }
        if self.cfg.idle_io {
            properties.push("IOSchedulingClass=idle".to_string());
        }

        let mut args: Vec<OsString> = vec![
            "--unit".into(),
            unit.into(),
            "--collect".into(),
            "--quiet".into(),
        ];
        for property in properties {
            args.push("--property".into());
            args.push(property.into());
        }
        for (key, value) in forwarded_env {
            args.push("--setenv".into());
            args.push(format!("{key}={value}").into());
        }
        args.push("--".into());
        args.extend(self.supervise_argv(req));
        args
    }

    /// Supervisor argv prefixed by whichever priority wrappers are present.
    pub fn direct_argv(
        &self,
        req: &LaunchRequest,
        nice_bin: Option<PathBuf>,
        ionice_bin: Option<PathBuf>,
    ) -> Vec<OsString> {
        let mut argv: Vec<OsString> = Vec::new();
        if self.cfg.idle_io
            && let Some(ionice) = ionice_bin
        {
            argv.extend([ionice.into_os_string(), "-c".into(), "3".into()]);
        }
        if let Some(nice) = nice_bin {
            argv.extend([
                nice.into_os_string(),
                "-n".into(),
                self.cfg.nice.to_string().into(),
            ]);
        }
        argv.extend(self.supervise_argv(req));
        argv
    }

    fn open_task_log(&self, task: &str) -> Result<File> {
        let dir = self.paths.task_log_dir();
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
        let path = self.paths.task_log_path(task);
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open task log {}", path.display()))
    }

    fn launch_systemd(&self, systemd_run: &Path, req: &LaunchRequest) -> Result<LaunchOutcome> {
        // Transient units start with a clean environment.
        let forwarded: Vec<(String, String)> = env::vars()
            .filter(|(k, _)| k.starts_with(FORWARDED_ENV_PREFIX))
            .collect();
        let unit = unit_name(&req.task, now_epoch_secs().unwrap_or(0));
        // The unit appends to the log itself; make sure the file exists.
        drop(self.open_task_log(&req.task)?);

        let mut cmd = Command::new(systemd_run);
        cmd.args(self.systemd_run_args(req, &unit, &forwarded));
        let output = run_command_with_timeout(&mut cmd).context("failed to run systemd-run")?;
        if !output.status.success() {
            anyhow::bail!(
                "systemd-run failed for {}: {}",
                req.task,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(LaunchOutcome {
            backend: "systemd",
            unit: Some(unit),
            pid: None,
        })
    }

    fn launch_direct(&self, req: &LaunchRequest) -> Result<LaunchOutcome> {
        let argv = self.direct_argv(req, which::which("nice").ok(), which::which("ionice").ok());
        let Some((program, args)) = argv.split_first() else {
            anyhow::bail!("empty supervisor command line");
        };
        let log = self.open_task_log(&req.task)?;
        let log_err = log.try_clone().context("failed to duplicate task log handle")?;

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .process_group(0)
            .spawn()
            .with_context(|| format!("failed to spawn supervisor for {}", req.task))?;
        Ok(LaunchOutcome {
            backend: "direct",
            unit: None,
            pid: Some(child.id()),
        })
    }

    /// Starts the supervisor and returns as soon as it is running.
    pub fn launch(&self, req: &LaunchRequest) -> Result<LaunchOutcome> {
        if !self.exe.exists() {
            anyhow::bail!("supervisor executable missing: {}", self.exe.display());
        }
        match resolve_backend(self.cfg.mode)? {
            Backend::Systemd { systemd_run } => self.launch_systemd(&systemd_run, req),
            Backend::Direct => self.launch_direct(req),
        }
    }
}
