use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

use crate::dutycycle::paths::DutyPaths;

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    pub boot_id_file: PathBuf,
    pub uptime_file: PathBuf,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            boot_id_file: PathBuf::from("/proc/sys/kernel/random/boot_id"),
            uptime_file: PathBuf::from("/proc/uptime"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OdometerConfig {
    /// Plain-text file holding power-on hours. Takes precedence over smartctl.
    pub hours_file: Option<PathBuf>,
    pub device: String,
    pub smartctl_bin: String,
    pub timeout_secs: u64,
}

impl Default for OdometerConfig {
    fn default() -> Self {
        Self {
            hours_file: None,
            device: "/dev/nvme0".to_string(),
            smartctl_bin: "smartctl".to_string(),
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    #[default]
    Auto,
    Systemd,
    Direct,
}

impl LaunchMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "systemd" => Some(Self::Systemd),
            "direct" => Some(Self::Direct),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Systemd => "systemd",
            Self::Direct => "direct",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    pub mode: LaunchMode,
    pub nice: i32,
    pub idle_io: bool,
    /// Extra seconds the confinement unit is allowed beyond the task timeout,
    /// so the supervisor's own timeout and cleanup fire first.
    pub grace_secs: u64,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            mode: LaunchMode::Auto,
            nice: 10,
            idle_io: true,
            grace_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WritebackConfig {
    /// Each subdirectory is one managed volume.
    pub volumes_root: PathBuf,
    pub budget_file: String,
    pub dirty_primary_file: String,
    pub dirty_secondary_file: String,
    /// Optional argv; `{volume}` is replaced by the volume directory name.
    pub usage_command: Vec<String>,
    pub usage_label: String,
    pub threshold_bytes: u64,
    pub flush_bytes: u64,
    pub window_secs: u64,
}

impl Default for WritebackConfig {
    fn default() -> Self {
        Self {
            volumes_root: PathBuf::from("/sys/fs/bcachefs"),
            budget_file: "options/writeback_budget".to_string(),
            dirty_primary_file: "internal/dirty_bytes".to_string(),
            dirty_secondary_file: "dirty_data".to_string(),
            usage_command: Vec::new(),
            usage_label: "dirty".to_string(),
            threshold_bytes: 4 * GIB,
            flush_bytes: 64 * MIB,
            window_secs: 900,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub profile: PathBuf,
    pub repo: PathBuf,
    pub current_system_link: PathBuf,
    pub apply: bool,
    pub sigma_hours: u64,
    /// Defaults to `<state_dir>/retention.json` when unset.
    pub state_file: Option<PathBuf>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            profile: PathBuf::from("/nix/var/nix/profiles/system"),
            repo: PathBuf::from("/etc/nixos"),
            current_system_link: PathBuf::from("/run/current-system"),
            apply: false,
            sigma_hours: 12,
            state_file: None,
        }
    }
}

impl RetentionConfig {
    pub fn state_file_path(&self, paths: &DutyPaths) -> PathBuf {
        self.state_file
            .clone()
            .unwrap_or_else(|| paths.state_dir.join("retention.json"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DutyConfig {
    pub clock: ClockConfig,
    pub odometer: OdometerConfig,
    pub launcher: LauncherConfig,
    pub writeback: WritebackConfig,
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct PartialDutyConfig {
    clock: Option<ClockConfig>,
    odometer: Option<OdometerConfig>,
    launcher: Option<LauncherConfig>,
    writeback: Option<WritebackConfig>,
    retention: Option<RetentionConfig>,
}

fn env_path(var: &str) -> Option<PathBuf> {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => Some(PathBuf::from(v.trim())),
        _ => None,
    }
}

fn env_or_u64(var: &str, fallback: u64) -> u64 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<u64>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_bool(var: &str, fallback: bool) -> bool {
    match env::var(var) {
        Ok(v) => match v.trim() {
            "1" | "true" | "TRUE" | "yes" | "on" => true,
            "0" | "false" | "FALSE" | "no" | "off" => false,
            _ => fallback,
        },
        Err(_) => fallback,
    }
}

fn env_or_string(var: &str, fallback: &str) -> String {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => fallback.to_string(),
    }
}

fn validate(cfg: &DutyConfig) -> Result<()> {
    if cfg.writeback.flush_bytes == 0 {
        return Err(anyhow!("invalid writeback flush_bytes: must be >= 1"));
    }
    if cfg.writeback.window_secs == 0 {
        return Err(anyhow!("invalid writeback window_secs: must be >= 1"));
    }
    if cfg.writeback.budget_file.trim().is_empty() {
        return Err(anyhow!("invalid writeback budget_file: cannot be empty"));
    }
    if cfg.retention.sigma_hours == 0 {
        return Err(anyhow!("invalid retention sigma_hours: must be >= 1"));
    }
    if !(-20..=19).contains(&cfg.launcher.nice) {
        return Err(anyhow!("invalid launcher nice: require -20 <= nice <= 19"));
    }
    Ok(())
}

pub fn resolve_config_path(paths: &DutyPaths) -> PathBuf {
    env_path("DUTYCYCLE_CONFIG_PATH").unwrap_or_else(|| paths.state_dir.join("dutycycle.toml"))
}

fn merge_file_config(base: &mut DutyConfig, paths: &DutyPaths) -> Result<()> {
    let path = resolve_config_path(paths);
    if !path.exists() {
        return Ok(());
    }

    let raw = fs::read_to_string(&path)?;
    let parsed: PartialDutyConfig = toml::from_str(&raw)
        .map_err(|err| anyhow!("failed to parse dutycycle config {}: {err}", path.display()))?;
    if let Some(clock) = parsed.clock {
        base.clock = clock;
    }
    if let Some(odometer) = parsed.odometer {
        base.odometer = odometer;
    }
    if let Some(launcher) = parsed.launcher {
        base.launcher = launcher;
    }
    if let Some(writeback) = parsed.writeback {
        base.writeback = writeback;
    }
    if let Some(retention) = parsed.retention {
        base.retention = retention;
    }
    Ok(())
}

fn apply_env_overrides(cfg: &mut DutyConfig) -> Result<()> {
    if let Some(path) = env_path("DUTYCYCLE_BOOT_ID_FILE") {
        cfg.clock.boot_id_file = path;
    }
    if let Some(path) = env_path("DUTYCYCLE_UPTIME_FILE") {
        cfg.clock.uptime_file = path;
    }
    if let Some(path) = env_path("DUTYCYCLE_ODOMETER_FILE") {
        cfg.odometer.hours_file = Some(path);
    }
    cfg.odometer.device = env_or_string("DUTYCYCLE_ODOMETER_DEVICE", &cfg.odometer.device);

    if let Ok(raw) = env::var("DUTYCYCLE_LAUNCH_MODE")
        && !raw.trim().is_empty()
    {
        cfg.launcher.mode = LaunchMode::parse(&raw).ok_or_else(|| {
            anyhow!("invalid DUTYCYCLE_LAUNCH_MODE `{raw}`: use `auto`, `systemd`, or `direct`")
        })?;
    }

    if let Some(path) = env_path("DUTYCYCLE_WRITEBACK_ROOT") {
        cfg.writeback.volumes_root = path;
    }
    cfg.writeback.threshold_bytes = env_or_u64(
        "DUTYCYCLE_WRITEBACK_THRESHOLD_BYTES",
        cfg.writeback.threshold_bytes,
    );
    cfg.writeback.flush_bytes =
        env_or_u64("DUTYCYCLE_WRITEBACK_FLUSH_BYTES", cfg.writeback.flush_bytes);
    cfg.writeback.window_secs =
        env_or_u64("DUTYCYCLE_WRITEBACK_WINDOW_SECS", cfg.writeback.window_secs);

    cfg.retention.apply = env_or_bool("DUTYCYCLE_RETENTION_APPLY", cfg.retention.apply);
    Ok(())
}

pub fn load_config(paths: &DutyPaths) -> Result<DutyConfig> {
    let mut cfg = DutyConfig::default();
    merge_file_config(&mut cfg, paths)?;
    apply_env_overrides(&mut cfg)?;
    validate(&cfg)?;
    Ok(cfg)
}
