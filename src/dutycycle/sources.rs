//! Readers for the machine-level signals the activity counter is anchored
//! to: the boot token, the monotonic uptime clock and the device odometer.

use anyhow::{Context, Result};
use serde_json::Value;
use std::path::Path;
use std::process::Command;

use crate::dutycycle::config::{ClockConfig, OdometerConfig};
use crate::dutycycle::util::{read_trimmed, run_command_with_optional_timeout};
use crate::dutycycle::warn::{self, WarnEvent};

/// One observation of the machine clocks, taken at the start of an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockSample {
    pub boot_id: Option<String>,
    pub monotonic_secs: Option<u64>,
    pub device_hours: Option<u64>,
}

pub fn read_boot_id(path: &Path) -> Option<String> {
    read_trimmed(path)
}

/// First field of a `/proc/uptime`-style file, truncated to whole seconds.
pub fn read_monotonic_secs(path: &Path) -> Option<u64> {
    let line = read_trimmed(path)?;
    parse_uptime_secs(&line)
}

fn parse_uptime_secs(line: &str) -> Option<u64> {
    let first = line.split_whitespace().next()?;
    let secs = first.parse::<f64>().ok()?;
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Some(secs.trunc() as u64)
}

fn read_hours_file(path: &Path) -> Result<u64> {
    let line = read_trimmed(path)
        .with_context(|| format!("odometer file {} is missing or empty", path.display()))?;
    line.parse::<u64>()
        .with_context(|| format!("odometer file {} is not an integer", path.display()))
}

fn parse_smartctl_hours(raw: &str) -> Option<u64> {
    let parsed: Value = serde_json::from_str(raw).ok()?;
    parsed
        .get("power_on_time")
        .and_then(|t| t.get("hours"))
        .and_then(Value::as_u64)
}

fn read_smartctl_hours(cfg: &OdometerConfig) -> Result<u64> {
    let mut cmd = Command::new(&cfg.smartctl_bin);
    cmd.arg("-j").arg("-A").arg(&cfg.device);
    let output = run_command_with_optional_timeout(&mut cmd, Some(cfg.timeout_secs))
        .with_context(|| format!("failed to run {} for {}", cfg.smartctl_bin, cfg.device))?;
    // smartctl sets informational bits in its exit status; judge by the payload.
    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_smartctl_hours(&stdout)
        .with_context(|| format!("no power_on_time.hours in smartctl output for {}", cfg.device))
}

/// Best-effort odometer reading in whole power-on hours.
pub fn read_device_hours(cfg: &OdometerConfig) -> Option<u64> {
    let (result, source) = match &cfg.hours_file {
        Some(path) => (read_hours_file(path), path.display().to_string()),
        None if cfg.device.trim().is_empty() => return None,
        None => (read_smartctl_hours(cfg), cfg.device.clone()),
    };
    match result {
        Ok(hours) => Some(hours),
        Err(err) => {
            warn::emit(WarnEvent {
                code: "ODOMETER_UNREADABLE",
                stage: "counter",
                action: "read-odometer",
                task: "na",
                source: &source,
                retry: "reuse-last-known",
                reason: "odometer-read-failed",
                err: &format!("{err:#}"),
            });
            None
        }
    }
}

pub fn sample(clock: &ClockConfig, odometer: &OdometerConfig) -> ClockSample {
    let boot_id = read_boot_id(&clock.boot_id_file);
    if boot_id.is_none() {
        warn::emit(WarnEvent {
            code: "BOOT_ID_UNREADABLE",
            stage: "counter",
            action: "read-boot-id",
            task: "na",
            source: &clock.boot_id_file.display().to_string(),
            retry: "assume-same-boot",
            reason: "boot-id-missing",
            err: "na",
        });
    }
    let monotonic_secs = read_monotonic_secs(&clock.uptime_file);
    if monotonic_secs.is_none() {
        warn::emit(WarnEvent {
            code: "UPTIME_UNREADABLE",
            stage: "counter",
            action: "read-uptime",
            task: "na",
            source: &clock.uptime_file.display().to_string(),
            retry: "zero-delta",
            reason: "uptime-missing",
            err: "na",
        });
    }
    ClockSample {
        boot_id,
        monotonic_secs,
        device_hours: read_device_hours(odometer),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn uptime_is_truncated_to_seconds() {
        assert_eq!(parse_uptime_secs("12345.67 54321.00"), Some(12345));
        assert_eq!(parse_uptime_secs("garbage"), None);
        assert_eq!(parse_uptime_secs("-3.0 1.0"), None);
    }

    #[test]
    fn smartctl_json_hours_are_extracted() {
        let raw = r#"{"device":{"name":"/dev/nvme0"},"power_on_time":{"hours":18234}}"#;
        assert_eq!(parse_smartctl_hours(raw), Some(18234));
        assert_eq!(parse_smartctl_hours(r#"{"smartctl":{}}"#), None);
    }

    #[test]
    fn hours_file_takes_precedence() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("hours");
        fs::write(&path, "421\n").expect("write");
        let cfg = OdometerConfig {
            hours_file: Some(path),
            device: "/dev/definitely-missing".to_string(),
            ..OdometerConfig::default()
        };
        assert_eq!(read_device_hours(&cfg), Some(421));
    }

    #[test]
    fn unreadable_hours_file_degrades_to_none() {
        let tmp = tempdir().expect("tempdir");
        let cfg = OdometerConfig {
            hours_file: Some(tmp.path().join("missing")),
            ..OdometerConfig::default()
        };
        assert_eq!(read_device_hours(&cfg), None);
    }
}
