use anyhow::Result;

use crate::commands::CommandReport;
use crate::dutycycle::config::{load_config, resolve_config_path};
use crate::dutycycle::launcher::resolve_backend;
use crate::dutycycle::paths::resolve_paths;

pub fn run() -> Result<CommandReport> {
    let mut report = CommandReport::new("config");
    let paths = resolve_paths()?;
    let cfg = load_config(&paths)?;

    report.detail(
        "resolution.order=defaults -> dutycycle.toml overrides -> environment overrides"
            .to_string(),
    );
    let config_path = resolve_config_path(&paths);
    if config_path.exists() {
        report.detail(format!("resolution.config_toml={}", config_path.display()));
    } else {
        report.detail(format!(
            "resolution.config_toml=missing ({})",
            config_path.display()
        ));
    }

    report.detail(format!(
        "paths.state_dir={} ({})",
        paths.state_dir.display(),
        if paths.state_dir_is_explicit {
            "DUTYCYCLE_STATE_DIR"
        } else {
            "default"
        }
    ));
    report.detail(format!("paths.logs_dir={}", paths.logs_dir.display()));
    report.detail(format!("paths.counter_file={}", paths.counter_file.display()));
    report.detail(format!("paths.schedule_file={}", paths.schedule_file.display()));

    report.detail(format!(
        "clock.boot_id_file={}",
        cfg.clock.boot_id_file.display()
    ));
    report.detail(format!("clock.uptime_file={}", cfg.clock.uptime_file.display()));
    match &cfg.odometer.hours_file {
        Some(path) => report.detail(format!("odometer.hours_file={}", path.display())),
        None => report.detail(format!(
            "odometer.device={} via {}",
            cfg.odometer.device, cfg.odometer.smartctl_bin
        )),
    }

    report.detail(format!("launcher.mode={}", cfg.launcher.mode.as_str()));
    match resolve_backend(cfg.launcher.mode) {
        Ok(backend) => report.detail(format!("launcher.backend={}", backend.as_str())),
        Err(err) => report.issue(format!("launcher.backend unavailable: {err:#}")),
    }
    report.detail(format!("launcher.nice={}", cfg.launcher.nice));
    report.detail(format!("launcher.idle_io={}", cfg.launcher.idle_io));
    report.detail(format!("launcher.grace_secs={}", cfg.launcher.grace_secs));

    report.detail(format!(
        "writeback.volumes_root={}",
        cfg.writeback.volumes_root.display()
    ));
    report.detail(format!(
        "writeback.threshold_bytes={}",
        cfg.writeback.threshold_bytes
    ));
    report.detail(format!("writeback.flush_bytes={}", cfg.writeback.flush_bytes));
    report.detail(format!("writeback.window_secs={}", cfg.writeback.window_secs));

    report.detail(format!(
        "retention.profile={}",
        cfg.retention.profile.display()
    ));
    report.detail(format!("retention.repo={}", cfg.retention.repo.display()));
    report.detail(format!("retention.apply={}", cfg.retention.apply));
    report.detail(format!(
        "retention.state_file={}",
        cfg.retention.state_file_path(&paths).display()
    ));

    Ok(report)
}
