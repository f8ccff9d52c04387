use predicates::str::contains;
use serde_json::{Value, json};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::{TempDir, tempdir};

struct Fixture {
    tmp: TempDir,
    state: PathBuf,
    volume: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let tmp = tempdir().expect("tempdir");
        let state = tmp.path().join("state");
        let volume = tmp.path().join("volumes/vol-a");
        fs::create_dir_all(volume.join("options")).expect("mkdir options");
        fs::create_dir_all(volume.join("internal")).expect("mkdir internal");
        fs::write(volume.join("options/writeback_budget"), "0\n").expect("budget");
        fs::write(volume.join("internal/dirty_bytes"), "0\n").expect("dirty");
        fs::write(tmp.path().join("boot_id"), "boot-a\n").expect("boot id");
        fs::write(tmp.path().join("uptime"), "600.00 1.00\n").expect("uptime");

        fs::create_dir_all(&state).expect("mkdir state");
        let schedule = json!({
            "schema_version": 1,
            "tasks": {
                "wb-daily": {
                    "calendar_time_of_day": "03:30",
                    "target": "writeback-daily",
                    "timeout_seconds": 60
                },
                "wb-threshold": {
                    "interval_minutes": 15,
                    "target": "writeback-threshold",
                    "timeout_seconds": 60
                },
                "ghost": {
                    "interval_minutes": 15,
                    "target": "no-such-body",
                    "timeout_seconds": 60
                }
            },
            "runs": {}
        });
        fs::write(
            state.join("schedule.json"),
            serde_json::to_string_pretty(&schedule).expect("encode"),
        )
        .expect("schedule");

        Self { tmp, state, volume }
    }

    fn cmd(&self, window_secs: u64) -> assert_cmd::Command {
        let root = self.tmp.path();
        let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("dutycycle");
        cmd.current_dir(root)
            .env("DUTYCYCLE_HOME", root)
            .env("DUTYCYCLE_STATE_DIR", &self.state)
            .env_remove("DUTYCYCLE_LOGS_DIR")
            .env_remove("DUTYCYCLE_CONFIG_PATH")
            .env("DUTYCYCLE_BOOT_ID_FILE", root.join("boot_id"))
            .env("DUTYCYCLE_UPTIME_FILE", root.join("uptime"))
            .env("DUTYCYCLE_ODOMETER_FILE", root.join("no-odometer"))
            .env("DUTYCYCLE_LAUNCH_MODE", "direct")
            .env("DUTYCYCLE_WRITEBACK_ROOT", root.join("volumes"))
            .env("DUTYCYCLE_WRITEBACK_THRESHOLD_BYTES", "1048576")
            .env("DUTYCYCLE_WRITEBACK_FLUSH_BYTES", "65536")
            .env("DUTYCYCLE_WRITEBACK_WINDOW_SECS", window_secs.to_string());
        cmd
    }

    fn budget(&self) -> String {
        fs::read_to_string(self.volume.join("options/writeback_budget"))
            .expect("budget")
            .trim()
            .to_string()
    }

    fn run_record(&self, task: &str) -> Value {
        let raw = fs::read_to_string(self.state.join("schedule.json")).expect("schedule");
        let doc: Value = serde_json::from_str(&raw).expect("json");
        doc["runs"][task].clone()
    }

    fn task_log(&self, task: &str) -> String {
        fs::read_to_string(log_path(&self.state, task)).unwrap_or_default()
    }
}

fn log_path(state: &Path, task: &str) -> PathBuf {
    state.join("logs/tasks").join(format!("{task}.log"))
}

#[test]
fn exec_daily_window_raises_then_restores_budget() {
    let fx = Fixture::new();

    fx.cmd(1)
        .args(["exec", "wb-daily"])
        .assert()
        .success()
        .stdout(contains("mode=daily-window"))
        .stdout(contains("raised=1"))
        .stdout(contains("restored=1"));

    assert_eq!(fx.budget(), "0");
}

#[test]
fn exec_threshold_below_limit_leaves_budget_alone() {
    let fx = Fixture::new();
    fs::write(fx.volume.join("internal/dirty_bytes"), "4096\n").expect("dirty");

    fx.cmd(1)
        .args(["exec", "wb-threshold"])
        .assert()
        .success()
        .stdout(contains("flushed=false"));

    assert_eq!(fx.budget(), "0");
}

#[test]
fn exec_threshold_reached_flushes() {
    let fx = Fixture::new();
    fs::write(fx.volume.join("internal/dirty_bytes"), "2M\n").expect("dirty");

    fx.cmd(1)
        .args(["exec", "wb-threshold"])
        .assert()
        .success()
        .stdout(contains("dirty_bytes=2097152"))
        .stdout(contains("flushed=true"));

    assert_eq!(fx.budget(), "0");
}

#[test]
fn exec_unknown_target_fails() {
    let fx = Fixture::new();

    fx.cmd(1)
        .args(["exec", "ghost"])
        .assert()
        .code(1)
        .stderr(contains("no task body registered"));
}

#[test]
#[cfg(not(windows))]
fn supervise_records_success() {
    let fx = Fixture::new();

    fx.cmd(1)
        .args(["supervise", "wb-daily", "--timeout-secs", "30"])
        .assert()
        .success()
        .stdout(contains("outcome=success"));

    let record = fx.run_record("wb-daily");
    assert_eq!(record["last_outcome"], "success");
    assert_eq!(record["last_success_on_minutes"], 0);
    let log = fx.task_log("wb-daily");
    assert!(log.contains("start timeout_secs=30"), "log: {log}");
    assert!(log.contains("end outcome=success"), "log: {log}");
}

#[test]
#[cfg(not(windows))]
fn supervise_timeout_kills_body_and_restores_budget() {
    let fx = Fixture::new();

    fx.cmd(30)
        .args(["supervise", "wb-daily", "--timeout-secs", "1"])
        .assert()
        .code(2)
        .stdout(contains("outcome=timeout"))
        .stdout(contains("cleanup_ok=true"));

    assert_eq!(fx.budget(), "0");
    let record = fx.run_record("wb-daily");
    assert_eq!(record["last_outcome"], "timeout");
    assert!(record["last_success_epoch_secs"].is_null());
    assert!(fx.task_log("wb-daily").contains("end outcome=timeout"));
}

#[test]
#[cfg(not(windows))]
fn supervise_records_failing_body_exit_code() {
    let fx = Fixture::new();

    fx.cmd(1)
        .args(["supervise", "ghost", "--timeout-secs", "30"])
        .assert()
        .code(2)
        .stdout(contains("outcome=exit=1"));

    assert_eq!(fx.run_record("ghost")["last_outcome"], "exit=1");
}

#[test]
#[cfg(not(windows))]
fn supervise_skips_when_task_already_running() {
    use fs2::FileExt;

    let fx = Fixture::new();
    let lock_path = fx.state.join("locks/task-wb-daily.lock");
    fs::create_dir_all(lock_path.parent().expect("parent")).expect("mkdir");
    fs::write(&lock_path, "4242\n").expect("payload");
    let held = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&lock_path)
        .expect("open");
    held.try_lock_exclusive().expect("lock");

    fx.cmd(1)
        .args(["supervise", "wb-daily", "--timeout-secs", "30"])
        .assert()
        .success()
        .stdout(contains("outcome=already-running"))
        .stdout(contains("holder.pid=4242"));

    assert!(fx.run_record("wb-daily").is_null());
}

#[test]
fn cleanup_restores_budget_after_crash() {
    let fx = Fixture::new();
    fs::write(fx.volume.join("options/writeback_budget"), "65536\n").expect("elevated");

    fx.cmd(1)
        .args(["cleanup", "wb-daily"])
        .assert()
        .success()
        .stdout(contains("cleanup=ok"));

    assert_eq!(fx.budget(), "0");
}
