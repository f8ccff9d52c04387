use fs2::FileExt;
use predicates::str::contains;
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use tempfile::tempdir;

fn base_cmd(root: &Path) -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("dutycycle");
    cmd.current_dir(root)
        .env("DUTYCYCLE_HOME", root)
        .env("DUTYCYCLE_STATE_DIR", root.join("state"))
        .env_remove("DUTYCYCLE_LOGS_DIR")
        .env_remove("DUTYCYCLE_CONFIG_PATH")
        .env("DUTYCYCLE_BOOT_ID_FILE", root.join("boot_id"))
        .env("DUTYCYCLE_UPTIME_FILE", root.join("uptime"))
        .env("DUTYCYCLE_ODOMETER_FILE", root.join("no-odometer"))
        .env("DUTYCYCLE_LAUNCH_MODE", "direct")
        .env("DUTYCYCLE_WRITEBACK_ROOT", root.join("volumes"));
    cmd
}

fn hold_lock(path: &Path, payload: &str) -> fs::File {
    fs::create_dir_all(path.parent().expect("parent")).expect("mkdir locks");
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .expect("open lock");
    file.try_lock_exclusive().expect("take lock");
    writeln!(file, "{payload}").expect("write payload");
    file
}

#[test]
#[cfg(not(windows))]
fn run_skips_without_touching_state_while_lock_is_held() {
    let tmp = tempdir().expect("tempdir");
    fs::write(tmp.path().join("boot_id"), "boot-a\n").expect("boot id");
    fs::write(tmp.path().join("uptime"), "600.00 1.00\n").expect("uptime");
    let state = tmp.path().join("state");
    let _held = hold_lock(
        &state.join("locks/scheduler.lock"),
        r#"{"pid":4242,"started_at_epoch_secs":1,"build_uuid":"x","command":"run"}"#,
    );

    base_cmd(tmp.path())
        .arg("run")
        .assert()
        .success()
        .stdout(contains("skipped=true"))
        .stdout(contains("pid=4242"));

    assert!(!state.join("counter.json").exists());
    assert!(!state.join("schedule.json").exists());
}

#[test]
#[cfg(not(windows))]
fn status_reports_holder_and_leaves_counter_alone() {
    let tmp = tempdir().expect("tempdir");
    fs::write(tmp.path().join("boot_id"), "boot-a\n").expect("boot id");
    fs::write(tmp.path().join("uptime"), "600.00 1.00\n").expect("uptime");
    let state = tmp.path().join("state");
    let _held = hold_lock(&state.join("locks/scheduler.lock"), "4242");

    let output = base_cmd(tmp.path())
        .arg("status")
        .output()
        .expect("status");
    assert!(output.status.success());
    let doc: Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(doc["lock"]["pid"], 4242);
    assert_eq!(doc["counter"]["on_minutes"], 0);
    assert!(!state.join("counter.json").exists());
}

#[test]
#[cfg(not(windows))]
fn lock_is_released_after_run() {
    let tmp = tempdir().expect("tempdir");
    fs::write(tmp.path().join("boot_id"), "boot-a\n").expect("boot id");
    fs::write(tmp.path().join("uptime"), "600.00 1.00\n").expect("uptime");
    let state = tmp.path().join("state");
    fs::create_dir_all(&state).expect("mkdir state");
    fs::write(
        state.join("schedule.json"),
        r#"{"schema_version":1,"tasks":{"weekly":{"interval_minutes":10080,"target":"writeback-threshold","timeout_seconds":60}},"runs":{}}"#,
    )
    .expect("schedule");

    base_cmd(tmp.path()).arg("run").assert().success();
    base_cmd(tmp.path())
        .arg("run")
        .assert()
        .success()
        .stdout(contains("due=none"));

    let payload = fs::read_to_string(state.join("locks/scheduler.lock")).expect("payload");
    let payload: Value = serde_json::from_str(payload.trim()).expect("payload json");
    assert_eq!(payload["command"], "run");
}
