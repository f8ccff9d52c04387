use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tempfile::NamedTempFile;

use crate::dutycycle::warn::{self, WarnEvent};

pub const DEFAULT_EXTERNAL_COMMAND_TIMEOUT_SECS: u64 = 120;
const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Return the current Unix epoch in seconds.
pub fn now_epoch_secs() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}

pub fn run_command_with_timeout(cmd: &mut Command) -> Result<Output> {
    run_command_with_optional_timeout(cmd, Some(DEFAULT_EXTERNAL_COMMAND_TIMEOUT_SECS))
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    let mut pipe = pipe?;
    Some(thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    }))
}

fn collect(reader: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

/// Runs `cmd` to completion with both pipes drained concurrently, so output
/// larger than the pipe buffer cannot stall the child.
pub fn run_command_with_optional_timeout(
    cmd: &mut Command,
    timeout_secs: Option<u64>,
) -> Result<Output> {
    let Some(timeout_secs) = timeout_secs else {
        return Ok(cmd.output()?);
    };
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    let mut child = cmd.spawn()?;
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());
    let started = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Output {
                status,
                stdout: collect(stdout),
                stderr: collect(stderr),
            });
        }
        if started.elapsed() >= Duration::from_secs(timeout_secs) {
            let _ = child.kill();
            let _ = child.wait();
            // Readers are left detached: a surviving grandchild may still
            // hold the pipes open.
            anyhow::bail!("command timed out after {}s", timeout_secs);
        }
        thread::sleep(CHILD_POLL_INTERVAL);
    }
}

/// Serializes `value` next to `path` and renames it into place, so readers
/// observe either the old or the new document and never a partial write.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;

    let mut temp = NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to create temp file in {}", parent.display()))?;
    serde_json::to_writer_pretty(&mut temp, value)?;
    temp.write_all(b"\n")?;
    temp.flush()?;
    temp.as_file().sync_all()?;

    temp.persist(path).map_err(|e| {
        anyhow::anyhow!("failed persisting {} atomically: {}", path.display(), e.error)
    })?;
    Ok(())
}

/// Loads a JSON document, treating absence as the default and corruption as
/// "start fresh" after preserving the unreadable bytes beside the original.
pub fn load_json_or_default<T>(path: &Path, stage: &str) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    read_json_document(path, stage, true)
}

/// Like [`load_json_or_default`] but never writes: a corrupt document reads
/// as the default and is left for the next writer to preserve.
pub fn peek_json_or_default<T>(path: &Path, stage: &str) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    read_json_document(path, stage, false)
}

fn read_json_document<T>(path: &Path, stage: &str, backup: bool) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(T::default()),
        Err(err) => {
            warn::emit(WarnEvent {
                code: "STATE_UNREADABLE",
                stage,
                action: "load-state",
                task: "na",
                source: &path.display().to_string(),
                retry: "started-fresh",
                reason: "read-failed",
                err: &format!("{err:#}"),
            });
            return Ok(T::default());
        }
    };

    match serde_json::from_str(&raw) {
        Ok(parsed) => Ok(parsed),
        Err(err) => {
            if backup {
                let timestamp = now_epoch_secs().unwrap_or(0);
                let backup_path = path.with_extension(format!("json.corrupt.{timestamp}"));
                let _ = fs::write(&backup_path, &raw);
            }

            warn::emit(WarnEvent {
                code: "STATE_CORRUPT",
                stage,
                action: "load-state",
                task: "na",
                source: &path.display().to_string(),
                retry: if backup { "started-fresh" } else { "read-as-default" },
                reason: "json-parse-failed",
                err: &format!("{err:#}"),
            });
            Ok(T::default())
        }
    }
}

/// Reads the first line of a small text file, trimmed. Missing or empty files
/// yield `None`.
pub fn read_trimmed(path: &Path) -> Option<String> {
    let raw = fs::read_to_string(path).ok()?;
    let line = raw.lines().next()?.trim();
    if line.is_empty() {
        None
    } else {
        Some(line.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    struct Doc {
        value: u64,
    }

    #[test]
    fn atomic_write_then_load() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("nested").join("doc.json");
        write_json_atomic(&path, &Doc { value: 7 }).expect("write");
        let loaded: Doc = load_json_or_default(&path, "test").expect("load");
        assert_eq!(loaded, Doc { value: 7 });
    }

    #[test]
    fn corrupt_document_is_backed_up_and_replaced_by_default() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("doc.json");
        fs::write(&path, "{not json").expect("write corrupt");

        let loaded: Doc = load_json_or_default(&path, "test").expect("load");
        assert_eq!(loaded, Doc::default());

        let backups = fs::read_dir(tmp.path())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".corrupt."))
            .count();
        assert_eq!(backups, 1);
    }

    #[test]
    fn peek_reads_corrupt_document_without_writing() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("doc.json");
        fs::write(&path, "{not json").expect("write corrupt");

        let loaded: Doc = peek_json_or_default(&path, "test").expect("peek");
        assert_eq!(loaded, Doc::default());
        let entries = fs::read_dir(tmp.path()).expect("read dir").count();
        assert_eq!(entries, 1);
        assert_eq!(fs::read_to_string(&path).expect("read"), "{not json");
    }

    #[test]
    fn read_trimmed_takes_first_line() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("boot_id");
        fs::write(&path, "  abc-123 \nignored\n").expect("write");
        assert_eq!(read_trimmed(&path).as_deref(), Some("abc-123"));
        assert!(read_trimmed(&tmp.path().join("missing")).is_none());
    }

    #[test]
    fn output_larger_than_pipe_buffer_is_collected() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg("head -c 200000 /dev/zero; head -c 100000 /dev/zero >&2");
        let started = Instant::now();
        let output = run_command_with_optional_timeout(&mut cmd, Some(10)).expect("run");
        assert!(output.status.success());
        assert_eq!(output.stdout.len(), 200_000);
        assert_eq!(output.stderr.len(), 100_000);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn timed_out_command_is_killed() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let err = run_command_with_optional_timeout(&mut cmd, Some(1)).expect_err("timeout");
        assert!(format!("{err:#}").contains("timed out"));
    }
}
