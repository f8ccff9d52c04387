//! Thin wrappers over `nix-env`, `nix-store` and `git` used by generation
//! retention. Every probe is bounded by the external command timeout.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::dutycycle::util::{run_command_with_optional_timeout, run_command_with_timeout};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generation {
    pub id: u64,
    pub at: DateTime<Utc>,
}

/// Parses `nix-env --list-generations` output (`  123   2025-08-12 12:34:56`),
/// oldest first. Timestamps are taken as UTC.
pub fn parse_generation_list(raw: &str) -> Vec<Generation> {
    let mut gens: Vec<Generation> = raw
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let id = fields.next()?.parse::<u64>().ok()?;
            let date = fields.next()?;
            let time = fields.next()?;
            let at = NaiveDateTime::parse_from_str(&format!("{date} {time}"), "%Y-%m-%d %H:%M:%S")
                .ok()?
                .and_utc();
            Some(Generation { id, at })
        })
        .collect();
    gens.sort_by_key(|g| (g.at, g.id));
    gens
}

pub fn list_generations(profile: &Path) -> Result<Vec<Generation>> {
    let mut cmd = Command::new("nix-env");
    cmd.arg("-p").arg(profile).arg("--list-generations");
    let output = run_command_with_timeout(&mut cmd).context("failed to run nix-env")?;
    if !output.status.success() {
        anyhow::bail!(
            "nix-env --list-generations failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(parse_generation_list(&String::from_utf8_lossy(&output.stdout)))
}

pub fn generation_link(profile: &Path, id: u64) -> PathBuf {
    PathBuf::from(format!("{}-{id}-link", profile.display()))
}

/// `.../system-42-link` → `42`.
pub fn parse_generation_link_name(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix("-link")?;
    let (_, id) = stem.rsplit_once('-')?;
    id.parse::<u64>().ok()
}

/// Identifies the booted generation: either the link points straight at a
/// `<profile>-N-link`, or its resolved store path matches one generation's.
pub fn booted_generation(profile: &Path, current_link: &Path, gens: &[Generation]) -> Option<u64> {
    if let Ok(target) = fs::read_link(current_link)
        && let Some(id) = parse_generation_link_name(&target)
    {
        return Some(id);
    }
    let resolved = fs::canonicalize(current_link).ok()?;
    gens.iter()
        .rev()
        .find(|g| fs::canonicalize(generation_link(profile, g.id)).ok().as_ref() == Some(&resolved))
        .map(|g| g.id)
}

/// Store paths in a generation's closure; empty when it cannot be queried.
pub fn closure_paths(profile: &Path, id: u64) -> BTreeSet<String> {
    let Ok(root) = fs::canonicalize(generation_link(profile, id)) else {
        return BTreeSet::new();
    };
    let mut cmd = Command::new("nix-store");
    cmd.arg("-qR").arg(root);
    match run_command_with_timeout(&mut cmd) {
        Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| l.trim().to_string())
            .collect(),
        _ => BTreeSet::new(),
    }
}

/// Sum of added and removed lines in `git diff --numstat` output; binary
/// entries (`-`) are skipped.
pub fn parse_numstat(raw: &str) -> u64 {
    raw.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let adds = fields.next()?.parse::<u64>().ok()?;
            let dels = fields.next()?.parse::<u64>().ok()?;
            fields.next()?;
            Some(adds + dels)
        })
        .sum()
}

fn git_stdout(repo: &Path, args: &[&str]) -> Option<String> {
    let mut cmd = Command::new("git");
    cmd.arg("-C").arg(repo).args(args);
    let output = run_command_with_timeout(&mut cmd).ok()?;
    output
        .status
        .success()
        .then(|| String::from_utf8_lossy(&output.stdout).to_string())
}

fn commit_before(repo: &Path, at: DateTime<Utc>) -> Option<String> {
    let before = format!("--before={}", at.to_rfc3339());
    let commit = git_stdout(repo, &["rev-list", "-1", &before, "HEAD"])?;
    let commit = commit.trim();
    (!commit.is_empty()).then(|| commit.to_string())
}

/// Lines changed in the configuration repository between the commits current
/// at two generation times. Zero when there is no repository or no change.
pub fn git_lines_delta(repo: &Path, older: DateTime<Utc>, newer: DateTime<Utc>) -> u64 {
    if !repo.join(".git").is_dir() {
        return 0;
    }
    let (Some(old), Some(new)) = (commit_before(repo, older), commit_before(repo, newer)) else {
        return 0;
    };
    if old == new {
        return 0;
    }
    git_stdout(repo, &["diff", "--numstat", &old, &new])
        .map(|raw| parse_numstat(&raw))
        .unwrap_or(0)
}

pub fn delete_generations(profile: &Path, ids: &[u64]) -> Result<String> {
    let joined = ids
        .iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(",");
    let mut cmd = Command::new("nix-env");
    cmd.arg("-p")
        .arg(profile)
        .arg("--delete-generations")
        .arg(&joined);
    let output = run_command_with_timeout(&mut cmd).context("failed to run nix-env")?;
    if !output.status.success() {
        anyhow::bail!(
            "nix-env --delete-generations {joined} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Unbounded here; the supervisor's task timeout caps the collection.
pub fn collect_garbage() -> Result<()> {
    let mut cmd = Command::new("nix-collect-garbage");
    let output =
        run_command_with_optional_timeout(&mut cmd, None).context("failed to run nix-collect-garbage")?;
    if !output.status.success() {
        anyhow::bail!(
            "nix-collect-garbage failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}
