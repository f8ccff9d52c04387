//! System profile generation retention.
//!
//! Generations are thinned by age: everything recent survives, the following
//! week keeps one per day plus the edges of busy stretches, older history
//! keeps one generation per clump of activity, and anything past three months
//! keeps one per calendar month. Booted and pinned generations always stay.

use anyhow::Result;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use super::nixprofile::{self, Generation};
use super::{MaintenanceTask, TaskContext};
use crate::dutycycle::config::{DutyConfig, RetentionConfig};
use crate::dutycycle::schedule::{Recurrence, TaskDefinition};
use crate::dutycycle::util::{load_json_or_default, write_json_atomic};
use crate::dutycycle::warn::{self, WarnEvent};

const HOUR_SECS: i64 = 3600;
const DAY_SECS: i64 = 24 * HOUR_SECS;

const KEEP_ALL_SECS: i64 = 3 * DAY_SECS;
const DAILY_TIER_SECS: i64 = 10 * DAY_SECS;
const MONTHLY_TIER_SECS: i64 = 90 * DAY_SECS;

const STRETCH_MIN_SPAN_SECS: i64 = 36 * HOUR_SECS;
const STRETCH_MAX_MEAN_GAP_SECS: f64 = 12.0 * HOUR_SECS as f64;

const CLUMP_MIN_HOURS: usize = 5 * 24;
const CLUMP_MAX_HOURS: usize = 10 * 24;
const CLUMP_GUARD_HOURS: usize = 12;

const REBUILD_WEIGHT: f64 = 0.1;
const LINES_WEIGHT: f64 = 0.5;
const PATHS_WEIGHT: f64 = 0.4;

const DEFAULT_INTERVAL_MINUTES: u64 = 24 * 60;
const DEFAULT_TIMEOUT_SECS: u64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepReason {
    BootedCurrent,
    BootedPrevious,
    Recent,
    Daily,
    StretchFirst,
    StretchNextDay,
    StretchLast,
    Clump,
    Monthly,
    Pinned,
}

impl KeepReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BootedCurrent => "booted-current",
            Self::BootedPrevious => "booted-previous",
            Self::Recent => "<=3d",
            Self::Daily => "daily",
            Self::StretchFirst => "prod-first",
            Self::StretchNextDay => "prod-+24h",
            Self::StretchLast => "prod-last",
            Self::Clump => "clump-longterm",
            Self::Monthly => "monthly",
            Self::Pinned => "pinned",
        }
    }
}

/// 5th/95th percentile scaling onto `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PercentileScale {
    p5: u64,
    p95: u64,
    single: bool,
}

impl PercentileScale {
    pub fn fit(values: &[u64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let mut sorted = values.to_vec();
        sorted.sort_unstable();
        let last = sorted.len() - 1;
        Some(Self {
            p5: sorted[last * 5 / 100],
            p95: sorted[last * 95 / 100],
            single: sorted.len() == 1,
        })
    }

    pub fn scale(&self, x: u64) -> f64 {
        if self.single {
            return 0.0;
        }
        if self.p95 == self.p5 {
            return if x <= self.p5 { 0.0 } else { 1.0 };
        }
        let span = (self.p95 - self.p5) as f64;
        ((x as f64 - self.p5 as f64) / span).clamp(0.0, 1.0)
    }
}

/// Per-generation deltas against the preceding generation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationDeltas {
    pub lines: BTreeMap<u64, u64>,
    pub paths: BTreeMap<u64, u64>,
}

pub fn activity_scores(gens: &[Generation], deltas: &GenerationDeltas) -> BTreeMap<u64, f64> {
    let lines: Vec<u64> = deltas.lines.values().copied().collect();
    let paths: Vec<u64> = deltas.paths.values().copied().collect();
    let line_scale = PercentileScale::fit(&lines);
    let path_scale = PercentileScale::fit(&paths);

    gens.iter()
        .enumerate()
        .map(|(i, g)| {
            if i == 0 {
                return (g.id, REBUILD_WEIGHT);
            }
            let l = line_scale.map_or(0.0, |s| s.scale(deltas.lines.get(&g.id).copied().unwrap_or(0)));
            let p = path_scale.map_or(0.0, |s| s.scale(deltas.paths.get(&g.id).copied().unwrap_or(0)));
            (g.id, REBUILD_WEIGHT + LINES_WEIGHT * l + PATHS_WEIGHT * p)
        })
        .collect()
}

/// Gaussian-smoothed activity on an hourly grid spanning the points.
/// Times are epoch seconds.
pub fn kernel_smooth(points: &[(i64, f64)], sigma_hours: u64) -> Vec<(i64, f64)> {
    let (Some(first), Some(last)) = (points.first(), points.last()) else {
        return Vec::new();
    };
    let start = first.0 - first.0.rem_euclid(HOUR_SECS);
    let end = last.0 - last.0.rem_euclid(HOUR_SECS);
    let hours = (end - start) / HOUR_SECS + 1;
    let two_sigma_sq = 2.0 * (sigma_hours as f64).powi(2);

    (0..hours)
        .map(|h| {
            let t = start + h * HOUR_SECS;
            let value = points
                .iter()
                .map(|(pt, score)| {
                    let dh = (pt - t).abs() as f64 / HOUR_SECS as f64;
                    score * (-(dh * dh) / two_sigma_sq).exp()
                })
                .sum();
            (t, value)
        })
        .collect()
}

/// Greedy left-to-right windows of `CLUMP_MIN_HOURS..=CLUMP_MAX_HOURS` grid
/// points, each the highest-integral window starting at the first unused
/// point. Chosen windows and a guard band around them become unusable.
pub fn select_integral_windows(grid: &[(i64, f64)]) -> Vec<(i64, i64)> {
    let mut prefix = Vec::with_capacity(grid.len() + 1);
    prefix.push(0.0);
    for (_, v) in grid {
        let next = prefix.last().copied().unwrap_or(0.0) + v;
        prefix.push(next);
    }

    let mut used = vec![false; grid.len()];
    let mut windows = Vec::new();
    while let Some(start) = used.iter().position(|u| !u) {
        let mut best: Option<(usize, f64)> = None;
        for len in CLUMP_MIN_HOURS..=CLUMP_MAX_HOURS {
            let end = start + len;
            if end > grid.len() {
                break;
            }
            let area = prefix[end] - prefix[start];
            if best.is_none_or(|(_, a)| area > a) {
                best = Some((end, area));
            }
        }
        let Some((end, _)) = best else {
            used[start] = true;
            continue;
        };
        windows.push((grid[start].0, grid[end - 1].0));
        let lo = start.saturating_sub(CLUMP_GUARD_HOURS);
        let hi = (end + CLUMP_GUARD_HOURS).min(grid.len());
        used[lo..hi].iter_mut().for_each(|u| *u = true);
    }
    windows
}

#[derive(Debug, Clone)]
pub struct PlanInput<'a> {
    /// Oldest first.
    pub generations: &'a [Generation],
    pub scores: &'a BTreeMap<u64, f64>,
    pub booted: Option<u64>,
    pub pinned: &'a BTreeSet<u64>,
    pub sigma_hours: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetentionPlan {
    pub keep: BTreeMap<u64, KeepReason>,
    pub delete: Vec<u64>,
}

fn keep_if_new(keep: &mut BTreeMap<u64, KeepReason>, id: u64, reason: KeepReason) {
    keep.entry(id).or_insert(reason);
}

fn productive_stretches(subset: &[&Generation], keep: &mut BTreeMap<u64, KeepReason>) {
    let mut i = 0;
    while i + 1 < subset.len() {
        let mut jumped_to = None;
        for j in (i + 1)..subset.len() {
            let span = (subset[j].at - subset[i].at).num_seconds();
            if span < STRETCH_MIN_SPAN_SECS {
                continue;
            }
            let mean_gap = span as f64 / (j - i) as f64;
            if mean_gap > STRETCH_MAX_MEAN_GAP_SECS {
                continue;
            }
            let target = subset[i].at.timestamp() + DAY_SECS;
            let mid = subset[i..=j]
                .iter()
                .min_by_key(|g| (g.at.timestamp() - target).abs())
                .map(|g| g.id)
                .unwrap_or(subset[i].id);
            keep_if_new(keep, subset[i].id, KeepReason::StretchFirst);
            keep_if_new(keep, mid, KeepReason::StretchNextDay);
            keep_if_new(keep, subset[j].id, KeepReason::StretchLast);
            jumped_to = Some(j);
            break;
        }
        match jumped_to {
            Some(j) => i = j,
            None => i += 1,
        }
    }
}

/// Decides which generations survive. Ages are measured from the newest
/// generation, not the wall clock.
pub fn plan_retention(input: &PlanInput<'_>) -> RetentionPlan {
    let gens = input.generations;
    let Some(newest) = gens.last() else {
        return RetentionPlan::default();
    };
    let now = newest.at;
    let age = |g: &Generation| (now - g.at).num_seconds();
    let known: BTreeSet<u64> = gens.iter().map(|g| g.id).collect();
    let mut keep: BTreeMap<u64, KeepReason> = BTreeMap::new();

    let previous = input.booted.map(|cur| cur.saturating_sub(1).max(1));
    if let Some(cur) = input.booted.filter(|id| known.contains(id)) {
        keep.insert(cur, KeepReason::BootedCurrent);
    }
    if let Some(prev) = previous.filter(|id| known.contains(id) && Some(*id) != input.booted) {
        keep.insert(prev, KeepReason::BootedPrevious);
    }

    for g in gens.iter().filter(|g| age(*g) <= KEEP_ALL_SECS) {
        keep.insert(g.id, KeepReason::Recent);
    }

    let middle: Vec<&Generation> = gens
        .iter()
        .filter(|g| age(*g) > KEEP_ALL_SECS && age(*g) <= DAILY_TIER_SECS)
        .collect();
    let mut per_day: BTreeMap<NaiveDate, &Generation> = BTreeMap::new();
    for g in middle.iter().copied() {
        let slot = per_day.entry(g.at.date_naive()).or_insert(g);
        if g.at > slot.at {
            *slot = g;
        }
    }
    for g in per_day.values() {
        keep_if_new(&mut keep, g.id, KeepReason::Daily);
    }
    productive_stretches(&middle, &mut keep);

    let cutoff = now.timestamp() - DAILY_TIER_SECS;
    let points: Vec<(i64, f64)> = gens
        .iter()
        .map(|g| (g.at.timestamp(), input.scores.get(&g.id).copied().unwrap_or(0.0)))
        .collect();
    let tail: Vec<(i64, f64)> = kernel_smooth(&points, input.sigma_hours)
        .into_iter()
        .filter(|(t, _)| *t <= cutoff)
        .collect();
    for (start, end) in select_integral_windows(&tail) {
        if let Some(g) = gens
            .iter()
            .filter(|g| (start..=end).contains(&g.at.timestamp()))
            .last()
        {
            keep_if_new(&mut keep, g.id, KeepReason::Clump);
        }
    }

    let mut per_month: BTreeMap<(i32, u32), &Generation> = BTreeMap::new();
    for g in gens.iter().filter(|g| age(*g) > MONTHLY_TIER_SECS) {
        let slot = per_month.entry((g.at.year(), g.at.month())).or_insert(g);
        if g.at > slot.at {
            *slot = g;
        }
    }
    for g in per_month.values() {
        keep_if_new(&mut keep, g.id, KeepReason::Monthly);
    }

    for id in input.pinned.iter().filter(|id| known.contains(id)) {
        keep.insert(*id, KeepReason::Pinned);
    }

    let delete = known
        .iter()
        .copied()
        .filter(|id| !keep.contains_key(id))
        .collect();
    RetentionPlan { keep, delete }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationEntry {
    pub ts: String,
    pub score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeptEntry {
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionMeta {
    pub last_run: Option<String>,
}

/// Persistent retention bookkeeping. `pinned` is operator-edited: any key
/// naming a generation id keeps that generation forever.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionState {
    pub gens: BTreeMap<String, GenerationEntry>,
    pub kept: BTreeMap<String, KeptEntry>,
    pub deleted: Vec<u64>,
    pub pinned: BTreeMap<String, serde_json::Value>,
    pub meta: RetentionMeta,
}

impl RetentionState {
    pub fn pinned_ids(&self) -> BTreeSet<u64> {
        self.pinned
            .keys()
            .filter_map(|k| k.trim().parse::<u64>().ok())
            .collect()
    }

    pub fn record_plan(
        &mut self,
        gens: &[Generation],
        scores: &BTreeMap<u64, f64>,
        plan: &RetentionPlan,
        now: DateTime<Utc>,
    ) {
        for g in gens {
            let entry = self.gens.entry(g.id.to_string()).or_default();
            entry.ts = g.at.to_rfc3339();
            entry.score = scores.get(&g.id).copied().unwrap_or(0.0);
        }
        self.kept = plan
            .keep
            .iter()
            .map(|(id, reason)| {
                (
                    id.to_string(),
                    KeptEntry {
                        reason: reason.as_str().to_string(),
                    },
                )
            })
            .collect();
        self.meta.last_run = Some(now.to_rfc3339());
    }
}

fn collect_deltas(cfg: &RetentionConfig, gens: &[Generation]) -> GenerationDeltas {
    let closures: BTreeMap<u64, BTreeSet<String>> = gens
        .iter()
        .map(|g| (g.id, nixprofile::closure_paths(&cfg.profile, g.id)))
        .collect();
    let empty = BTreeSet::new();
    let mut deltas = GenerationDeltas::default();
    for pair in gens.windows(2) {
        let (older, newer) = (&pair[0], &pair[1]);
        deltas.lines.insert(
            newer.id,
            nixprofile::git_lines_delta(&cfg.repo, older.at, newer.at),
        );
        let before = closures.get(&older.id).unwrap_or(&empty);
        let after = closures.get(&newer.id).unwrap_or(&empty);
        let changed = after.symmetric_difference(before).count() as u64;
        deltas.paths.insert(newer.id, changed);
    }
    deltas
}

fn format_ids(ids: &[u64]) -> String {
    if ids.is_empty() {
        return "none".to_string();
    }
    ids.iter().map(u64::to_string).collect::<Vec<_>>().join(",")
}

pub struct GenerationRetentionTask;

impl MaintenanceTask for GenerationRetentionTask {
    fn target(&self) -> &'static str {
        "generation-retention"
    }

    fn description(&self) -> &'static str {
        "Thin system profile generations by age and activity, then collect garbage"
    }

    fn default_definition(&self, _cfg: &DutyConfig) -> TaskDefinition {
        TaskDefinition {
            enabled: true,
            recurrence: Recurrence::Interval {
                minutes: DEFAULT_INTERVAL_MINUTES,
            },
            target: self.target().to_string(),
            timeout_seconds: DEFAULT_TIMEOUT_SECS,
            description: Some(self.description().to_string()),
        }
    }

    fn writable_paths(&self, cfg: &DutyConfig) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = cfg
            .retention
            .profile
            .parent()
            .map(|p| p.to_path_buf())
            .into_iter()
            .collect();
        paths.extend([PathBuf::from("/nix/var/nix"), PathBuf::from("/nix/store")]);
        if let Some(state_file) = &cfg.retention.state_file
            && let Some(parent) = state_file.parent()
        {
            paths.push(parent.to_path_buf());
        }
        paths
    }

    fn execute(&self, ctx: &TaskContext<'_>) -> Result<String> {
        let cfg = &ctx.cfg.retention;
        let gens = nixprofile::list_generations(&cfg.profile)?;
        if gens.is_empty() {
            ctx.log("no generations found");
            return Ok("generations=0".to_string());
        }

        let booted = nixprofile::booted_generation(&cfg.profile, &cfg.current_system_link, &gens);
        let state_path = cfg.state_file_path(ctx.paths);
        let mut state: RetentionState = load_json_or_default(&state_path, "retention")?;
        let deltas = collect_deltas(cfg, &gens);
        let scores = activity_scores(&gens, &deltas);
        let pinned = state.pinned_ids();
        let plan = plan_retention(&PlanInput {
            generations: &gens,
            scores: &scores,
            booted,
            pinned: &pinned,
            sigma_hours: cfg.sigma_hours,
        });

        state.record_plan(&gens, &scores, &plan, Utc::now());
        write_json_atomic(&state_path, &state)?;

        let kept = plan
            .keep
            .iter()
            .map(|(id, reason)| format!("{id}:{}", reason.as_str()))
            .collect::<Vec<_>>()
            .join(",");
        ctx.log(&format!("plan delete={}", format_ids(&plan.delete)));
        ctx.log(&format!("plan keep={kept}"));

        let summary = format!(
            "generations={} kept={} delete={} booted={} apply={}",
            gens.len(),
            plan.keep.len(),
            plan.delete.len(),
            booted.map_or("unknown".to_string(), |id| id.to_string()),
            cfg.apply
        );
        if !cfg.apply {
            ctx.log("dry-run: no deletions performed");
            return Ok(summary);
        }
        if plan.delete.is_empty() {
            return Ok(summary);
        }

        let output = nixprofile::delete_generations(&cfg.profile, &plan.delete)?;
        if !output.is_empty() {
            ctx.log(&output);
        }
        state.deleted.extend(plan.delete.iter().copied());
        write_json_atomic(&state_path, &state)?;

        if let Err(err) = nixprofile::collect_garbage() {
            warn::emit(WarnEvent {
                code: "GC_FAILED",
                stage: "retention",
                action: "collect-garbage",
                task: ctx.task_name,
                source: "nix-collect-garbage",
                retry: "next-run",
                reason: "command-failed",
                err: &format!("{err:#}"),
            });
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 20, 12, 0, 0)
            .single()
            .expect("ts")
    }

    fn ts(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).single().expect("ts")
    }

    fn plan(gens: &[Generation], booted: Option<u64>, pinned: &[u64]) -> RetentionPlan {
        let scores = gens.iter().map(|g| (g.id, REBUILD_WEIGHT)).collect();
        let pinned = pinned.iter().copied().collect();
        plan_retention(&PlanInput {
            generations: gens,
            scores: &scores,
            booted,
            pinned: &pinned,
            sigma_hours: 12,
        })
    }

    /// Three generations on one day in the daily tier, plus the newest.
    fn one_busy_day() -> Vec<Generation> {
        vec![
            Generation { id: 10, at: ts(2026, 3, 15, 8) },
            Generation { id: 11, at: ts(2026, 3, 15, 12) },
            Generation { id: 12, at: ts(2026, 3, 15, 20) },
            Generation { id: 13, at: now() },
        ]
    }

    #[test]
    fn percentile_scale_edges() {
        let spread: Vec<u64> = (0..=100).collect();
        let scale = PercentileScale::fit(&spread).expect("scale");
        assert!((scale.scale(50) - 0.5).abs() < 1e-9);
        assert_eq!(scale.scale(0), 0.0);
        assert_eq!(scale.scale(1_000), 1.0);

        let single = PercentileScale::fit(&[42]).expect("scale");
        assert_eq!(single.scale(1_000), 0.0);

        let flat = PercentileScale::fit(&[3, 3, 3]).expect("scale");
        assert_eq!(flat.scale(3), 0.0);
        assert_eq!(flat.scale(4), 1.0);
        assert!(PercentileScale::fit(&[]).is_none());
    }

    #[test]
    fn first_generation_scores_rebuild_weight_only() {
        let gens = one_busy_day();
        let deltas = GenerationDeltas {
            lines: BTreeMap::from([(11, 0), (12, 100), (13, 50)]),
            paths: BTreeMap::from([(11, 0), (12, 10), (13, 10)]),
        };
        let scores = activity_scores(&gens, &deltas);
        assert_eq!(scores[&10], REBUILD_WEIGHT);
        assert_eq!(scores[&11], REBUILD_WEIGHT);
        // Deltas at or above p95 saturate to 1.
        assert!((scores[&12] - (0.1 + 0.5 + 0.4)).abs() < 1e-9);
    }

    #[test]
    fn kernel_smooth_uses_hourly_grid() {
        let t = ts(2026, 1, 1, 10).timestamp() + 30 * 60;
        let grid = kernel_smooth(&[(t, 1.0)], 12);
        assert_eq!(grid.len(), 1);
        assert_eq!(grid[0].0, ts(2026, 1, 1, 10).timestamp());
        let expected = (-(0.25f64) / 288.0).exp();
        assert!((grid[0].1 - expected).abs() < 1e-12);
        assert!(kernel_smooth(&[], 12).is_empty());
    }

    #[test]
    fn windows_are_greedy_with_guard_bands() {
        let grid: Vec<(i64, f64)> = (0..400).map(|h| (h as i64 * HOUR_SECS, 1.0)).collect();
        let windows = select_integral_windows(&grid);
        assert_eq!(
            windows,
            vec![(0, 239 * HOUR_SECS), (252 * HOUR_SECS, 399 * HOUR_SECS)]
        );
        // Too short for even the minimum window.
        assert!(select_integral_windows(&grid[..100]).is_empty());
    }

    #[test]
    fn recent_generations_are_all_kept() {
        let gens = vec![
            Generation { id: 1, at: now() - Duration::days(2) },
            Generation { id: 2, at: now() - Duration::days(1) },
            Generation { id: 3, at: now() },
        ];
        let plan = plan(&gens, None, &[]);
        assert!(plan.delete.is_empty());
        assert!(plan.keep.values().all(|r| *r == KeepReason::Recent));
    }

    #[test]
    fn daily_tier_keeps_last_generation_per_day() {
        let plan = plan(&one_busy_day(), None, &[]);
        assert_eq!(plan.keep.get(&12), Some(&KeepReason::Daily));
        assert_eq!(plan.keep.get(&13), Some(&KeepReason::Recent));
        assert_eq!(plan.delete, vec![10, 11]);
    }

    #[test]
    fn booted_and_pinned_generations_survive() {
        let plan_booted = plan(&one_busy_day(), Some(11), &[]);
        assert_eq!(plan_booted.keep.get(&11), Some(&KeepReason::BootedCurrent));
        assert_eq!(plan_booted.keep.get(&10), Some(&KeepReason::BootedPrevious));
        assert!(plan_booted.delete.is_empty());

        let plan_pinned = plan(&one_busy_day(), None, &[10, 999]);
        assert_eq!(plan_pinned.keep.get(&10), Some(&KeepReason::Pinned));
        assert!(!plan_pinned.keep.contains_key(&999));
        assert_eq!(plan_pinned.delete, vec![11]);
    }

    #[test]
    fn productive_stretch_keeps_first_next_day_and_last() {
        // Every 6h from 2026-03-11 00:00 to 2026-03-13 00:00.
        let start = ts(2026, 3, 11, 0);
        let mut gens: Vec<Generation> = (0..9)
            .map(|i| Generation {
                id: 100 + i,
                at: start + Duration::hours(6 * i as i64),
            })
            .collect();
        gens.push(Generation { id: 200, at: now() });

        let plan = plan(&gens, None, &[]);
        assert_eq!(plan.keep.get(&100), Some(&KeepReason::StretchFirst));
        assert_eq!(plan.keep.get(&104), Some(&KeepReason::StretchNextDay));
        assert_eq!(plan.keep.get(&106), Some(&KeepReason::StretchLast));
        for daily in [103, 107, 108] {
            assert_eq!(plan.keep.get(&daily), Some(&KeepReason::Daily));
        }
        assert_eq!(plan.delete, vec![101, 102, 105]);
    }

    #[test]
    fn old_history_keeps_a_generation_per_month() {
        let gens = vec![
            Generation { id: 1, at: ts(2025, 11, 5, 9) },
            Generation { id: 2, at: ts(2025, 11, 20, 9) },
            Generation { id: 3, at: ts(2025, 12, 2, 9) },
            Generation { id: 4, at: now() },
        ];
        let plan = plan(&gens, None, &[]);
        for id in [2, 3, 4] {
            assert!(plan.keep.contains_key(&id), "{id} should be kept");
        }
        let ids: BTreeSet<u64> = plan.keep.keys().chain(plan.delete.iter()).copied().collect();
        assert_eq!(ids.len(), gens.len());
    }

    #[test]
    fn state_records_plan_and_pins() {
        let gens = one_busy_day();
        let mut state = RetentionState::default();
        state.pinned.insert("11".to_string(), serde_json::json!(true));
        state.pinned.insert("not-an-id".to_string(), serde_json::json!(true));
        assert_eq!(state.pinned_ids(), BTreeSet::from([11]));

        let scores = gens.iter().map(|g| (g.id, 0.25)).collect();
        let plan = plan(&gens, None, &[11]);
        state.record_plan(&gens, &scores, &plan, now());
        assert_eq!(state.gens["13"].score, 0.25);
        assert_eq!(state.kept["11"].reason, "pinned");
        assert!(state.meta.last_run.is_some());
        assert!(!state.kept.contains_key("10"));
    }
}
