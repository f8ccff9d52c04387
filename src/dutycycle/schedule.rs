use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::dutycycle::paths::DutyPaths;
use crate::dutycycle::util::{load_json_or_default, peek_json_or_default, write_json_atomic};
use crate::dutycycle::warn::{self, WarnEvent};
use crate::error::DutycycleError;

pub const MINUTES_PER_DAY: u16 = 1440;

/// A wall-clock `HH:MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeOfDay {
    pub hour: u8,
    pub minute: u8,
}

impl TimeOfDay {
    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self { hour, minute })
    }

    pub fn minute_of_day(self) -> u16 {
        u16::from(self.hour) * 60 + u16::from(self.minute)
    }
}

impl FromStr for TimeOfDay {
    type Err = DutycycleError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || DutycycleError::InvalidTimeOfDay(raw.to_string());
        let (h, m) = raw.trim().split_once(':').ok_or_else(invalid)?;
        if h.is_empty() || h.len() > 2 || m.len() != 2 {
            return Err(invalid());
        }
        let hour = h.parse::<u8>().map_err(|_| invalid())?;
        let minute = m.parse::<u8>().map_err(|_| invalid())?;
        Self::new(hour, minute).ok_or_else(invalid)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recurrence {
    /// Every N minutes of activity-counter time since the last success.
    Interval { minutes: u64 },
    /// Daily, within ±30 minutes of a wall-clock time.
    Calendar { at: TimeOfDay },
}

impl fmt::Display for Recurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interval { minutes } => write!(f, "every {minutes} active minutes"),
            Self::Calendar { at } => write!(f, "daily around {at}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawTaskDefinition", into = "RawTaskDefinition")]
pub struct TaskDefinition {
    pub enabled: bool,
    pub recurrence: Recurrence,
    pub target: String,
    pub timeout_seconds: u64,
    pub description: Option<String>,
}

/// On-disk shape: exactly one of `interval_minutes` / `calendar_time_of_day`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawTaskDefinition {
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    interval_minutes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    calendar_time_of_day: Option<String>,
    target: String,
    timeout_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl TryFrom<RawTaskDefinition> for TaskDefinition {
    type Error = DutycycleError;

    fn try_from(raw: RawTaskDefinition) -> Result<Self, Self::Error> {
        let recurrence = match (raw.interval_minutes, raw.calendar_time_of_day) {
            (Some(0), None) => {
                return Err(DutycycleError::InvalidRecurrence(
                    "interval_minutes must be >= 1".to_string(),
                ));
            }
            (Some(minutes), None) => Recurrence::Interval { minutes },
            (None, Some(at)) => Recurrence::Calendar { at: at.parse()? },
            (Some(_), Some(_)) => {
                return Err(DutycycleError::InvalidRecurrence(
                    "interval_minutes and calendar_time_of_day are mutually exclusive".to_string(),
                ));
            }
            (None, None) => {
                return Err(DutycycleError::InvalidRecurrence(
                    "one of interval_minutes or calendar_time_of_day is required".to_string(),
                ));
            }
        };
        Ok(Self {
            enabled: raw.enabled,
            recurrence,
            target: raw.target,
            timeout_seconds: raw.timeout_seconds,
            description: raw.description,
        })
    }
}

impl From<TaskDefinition> for RawTaskDefinition {
    fn from(def: TaskDefinition) -> Self {
        let (interval_minutes, calendar_time_of_day) = match def.recurrence {
            Recurrence::Interval { minutes } => (Some(minutes), None),
            Recurrence::Calendar { at } => (None, Some(at.to_string())),
        };
        Self {
            enabled: def.enabled,
            interval_minutes,
            calendar_time_of_day,
            target: def.target,
            timeout_seconds: def.timeout_seconds,
            description: def.description,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunRecord {
    pub last_attempt_epoch_secs: Option<u64>,
    pub last_attempt_on_minutes: u64,
    pub last_success_epoch_secs: Option<u64>,
    pub last_success_on_minutes: u64,
    pub last_outcome: Option<String>,
    pub last_outcome_epoch_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawScheduleDocument", into = "RawScheduleDocument")]
pub struct ScheduleDocument {
    pub schema_version: u32,
    pub tasks: BTreeMap<String, TaskDefinition>,
    pub runs: BTreeMap<String, RunRecord>,
    /// Entries that failed validation, kept verbatim so a save writes them
    /// back for the operator to fix. Never dispatched.
    pub rejected: BTreeMap<String, Value>,
}

impl Default for ScheduleDocument {
    fn default() -> Self {
        Self {
            schema_version: 1,
            tasks: BTreeMap::new(),
            runs: BTreeMap::new(),
            rejected: BTreeMap::new(),
        }
    }
}

/// On-disk shape: tasks stay untyped so one bad entry cannot sink the rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct RawScheduleDocument {
    schema_version: u32,
    tasks: BTreeMap<String, Value>,
    runs: BTreeMap<String, RunRecord>,
}

impl Default for RawScheduleDocument {
    fn default() -> Self {
        Self {
            schema_version: 1,
            tasks: BTreeMap::new(),
            runs: BTreeMap::new(),
        }
    }
}

impl From<RawScheduleDocument> for ScheduleDocument {
    fn from(raw: RawScheduleDocument) -> Self {
        let mut tasks = BTreeMap::new();
        let mut rejected = BTreeMap::new();
        for (name, entry) in raw.tasks {
            match TaskDefinition::deserialize(&entry) {
                Ok(def) => {
                    tasks.insert(name, def);
                }
                Err(_) => {
                    rejected.insert(name, entry);
                }
            }
        }
        Self {
            schema_version: raw.schema_version,
            tasks,
            runs: raw.runs,
            rejected,
        }
    }
}

impl From<ScheduleDocument> for RawScheduleDocument {
    fn from(doc: ScheduleDocument) -> Self {
        let mut tasks = doc.rejected;
        for (name, def) in doc.tasks {
            let entry = serde_json::to_value(RawTaskDefinition::from(def)).unwrap_or(Value::Null);
            tasks.insert(name, entry);
        }
        Self {
            schema_version: doc.schema_version,
            tasks,
            runs: doc.runs,
        }
    }
}

impl ScheduleDocument {
    pub fn with_tasks(tasks: BTreeMap<String, TaskDefinition>) -> Self {
        Self {
            tasks,
            ..Self::default()
        }
    }

    pub fn task(&self, name: &str) -> Result<&TaskDefinition, DutycycleError> {
        self.tasks
            .get(name)
            .ok_or_else(|| DutycycleError::UnknownTask(name.to_string()))
    }

    pub fn run_record(&self, name: &str) -> RunRecord {
        self.runs.get(name).cloned().unwrap_or_default()
    }

    pub fn mark_attempt(
        &mut self,
        name: &str,
        on_minutes: u64,
        now_epoch: u64,
    ) -> Result<&RunRecord, DutycycleError> {
        self.task(name)?;
        let record = self.runs.entry(name.to_string()).or_default();
        record.last_attempt_epoch_secs = Some(now_epoch);
        record.last_attempt_on_minutes = on_minutes;
        Ok(record)
    }

    pub fn mark_success(
        &mut self,
        name: &str,
        on_minutes: u64,
        now_epoch: u64,
    ) -> Result<&RunRecord, DutycycleError> {
        self.task(name)?;
        let record = self.runs.entry(name.to_string()).or_default();
        record.last_success_epoch_secs = Some(now_epoch);
        record.last_success_on_minutes = on_minutes;
        record.last_outcome = Some("success".to_string());
        record.last_outcome_epoch_secs = Some(now_epoch);
        Ok(record)
    }

    pub fn mark_outcome(
        &mut self,
        name: &str,
        outcome: &str,
        now_epoch: u64,
    ) -> Result<&RunRecord, DutycycleError> {
        self.task(name)?;
        let record = self.runs.entry(name.to_string()).or_default();
        record.last_outcome = Some(outcome.to_string());
        record.last_outcome_epoch_secs = Some(now_epoch);
        Ok(record)
    }
}

#[derive(Debug, Clone)]
pub struct ScheduleStore {
    path: PathBuf,
}

impl ScheduleStore {
    pub fn new(paths: &DutyPaths) -> Self {
        Self {
            path: paths.schedule_file.clone(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `None` when no schedule exists yet, or the existing one was unreadable
    /// (it is preserved as a `.corrupt.<epoch>` sibling).
    pub fn load(&self) -> Result<Option<ScheduleDocument>> {
        let doc = load_json_or_default::<Option<ScheduleDocument>>(&self.path, "schedule")?;
        self.warn_rejected(doc.as_ref());
        Ok(doc)
    }

    /// Read-only variant of [`ScheduleStore::load`]: a corrupt schedule reads
    /// as `None` and nothing is written beside it.
    pub fn peek(&self) -> Result<Option<ScheduleDocument>> {
        let doc = peek_json_or_default::<Option<ScheduleDocument>>(&self.path, "schedule")?;
        self.warn_rejected(doc.as_ref());
        Ok(doc)
    }

    fn warn_rejected(&self, doc: Option<&ScheduleDocument>) {
        let Some(doc) = doc else {
            return;
        };
        for (name, entry) in &doc.rejected {
            let err = match TaskDefinition::deserialize(entry) {
                Ok(_) => continue,
                Err(err) => err.to_string(),
            };
            warn::emit(WarnEvent {
                code: "SCHEDULE_ENTRY_INVALID",
                stage: "schedule",
                action: "load-schedule",
                task: name,
                source: &self.path.display().to_string(),
                retry: "skipped-until-fixed",
                reason: "task-definition-invalid",
                err: &err,
            });
        }
    }

    pub fn load_or_empty(&self) -> Result<ScheduleDocument> {
        Ok(self.load()?.unwrap_or_default())
    }

    pub fn save(&self, doc: &ScheduleDocument) -> Result<()> {
        write_json_atomic(&self.path, doc)
    }

    /// Materializes the built-in defaults once. An existing schedule is never
    /// touched, so hand edits stay authoritative.
    pub fn ensure_default<F>(&self, defaults: F) -> Result<(ScheduleDocument, bool)>
    where
        F: FnOnce() -> BTreeMap<String, TaskDefinition>,
    {
        if let Some(doc) = self.load()? {
            return Ok((doc, false));
        }
        let doc = ScheduleDocument::with_tasks(defaults());
        self.save(&doc)?;
        Ok((doc, true))
    }

    /// Loads, applies `mutate`, and writes the document back atomically.
    pub fn modify<T, F>(&self, mutate: F) -> Result<T>
    where
        F: FnOnce(&mut ScheduleDocument) -> Result<T, DutycycleError>,
    {
        let mut doc = self.load_or_empty()?;
        let out = mutate(&mut doc)?;
        self.save(&doc)?;
        Ok(out)
    }

    pub fn mark_attempt(&self, name: &str, on_minutes: u64, now_epoch: u64) -> Result<RunRecord> {
        self.modify(|doc| doc.mark_attempt(name, on_minutes, now_epoch).cloned())
    }

    pub fn mark_success(&self, name: &str, on_minutes: u64, now_epoch: u64) -> Result<RunRecord> {
        self.modify(|doc| doc.mark_success(name, on_minutes, now_epoch).cloned())
    }

    pub fn mark_outcome(&self, name: &str, outcome: &str, now_epoch: u64) -> Result<RunRecord> {
        self.modify(|doc| doc.mark_outcome(name, outcome, now_epoch).cloned())
    }
}
