//! Due-set computation: a pure function of the activity counter, the wall
//! clock and the schedule document.

use crate::dutycycle::schedule::{
    MINUTES_PER_DAY, Recurrence, RunRecord, ScheduleDocument, TaskDefinition,
};

/// Half-width of a calendar task's window, in minutes.
pub const CALENDAR_WINDOW_MINUTES: u16 = 30;

/// A calendar task attempted this recently is considered already fired for
/// the current window.
pub const CALENDAR_REFIRE_GUARD_SECS: u64 = (2 * CALENDAR_WINDOW_MINUTES as u64 + 1) * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DueInputs {
    pub on_minutes: u64,
    pub now_epoch_secs: u64,
    /// Local wall-clock minute of day, `0..1440`.
    pub now_minute_of_day: u16,
}

/// Shortest distance between two minutes on a 1440-minute circular clock.
pub fn circular_minute_distance(a: u16, b: u16) -> u16 {
    let diff = a.abs_diff(b) % MINUTES_PER_DAY;
    diff.min(MINUTES_PER_DAY - diff)
}

pub fn in_calendar_window(now_minute_of_day: u16, target_minute_of_day: u16) -> bool {
    circular_minute_distance(now_minute_of_day, target_minute_of_day) <= CALENDAR_WINDOW_MINUTES
}

pub fn is_due(def: &TaskDefinition, run: &RunRecord, inputs: &DueInputs) -> bool {
    if !def.enabled {
        return false;
    }
    match def.recurrence {
        Recurrence::Interval { minutes } => {
            inputs.on_minutes >= run.last_success_on_minutes.saturating_add(minutes)
        }
        Recurrence::Calendar { at } => {
            if !in_calendar_window(inputs.now_minute_of_day, at.minute_of_day()) {
                return false;
            }
            match run.last_attempt_epoch_secs {
                Some(last) => {
                    inputs.now_epoch_secs.saturating_sub(last) >= CALENDAR_REFIRE_GUARD_SECS
                }
                // Bootstrap: never attempted, so the first window entered fires
                // regardless of the counter.
                None => true,
            }
        }
    }
}

/// Names of every task due now, in schedule order.
pub fn due_tasks(doc: &ScheduleDocument, inputs: &DueInputs) -> Vec<String> {
    doc.tasks
        .iter()
        .filter(|(name, def)| is_due(def, &doc.run_record(name), inputs))
        .map(|(name, _)| name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dutycycle::schedule::TimeOfDay;
    use std::collections::BTreeMap;

    fn interval(minutes: u64) -> TaskDefinition {
        TaskDefinition {
            enabled: true,
            recurrence: Recurrence::Interval { minutes },
            target: "writeback-threshold".to_string(),
            timeout_seconds: 60,
            description: None,
        }
    }

    fn calendar(raw: &str) -> TaskDefinition {
        TaskDefinition {
            enabled: true,
            recurrence: Recurrence::Calendar {
                at: raw.parse::<TimeOfDay>().expect("time"),
            },
            target: "writeback-daily".to_string(),
            timeout_seconds: 60,
            description: None,
        }
    }

    fn at(on_minutes: u64, hhmm: &str) -> DueInputs {
        DueInputs {
            on_minutes,
            now_epoch_secs: 1_000_000,
            now_minute_of_day: hhmm.parse::<TimeOfDay>().expect("time").minute_of_day(),
        }
    }

    fn succeeded_at(on_minutes: u64) -> RunRecord {
        RunRecord {
            last_success_on_minutes: on_minutes,
            last_success_epoch_secs: Some(1),
            last_attempt_on_minutes: on_minutes,
            last_attempt_epoch_secs: Some(1),
            ..RunRecord::default()
        }
    }

    #[test]
    fn interval_task_is_due_exactly_at_boundary() {
        let def = interval(480);
        let run = succeeded_at(1000);
        assert!(!is_due(&def, &run, &at(1479, "12:00")));
        assert!(is_due(&def, &run, &at(1480, "12:00")));
        assert!(is_due(&def, &run, &at(5000, "12:00")));
    }

    #[test]
    fn never_run_interval_task_waits_for_first_interval() {
        let def = interval(60);
        assert!(!is_due(&def, &RunRecord::default(), &at(59, "12:00")));
        assert!(is_due(&def, &RunRecord::default(), &at(60, "12:00")));
    }

    #[test]
    fn disabled_tasks_are_never_due() {
        let mut def = interval(1);
        def.enabled = false;
        assert!(!is_due(&def, &RunRecord::default(), &at(10_000, "12:00")));
        let mut cal = calendar("12:00");
        cal.enabled = false;
        assert!(!is_due(&cal, &RunRecord::default(), &at(0, "12:00")));
    }

    #[test]
    fn calendar_window_is_thirty_minutes_each_side() {
        let target = 11 * 60;
        for inside in ["10:30", "10:31", "11:00", "11:29", "11:30"] {
            let now = inside.parse::<TimeOfDay>().expect("time").minute_of_day();
            assert!(in_calendar_window(now, target), "{inside} should be inside");
        }
        for outside in ["10:29", "11:31", "23:00"] {
            let now = outside.parse::<TimeOfDay>().expect("time").minute_of_day();
            assert!(!in_calendar_window(now, target), "{outside} should be outside");
        }
    }

    #[test]
    fn calendar_window_wraps_midnight() {
        let target = 10;
        assert!(in_calendar_window(23 * 60 + 45, target));
        assert!(!in_calendar_window(23 * 60 + 39, target));
        assert_eq!(circular_minute_distance(0, 1439), 1);
    }

    #[test]
    fn calendar_bootstrap_fires_on_first_window() {
        let def = calendar("11:00");
        assert!(is_due(&def, &RunRecord::default(), &at(0, "10:45")));
        assert!(!is_due(&def, &RunRecord::default(), &at(0, "09:00")));
    }

    #[test]
    fn succeeded_calendar_task_ignores_counter_outside_window() {
        let def = calendar("11:00");
        let run = succeeded_at(10);
        assert!(!is_due(&def, &run, &at(1_000_000, "15:00")));
        assert!(is_due(&def, &run, &at(11, "11:10")));
    }

    #[test]
    fn calendar_task_fires_once_per_window() {
        let def = calendar("11:00");
        let inputs = at(500, "11:05");
        let just_attempted = RunRecord {
            last_attempt_epoch_secs: Some(inputs.now_epoch_secs - 10 * 60),
            ..RunRecord::default()
        };
        assert!(!is_due(&def, &just_attempted, &inputs));

        let attempted_yesterday = RunRecord {
            last_attempt_epoch_secs: Some(inputs.now_epoch_secs - 86_400),
            ..RunRecord::default()
        };
        assert!(is_due(&def, &attempted_yesterday, &inputs));
    }

    #[test]
    fn due_set_collects_independent_tasks() {
        let mut tasks = BTreeMap::new();
        tasks.insert("a-interval".to_string(), interval(10));
        tasks.insert("b-calendar".to_string(), calendar("03:30"));
        tasks.insert("c-later".to_string(), interval(10_000));
        let doc = ScheduleDocument::with_tasks(tasks);

        let due = due_tasks(&doc, &at(20, "03:10"));
        assert_eq!(due, vec!["a-interval".to_string(), "b-calendar".to_string()]);
    }
}
