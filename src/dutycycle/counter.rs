//! Persistent activity counter: whole minutes of device-active time,
//! anchored to the boot session's monotonic clock and fast-forwarded by the
//! device odometer. The counter never decreases.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::dutycycle::config::DutyConfig;
use crate::dutycycle::paths::DutyPaths;
use crate::dutycycle::sources::{self, ClockSample};
use crate::dutycycle::util::{
    load_json_or_default, now_epoch_secs, peek_json_or_default, write_json_atomic,
};

/// Ceiling on what elapsed time alone may add within one boot session.
pub const MAX_SESSION_DELTA_MINUTES: u64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ActivityCounter {
    pub schema_version: u32,
    pub last_boot_id: String,
    pub last_monotonic_seconds: u64,
    pub on_minutes: u64,
    pub last_device_hours: u64,
    pub last_update_epoch_secs: u64,
}

impl Default for ActivityCounter {
    fn default() -> Self {
        Self {
            schema_version: 1,
            last_boot_id: String::new(),
            last_monotonic_seconds: 0,
            on_minutes: 0,
            last_device_hours: 0,
            last_update_epoch_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OdometerVerdict {
    Unavailable,
    Accepted,
    FastForwarded,
    IgnoredDecrease,
}

impl OdometerVerdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unavailable => "unavailable",
            Self::Accepted => "accepted",
            Self::FastForwarded => "fast-forwarded",
            Self::IgnoredDecrease => "ignored-decrease",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterAdvance {
    pub counter: ActivityCounter,
    pub delta_minutes: u64,
    pub reboot_detected: bool,
    pub clamped: bool,
    pub odometer: OdometerVerdict,
}

/// Pure transition from the stored counter and a fresh clock sample.
///
/// Within one boot session the elapsed monotonic time is converted to whole
/// minutes and clamped to [`MAX_SESSION_DELTA_MINUTES`]; sub-minute remainders
/// are carried by advancing the snapshot only by the minutes consumed. A new
/// boot token counts the new session's absolute uptime, unclamped.
pub fn advance(prev: &ActivityCounter, sample: &ClockSample, now_epoch: u64) -> CounterAdvance {
    let boot_id = sample
        .boot_id
        .clone()
        .unwrap_or_else(|| prev.last_boot_id.clone());
    let same_boot = !prev.last_boot_id.is_empty() && boot_id == prev.last_boot_id;

    let mut clamped = false;
    let (delta_minutes, monotonic_snapshot) = match (same_boot, sample.monotonic_secs) {
        (true, Some(now)) if now < prev.last_monotonic_seconds => (0, now),
        (true, Some(now)) => {
            let minutes = (now - prev.last_monotonic_seconds) / 60;
            if minutes > MAX_SESSION_DELTA_MINUTES {
                clamped = true;
                (MAX_SESSION_DELTA_MINUTES, now)
            } else {
                (minutes, prev.last_monotonic_seconds + minutes * 60)
            }
        }
        (true, None) => (0, prev.last_monotonic_seconds),
        (false, Some(now)) => {
            let minutes = now / 60;
            (minutes, minutes * 60)
        }
        (false, None) => (0, 0),
    };

    let mut on_minutes = prev.on_minutes.saturating_add(delta_minutes);
    let mut device_hours = prev.last_device_hours;
    let odometer = match sample.device_hours {
        None => OdometerVerdict::Unavailable,
        Some(hours) if hours < prev.last_device_hours => OdometerVerdict::IgnoredDecrease,
        Some(hours) => {
            device_hours = hours;
            let device_minutes = hours.saturating_mul(60);
            if device_minutes > on_minutes {
                on_minutes = device_minutes;
                OdometerVerdict::FastForwarded
            } else {
                OdometerVerdict::Accepted
            }
        }
    };

    CounterAdvance {
        counter: ActivityCounter {
            schema_version: prev.schema_version.max(1),
            last_boot_id: boot_id,
            last_monotonic_seconds: monotonic_snapshot,
            on_minutes: on_minutes.max(prev.on_minutes),
            last_device_hours: device_hours,
            last_update_epoch_secs: now_epoch,
        },
        delta_minutes,
        reboot_detected: !same_boot,
        clamped,
        odometer,
    }
}

#[derive(Debug, Clone)]
pub struct CounterStore {
    path: PathBuf,
}

impl CounterStore {
    pub fn new(paths: &DutyPaths) -> Self {
        Self {
            path: paths.counter_file.clone(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Absent or corrupt documents read as a zero counter.
    pub fn load(&self) -> Result<ActivityCounter> {
        load_json_or_default(&self.path, "counter")
    }

    /// Same as [`CounterStore::load`] without the corrupt-file backup.
    pub fn peek(&self) -> Result<ActivityCounter> {
        peek_json_or_default(&self.path, "counter")
    }

    pub fn save(&self, counter: &ActivityCounter) -> Result<()> {
        write_json_atomic(&self.path, counter)
    }

    pub fn update_with_sample(&self, sample: &ClockSample) -> Result<CounterAdvance> {
        let prev = self.load()?;
        let advanced = advance(&prev, sample, now_epoch_secs()?);
        self.save(&advanced.counter)?;
        Ok(advanced)
    }

    pub fn update(&self, cfg: &DutyConfig) -> Result<CounterAdvance> {
        let sample = sources::sample(&cfg.clock, &cfg.odometer);
        self.update_with_sample(&sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample(boot: &str, mono: u64, hours: Option<u64>) -> ClockSample {
        ClockSample {
            boot_id: Some(boot.to_string()),
            monotonic_secs: Some(mono),
            device_hours: hours,
        }
    }

    fn running(boot: &str, mono: u64, on: u64) -> ActivityCounter {
        ActivityCounter {
            last_boot_id: boot.to_string(),
            last_monotonic_seconds: mono,
            on_minutes: on,
            ..ActivityCounter::default()
        }
    }

    #[test]
    fn same_boot_delta_is_clamped_to_thirty_minutes() {
        let mut counter = running("boot-a", 0, 0);
        for mono in [600, 1200, 1200 + 500 * 60] {
            counter = advance(&counter, &sample("boot-a", mono, None), 0).counter;
        }
        assert_eq!(counter.on_minutes, 50);
    }

    #[test]
    fn clamp_is_reported() {
        let prev = running("boot-a", 100, 7);
        let out = advance(&prev, &sample("boot-a", 100 + 31 * 60, None), 0);
        assert!(out.clamped);
        assert_eq!(out.delta_minutes, 30);
        assert_eq!(out.counter.last_monotonic_seconds, 100 + 31 * 60);
    }

    #[test]
    fn reboot_uses_absolute_uptime_of_new_session() {
        let prev = running("boot-a", 90_000, 1000);
        let out = advance(&prev, &sample("boot-b", 7200, None), 0);
        assert!(out.reboot_detected);
        assert!(!out.clamped);
        assert_eq!(out.delta_minutes, 120);
        assert_eq!(out.counter.on_minutes, 1120);
        assert_eq!(out.counter.last_boot_id, "boot-b");
    }

    #[test]
    fn first_update_counts_uptime_since_boot() {
        let out = advance(
            &ActivityCounter::default(),
            &sample("boot-a", 3 * 3600 + 59, None),
            42,
        );
        assert!(out.reboot_detected);
        assert_eq!(out.counter.on_minutes, 180);
        assert_eq!(out.counter.last_update_epoch_secs, 42);
    }

    #[test]
    fn sub_minute_remainder_is_carried_forward() {
        let mut counter = running("boot-a", 0, 0);
        for mono in [90, 180] {
            counter = advance(&counter, &sample("boot-a", mono, None), 0).counter;
        }
        assert_eq!(counter.on_minutes, 3);
        assert_eq!(counter.last_monotonic_seconds, 180);
    }

    #[test]
    fn odometer_fast_forwards_counter() {
        let prev = running("boot-a", 0, 100);
        let out = advance(&prev, &sample("boot-a", 60, Some(10)), 0);
        assert_eq!(out.odometer, OdometerVerdict::FastForwarded);
        assert_eq!(out.counter.on_minutes, 600);
        assert_eq!(out.counter.last_device_hours, 10);
    }

    #[test]
    fn decreasing_odometer_is_ignored() {
        let mut prev = running("boot-a", 0, 6000);
        prev.last_device_hours = 100;
        let out = advance(&prev, &sample("boot-a", 60, Some(40)), 0);
        assert_eq!(out.odometer, OdometerVerdict::IgnoredDecrease);
        assert_eq!(out.counter.last_device_hours, 100);
        assert_eq!(out.counter.on_minutes, 6001);
    }

    #[test]
    fn odometer_behind_counter_is_accepted_without_change() {
        let mut prev = running("boot-a", 0, 6000);
        prev.last_device_hours = 90;
        let out = advance(&prev, &sample("boot-a", 0, Some(95)), 0);
        assert_eq!(out.odometer, OdometerVerdict::Accepted);
        assert_eq!(out.counter.last_device_hours, 95);
        assert_eq!(out.counter.on_minutes, 6000);
    }

    #[test]
    fn missing_signals_never_decrease_counter() {
        let prev = running("boot-a", 5000, 777);
        let out = advance(
            &prev,
            &ClockSample {
                boot_id: None,
                monotonic_secs: None,
                device_hours: None,
            },
            0,
        );
        assert!(!out.reboot_detected);
        assert_eq!(out.counter.on_minutes, 777);
        assert_eq!(out.counter.last_monotonic_seconds, 5000);
        assert_eq!(out.odometer, OdometerVerdict::Unavailable);
    }

    #[test]
    fn counter_is_non_decreasing_over_irregular_samples() {
        let samples = [
            sample("a", 10, Some(1)),
            sample("a", 5, None),
            sample("b", 0, Some(0)),
            sample("b", 99_999, Some(3)),
            sample("a", 60, Some(2)),
            sample("a", 120, Some(400)),
        ];
        let mut counter = ActivityCounter::default();
        for s in &samples {
            let next = advance(&counter, s, 0).counter;
            assert!(next.on_minutes >= counter.on_minutes);
            assert!(next.last_device_hours >= counter.last_device_hours);
            counter = next;
        }
    }

    #[test]
    fn store_persists_between_updates() {
        let tmp = tempdir().expect("tempdir");
        let paths = DutyPaths::from_state_dir(tmp.path().to_path_buf(), None);
        let store = CounterStore::new(&paths);

        store
            .update_with_sample(&sample("boot-a", 600, None))
            .expect("first update");
        let second = store
            .update_with_sample(&sample("boot-a", 1200, None))
            .expect("second update");
        assert_eq!(second.counter.on_minutes, 20);
        assert_eq!(store.load().expect("load").on_minutes, 20);
    }
}
