/// Sync Schedule Module
///
/// Recurring (days-of-week, time-of-day) windows that gate when the engine
/// may send or apply changes. A window whose end is at or before its start
/// spans midnight into the following day.
use chrono::{DateTime, Datelike, Duration, Local, NaiveTime, TimeZone, Weekday};
use serde::{Deserialize, Serialize};

/// Whether windows permit or forbid syncing while active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleMode {
    /// Sync runs only inside a window.
    AllowDuring,
    /// Sync runs only outside every window.
    BlockDuring,
}

/// One recurring window. `days` refers to the day the window starts on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub days: Vec<Weekday>,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    /// Whether the window spans midnight.
    pub fn is_overnight(&self) -> bool {
        self.end <= self.start
    }

    /// Whether `now` falls inside this window.
    pub fn contains(&self, now: DateTime<Local>) -> bool {
        if self.days.is_empty() {
            return false;
        }
        let time = now.time();
        let today = now.weekday();
        if !self.is_overnight() {
            self.days.contains(&today) && time >= self.start && time < self.end
        } else {
            // Overnight: either we are past the start on a listed day, or
            // before the end on the morning after one.
            let yesterday = today.pred();
            (self.days.contains(&today) && time >= self.start)
                || (self.days.contains(&yesterday) && time < self.end)
        }
    }
}

/// The schedule attached to the configuration object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSchedule {
    pub enabled: bool,
    pub mode: ScheduleMode,
    pub windows: Vec<TimeWindow>,
}

impl Default for SyncSchedule {
    fn default() -> Self {
        Self { enabled: false, mode: ScheduleMode::AllowDuring, windows: Vec::new() }
    }
}

impl SyncSchedule {
    /// Whether sync may run at `now`: in-window XOR blocking mode. A
    /// disabled schedule always allows.
    pub fn is_sync_allowed_at(&self, now: DateTime<Local>) -> bool {
        if !self.enabled {
            return true;
        }
        let in_window = self.windows.iter().any(|w| w.contains(now));
        in_window != (self.mode == ScheduleMode::BlockDuring)
    }

    pub fn is_sync_allowed_now(&self) -> bool {
        self.is_sync_allowed_at(Local::now())
    }

    /// The next instant after `now` at which any window opens or closes,
    /// used to arm the engine's wake timer. None when the schedule can
    /// never change state.
    pub fn next_transition_after(&self, now: DateTime<Local>) -> Option<DateTime<Local>> {
        if !self.enabled {
            return None;
        }
        let mut best: Option<DateTime<Local>> = None;
        for window in &self.windows {
            if window.days.is_empty() {
                continue;
            }
            for day_offset in 0..=7i64 {
                let date = now.date_naive() + Duration::days(day_offset);
                for boundary in [window.start, window.end] {
                    let naive = date.and_time(boundary);
                    let Some(candidate) = Local.from_local_datetime(&naive).earliest() else {
                        continue;
                    };
                    if candidate <= now {
                        continue;
                    }
                    if best.map_or(true, |b| candidate < b) {
                        best = Some(candidate);
                    }
                }
            }
        }
        best
    }
}

/// Millisecond UTC timestamp for "now"; the engine stamps records with this.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Format a UTC millisecond timestamp for conflict copies and versions,
/// e.g. `20240501T120000Z`.
pub fn compact_timestamp(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .unwrap_or_else(|| chrono::DateTime::from_timestamp_millis(0).unwrap())
        .format("%Y%m%dT%H%M%SZ")
        .to_string()
}
