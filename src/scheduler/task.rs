use crate::config::{parse_clock, ScheduleConfig};
use crate::engine::Denial;
use crate::error::{BotError, BotResult};
use crate::store::TaskRow;
use chrono::{DateTime, Duration, FixedOffset, NaiveTime, Utc};
use serde::Serialize;

/// Registered tasks, in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TaskKind {
    FollowBatch,
    VerifyFollowBacks,
    UnfollowBatch,
    HealthCheck,
    DailyReport,
    Reconnect,
}

impl TaskKind {
    pub const ALL: [TaskKind; 6] = [
        TaskKind::FollowBatch,
        TaskKind::VerifyFollowBacks,
        TaskKind::UnfollowBatch,
        TaskKind::HealthCheck,
        TaskKind::DailyReport,
        TaskKind::Reconnect,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::FollowBatch => "follow_batch",
            TaskKind::VerifyFollowBacks => "verify_follow_backs",
            TaskKind::UnfollowBatch => "unfollow_batch",
            TaskKind::HealthCheck => "health_check",
            TaskKind::DailyReport => "daily_report",
            TaskKind::Reconnect => "reconnect",
        }
    }

    pub fn from_name(name: &str) -> Option<TaskKind> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    /// Needs the device lock and a reachable device.
    pub fn uses_device(&self) -> bool {
        !matches!(self, TaskKind::HealthCheck | TaskKind::DailyReport)
    }

    pub fn cadence(&self, schedule: &ScheduleConfig) -> BotResult<Cadence> {
        let every = |minutes: u64| Cadence::Every(Duration::minutes(minutes.max(1) as i64));
        let daily = |raw: &str| {
            parse_clock(raw)
                .map(Cadence::DailyAt)
                .map_err(|e| BotError::Config(format!("{}: {:#}", self.name(), e)))
        };
        Ok(match self {
            TaskKind::FollowBatch => every(schedule.follow_interval_minutes),
            TaskKind::VerifyFollowBacks => every(schedule.verify_interval_minutes),
            TaskKind::UnfollowBatch => every(schedule.unfollow_interval_minutes),
            TaskKind::HealthCheck => every(schedule.health_interval_minutes),
            TaskKind::DailyReport => daily(&schedule.daily_report_at)?,
            TaskKind::Reconnect => daily(&schedule.reconnect_at)?,
        })
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Cadence {
    Every(#[serde(with = "duration_secs")] Duration),
    /// Local wall-clock time in the configured UTC offset.
    DailyAt(NaiveTime),
}

impl Cadence {
    /// First eligible instant strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>, offset: FixedOffset) -> DateTime<Utc> {
        match self {
            Cadence::Every(interval) => after + *interval,
            Cadence::DailyAt(at) => {
                let local = after.naive_utc() + Duration::seconds(offset.local_minus_utc() as i64);
                let mut candidate = local.date().and_time(*at);
                if candidate <= local {
                    candidate += Duration::days(1);
                }
                let utc = candidate - Duration::seconds(offset.local_minus_utc() as i64);
                DateTime::from_naive_utc_and_offset(utc, Utc)
            }
        }
    }

    /// When a never-run task first becomes eligible.
    pub fn first_eligible(&self, now: DateTime<Utc>, offset: FixedOffset) -> DateTime<Utc> {
        match self {
            Cadence::Every(_) => now,
            Cadence::DailyAt(_) => self.next_after(now, offset),
        }
    }
}

impl std::fmt::Display for Cadence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cadence::Every(d) => write!(f, "every {}m", d.num_minutes()),
            Cadence::DailyAt(t) => write!(f, "daily {}", t.format("%H:%M")),
        }
    }
}

mod duration_secs {
    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &chrono::Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(d.num_seconds())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Ok(String),
    /// Ran, then stopped early on a quota denial.
    Deferred { summary: String, denial: Denial },
    Failed(String),
    /// Not run: device tasks wait while the device is suspended.
    Skipped(String),
}

impl TaskStatus {
    pub fn label(&self) -> String {
        match self {
            TaskStatus::Ok(summary) => format!("ok: {}", summary),
            TaskStatus::Deferred { summary, denial } => format!(
                "deferred ({}, retry in {}s): {}",
                denial.reason,
                denial.retry_after.as_secs(),
                summary
            ),
            TaskStatus::Failed(e) => format!("failed: {}", e),
            TaskStatus::Skipped(why) => format!("skipped: {}", why),
        }
    }
}

/// One completed run, returned from `tick` and `run_now`.
#[derive(Debug, Clone)]
pub struct TaskRun {
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub at: DateTime<Utc>,
    pub manual: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduledTask {
    pub kind: TaskKind,
    pub cadence: Cadence,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_eligible: DateTime<Utc>,
    pub last_status: Option<String>,
    pub last_error: Option<String>,
}

impl ScheduledTask {
    pub fn new(kind: TaskKind, cadence: Cadence, now: DateTime<Utc>, offset: FixedOffset) -> Self {
        Self {
            kind,
            cadence,
            enabled: true,
            last_run: None,
            next_eligible: cadence.first_eligible(now, offset),
            last_status: None,
            last_error: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_eligible <= now
    }

    /// Pick up persisted state from a previous run.
    pub fn restore(&mut self, row: &TaskRow) {
        self.enabled = row.enabled;
        self.last_run = row.last_run;
        if let Some(next) = row.next_eligible {
            self.next_eligible = next;
        }
        self.last_status = row.last_status.clone();
        self.last_error = row.last_error.clone();
    }

    pub fn to_row(&self) -> TaskRow {
        TaskRow {
            name: self.kind.name().to_string(),
            enabled: self.enabled,
            last_run: self.last_run,
            next_eligible: Some(self.next_eligible),
            last_status: self.last_status.clone(),
            last_error: self.last_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc_plus(hours: i32) -> FixedOffset {
        FixedOffset::east_opt(hours * 3600).unwrap()
    }

    #[test]
    fn test_names_round_trip_in_registration_order() {
        let names: Vec<_> = TaskKind::ALL.iter().map(|k| k.name()).collect();
        assert_eq!(
            names,
            vec![
                "follow_batch",
                "verify_follow_backs",
                "unfollow_batch",
                "health_check",
                "daily_report",
                "reconnect"
            ]
        );
        assert_eq!(TaskKind::from_name("reconnect"), Some(TaskKind::Reconnect));
        assert_eq!(TaskKind::from_name("nope"), None);
    }

    #[test]
    fn test_daily_at_uses_local_offset() {
        let cadence = Cadence::DailyAt(NaiveTime::from_hms_opt(6, 0, 0).unwrap());
        // 03:00 UTC is 05:00 at UTC+2, so 06:00 local is 04:00 UTC the same day.
        let after = Utc.with_ymd_and_hms(2025, 3, 1, 3, 0, 0).unwrap();
        assert_eq!(
            cadence.next_after(after, utc_plus(2)),
            Utc.with_ymd_and_hms(2025, 3, 1, 4, 0, 0).unwrap()
        );
        // Exactly at the slot rolls to the next day.
        let at_slot = Utc.with_ymd_and_hms(2025, 3, 1, 4, 0, 0).unwrap();
        assert_eq!(
            cadence.next_after(at_slot, utc_plus(2)),
            Utc.with_ymd_and_hms(2025, 3, 2, 4, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_interval_tasks_are_due_immediately() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let task = ScheduledTask::new(
            TaskKind::FollowBatch,
            TaskKind::FollowBatch.cadence(&ScheduleConfig::default()).unwrap(),
            now,
            utc_plus(0),
        );
        assert!(task.is_due(now));
        let report = ScheduledTask::new(
            TaskKind::DailyReport,
            TaskKind::DailyReport.cadence(&ScheduleConfig::default()).unwrap(),
            now,
            utc_plus(0),
        );
        assert_eq!(report.next_eligible, Utc.with_ymd_and_hms(2025, 3, 1, 23, 0, 0).unwrap());
    }

    #[test]
    fn test_device_classification() {
        assert!(TaskKind::Reconnect.uses_device());
        assert!(TaskKind::VerifyFollowBacks.uses_device());
        assert!(!TaskKind::HealthCheck.uses_device());
    }
}
