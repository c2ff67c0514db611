//! Health check and end-of-day summary, both read-only over the store.

use crate::engine::governor::{self, QuotaWindow, SharedGovernor};
use crate::error::BotResult;
use crate::store::{ActionKind, ActionOutcome, ActionRecord, Store, Target, TargetState, Transition};
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Utc};
use serde::Serialize;
use std::fmt;

/// Share of the hourly cap above which the follow pace is flagged.
const HIGH_RATE_SHARE: f64 = 0.8;
const HIGH_FAILURE_RATIO: f64 = 0.3;
/// Too few attempts make the failure ratio meaningless.
const MIN_ATTEMPTS_FOR_RATIO: u32 = 5;

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub at: DateTime<Utc>,
    pub follows_last_hour: u32,
    pub attempts_today: u32,
    pub failures_today: u32,
    pub device_suspended: bool,
    pub quotas: Vec<QuotaWindow>,
    pub warnings: Vec<String>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.warnings.is_empty()
    }
}

pub fn health(
    store: &Store,
    governor: &SharedGovernor,
    now: DateTime<Utc>,
    offset: FixedOffset,
    device_suspended: bool,
) -> BotResult<HealthReport> {
    let hour_ago = now - Duration::hours(1);
    let today = local_day_start(now, offset);

    let follows_last_hour = store.count_actions(ActionKind::Follow, Some(ActionOutcome::Success), hour_ago)?;
    let mut attempts_today = 0;
    let mut failures_today = 0;
    for kind in [ActionKind::Follow, ActionKind::Unfollow] {
        attempts_today += store.count_actions(kind, None, today)?;
        failures_today += store.count_actions(kind, Some(ActionOutcome::NotFound), today)?;
        failures_today += store.count_actions(kind, Some(ActionOutcome::Error), today)?;
    }

    let (quotas, hourly_cap) = {
        let gov = governor::lock(governor);
        let quotas = [ActionKind::Follow, ActionKind::Unfollow]
            .into_iter()
            .map(|k| gov.window(k, now))
            .collect::<Vec<_>>();
        (quotas, gov.limits().max_actions_per_hour)
    };

    let mut warnings = Vec::new();
    if follows_last_hour as f64 >= hourly_cap as f64 * HIGH_RATE_SHARE {
        warnings.push(format!(
            "high follow rate: {} in the last hour (cap {})",
            follows_last_hour, hourly_cap
        ));
    }
    if attempts_today >= MIN_ATTEMPTS_FOR_RATIO {
        let ratio = failures_today as f64 / attempts_today as f64;
        if ratio > HIGH_FAILURE_RATIO {
            warnings.push(format!(
                "high failure ratio: {}/{} attempts failed today",
                failures_today, attempts_today
            ));
        }
    }
    if device_suspended {
        warnings.push("device suspended".to_string());
    }

    Ok(HealthReport {
        at: now,
        follows_last_hour,
        attempts_today,
        failures_today,
        device_suspended,
        quotas,
        warnings,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyReport {
    pub day: NaiveDate,
    pub follows: u32,
    pub unfollows: u32,
    pub confirmations: u32,
    pub expirations: u32,
    /// Confirmed share of targets resolved today; `None` when nothing resolved.
    pub follow_back_rate: Option<f64>,
    pub failure_reasons: Vec<(String, u32)>,
    pub states: Vec<(TargetState, u32)>,
}

pub fn daily(store: &Store, now: DateTime<Utc>, offset: FixedOffset) -> BotResult<DailyReport> {
    let since = local_day_start(now, offset);
    let confirmations = store.confirmations_since(since)?;
    let expirations = store.expirations_since(since)?;
    let resolved = confirmations + expirations;
    Ok(DailyReport {
        day: now.with_timezone(&offset).date_naive(),
        follows: store.count_actions(ActionKind::Follow, Some(ActionOutcome::Success), since)?,
        unfollows: store.count_actions(ActionKind::Unfollow, Some(ActionOutcome::Success), since)?,
        confirmations,
        expirations,
        follow_back_rate: (resolved > 0).then(|| confirmations as f64 / resolved as f64),
        failure_reasons: store.failure_reasons(since)?,
        states: store.state_counts()?,
    })
}

impl fmt::Display for DailyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Daily report {}", self.day)?;
        writeln!(f, "  follows:       {}", self.follows)?;
        writeln!(f, "  unfollows:     {}", self.unfollows)?;
        writeln!(f, "  confirmed:     {}", self.confirmations)?;
        writeln!(f, "  expired:       {}", self.expirations)?;
        match self.follow_back_rate {
            Some(rate) => writeln!(f, "  follow-back:   {:.1}%", rate * 100.0)?,
            None => writeln!(f, "  follow-back:   n/a")?,
        }
        if !self.failure_reasons.is_empty() {
            writeln!(f, "  failures:")?;
            for (reason, n) in &self.failure_reasons {
                writeln!(f, "    {:>4}  {}", n, reason)?;
            }
        }
        let states: Vec<String> = self
            .states
            .iter()
            .map(|(s, n)| format!("{}={}", s, n))
            .collect();
        write!(f, "  targets:       {}", states.join(" "))
    }
}

/// One target with everything that happened to it, for `--export`.
#[derive(Debug, Clone, Serialize)]
pub struct TargetHistory {
    pub target: Target,
    pub actions: Vec<ActionRecord>,
    pub transitions: Vec<Transition>,
}

pub fn export(store: &Store) -> BotResult<Vec<TargetHistory>> {
    store
        .all_targets()?
        .into_iter()
        .map(|target| {
            Ok(TargetHistory {
                actions: store.actions_for(target.id)?,
                transitions: store.transitions_for(target.id)?,
                target,
            })
        })
        .collect()
}

fn local_day_start(now: DateTime<Utc>, offset: FixedOffset) -> DateTime<Utc> {
    let local_ms = now.timestamp_millis() + offset.local_minus_utc() as i64 * 1000;
    now - Duration::milliseconds(local_ms.rem_euclid(24 * 3_600_000))
}
