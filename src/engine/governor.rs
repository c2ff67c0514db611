//! Activity caps, rest window, cooldown and human-like delays.

use crate::config::LimitsConfig;
use crate::error::{BotError, BotResult};
use crate::store::ActionKind;
use chrono::{DateTime, FixedOffset, NaiveTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const HOUR_MS: i64 = 3_600_000;
const DAY_MS: i64 = 24 * HOUR_MS;

/// The governor is consulted synchronously from the executor and read by
/// reporting; neither holds the lock across an await.
pub type SharedGovernor = Arc<Mutex<RateGovernor>>;

pub fn lock(governor: &SharedGovernor) -> MutexGuard<'_, RateGovernor> {
    governor.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DenialReason {
    RestWindowActive,
    DailyQuotaExceeded,
    HourlyQuotaExceeded,
    CooldownActive,
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DenialReason::RestWindowActive => "rest window active",
            DenialReason::DailyQuotaExceeded => "daily quota exceeded",
            DenialReason::HourlyQuotaExceeded => "hourly quota exceeded",
            DenialReason::CooldownActive => "cooldown active",
        };
        f.write_str(s)
    }
}

/// Why an action may not run now, and how long until it might.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Denial {
    pub kind: ActionKind,
    pub reason: DenialReason,
    pub retry_after: Duration,
}

/// Permission to perform one action after waiting `delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permit {
    pub kind: ActionKind,
    pub granted_at: DateTime<Utc>,
    pub delay: Duration,
}

/// Usage of one action kind against its calendar and rolling caps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaWindow {
    pub kind: ActionKind,
    pub hour_used: u32,
    pub hour_cap: u32,
    pub day_used: u32,
    pub day_cap: u32,
    pub rolling_hour: u32,
    pub rolling_day: u32,
    pub hour_resets_at: DateTime<Utc>,
    pub day_resets_at: DateTime<Utc>,
}

pub struct RateGovernor {
    limits: LimitsConfig,
    offset: FixedOffset,
    rest: Option<(NaiveTime, NaiveTime)>,
    /// Granted permits of the last 24h, oldest first.
    grants: VecDeque<(ActionKind, DateTime<Utc>)>,
    rng: StdRng,
}

impl RateGovernor {
    pub fn new(limits: LimitsConfig, offset: FixedOffset) -> BotResult<Self> {
        Self::build(limits, offset, StdRng::from_entropy())
    }

    /// Deterministic delays, for tests and simulation.
    pub fn with_seed(limits: LimitsConfig, offset: FixedOffset, seed: u64) -> BotResult<Self> {
        Self::build(limits, offset, StdRng::seed_from_u64(seed))
    }

    fn build(limits: LimitsConfig, offset: FixedOffset, rng: StdRng) -> BotResult<Self> {
        let rest = rest_bounds(&limits)?;
        Ok(Self {
            limits,
            offset,
            rest,
            grants: VecDeque::new(),
            rng,
        })
    }

    pub fn limits(&self) -> &LimitsConfig {
        &self.limits
    }

    /// Swap limits at runtime. Grants already issued keep counting.
    pub fn set_limits(&mut self, limits: LimitsConfig) -> BotResult<()> {
        self.rest = rest_bounds(&limits)?;
        if limits != self.limits {
            tracing::info!(
                daily_follows = limits.max_daily_follows,
                daily_unfollows = limits.max_daily_unfollows,
                hourly = limits.max_actions_per_hour,
                "rate limits updated"
            );
        }
        self.limits = limits;
        Ok(())
    }

    pub fn set_offset(&mut self, offset: FixedOffset) {
        self.offset = offset;
    }

    /// Seed the rolling log from persisted grants so a restart keeps counting.
    pub fn restore(&mut self, grants: impl IntoIterator<Item = (ActionKind, DateTime<Utc>)>) {
        let mut all: Vec<_> = self.grants.drain(..).chain(grants).collect();
        all.sort_by_key(|(_, at)| *at);
        self.grants = all.into();
    }

    /// Dry run: would `try_acquire` grant right now?
    pub fn check(&self, kind: ActionKind, now: DateTime<Utc>) -> Result<(), Denial> {
        let deny = |reason, wait: chrono::Duration| {
            Err(Denial {
                kind,
                reason,
                retry_after: wait.to_std().unwrap_or_default().max(Duration::from_secs(1)),
            })
        };

        if let Some(wait) = self.rest_remaining(now) {
            return deny(DenialReason::RestWindowActive, wait);
        }

        if !kind.is_quota_limited() {
            let spacing = chrono::Duration::seconds(self.limits.verify_spacing_seconds as i64);
            if let Some(last) = self.last_grant(|k| k == kind) {
                if now < last + spacing {
                    return deny(DenialReason::CooldownActive, last + spacing - now);
                }
            }
            return Ok(());
        }

        let day_cap = self.daily_cap(kind);
        if let Some(wait) = self.cap_wait(now, DAY_MS, day_cap, |k| k == kind) {
            return deny(DenialReason::DailyQuotaExceeded, wait);
        }

        let hour_cap = self.limits.max_actions_per_hour;
        if let Some(wait) = self.cap_wait(now, HOUR_MS, hour_cap, |k| k.is_quota_limited()) {
            return deny(DenialReason::HourlyQuotaExceeded, wait);
        }

        let spacing = chrono::Duration::seconds(self.limits.min_action_spacing_seconds as i64);
        if let Some(last) = self.last_grant(|k| k.is_quota_limited()) {
            if now < last + spacing {
                return deny(DenialReason::CooldownActive, last + spacing - now);
            }
        }
        Ok(())
    }

    /// Grant a permit and count it, or explain why not.
    pub fn try_acquire(&mut self, kind: ActionKind, now: DateTime<Utc>) -> Result<Permit, Denial> {
        self.prune(now);
        self.check(kind, now)?;
        self.grants.push_back((kind, now));

        let delay = if kind.is_quota_limited() {
            let lo = self.limits.min_delay_seconds * 1000;
            let hi = self.limits.max_delay_seconds * 1000;
            Duration::from_millis(self.rng.gen_range(lo..=hi))
        } else {
            Duration::ZERO
        };
        tracing::debug!(kind = %kind, delay_ms = delay.as_millis() as u64, "permit granted");
        Ok(Permit {
            kind,
            granted_at: now,
            delay,
        })
    }

    pub fn window(&self, kind: ActionKind, now: DateTime<Utc>) -> QuotaWindow {
        let hour_start = calendar_start(now, self.offset, HOUR_MS);
        let day_start = calendar_start(now, self.offset, DAY_MS);
        let hour_match = |k: ActionKind| {
            if kind.is_quota_limited() {
                k.is_quota_limited()
            } else {
                k == kind
            }
        };
        QuotaWindow {
            kind,
            hour_used: self.count_since(hour_start, hour_match),
            hour_cap: self.limits.max_actions_per_hour,
            day_used: self.count_since(day_start, |k| k == kind),
            day_cap: self.daily_cap(kind),
            rolling_hour: self.count_since(now - chrono::Duration::milliseconds(HOUR_MS), hour_match),
            rolling_day: self.count_since(now - chrono::Duration::milliseconds(DAY_MS), |k| k == kind),
            hour_resets_at: hour_start + chrono::Duration::milliseconds(HOUR_MS),
            day_resets_at: day_start + chrono::Duration::milliseconds(DAY_MS),
        }
    }

    fn daily_cap(&self, kind: ActionKind) -> u32 {
        match kind {
            ActionKind::Follow => self.limits.max_daily_follows,
            ActionKind::Unfollow => self.limits.max_daily_unfollows,
            ActionKind::VerifyFollowBack => u32::MAX,
        }
    }

    /// How long until one more grant fits under `cap`, checking both the
    /// calendar window containing `now` and the rolling window ending at `now`.
    fn cap_wait(
        &self,
        now: DateTime<Utc>,
        span_ms: i64,
        cap: u32,
        matches: impl Fn(ActionKind) -> bool,
    ) -> Option<chrono::Duration> {
        let span = chrono::Duration::milliseconds(span_ms);
        let calendar_start = calendar_start(now, self.offset, span_ms);
        let calendar_reset = calendar_start + span;
        if cap == 0 {
            return Some(calendar_reset - now);
        }

        let rolling: Vec<DateTime<Utc>> = self
            .grants
            .iter()
            .filter(|(k, at)| matches(*k) && *at > now - span)
            .map(|(_, at)| *at)
            .collect();
        let calendar_used = rolling.iter().filter(|at| **at >= calendar_start).count() as u32;
        let rolling_used = rolling.len() as u32;
        if calendar_used < cap && rolling_used < cap {
            return None;
        }

        let mut wait = chrono::Duration::zero();
        if calendar_used >= cap {
            wait = calendar_reset - now;
        }
        if rolling_used >= cap {
            let oldest_blocking = rolling[(rolling_used - cap) as usize];
            wait = wait.max(oldest_blocking + span - now);
        }
        Some(wait)
    }

    fn count_since(&self, since: DateTime<Utc>, matches: impl Fn(ActionKind) -> bool) -> u32 {
        self.grants
            .iter()
            .filter(|(k, at)| matches(*k) && *at >= since)
            .count() as u32
    }

    fn last_grant(&self, matches: impl Fn(ActionKind) -> bool) -> Option<DateTime<Utc>> {
        self.grants
            .iter()
            .rev()
            .find(|(k, _)| matches(*k))
            .map(|(_, at)| *at)
    }

    fn rest_remaining(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        let (start, end) = self.rest?;
        if start == end {
            return None;
        }
        let t = now.with_timezone(&self.offset).time();
        let inside = if start < end {
            t >= start && t < end
        } else {
            t >= start || t < end
        };
        if !inside {
            return None;
        }
        let mut wait = end - t;
        if wait <= chrono::Duration::zero() {
            wait += chrono::Duration::days(1);
        }
        Some(wait)
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let horizon = now - chrono::Duration::milliseconds(DAY_MS);
        while self.grants.front().is_some_and(|(_, at)| *at <= horizon) {
            self.grants.pop_front();
        }
    }
}

fn rest_bounds(limits: &LimitsConfig) -> BotResult<Option<(NaiveTime, NaiveTime)>> {
    limits
        .rest_window
        .as_ref()
        .map(|rw| rw.bounds().map_err(|e| BotError::Config(format!("{:#}", e))))
        .transpose()
}

/// Start of the local hour or day containing `now`, as a UTC instant.
fn calendar_start(now: DateTime<Utc>, offset: FixedOffset, span_ms: i64) -> DateTime<Utc> {
    let local_ms = now.timestamp_millis() + offset.local_minus_utc() as i64 * 1000;
    now - chrono::Duration::milliseconds(local_ms.rem_euclid(span_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RestWindow;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, h, m, 0).unwrap()
    }

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn limits() -> LimitsConfig {
        LimitsConfig {
            max_daily_follows: 10,
            max_daily_unfollows: 5,
            max_actions_per_hour: 3,
            min_delay_seconds: 30,
            max_delay_seconds: 120,
            min_action_spacing_seconds: 60,
            verify_spacing_seconds: 5,
            rest_window: None,
        }
    }

    #[test]
    fn test_delay_within_bounds() {
        let mut gov = RateGovernor::with_seed(limits(), utc(), 1).unwrap();
        let mut now = at(9, 0);
        for _ in 0..3 {
            let permit = gov.try_acquire(ActionKind::Follow, now).unwrap();
            assert!(permit.delay >= Duration::from_secs(30));
            assert!(permit.delay <= Duration::from_secs(120));
            now += chrono::Duration::minutes(2);
        }
    }

    #[test]
    fn test_hourly_cap_shared_between_follow_and_unfollow() {
        let mut gov = RateGovernor::with_seed(limits(), utc(), 1).unwrap();
        gov.try_acquire(ActionKind::Follow, at(9, 0)).unwrap();
        gov.try_acquire(ActionKind::Unfollow, at(9, 5)).unwrap();
        gov.try_acquire(ActionKind::Follow, at(9, 10)).unwrap();

        let denial = gov.try_acquire(ActionKind::Unfollow, at(9, 20)).unwrap_err();
        assert_eq!(denial.reason, DenialReason::HourlyQuotaExceeded);
        assert_eq!(denial.retry_after, Duration::from_secs(40 * 60));
    }

    #[test]
    fn test_hourly_denial_reported_before_cooldown() {
        let mut gov = RateGovernor::with_seed(limits(), utc(), 1).unwrap();
        for m in [0, 1, 2] {
            gov.try_acquire(ActionKind::Follow, at(9, m)).unwrap();
        }
        let denial = gov.check(ActionKind::Follow, at(9, 2) + chrono::Duration::seconds(10));
        assert_eq!(denial.unwrap_err().reason, DenialReason::HourlyQuotaExceeded);
    }

    #[test]
    fn test_cooldown_between_actions() {
        let mut gov = RateGovernor::with_seed(limits(), utc(), 1).unwrap();
        gov.try_acquire(ActionKind::Follow, at(9, 0)).unwrap();
        let denial = gov
            .try_acquire(ActionKind::Follow, at(9, 0) + chrono::Duration::seconds(20))
            .unwrap_err();
        assert_eq!(denial.reason, DenialReason::CooldownActive);
        assert_eq!(denial.retry_after, Duration::from_secs(40));
    }

    #[test]
    fn test_rolling_hour_spans_calendar_boundary() {
        let mut gov = RateGovernor::with_seed(limits(), utc(), 1).unwrap();
        for m in [50, 55, 58] {
            gov.try_acquire(ActionKind::Follow, at(9, m)).unwrap();
        }
        // New calendar hour, but the rolling hour is still full.
        let denial = gov.try_acquire(ActionKind::Follow, at(10, 5)).unwrap_err();
        assert_eq!(denial.reason, DenialReason::HourlyQuotaExceeded);
        assert_eq!(denial.retry_after, Duration::from_secs(45 * 60));
        assert!(gov.try_acquire(ActionKind::Follow, at(10, 51)).is_ok());
    }

    #[test]
    fn test_daily_cap_resets_at_local_midnight() {
        let mut l = limits();
        l.max_actions_per_hour = 100;
        l.max_daily_follows = 2;
        // UTC+2: local midnight is 22:00 UTC.
        let offset = FixedOffset::east_opt(2 * 3600).unwrap();
        let mut gov = RateGovernor::with_seed(l, offset, 1).unwrap();
        gov.try_acquire(ActionKind::Follow, at(0, 0)).unwrap();
        gov.try_acquire(ActionKind::Follow, at(1, 0)).unwrap();

        let denial = gov.try_acquire(ActionKind::Follow, at(12, 0)).unwrap_err();
        assert_eq!(denial.reason, DenialReason::DailyQuotaExceeded);
        // Calendar day resets at 22:00 UTC but the rolling day holds until 00:00+1d.
        assert_eq!(denial.retry_after, Duration::from_secs(12 * 3600));

        let window = gov.window(ActionKind::Follow, at(12, 0));
        assert_eq!(window.day_used, 2);
        assert_eq!(window.day_resets_at, at(22, 0));
    }

    #[test]
    fn test_unfollow_cap_independent_of_follows() {
        let mut l = limits();
        l.max_actions_per_hour = 100;
        l.min_action_spacing_seconds = 0;
        l.max_daily_unfollows = 1;
        let mut gov = RateGovernor::with_seed(l, utc(), 1).unwrap();
        gov.try_acquire(ActionKind::Unfollow, at(8, 0)).unwrap();
        assert_eq!(
            gov.check(ActionKind::Unfollow, at(8, 1)).unwrap_err().reason,
            DenialReason::DailyQuotaExceeded
        );
        assert!(gov.try_acquire(ActionKind::Follow, at(8, 1)).is_ok());
    }

    #[test]
    fn test_rest_window_wrapping_midnight() {
        let mut l = limits();
        l.rest_window = Some(RestWindow {
            start: "23:00".into(),
            end: "07:00".into(),
        });
        let mut gov = RateGovernor::with_seed(l, utc(), 1).unwrap();
        let denial = gov.try_acquire(ActionKind::Follow, at(3, 30)).unwrap_err();
        assert_eq!(denial.reason, DenialReason::RestWindowActive);
        assert_eq!(denial.retry_after, Duration::from_secs(3 * 3600 + 30 * 60));
        assert_eq!(
            gov.check(ActionKind::VerifyFollowBack, at(23, 30)).unwrap_err().reason,
            DenialReason::RestWindowActive
        );
        assert!(gov.try_acquire(ActionKind::Follow, at(7, 0)).is_ok());
    }

    #[test]
    fn test_verify_is_only_spaced() {
        let mut l = limits();
        l.max_actions_per_hour = 1;
        let mut gov = RateGovernor::with_seed(l, utc(), 1).unwrap();
        gov.try_acquire(ActionKind::Follow, at(9, 0)).unwrap();
        let permit = gov.try_acquire(ActionKind::VerifyFollowBack, at(9, 0)).unwrap();
        assert_eq!(permit.delay, Duration::ZERO);
        let denial = gov
            .try_acquire(ActionKind::VerifyFollowBack, at(9, 0) + chrono::Duration::seconds(2))
            .unwrap_err();
        assert_eq!(denial.reason, DenialReason::CooldownActive);
        assert!(gov
            .try_acquire(ActionKind::VerifyFollowBack, at(9, 0) + chrono::Duration::seconds(5))
            .is_ok());
    }

    #[test]
    fn test_check_does_not_consume() {
        let gov = RateGovernor::with_seed(limits(), utc(), 1).unwrap();
        for _ in 0..10 {
            assert!(gov.check(ActionKind::Follow, at(9, 0)).is_ok());
        }
        assert_eq!(gov.window(ActionKind::Follow, at(9, 0)).day_used, 0);
    }

    #[test]
    fn test_restore_counts_persisted_grants() {
        let mut gov = RateGovernor::with_seed(limits(), utc(), 1).unwrap();
        gov.restore(vec![
            (ActionKind::Follow, at(8, 40)),
            (ActionKind::Follow, at(8, 20)),
            (ActionKind::Unfollow, at(8, 30)),
        ]);
        let denial = gov.check(ActionKind::Follow, at(9, 0)).unwrap_err();
        assert_eq!(denial.reason, DenialReason::HourlyQuotaExceeded);
        assert_eq!(denial.retry_after, Duration::from_secs(20 * 60));
    }

    #[test]
    fn test_set_limits_keeps_counters() {
        let mut gov = RateGovernor::with_seed(limits(), utc(), 1).unwrap();
        gov.try_acquire(ActionKind::Follow, at(9, 0)).unwrap();
        let mut l = limits();
        l.max_actions_per_hour = 1;
        gov.set_limits(l).unwrap();
        assert_eq!(
            gov.check(ActionKind::Follow, at(9, 30)).unwrap_err().reason,
            DenialReason::HourlyQuotaExceeded
        );
    }
}
