// Rate governor caps under randomized request schedules

use chrono::{DateTime, Duration, FixedOffset, TimeZone, Utc};
use follow_cycle::config::LimitsConfig;
use follow_cycle::engine::RateGovernor;
use follow_cycle::store::ActionKind;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn limits() -> LimitsConfig {
    LimitsConfig {
        max_daily_follows: 15,
        max_daily_unfollows: 8,
        max_actions_per_hour: 4,
        min_delay_seconds: 0,
        max_delay_seconds: 0,
        min_action_spacing_seconds: 0,
        verify_spacing_seconds: 0,
        rest_window: None,
    }
}

/// Drive the governor with random requests over three days and return every grant.
fn run_schedule(seed: u64, offset: FixedOffset) -> Vec<(ActionKind, DateTime<Utc>)> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut governor = RateGovernor::with_seed(limits(), offset, seed).unwrap();
    let mut now = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
    let end = now + Duration::days(3);
    let mut grants = Vec::new();
    while now < end {
        now += Duration::seconds(rng.gen_range(1..900));
        let kind = if rng.gen_bool(0.7) {
            ActionKind::Follow
        } else {
            ActionKind::Unfollow
        };
        if let Ok(permit) = governor.try_acquire(kind, now) {
            grants.push((kind, permit.granted_at));
        }
    }
    grants
}

fn in_window(
    grants: &[(ActionKind, DateTime<Utc>)],
    end: DateTime<Utc>,
    span: Duration,
    matches: impl Fn(ActionKind) -> bool,
) -> usize {
    grants
        .iter()
        .filter(|(k, at)| matches(*k) && *at > end - span && *at <= end)
        .count()
}

#[test]
fn test_rolling_windows_never_exceed_caps() {
    let limits = limits();
    for seed in 0..20 {
        let grants = run_schedule(seed, FixedOffset::east_opt(0).unwrap());
        assert!(!grants.is_empty());
        for (_, at) in &grants {
            let hour = in_window(&grants, *at, Duration::hours(1), |_| true);
            assert!(hour as u32 <= limits.max_actions_per_hour, "seed {} hour ending {}: {}", seed, at, hour);
            let follows = in_window(&grants, *at, Duration::hours(24), |k| k == ActionKind::Follow);
            assert!(follows as u32 <= limits.max_daily_follows, "seed {} day ending {}: {}", seed, at, follows);
            let unfollows = in_window(&grants, *at, Duration::hours(24), |k| k == ActionKind::Unfollow);
            assert!(unfollows as u32 <= limits.max_daily_unfollows);
        }
    }
}

#[test]
fn test_calendar_days_respect_local_offset() {
    let limits = limits();
    let offset = FixedOffset::east_opt(5 * 3600 + 30 * 60).unwrap();
    for seed in 100..110 {
        let grants = run_schedule(seed, offset);
        let mut per_day = std::collections::HashMap::new();
        for (kind, at) in &grants {
            if *kind == ActionKind::Follow {
                *per_day.entry(at.with_timezone(&offset).date_naive()).or_insert(0u32) += 1;
            }
        }
        for (day, n) in per_day {
            assert!(n <= limits.max_daily_follows, "seed {} local day {}: {}", seed, day, n);
        }
    }
}

#[test]
fn test_restored_grants_keep_counting() {
    let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 30, 0).unwrap();
    let offset = FixedOffset::east_opt(0).unwrap();
    let mut governor = RateGovernor::with_seed(limits(), offset, 1).unwrap();
    governor.restore((0..4).map(|i| (ActionKind::Follow, now - Duration::minutes(10 * i + 1))));

    let denial = governor.try_acquire(ActionKind::Unfollow, now).unwrap_err();
    assert!(denial.retry_after.as_secs() > 0);
    // Verification is spacing-only and ignores the hourly cap.
    assert!(governor.try_acquire(ActionKind::VerifyFollowBack, now).is_ok());
}
