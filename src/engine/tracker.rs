//! Multi-day reciprocation tracking.
//!
//! A followed target matures for `maturation_window_hours` before anyone
//! looks at it. After that each device check either confirms the follow-back
//! or, once maturation plus grace has elapsed, expires the target so the
//! unfollow batch can pick it up.

use super::governor::Denial;
use crate::config::TrackingConfig;
use crate::error::BotResult;
use crate::scheduler::control::RunControl;
use crate::store::{ActionKind, Store, Target, TargetState};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;

/// Result of looking for the follow-back marker on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowBackCheck {
    Confirmed,
    /// Profile header seen, no badge.
    NotYet,
    /// The profile could not be read; says nothing about the follow-back.
    Inconclusive,
    Deferred(Denial),
}

/// Whatever can open a profile and look for the "follows you" marker.
#[async_trait]
pub trait FollowBackProbe: Send {
    async fn check_follow_back(&mut self, target: &Target) -> BotResult<FollowBackCheck>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Wait {
    Maturing { matures_at: DateTime<Utc> },
    RecentlyChecked,
    NoMarker,
    Unreadable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    /// Target is not in Followed; nothing to do.
    Ignored,
    NotYet(Wait),
    Confirmed,
    Expired,
    Deferred(Denial),
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct VerifyReport {
    pub evaluated: u32,
    pub confirmed: u32,
    pub expired: u32,
    pub pending: u32,
    #[serde(skip)]
    pub deferred: Option<Denial>,
}

pub struct ReciprocationTracker {
    store: Arc<Store>,
    maturation: Duration,
    grace: Duration,
    recheck: Duration,
}

impl ReciprocationTracker {
    pub fn new(store: Arc<Store>, config: &TrackingConfig) -> Self {
        let mut tracker = Self {
            store,
            maturation: Duration::zero(),
            grace: Duration::zero(),
            recheck: Duration::zero(),
        };
        tracker.apply_config(config);
        tracker
    }

    pub fn apply_config(&mut self, config: &TrackingConfig) {
        self.maturation = Duration::hours(config.maturation_window_hours as i64);
        self.grace = Duration::hours(config.unfollow_grace_hours as i64);
        self.recheck = Duration::minutes(config.recheck_minutes as i64);
    }

    pub fn maturation(&self) -> Duration {
        self.maturation
    }

    /// Advance one target. Only Followed targets past maturation ever reach
    /// the device; everything else is answered from the store.
    pub async fn evaluate(
        &self,
        target: &Target,
        now: DateTime<Utc>,
        probe: &mut dyn FollowBackProbe,
    ) -> BotResult<Evaluation> {
        if target.state != TargetState::Followed {
            return Ok(Evaluation::Ignored);
        }
        let Some(followed_at) = target.followed_at else {
            tracing::warn!(handle = %target.handle, "followed target without followed_at");
            return Ok(Evaluation::Ignored);
        };

        let matures_at = followed_at + self.maturation;
        if now < matures_at {
            return Ok(Evaluation::NotYet(Wait::Maturing { matures_at }));
        }

        if let Some(last) = self.store.last_action(target.id, ActionKind::VerifyFollowBack)? {
            if now - last.at < self.recheck {
                return Ok(Evaluation::NotYet(Wait::RecentlyChecked));
            }
        }

        match probe.check_follow_back(target).await? {
            FollowBackCheck::Deferred(denial) => Ok(Evaluation::Deferred(denial)),
            FollowBackCheck::Confirmed => {
                self.store
                    .transition(target.id, TargetState::Followed, TargetState::BackfillConfirmed, now)?;
                tracing::info!(handle = %target.handle, "follow-back confirmed");
                Ok(Evaluation::Confirmed)
            }
            FollowBackCheck::NotYet if now - followed_at >= self.maturation + self.grace => {
                self.store
                    .transition(target.id, TargetState::Followed, TargetState::Expired, now)?;
                tracing::info!(handle = %target.handle, "no follow-back, expired");
                Ok(Evaluation::Expired)
            }
            FollowBackCheck::NotYet => Ok(Evaluation::NotYet(Wait::NoMarker)),
            FollowBackCheck::Inconclusive => {
                tracing::debug!(handle = %target.handle, "profile unreadable, keeping target");
                Ok(Evaluation::NotYet(Wait::Unreadable))
            }
        }
    }

    /// Evaluate up to `limit` matured targets, oldest follow first. Stops on a
    /// deferral or when the run is paused; device loss aborts the batch.
    pub async fn verify_batch(
        &self,
        probe: &mut dyn FollowBackProbe,
        now: impl Fn() -> DateTime<Utc>,
        limit: u32,
        control: &RunControl,
    ) -> BotResult<VerifyReport> {
        let cutoff = now() - self.maturation;
        let due = self.store.matured_followed(cutoff, limit)?;
        let mut report = VerifyReport::default();
        for target in due {
            if !control.is_running() {
                break;
            }
            let outcome = self.evaluate(&target, now(), probe).await?;
            report.evaluated += 1;
            match outcome {
                Evaluation::Confirmed => report.confirmed += 1,
                Evaluation::Expired => report.expired += 1,
                Evaluation::NotYet(_) | Evaluation::Ignored => report.pending += 1,
                Evaluation::Deferred(denial) => {
                    report.evaluated -= 1;
                    report.deferred = Some(denial);
                    break;
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ActionOutcome, NewAction};
    use chrono::TimeZone;

    struct ScriptedProbe {
        answer: FollowBackCheck,
        calls: u32,
        store: Arc<Store>,
        now: DateTime<Utc>,
    }

    #[async_trait]
    impl FollowBackProbe for ScriptedProbe {
        async fn check_follow_back(&mut self, target: &Target) -> BotResult<FollowBackCheck> {
            self.calls += 1;
            self.store.record_action(&NewAction {
                target_id: target.id,
                kind: ActionKind::VerifyFollowBack,
                at: self.now,
                outcome: ActionOutcome::Success,
                latency_ms: 1,
                detail: None,
            })?;
            Ok(self.answer)
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn followed(store: &Store, handle: &str) -> Target {
        store.import_targets(&[handle], t0()).unwrap();
        let t = store.target(handle).unwrap().unwrap();
        store
            .transition(t.id, TargetState::Imported, TargetState::Followed, t0())
            .unwrap()
    }

    fn setup(answer: FollowBackCheck) -> (Arc<Store>, ReciprocationTracker, ScriptedProbe) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let tracker = ReciprocationTracker::new(store.clone(), &TrackingConfig::default());
        let probe = ScriptedProbe {
            answer,
            calls: 0,
            store: store.clone(),
            now: t0(),
        };
        (store, tracker, probe)
    }

    #[tokio::test]
    async fn test_maturing_target_never_reaches_device() {
        let (store, tracker, mut probe) = setup(FollowBackCheck::Confirmed);
        let target = followed(&store, "alice");
        let result = tracker
            .evaluate(&target, t0() + Duration::hours(23), &mut probe)
            .await
            .unwrap();
        assert_eq!(
            result,
            Evaluation::NotYet(Wait::Maturing {
                matures_at: t0() + Duration::hours(24)
            })
        );
        assert_eq!(probe.calls, 0);
        assert_eq!(store.target("alice").unwrap().unwrap().state, TargetState::Followed);
    }

    #[tokio::test]
    async fn test_confirmation_after_maturation() {
        let (store, tracker, mut probe) = setup(FollowBackCheck::Confirmed);
        let target = followed(&store, "alice");
        let now = t0() + Duration::hours(24);
        assert_eq!(
            tracker.evaluate(&target, now, &mut probe).await.unwrap(),
            Evaluation::Confirmed
        );
        let stored = store.target("alice").unwrap().unwrap();
        assert_eq!(stored.state, TargetState::BackfillConfirmed);
        assert_eq!(stored.resolved_at, Some(now));
    }

    #[tokio::test]
    async fn test_terminal_targets_are_left_alone() {
        let (store, tracker, mut probe) = setup(FollowBackCheck::Confirmed);
        let target = followed(&store, "alice");
        let later = t0() + Duration::hours(30);
        tracker.evaluate(&target, later, &mut probe).await.unwrap();

        let confirmed = store.target("alice").unwrap().unwrap();
        for _ in 0..3 {
            assert_eq!(
                tracker.evaluate(&confirmed, later, &mut probe).await.unwrap(),
                Evaluation::Ignored
            );
        }
        assert_eq!(probe.calls, 1);
        assert_eq!(store.transitions_for(target.id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_expiry_honours_grace() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let config = TrackingConfig {
            unfollow_grace_hours: 6,
            recheck_minutes: 0,
            ..TrackingConfig::default()
        };
        let tracker = ReciprocationTracker::new(store.clone(), &config);
        let mut probe = ScriptedProbe {
            answer: FollowBackCheck::NotYet,
            calls: 0,
            store: store.clone(),
            now: t0(),
        };
        let target = followed(&store, "bob");

        let inside_grace = t0() + Duration::hours(26);
        assert_eq!(
            tracker.evaluate(&target, inside_grace, &mut probe).await.unwrap(),
            Evaluation::NotYet(Wait::NoMarker)
        );
        let past_grace = t0() + Duration::hours(30);
        assert_eq!(
            tracker.evaluate(&target, past_grace, &mut probe).await.unwrap(),
            Evaluation::Expired
        );
        assert_eq!(store.target("bob").unwrap().unwrap().state, TargetState::Expired);
    }

    #[tokio::test]
    async fn test_unreadable_profile_never_expires() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let config = TrackingConfig {
            recheck_minutes: 0,
            ..TrackingConfig::default()
        };
        let tracker = ReciprocationTracker::new(store.clone(), &config);
        let mut probe = ScriptedProbe {
            answer: FollowBackCheck::Inconclusive,
            calls: 0,
            store: store.clone(),
            now: t0(),
        };
        let target = followed(&store, "dana");

        for hours in [25, 48, 200] {
            let outcome = tracker
                .evaluate(&target, t0() + Duration::hours(hours), &mut probe)
                .await
                .unwrap();
            assert_eq!(outcome, Evaluation::NotYet(Wait::Unreadable));
        }
        assert_eq!(probe.calls, 3);
        assert_eq!(store.target("dana").unwrap().unwrap().state, TargetState::Followed);
    }

    #[tokio::test]
    async fn test_recent_check_is_not_repeated() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let config = TrackingConfig {
            unfollow_grace_hours: 48,
            ..TrackingConfig::default()
        };
        let tracker = ReciprocationTracker::new(store.clone(), &config);
        let check_at = t0() + Duration::hours(25);
        let mut probe = ScriptedProbe {
            answer: FollowBackCheck::NotYet,
            calls: 0,
            store: store.clone(),
            now: check_at,
        };
        let target = followed(&store, "carol");

        tracker.evaluate(&target, check_at, &mut probe).await.unwrap();
        let again = tracker
            .evaluate(&target, check_at + Duration::minutes(30), &mut probe)
            .await
            .unwrap();
        assert_eq!(again, Evaluation::NotYet(Wait::RecentlyChecked));
        assert_eq!(probe.calls, 1);
    }

    #[tokio::test]
    async fn test_batch_only_picks_matured_targets() {
        let (store, tracker, mut probe) = setup(FollowBackCheck::Confirmed);
        followed(&store, "old");
        store.import_targets(&["fresh"], t0()).unwrap();
        let fresh = store.target("fresh").unwrap().unwrap();
        store
            .transition(fresh.id, TargetState::Imported, TargetState::Followed, t0() + Duration::hours(20))
            .unwrap();

        let now = t0() + Duration::hours(25);
        let report = tracker
            .verify_batch(&mut probe, || now, 10, &RunControl::new())
            .await
            .unwrap();
        assert_eq!(report.evaluated, 1);
        assert_eq!(report.confirmed, 1);
        assert_eq!(store.target("fresh").unwrap().unwrap().state, TargetState::Followed);
    }
}
