//! Periodic driver. Every device-touching task goes through one lock, so the
//! scheduler loop and manual runs never interleave on the device.

pub mod control;
pub mod task;

pub use control::{RunControl, RunState};
pub use task::{Cadence, ScheduledTask, TaskKind, TaskRun, TaskStatus};

use crate::clock::Clock;
use crate::config::{Config, ConfigWatcher};
use crate::engine::governor::{self, SharedGovernor};
use crate::engine::ReciprocationTracker;
use crate::error::{BotError, BotResult};
use crate::execution::{ActionExecutor, BatchReport};
use crate::report::{self, HealthReport};
use crate::store::Store;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;

/// The single device worker.
pub type DeviceLock = Arc<tokio::sync::Mutex<ActionExecutor>>;

/// Device tasks are parked while this is set.
#[derive(Debug, Clone, Serialize)]
pub struct Suspension {
    pub since: DateTime<Utc>,
    pub reason: String,
    pub last_attempt: DateTime<Utc>,
}

pub struct TaskScheduler {
    tasks: Vec<ScheduledTask>,
    executor: DeviceLock,
    tracker: ReciprocationTracker,
    governor: SharedGovernor,
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    control: RunControl,
    config: Config,
    watcher: Option<ConfigWatcher>,
    suspension: Option<Suspension>,
    last_health: Option<HealthReport>,
}

impl TaskScheduler {
    /// Register every task and pick up persisted schedule state.
    pub fn new(
        executor: ActionExecutor,
        governor: SharedGovernor,
        store: Arc<Store>,
        clock: Arc<dyn Clock>,
        control: RunControl,
        config: Config,
    ) -> BotResult<Self> {
        let now = clock.now();
        let offset = config.local_offset();
        let rows = store.load_tasks()?;
        let mut tasks = Vec::with_capacity(TaskKind::ALL.len());
        for kind in TaskKind::ALL {
            let mut task = ScheduledTask::new(kind, kind.cadence(&config.schedule)?, now, offset);
            if let Some(row) = rows.iter().find(|r| r.name == kind.name()) {
                task.restore(row);
            }
            tasks.push(task);
        }
        Ok(Self {
            tasks,
            executor: Arc::new(tokio::sync::Mutex::new(executor)),
            tracker: ReciprocationTracker::new(store.clone(), &config.tracking),
            governor,
            store,
            clock,
            control,
            config,
            watcher: None,
            suspension: None,
            last_health: None,
        })
    }

    /// Re-read the config file on every tick when it changed.
    pub fn with_watcher(mut self, watcher: ConfigWatcher) -> Self {
        self.watcher = Some(watcher);
        self
    }

    pub fn tasks(&self) -> &[ScheduledTask] {
        &self.tasks
    }

    pub fn suspension(&self) -> Option<&Suspension> {
        self.suspension.as_ref()
    }

    pub fn is_suspended(&self) -> bool {
        self.suspension.is_some()
    }

    pub fn last_health(&self) -> Option<&HealthReport> {
        self.last_health.as_ref()
    }

    pub fn control(&self) -> &RunControl {
        &self.control
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn governor(&self) -> SharedGovernor {
        self.governor.clone()
    }

    pub fn executor(&self) -> DeviceLock {
        self.executor.clone()
    }

    /// Initial connect. An unreachable device only suspends device tasks; a
    /// missing client app is a startup error.
    pub async fn start(&mut self) -> BotResult<()> {
        let executor = self.executor.clone();
        let result = executor.lock().await.connect().await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_device_fatal() => {
                self.suspend(e.to_string());
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// One pass of the loop: reload config, maybe reconnect, run what is due.
    pub async fn tick(&mut self) -> Vec<TaskRun> {
        if let Some(config) = self.watcher.as_mut().and_then(|w| w.poll()) {
            self.apply_config(config).await;
        }
        let mut runs = Vec::new();
        if !self.control.is_running() {
            return runs;
        }
        self.try_resume_device().await;

        let now = self.clock.now();
        let mut due: Vec<usize> = (0..self.tasks.len())
            .filter(|&i| self.tasks[i].is_due(now))
            .collect();
        due.sort_by_key(|&i| (self.tasks[i].next_eligible, i));

        for i in due {
            if !self.control.is_running() {
                break;
            }
            let kind = self.tasks[i].kind;
            if self.blocked_by_suspension(kind) {
                let at = self.clock.now();
                let retry = at + self.backoff();
                let status = TaskStatus::Skipped("device suspended".to_string());
                let task = &mut self.tasks[i];
                task.next_eligible = retry;
                task.last_status = Some(status.label());
                self.persist(i);
                runs.push(TaskRun { kind, status, at, manual: false });
                continue;
            }

            let status = self.run_task(kind).await;
            let finished = self.clock.now();
            let offset = self.config.local_offset();
            let task = &mut self.tasks[i];
            let mut next = task.cadence.next_after(finished, offset);
            if let TaskStatus::Deferred { denial, .. } = &status {
                let retry = finished + to_chrono(denial.retry_after);
                next = next.max(retry);
            }
            task.last_run = Some(finished);
            task.next_eligible = next;
            record_status(task, &status);
            self.persist(i);
            runs.push(TaskRun { kind, status, at: finished, manual: false });
        }
        runs
    }

    /// Run a task right away. The regular schedule is left as it was.
    pub async fn run_now(&mut self, name: &str) -> BotResult<TaskRun> {
        let i = self.index_of(name)?;
        let kind = self.tasks[i].kind;
        let status = if self.control.is_stopping() {
            TaskStatus::Skipped("stopping".to_string())
        } else if self.blocked_by_suspension(kind) {
            TaskStatus::Skipped("device suspended".to_string())
        } else {
            self.run_task(kind).await
        };
        record_status(&mut self.tasks[i], &status);
        self.persist(i);
        tracing::info!(task = %kind, status = %status.label(), "manual run");
        Ok(TaskRun {
            kind,
            status,
            at: self.clock.now(),
            manual: true,
        })
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> BotResult<()> {
        let i = self.index_of(name)?;
        self.tasks[i].enabled = enabled;
        self.store.save_task(&self.tasks[i].to_row())?;
        tracing::info!(task = name, enabled, "task toggled");
        Ok(())
    }

    /// Push a new configuration into every component. Quota counters survive.
    pub async fn apply_config(&mut self, config: Config) {
        let offset = config.local_offset();
        {
            let mut gov = governor::lock(&self.governor);
            if let Err(e) = gov.set_limits(config.limits.clone()) {
                tracing::warn!(error = %e, "new limits rejected, keeping the old ones");
            }
            gov.set_offset(offset);
        }
        self.executor.lock().await.apply_config(&config);
        self.tracker.apply_config(&config.tracking);

        let now = self.clock.now();
        for task in &mut self.tasks {
            let cadence = match task.kind.cadence(&config.schedule) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(task = %task.kind, error = %e, "cadence unchanged");
                    continue;
                }
            };
            if cadence != task.cadence {
                task.cadence = cadence;
                task.next_eligible = match task.last_run {
                    Some(last) => cadence.next_after(last, offset),
                    None => cadence.first_eligible(now, offset),
                };
                tracing::info!(task = %task.kind, cadence = %cadence, "cadence changed");
            }
        }
        self.config = config;
    }

    fn blocked_by_suspension(&self, kind: TaskKind) -> bool {
        self.suspension.is_some() && kind.uses_device() && kind != TaskKind::Reconnect
    }

    fn index_of(&self, name: &str) -> BotResult<usize> {
        TaskKind::from_name(name)
            .and_then(|kind| self.tasks.iter().position(|t| t.kind == kind))
            .ok_or_else(|| BotError::Config(format!("unknown task {:?}", name)))
    }

    fn backoff(&self) -> Duration {
        Duration::seconds(self.config.schedule.reconnect_backoff_seconds.max(1) as i64)
    }

    fn persist(&self, i: usize) {
        if let Err(e) = self.store.save_task(&self.tasks[i].to_row()) {
            tracing::error!(task = %self.tasks[i].kind, error = %e, "failed to persist task state");
        }
    }

    fn suspend(&mut self, reason: String) {
        let now = self.clock.now();
        tracing::error!(reason = %reason, "device tasks suspended");
        match &mut self.suspension {
            Some(s) => {
                s.reason = reason;
                s.last_attempt = now;
            }
            None => {
                self.suspension = Some(Suspension {
                    since: now,
                    reason,
                    last_attempt: now,
                })
            }
        }
    }

    async fn try_resume_device(&mut self) {
        let now = self.clock.now();
        let backoff = self.backoff();
        match &mut self.suspension {
            Some(s) if now - s.last_attempt >= backoff => s.last_attempt = now,
            _ => return,
        }
        let executor = self.executor.clone();
        let result = executor.lock().await.relaunch().await;
        match result {
            Ok(info) => {
                tracing::info!(serial = %info.serial, "device back, resuming device tasks");
                self.suspension = None;
            }
            Err(e) => {
                tracing::warn!(error = %e, "reconnect failed");
                if let Some(s) = &mut self.suspension {
                    s.reason = e.to_string();
                }
            }
        }
    }

    async fn run_task(&mut self, kind: TaskKind) -> TaskStatus {
        match self.execute(kind).await {
            Ok(status) => status,
            Err(e) => {
                if e.is_device_fatal() {
                    self.suspend(e.to_string());
                } else {
                    tracing::error!(task = %kind, error = %e, "task failed");
                }
                TaskStatus::Failed(e.to_string())
            }
        }
    }

    async fn execute(&mut self, kind: TaskKind) -> BotResult<TaskStatus> {
        let schedule = &self.config.schedule;
        let (follows, unfollows, verifies) = (
            schedule.follows_per_batch,
            schedule.unfollows_per_batch,
            schedule.verify_batch_size,
        );
        let executor = self.executor.clone();
        match kind {
            TaskKind::FollowBatch => {
                let report = executor.lock().await.follow_batch(follows, &self.control).await?;
                Ok(batch_status("followed", report))
            }
            TaskKind::UnfollowBatch => {
                let report = executor.lock().await.unfollow_batch(unfollows, &self.control).await?;
                Ok(batch_status("unfollowed", report))
            }
            TaskKind::VerifyFollowBacks => {
                let mut exec = executor.lock().await;
                let clock = self.clock.clone();
                let report = self
                    .tracker
                    .verify_batch(&mut *exec, move || clock.now(), verifies, &self.control)
                    .await?;
                let summary = format!(
                    "{} checked, {} confirmed, {} expired, {} pending",
                    report.evaluated, report.confirmed, report.expired, report.pending
                );
                Ok(match report.deferred {
                    Some(denial) => TaskStatus::Deferred { summary, denial },
                    None => TaskStatus::Ok(summary),
                })
            }
            TaskKind::Reconnect => {
                let info = executor.lock().await.relaunch().await?;
                if self.suspension.take().is_some() {
                    tracing::info!(serial = %info.serial, "device back, resuming device tasks");
                }
                Ok(TaskStatus::Ok(format!(
                    "{} {}x{}",
                    info.serial, info.width, info.height
                )))
            }
            TaskKind::HealthCheck => {
                let now = self.clock.now();
                let health = report::health(
                    &self.store,
                    &self.governor,
                    now,
                    self.config.local_offset(),
                    self.suspension.is_some(),
                )?;
                for warning in &health.warnings {
                    tracing::warn!(warning = %warning, "health check");
                }
                let summary = if health.is_healthy() {
                    format!("healthy, {} follows in the last hour", health.follows_last_hour)
                } else {
                    health.warnings.join("; ")
                };
                self.last_health = Some(health);
                Ok(TaskStatus::Ok(summary))
            }
            TaskKind::DailyReport => {
                let now = self.clock.now();
                let daily = report::daily(&self.store, now, self.config.local_offset())?;
                tracing::info!("{}", daily);
                let summary = format!(
                    "{} follows, {} unfollows, {} confirmed",
                    daily.follows, daily.unfollows, daily.confirmations
                );
                let pruned = self.store.prune_grants(now - Duration::hours(24))?;
                tracing::debug!(pruned, "old quota grants pruned");
                Ok(TaskStatus::Ok(summary))
            }
        }
    }
}

fn batch_status(verb: &str, report: BatchReport) -> TaskStatus {
    let mut summary = format!(
        "{} attempted, {} {}, {} not found",
        report.attempted, report.succeeded, verb, report.not_found
    );
    if report.interrupted {
        summary.push_str(", interrupted");
    }
    match report.deferred {
        Some(denial) => TaskStatus::Deferred { summary, denial },
        None => TaskStatus::Ok(summary),
    }
}

fn record_status(task: &mut ScheduledTask, status: &TaskStatus) {
    task.last_status = Some(status.label());
    task.last_error = match status {
        TaskStatus::Failed(e) => Some(e.clone()),
        _ => None,
    };
}

fn to_chrono(d: std::time::Duration) -> Duration {
    Duration::from_std(d).unwrap_or_else(|_| Duration::days(365))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::device::sim::{SimDevice, SimScript};
    use crate::engine::{RateGovernor, TapJitter};
    use crate::store::{ActionKind, TargetState};
    use chrono::TimeZone;
    use std::sync::Mutex;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn fast_config() -> Config {
        let mut config = Config::default();
        config.device.settle_ms = 0;
        config.device.launch_wait_ms = 0;
        config.limits.min_delay_seconds = 0;
        config.limits.max_delay_seconds = 0;
        config.limits.min_action_spacing_seconds = 0;
        config.limits.verify_spacing_seconds = 0;
        config.limits.max_actions_per_hour = 100;
        config
    }

    fn scheduler(script: SimScript, config: Config) -> (TaskScheduler, Arc<Store>, ManualClock) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let clock = ManualClock::new(t0());
        let governor: SharedGovernor = Arc::new(Mutex::new(
            RateGovernor::with_seed(config.limits.clone(), config.local_offset(), 7).unwrap(),
        ));
        let (device, locator) = SimDevice::new(script, 7);
        let executor = ActionExecutor::new(
            Box::new(device),
            Arc::new(locator),
            governor.clone(),
            store.clone(),
            Arc::new(clock.clone()),
            &config,
        )
        .with_jitter(TapJitter::seeded(config.vision.coordinate_variance, 7));
        let scheduler = TaskScheduler::new(
            executor,
            governor,
            store.clone(),
            Arc::new(clock.clone()),
            RunControl::new(),
            config,
        )
        .unwrap();
        (scheduler, store, clock)
    }

    #[tokio::test]
    async fn test_first_tick_runs_interval_tasks_in_order() {
        let (mut sched, store, _clock) = scheduler(SimScript::default(), fast_config());
        store.import_targets(&["alice", "bob"], t0()).unwrap();
        sched.start().await.unwrap();

        let runs = sched.tick().await;
        let kinds: Vec<_> = runs.iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TaskKind::FollowBatch,
                TaskKind::VerifyFollowBacks,
                TaskKind::UnfollowBatch,
                TaskKind::HealthCheck
            ]
        );
        assert!(matches!(&runs[0].status, TaskStatus::Ok(s) if s.starts_with("2 attempted, 2 followed")));
        assert_eq!(
            store.target("bob").unwrap().unwrap().state,
            TargetState::Followed
        );

        // Nothing is due again until the follow interval passes.
        assert!(sched.tick().await.is_empty());
    }

    #[tokio::test]
    async fn test_schedule_survives_restart() {
        let (mut sched, store, clock) = scheduler(SimScript::default(), fast_config());
        sched.tick().await;
        let next = sched.tasks()[0].next_eligible;
        assert_eq!(next, t0() + Duration::minutes(5));

        let rows = store.load_tasks().unwrap();
        let follow = rows.iter().find(|r| r.name == "follow_batch").unwrap();
        assert_eq!(follow.next_eligible, Some(next));
        assert!(follow.last_status.as_deref().unwrap().starts_with("ok:"));

        sched.set_enabled("unfollow_batch", false).unwrap();
        clock.advance(Duration::hours(3));
        let runs = sched.tick().await;
        assert!(runs.iter().all(|r| r.kind != TaskKind::UnfollowBatch));
        assert!(!store
            .load_tasks()
            .unwrap()
            .iter()
            .find(|r| r.name == "unfollow_batch")
            .unwrap()
            .enabled);
    }

    #[tokio::test]
    async fn test_hourly_deferral_pushes_next_run_out() {
        let mut config = fast_config();
        config.limits.max_actions_per_hour = 1;
        let (mut sched, store, _clock) = scheduler(SimScript::default(), config);
        store.import_targets(&["a", "b"], t0()).unwrap();

        let runs = sched.tick().await;
        let TaskStatus::Deferred { denial, .. } = &runs[0].status else {
            panic!("expected deferral, got {:?}", runs[0].status);
        };
        assert!(denial.retry_after.as_secs() > 0);
        // Hourly window resets at 13:00, later than the 5 minute cadence.
        assert_eq!(
            sched.tasks()[0].next_eligible,
            Utc.with_ymd_and_hms(2025, 3, 1, 13, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_run_now_leaves_schedule_alone() {
        let (mut sched, store, _clock) = scheduler(SimScript::default(), fast_config());
        store.import_targets(&["a"], t0()).unwrap();
        let before = sched.tasks()[0].clone();

        let run = sched.run_now("follow_batch").await.unwrap();
        assert!(run.manual);
        assert!(matches!(run.status, TaskStatus::Ok(_)));
        let after = &sched.tasks()[0];
        assert_eq!(after.last_run, before.last_run);
        assert_eq!(after.next_eligible, before.next_eligible);
        assert!(after.last_status.is_some());

        assert!(sched.run_now("nope").await.is_err());
    }

    #[tokio::test]
    async fn test_daily_report_prunes_old_grants() {
        let (mut sched, store, _clock) = scheduler(SimScript::default(), fast_config());
        store.record_grant(ActionKind::Follow, t0() - Duration::hours(30)).unwrap();
        store.record_grant(ActionKind::Unfollow, t0() - Duration::hours(1)).unwrap();

        let run = sched.run_now("daily_report").await.unwrap();
        assert!(matches!(run.status, TaskStatus::Ok(_)), "{:?}", run.status);
        let left = store.grants_since(t0() - Duration::days(7)).unwrap();
        assert_eq!(left, vec![(ActionKind::Unfollow, t0() - Duration::hours(1))]);
    }

    #[tokio::test]
    async fn test_paused_scheduler_runs_nothing() {
        let (mut sched, store, _clock) = scheduler(SimScript::default(), fast_config());
        store.import_targets(&["a"], t0()).unwrap();
        sched.control().pause();
        assert!(sched.tick().await.is_empty());
        sched.control().resume();
        assert!(!sched.tick().await.is_empty());
    }

    #[tokio::test]
    async fn test_config_reload_changes_cadence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("follow-cycle.toml");
        let (sched, _store, _clock) = scheduler(SimScript::default(), fast_config());
        let mut sched = sched.with_watcher(ConfigWatcher::new(&path));
        sched.tick().await;
        assert_eq!(sched.tasks()[0].next_eligible, t0() + Duration::minutes(5));

        std::fs::write(&path, "[schedule]\nfollowIntervalMinutes = 30\n").unwrap();
        sched.tick().await;
        assert_eq!(sched.config().schedule.follow_interval_minutes, 30);
        assert_eq!(sched.tasks()[0].cadence, Cadence::Every(Duration::minutes(30)));
        assert_eq!(sched.tasks()[0].next_eligible, t0() + Duration::minutes(30));
    }
}
