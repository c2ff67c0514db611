use crate::clock::Clock;
use crate::config::Config;
use crate::device::guard::GuardedBridge;
use crate::device::{DeviceBridge, DeviceInfo, Frame, Key};
use crate::engine::governor::{self, Denial, Permit, SharedGovernor};
use crate::engine::tracker::{FollowBackCheck, FollowBackProbe};
use crate::engine::{InFlightRegistry, TapJitter};
use crate::error::{BotError, BotResult};
use crate::scheduler::control::RunControl;
use crate::store::{ActionKind, ActionOutcome, NewAction, Store, Target, TargetState};
use crate::vision::{ControlKind, ControlLocator, Match};
use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The parts of the configuration the executor reads on every action.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub app_package: String,
    pub launch_wait: Duration,
    pub settle: Duration,
    pub first_result: [f64; 2],
    pub min_confidence: f32,
    pub locate_attempts: u32,
    pub verify_retries: u32,
    pub screenshot_dir: Option<PathBuf>,
    pub max_retries: u32,
}

impl ExecutorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            app_package: config.device.app_package.clone(),
            launch_wait: Duration::from_millis(config.device.launch_wait_ms),
            settle: Duration::from_millis(config.device.settle_ms),
            first_result: config.device.first_result,
            min_confidence: config.vision.min_confidence,
            locate_attempts: config.vision.locate_attempts.max(1),
            verify_retries: config.vision.verify_retries,
            screenshot_dir: config.vision.screenshot_dir.as_ref().map(PathBuf::from),
            max_retries: config.tracking.max_retries.max(1),
        }
    }
}

/// What happened to one follow or unfollow request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionResult {
    /// Target moved on. `already` when the UI showed the end state before any tap.
    Done { already: bool },
    /// Control missing or the tap did not stick. `parked` once the target hit Failed.
    NotFound { retries: u32, parked: bool },
    /// Governor said no; nothing touched the device and nothing was recorded.
    Deferred(Denial),
    /// Wrong state or another action on the same target is running.
    Skipped(&'static str),
    /// Stop requested while waiting out the permit delay.
    Interrupted,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct BatchReport {
    pub attempted: u32,
    pub succeeded: u32,
    pub not_found: u32,
    pub skipped: u32,
    pub interrupted: bool,
    #[serde(skip)]
    pub deferred: Option<Denial>,
}

/// Runs follow, unfollow and follow-back checks against the device.
///
/// Lives behind the scheduler's device lock, so at most one sequence touches
/// the device at a time.
pub struct ActionExecutor {
    bridge: GuardedBridge,
    locator: Arc<dyn ControlLocator>,
    governor: SharedGovernor,
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    jitter: TapJitter,
    in_flight: InFlightRegistry,
    settings: ExecutorSettings,
    device: Option<DeviceInfo>,
    last_frame: Option<Arc<Frame>>,
}

impl ActionExecutor {
    pub fn new(
        bridge: Box<dyn DeviceBridge>,
        locator: Arc<dyn ControlLocator>,
        governor: SharedGovernor,
        store: Arc<Store>,
        clock: Arc<dyn Clock>,
        config: &Config,
    ) -> Self {
        Self {
            bridge: GuardedBridge::new(bridge, config.command_timeout()),
            locator,
            governor,
            store,
            clock,
            jitter: TapJitter::new(config.vision.coordinate_variance),
            in_flight: InFlightRegistry::new(),
            settings: ExecutorSettings::from_config(config),
            device: None,
            last_frame: None,
        }
    }

    /// Replace the jitter source, e.g. with a seeded one.
    pub fn with_jitter(mut self, jitter: TapJitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn apply_config(&mut self, config: &Config) {
        self.settings = ExecutorSettings::from_config(config);
        self.bridge.set_timeout(config.command_timeout());
        self.jitter.set_variance(config.vision.coordinate_variance);
    }

    pub fn device(&self) -> Option<&DeviceInfo> {
        self.device.as_ref()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.count()
    }

    /// Attach to the device and make sure the client is installed.
    pub async fn connect(&mut self) -> BotResult<DeviceInfo> {
        let info = self.bridge.connect().await?;
        let package = self.settings.app_package.clone();
        if !self.bridge.is_installed(&package).await? {
            return Err(BotError::Config(format!(
                "{} is not installed on {}",
                package, info.serial
            )));
        }
        tracing::info!(serial = %info.serial, width = info.width, height = info.height, "device ready");
        self.device = Some(info.clone());
        Ok(info)
    }

    /// Reconnect and restart the client from a clean state.
    pub async fn relaunch(&mut self) -> BotResult<DeviceInfo> {
        let info = self.connect().await?;
        let package = self.settings.app_package.clone();
        self.bridge.kill_app(&package).await?;
        self.bridge.launch_app(&package).await?;
        tokio::time::sleep(self.settings.launch_wait).await;
        Ok(info)
    }

    pub async fn follow(&mut self, target: &Target, control: &RunControl) -> BotResult<ActionResult> {
        if target.state != TargetState::Imported {
            return Ok(ActionResult::Skipped("not imported"));
        }
        self.guarded(target, ActionKind::Follow, control).await
    }

    pub async fn unfollow(&mut self, target: &Target, control: &RunControl) -> BotResult<ActionResult> {
        if target.state != TargetState::Expired {
            return Ok(ActionResult::Skipped("not expired"));
        }
        self.guarded(target, ActionKind::Unfollow, control).await
    }

    /// Open the profile and look for the "follows you" marker.
    pub async fn check_follow_back(&mut self, target: &Target) -> BotResult<FollowBackCheck> {
        if !self
            .in_flight
            .try_register(target.id, &target.handle, ActionKind::VerifyFollowBack)
        {
            return Ok(FollowBackCheck::Inconclusive);
        }
        let result = self.run_check(target).await;
        self.in_flight.complete(target.id);
        result
    }

    pub async fn follow_batch(&mut self, limit: u32, control: &RunControl) -> BotResult<BatchReport> {
        let queue = self.store.follow_candidates(limit)?;
        self.run_batch(queue, ActionKind::Follow, control).await
    }

    pub async fn unfollow_batch(&mut self, limit: u32, control: &RunControl) -> BotResult<BatchReport> {
        let queue = self.store.targets_in_state(TargetState::Expired, limit)?;
        self.run_batch(queue, ActionKind::Unfollow, control).await
    }

    /// Work through `queue` until it is empty, the governor defers, or the run
    /// stops. A lost device aborts the batch with the error.
    async fn run_batch(
        &mut self,
        queue: Vec<Target>,
        kind: ActionKind,
        control: &RunControl,
    ) -> BotResult<BatchReport> {
        let mut report = BatchReport::default();
        for target in queue {
            if !control.is_running() {
                report.interrupted = true;
                break;
            }
            let result = match kind {
                ActionKind::Unfollow => self.unfollow(&target, control).await?,
                _ => self.follow(&target, control).await?,
            };
            match result {
                ActionResult::Done { .. } => {
                    report.attempted += 1;
                    report.succeeded += 1;
                }
                ActionResult::NotFound { .. } => {
                    report.attempted += 1;
                    report.not_found += 1;
                }
                ActionResult::Skipped(_) => report.skipped += 1,
                ActionResult::Deferred(denial) => {
                    tracing::info!(
                        kind = %kind,
                        reason = %denial.reason,
                        retry_after_s = denial.retry_after.as_secs(),
                        "batch deferred"
                    );
                    report.deferred = Some(denial);
                    break;
                }
                ActionResult::Interrupted => {
                    report.interrupted = true;
                    break;
                }
            }
        }
        Ok(report)
    }

    async fn guarded(
        &mut self,
        target: &Target,
        kind: ActionKind,
        control: &RunControl,
    ) -> BotResult<ActionResult> {
        if !self.in_flight.try_register(target.id, &target.handle, kind) {
            return Ok(ActionResult::Skipped("already in flight"));
        }
        let result = self.run_action(target, kind, control).await;
        self.in_flight.complete(target.id);
        result
    }

    async fn run_action(
        &mut self,
        target: &Target,
        kind: ActionKind,
        control: &RunControl,
    ) -> BotResult<ActionResult> {
        let permit = match self.acquire(kind) {
            Ok(permit) => permit,
            Err(denial) => return Ok(ActionResult::Deferred(denial)),
        };
        if !wait_out(permit.delay, control).await {
            tracing::info!(handle = %target.handle, kind = %kind, "stopped before device contact");
            return Ok(ActionResult::Interrupted);
        }
        self.store.record_grant(kind, permit.granted_at)?;

        let started = Instant::now();
        let attempt = match kind {
            ActionKind::Unfollow => self.attempt_unfollow(&target.handle).await,
            _ => self.attempt_follow(&target.handle).await,
        };
        let home = self.leave_profile(&attempt).await;
        let result = self.conclude(target, kind, attempt, started)?;
        home?;
        Ok(result)
    }

    /// Record the attempt and move the target accordingly.
    fn conclude(
        &mut self,
        target: &Target,
        kind: ActionKind,
        attempt: BotResult<bool>,
        started: Instant,
    ) -> BotResult<ActionResult> {
        let (from, to) = match kind {
            ActionKind::Unfollow => (TargetState::Expired, TargetState::Unfollowed),
            _ => (TargetState::Imported, TargetState::Followed),
        };
        match attempt {
            Ok(already) => {
                let detail = already.then(|| match kind {
                    ActionKind::Unfollow => "already_unfollowed".to_string(),
                    _ => "already_following".to_string(),
                });
                self.record(target, kind, ActionOutcome::Success, started, detail)?;
                self.store.transition(target.id, from, to, self.clock.now())?;
                tracing::info!(handle = %target.handle, kind = %kind, already, "action succeeded");
                Ok(ActionResult::Done { already })
            }
            Err(e) if e.is_device_fatal() => {
                self.device = None;
                self.record(target, kind, ActionOutcome::Error, started, Some(e.to_string()))?;
                tracing::error!(handle = %target.handle, kind = %kind, error = %e, "device lost mid-action");
                Err(e)
            }
            Err(e) if is_attempt_failure(&e) => {
                self.save_failure_frame(&target.handle, kind);
                let outcome = match e {
                    BotError::Input(_) => ActionOutcome::Error,
                    _ => ActionOutcome::NotFound,
                };
                self.record(target, kind, outcome, started, Some(e.to_string()))?;
                let retries = self.store.bump_retries(target.id)?;
                let parked = retries >= self.settings.max_retries;
                if parked {
                    self.store
                        .transition(target.id, from, TargetState::Failed, self.clock.now())?;
                    tracing::warn!(handle = %target.handle, kind = %kind, retries, error = %e, "giving up on target");
                } else {
                    tracing::warn!(handle = %target.handle, kind = %kind, retries, error = %e, "attempt failed");
                }
                Ok(ActionResult::NotFound { retries, parked })
            }
            Err(e) => Err(e),
        }
    }

    async fn run_check(&mut self, target: &Target) -> BotResult<FollowBackCheck> {
        let permit = match self.acquire(ActionKind::VerifyFollowBack) {
            Ok(permit) => permit,
            Err(denial) => return Ok(FollowBackCheck::Deferred(denial)),
        };
        tokio::time::sleep(permit.delay).await;
        self.store.record_grant(permit.kind, permit.granted_at)?;

        let started = Instant::now();
        let attempt = self.attempt_check(&target.handle).await;
        let home = self.leave_profile(&attempt).await;
        let kind = ActionKind::VerifyFollowBack;
        let result = match attempt {
            Ok(confirmed) => {
                let detail = if confirmed { "confirmed" } else { "not_yet" };
                self.record(target, kind, ActionOutcome::Success, started, Some(detail.to_string()))?;
                tracing::debug!(handle = %target.handle, confirmed, "follow-back checked");
                if confirmed {
                    FollowBackCheck::Confirmed
                } else {
                    FollowBackCheck::NotYet
                }
            }
            Err(e) if e.is_device_fatal() => {
                self.device = None;
                self.record(target, kind, ActionOutcome::Error, started, Some(e.to_string()))?;
                return Err(e);
            }
            Err(e) if is_attempt_failure(&e) => {
                self.save_failure_frame(&target.handle, kind);
                self.record(target, kind, ActionOutcome::NotFound, started, Some(e.to_string()))?;
                tracing::warn!(handle = %target.handle, error = %e, "follow-back check inconclusive");
                FollowBackCheck::Inconclusive
            }
            Err(e) => return Err(e),
        };
        home?;
        Ok(result)
    }

    /// Governor decision. The caller persists the grant once the permit delay
    /// is over, so a stop during the wait leaves no trace across restarts.
    fn acquire(&self, kind: ActionKind) -> Result<Permit, Denial> {
        let now = self.clock.now();
        let decision = governor::lock(&self.governor).try_acquire(kind, now);
        if let Err(denial) = &decision {
            tracing::debug!(
                kind = %kind,
                reason = %denial.reason,
                retry_after_s = denial.retry_after.as_secs(),
                "permit denied"
            );
        }
        decision
    }

    fn record(
        &self,
        target: &Target,
        kind: ActionKind,
        outcome: ActionOutcome,
        started: Instant,
        detail: Option<String>,
    ) -> BotResult<()> {
        self.store.record_action(&NewAction {
            target_id: target.id,
            kind,
            at: self.clock.now(),
            outcome,
            latency_ms: started.elapsed().as_millis() as u64,
            detail,
        })?;
        Ok(())
    }

    // --- device sequences ---

    /// Returns true when the profile already showed "following".
    async fn attempt_follow(&mut self, handle: &str) -> BotResult<bool> {
        self.open_profile(handle).await?;
        let frame = self.capture().await?;
        if self.find(&frame, ControlKind::FollowingButton).await?.is_some() {
            tracing::debug!(handle, "already following");
            return Ok(true);
        }
        let follow = match self.find(&frame, ControlKind::FollowButton).await? {
            Some(m) => m,
            None => self.require(ControlKind::FollowButton).await?,
        };
        self.tap_match(&follow).await?;
        self.verify(ControlKind::FollowingButton).await?;
        Ok(false)
    }

    /// Returns true when the profile already showed "follow".
    async fn attempt_unfollow(&mut self, handle: &str) -> BotResult<bool> {
        self.open_profile(handle).await?;
        let frame = self.capture().await?;
        let following = match self.find(&frame, ControlKind::FollowingButton).await? {
            Some(m) => m,
            None => {
                if self.find(&frame, ControlKind::FollowButton).await?.is_some() {
                    tracing::debug!(handle, "not following anymore");
                    return Ok(true);
                }
                self.require(ControlKind::FollowingButton).await?
            }
        };
        self.tap_match(&following).await?;

        // Some client versions ask for confirmation, some don't.
        let frame = self.capture().await?;
        if let Some(confirm) = self.find(&frame, ControlKind::UnfollowConfirm).await? {
            self.tap_match(&confirm).await?;
        }
        self.verify(ControlKind::FollowButton).await?;
        Ok(false)
    }

    async fn attempt_check(&mut self, handle: &str) -> BotResult<bool> {
        self.open_profile(handle).await?;
        for attempt in 0..self.settings.locate_attempts {
            if attempt > 0 {
                self.settle().await;
            }
            let frame = self.capture().await?;
            if self.find(&frame, ControlKind::FollowsYouBadge).await?.is_some() {
                return Ok(true);
            }
            // The profile header is up, so a missing badge is a real "no".
            if self.find(&frame, ControlKind::FollowingButton).await?.is_some()
                || self.find(&frame, ControlKind::FollowButton).await?.is_some()
            {
                return Ok(false);
            }
        }
        Err(BotError::ElementNotFound(format!(
            "{} (profile did not load)",
            ControlKind::FollowingButton
        )))
    }

    async fn open_profile(&mut self, handle: &str) -> BotResult<()> {
        self.ensure_foreground().await?;
        self.tap_control(ControlKind::SearchTab).await?;
        self.tap_control(ControlKind::SearchField).await?;
        self.bridge.type_text(handle).await?;
        self.bridge.press_key(Key::Enter).await?;
        self.settle().await;

        let (w, h) = match &self.device {
            Some(info) => (info.width, info.height),
            None => return Err(BotError::DeviceUnavailable("no device attached".into())),
        };
        let [fx, fy] = self.settings.first_result;
        let row = ((w as f64 * fx).round() as i32, (h as f64 * fy).round() as i32);
        let (x, y) = self.jitter.apply(row);
        self.bridge.tap(x, y).await?;
        self.settle().await;
        Ok(())
    }

    async fn ensure_foreground(&mut self) -> BotResult<()> {
        if self.device.is_none() {
            self.connect().await?;
        }
        let package = self.settings.app_package.clone();
        if !self.bridge.is_app_running(&package).await? {
            tracing::info!(package = %package, "launching client");
            self.bridge.launch_app(&package).await?;
            tokio::time::sleep(self.settings.launch_wait).await;
        }
        Ok(())
    }

    /// Back to the home tab so the next sequence starts from a known screen.
    /// Skipped after a device loss; non-fatal trouble is only logged.
    async fn leave_profile(&mut self, attempt: &BotResult<bool>) -> BotResult<()> {
        if matches!(attempt, Err(e) if e.is_device_fatal()) {
            return Ok(());
        }
        let result: BotResult<()> = async {
            let frame = self.capture().await?;
            match self.find(&frame, ControlKind::HomeTab).await? {
                Some(home) => self.tap_match(&home).await,
                None => {
                    self.bridge.press_key(Key::Back).await?;
                    self.bridge.press_key(Key::Back).await
                }
            }
        }
        .await;
        match result {
            Err(e) if e.is_device_fatal() => {
                self.device = None;
                Err(e)
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not return home");
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    async fn tap_control(&mut self, kind: ControlKind) -> BotResult<()> {
        let found = self.require(kind).await?;
        self.tap_match(&found).await?;
        if let Some(expected) = kind.expected_after_tap() {
            self.verify(expected).await?;
        }
        Ok(())
    }

    async fn tap_match(&mut self, found: &Match) -> BotResult<()> {
        let (x, y) = self.jitter.apply(found.center());
        self.bridge.tap(x, y).await?;
        self.settle().await;
        Ok(())
    }

    /// Locate with bounded re-captures; absence becomes `ElementNotFound`.
    async fn require(&mut self, kind: ControlKind) -> BotResult<Match> {
        for attempt in 0..self.settings.locate_attempts {
            if attempt > 0 {
                self.settle().await;
            }
            let frame = self.capture().await?;
            if let Some(found) = self.find(&frame, kind).await? {
                return Ok(found);
            }
            tracing::debug!(control = %kind, attempt, "control not visible yet");
        }
        Err(BotError::ElementNotFound(kind.to_string()))
    }

    async fn verify(&mut self, expected: ControlKind) -> BotResult<()> {
        for attempt in 0..=self.settings.verify_retries {
            if attempt > 0 {
                self.settle().await;
            }
            let frame = self.capture().await?;
            if self.find(&frame, expected).await?.is_some() {
                return Ok(());
            }
        }
        Err(BotError::VerificationMismatch {
            expected: expected.to_string(),
        })
    }

    async fn capture(&mut self) -> BotResult<Arc<Frame>> {
        let frame = Arc::new(self.bridge.capture().await?);
        self.last_frame = Some(frame.clone());
        Ok(frame)
    }

    /// Template matching is CPU-bound; keep it off the async workers.
    async fn find(&self, frame: &Arc<Frame>, kind: ControlKind) -> BotResult<Option<Match>> {
        let locator = self.locator.clone();
        let frame = frame.clone();
        let min_confidence = self.settings.min_confidence;
        tokio::task::spawn_blocking(move || locator.locate(&frame, kind, min_confidence))
            .await
            .map_err(|e| BotError::ElementNotFound(format!("{}: matcher task failed: {}", kind, e)))
    }

    async fn settle(&self) {
        tokio::time::sleep(self.settings.settle).await;
    }

    fn save_failure_frame(&self, handle: &str, kind: ActionKind) {
        let (Some(dir), Some(frame)) = (&self.settings.screenshot_dir, &self.last_frame) else {
            return;
        };
        if let Err(e) = std::fs::create_dir_all(dir) {
            tracing::warn!(dir = %dir.display(), error = %e, "cannot create screenshot dir");
            return;
        }
        let name = format!(
            "{}-{}-{}.png",
            self.clock.now().format("%Y%m%dT%H%M%S"),
            kind,
            handle
        );
        let path = dir.join(name);
        match frame.image.save(&path) {
            Ok(()) => tracing::info!(path = %path.display(), "failure screenshot saved"),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "failure screenshot not saved"),
        }
    }
}

#[async_trait]
impl FollowBackProbe for ActionExecutor {
    async fn check_follow_back(&mut self, target: &Target) -> BotResult<FollowBackCheck> {
        ActionExecutor::check_follow_back(self, target).await
    }
}

/// Errors that count against a target rather than against the device.
fn is_attempt_failure(e: &BotError) -> bool {
    matches!(
        e,
        BotError::ElementNotFound(_) | BotError::VerificationMismatch { .. } | BotError::Input(_)
    )
}

/// Sleep for `delay` unless a stop arrives first. False when stopped.
async fn wait_out(delay: Duration, control: &RunControl) -> bool {
    if control.is_stopping() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = control.stopped() => false,
    }
}
