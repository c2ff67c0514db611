use super::{DeviceBridge, DeviceInfo, Frame, Key};
use crate::error::{BotError, BotResult};
use crate::store::normalize_handle;
use crate::vision::{BoundingBox, ControlKind, ControlLocator, Match};
use async_trait::async_trait;
use image::GrayImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

pub const SIM_WIDTH: u32 = 1080;
pub const SIM_HEIGHT: u32 = 2400;
pub const SIM_PACKAGE: &str = "com.instagram.android";

/// Behaviour knobs for the simulated client.
#[derive(Debug, Clone, Default)]
pub struct SimScript {
    /// The n-th bridge call (1-based) never returns.
    pub hang_on_call: Option<u32>,
    /// The device drops off the bus as soon as this handle is typed into search.
    pub disconnect_on_handle: Option<String>,
    /// Chance that a followed account follows back.
    pub follow_back_probability: f64,
    /// Accounts that always follow back once followed.
    pub follows_back: Vec<String>,
    /// Accounts whose profile does not exist.
    pub missing_profiles: Vec<String>,
    /// Accounts whose follow tap is swallowed by the client.
    pub unresponsive_follow: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Screen {
    Home,
    Search,
    Profile(String),
}

#[derive(Debug)]
struct SimState {
    script: SimScript,
    rng: StdRng,
    online: bool,
    app_running: bool,
    screen: Screen,
    typed: String,
    confirm_shown: bool,
    following: HashSet<String>,
    followers: HashSet<String>,
    calls: u32,
    taps: Vec<(i32, i32)>,
}

impl SimState {
    fn visible(&self, kind: ControlKind) -> bool {
        match (&self.screen, kind) {
            (_, ControlKind::HomeTab | ControlKind::SearchTab) => true,
            (Screen::Search, ControlKind::SearchField) => true,
            (Screen::Profile(h), kind) if self.profile_exists(h) => match kind {
                ControlKind::FollowButton => !self.following.contains(h),
                ControlKind::FollowingButton => self.following.contains(h),
                ControlKind::UnfollowConfirm => self.confirm_shown,
                ControlKind::FollowsYouBadge => self.followers.contains(h),
                _ => false,
            },
            _ => false,
        }
    }

    fn profile_exists(&self, handle: &str) -> bool {
        !self
            .script
            .missing_profiles
            .iter()
            .any(|m| normalize_handle(m) == handle)
    }

    fn hit(&self, x: i32, y: i32) -> Option<ControlKind> {
        // Popup sits above everything else.
        let order = [
            ControlKind::UnfollowConfirm,
            ControlKind::FollowButton,
            ControlKind::FollowingButton,
            ControlKind::SearchField,
            ControlKind::HomeTab,
            ControlKind::SearchTab,
        ];
        order.into_iter().find(|k| {
            let b = control_box(*k);
            self.visible(*k)
                && x >= b.x
                && x < b.x + b.width as i32
                && y >= b.y
                && y < b.y + b.height as i32
        })
    }

    fn apply_tap(&mut self, x: i32, y: i32) {
        self.taps.push((x, y));
        let hit = self.hit(x, y);
        if self.confirm_shown && hit != Some(ControlKind::UnfollowConfirm) {
            self.confirm_shown = false;
            return;
        }
        match hit {
            Some(ControlKind::HomeTab) => self.screen = Screen::Home,
            Some(ControlKind::SearchTab) => {
                self.screen = Screen::Search;
                self.typed.clear();
            }
            Some(ControlKind::FollowButton) => {
                if let Screen::Profile(h) = self.screen.clone() {
                    let swallowed = self
                        .script
                        .unresponsive_follow
                        .iter()
                        .any(|u| normalize_handle(u) == h);
                    if !swallowed {
                        self.following.insert(h.clone());
                        self.roll_follow_back(&h);
                    }
                }
            }
            Some(ControlKind::FollowingButton) => self.confirm_shown = true,
            Some(ControlKind::UnfollowConfirm) => {
                if let Screen::Profile(h) = &self.screen {
                    self.following.remove(h);
                }
                self.confirm_shown = false;
            }
            Some(_) => {}
            None => {
                // Anywhere else on a populated search screen opens the first result.
                if self.screen == Screen::Search && !self.typed.is_empty() {
                    self.screen = Screen::Profile(normalize_handle(&self.typed));
                }
            }
        }
    }

    fn roll_follow_back(&mut self, handle: &str) {
        let forced = self
            .script
            .follows_back
            .iter()
            .any(|f| normalize_handle(f) == handle);
        let p = self.script.follow_back_probability.clamp(0.0, 1.0);
        if forced || (p > 0.0 && self.rng.gen_bool(p)) {
            self.followers.insert(handle.to_string());
        }
    }
}

/// Fixed layout of the simulated client on a 1080x2400 screen.
pub fn control_box(kind: ControlKind) -> BoundingBox {
    let (x, y, width, height) = match kind {
        ControlKind::HomeTab => (60, 2260, 80, 80),
        ControlKind::SearchTab => (300, 2260, 80, 80),
        ControlKind::SearchField => (80, 120, 920, 90),
        ControlKind::FollowButton | ControlKind::FollowingButton => (60, 700, 300, 80),
        ControlKind::UnfollowConfirm => (90, 1900, 900, 100),
        ControlKind::FollowsYouBadge => (400, 520, 160, 40),
    };
    BoundingBox { x, y, width, height }
}

fn lock(state: &Arc<Mutex<SimState>>) -> MutexGuard<'_, SimState> {
    match state.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// In-process stand-in for a phone running the client. Used by `--simulate`
/// and the tests. Paired with a `SimLocator` that reads the same screen model.
pub struct SimDevice {
    state: Arc<Mutex<SimState>>,
}

/// Locator over the simulated screen, plus inspection hooks for tests.
#[derive(Clone)]
pub struct SimLocator {
    state: Arc<Mutex<SimState>>,
}

impl SimDevice {
    pub fn new(script: SimScript, seed: u64) -> (SimDevice, SimLocator) {
        let state = Arc::new(Mutex::new(SimState {
            script,
            rng: StdRng::seed_from_u64(seed),
            online: true,
            app_running: false,
            screen: Screen::Home,
            typed: String::new(),
            confirm_shown: false,
            following: HashSet::new(),
            followers: HashSet::new(),
            calls: 0,
            taps: Vec::new(),
        }));
        (
            SimDevice {
                state: state.clone(),
            },
            SimLocator { state },
        )
    }

    /// Count the call and fail it if the script says so.
    async fn enter(&self) -> BotResult<()> {
        let hang = {
            let mut s = lock(&self.state);
            s.calls += 1;
            if !s.online {
                return Err(BotError::DeviceUnavailable("error: no devices/emulators found".into()));
            }
            s.script.hang_on_call == Some(s.calls)
        };
        if hang {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceBridge for SimDevice {
    async fn connect(&mut self) -> BotResult<DeviceInfo> {
        self.enter().await?;
        Ok(DeviceInfo {
            serial: "sim-0".to_string(),
            width: SIM_WIDTH,
            height: SIM_HEIGHT,
        })
    }

    async fn capture(&mut self) -> BotResult<Frame> {
        self.enter().await?;
        Ok(Frame::new(GrayImage::new(1, 1), chrono::Utc::now()))
    }

    async fn tap(&mut self, x: i32, y: i32) -> BotResult<()> {
        self.enter().await?;
        let mut s = lock(&self.state);
        if x < 0 || y < 0 || x >= SIM_WIDTH as i32 || y >= SIM_HEIGHT as i32 {
            return Err(BotError::Input(format!("tap ({}, {}) outside screen", x, y)));
        }
        s.apply_tap(x, y);
        Ok(())
    }

    async fn swipe(&mut self, _x1: i32, _y1: i32, _x2: i32, _y2: i32, _duration_ms: u32) -> BotResult<()> {
        self.enter().await
    }

    async fn type_text(&mut self, text: &str) -> BotResult<()> {
        self.enter().await?;
        let mut s = lock(&self.state);
        let handle = normalize_handle(text);
        if s
            .script
            .disconnect_on_handle
            .as_deref()
            .is_some_and(|d| normalize_handle(d) == handle)
        {
            s.online = false;
            return Err(BotError::DeviceUnavailable("device offline".into()));
        }
        if s.screen == Screen::Search {
            s.typed = text.to_string();
        }
        Ok(())
    }

    async fn press_key(&mut self, key: Key) -> BotResult<()> {
        self.enter().await?;
        let mut s = lock(&self.state);
        match key {
            Key::Back => {
                if s.confirm_shown {
                    s.confirm_shown = false;
                } else {
                    s.screen = match s.screen {
                        Screen::Profile(_) => Screen::Search,
                        _ => Screen::Home,
                    };
                }
            }
            Key::Home => s.app_running = false,
            Key::Enter => {}
        }
        Ok(())
    }

    async fn launch_app(&mut self, package: &str) -> BotResult<()> {
        self.enter().await?;
        if package != SIM_PACKAGE {
            return Err(BotError::Input(format!("{} is not installed", package)));
        }
        let mut s = lock(&self.state);
        s.app_running = true;
        s.screen = Screen::Home;
        Ok(())
    }

    async fn kill_app(&mut self, _package: &str) -> BotResult<()> {
        self.enter().await?;
        let mut s = lock(&self.state);
        s.app_running = false;
        s.confirm_shown = false;
        Ok(())
    }

    async fn is_app_running(&mut self, package: &str) -> BotResult<bool> {
        self.enter().await?;
        Ok(package == SIM_PACKAGE && lock(&self.state).app_running)
    }

    async fn is_installed(&mut self, package: &str) -> BotResult<bool> {
        self.enter().await?;
        Ok(package == SIM_PACKAGE)
    }
}

impl ControlLocator for SimLocator {
    fn locate(&self, _frame: &Frame, kind: ControlKind, _min_confidence: f32) -> Option<Match> {
        let s = lock(&self.state);
        if !s.app_running || !s.visible(kind) {
            return None;
        }
        Some(Match {
            bbox: control_box(kind),
            confidence: 0.97,
            scale: 1.0,
        })
    }
}

impl SimLocator {
    pub fn is_following(&self, handle: &str) -> bool {
        lock(&self.state).following.contains(&normalize_handle(handle))
    }

    /// Pretend the account followed us back, independent of the dice.
    pub fn grant_follow_back(&self, handle: &str) {
        lock(&self.state).followers.insert(normalize_handle(handle));
    }

    pub fn set_online(&self, online: bool) {
        lock(&self.state).online = online;
    }

    pub fn taps(&self) -> Vec<(i32, i32)> {
        lock(&self.state).taps.clone()
    }

    pub fn calls(&self) -> u32 {
        lock(&self.state).calls
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_profile(dev: &mut SimDevice, handle: &str) {
        dev.launch_app(SIM_PACKAGE).await.unwrap();
        let (x, y) = control_box(ControlKind::SearchTab).center();
        dev.tap(x, y).await.unwrap();
        dev.type_text(handle).await.unwrap();
        dev.tap(540, 600).await.unwrap();
    }

    #[tokio::test]
    async fn test_follow_tap_flips_control() {
        let (mut dev, loc) = SimDevice::new(SimScript::default(), 1);
        open_profile(&mut dev, "alice").await;
        let frame = dev.capture().await.unwrap();
        let follow = loc.locate(&frame, ControlKind::FollowButton, 0.8).unwrap();
        assert!(loc.locate(&frame, ControlKind::FollowingButton, 0.8).is_none());

        let (x, y) = follow.center();
        dev.tap(x, y).await.unwrap();
        assert!(loc.is_following("alice"));
        assert!(loc.locate(&frame, ControlKind::FollowingButton, 0.8).is_some());
    }

    #[tokio::test]
    async fn test_missing_profile_shows_no_follow_controls() {
        let script = SimScript {
            missing_profiles: vec!["ghost".into()],
            ..SimScript::default()
        };
        let (mut dev, loc) = SimDevice::new(script, 1);
        open_profile(&mut dev, "ghost").await;
        let frame = dev.capture().await.unwrap();
        assert!(loc.locate(&frame, ControlKind::FollowButton, 0.8).is_none());
        assert!(loc.locate(&frame, ControlKind::HomeTab, 0.8).is_some());
    }

    #[tokio::test]
    async fn test_unfollow_needs_confirmation() {
        let (mut dev, loc) = SimDevice::new(SimScript::default(), 1);
        open_profile(&mut dev, "bob").await;
        let (x, y) = control_box(ControlKind::FollowButton).center();
        dev.tap(x, y).await.unwrap();
        dev.tap(x, y).await.unwrap();
        assert!(loc.is_following("bob"), "popup only, not yet unfollowed");
        let (cx, cy) = control_box(ControlKind::UnfollowConfirm).center();
        dev.tap(cx, cy).await.unwrap();
        assert!(!loc.is_following("bob"));
    }

    #[tokio::test]
    async fn test_disconnect_on_handle() {
        let script = SimScript {
            disconnect_on_handle: Some("carol".into()),
            ..SimScript::default()
        };
        let (mut dev, loc) = SimDevice::new(script, 1);
        dev.launch_app(SIM_PACKAGE).await.unwrap();
        let err = dev.type_text("carol").await.unwrap_err();
        assert!(err.is_device_fatal());
        assert!(dev.capture().await.unwrap_err().is_device_fatal());
        loc.set_online(true);
        assert!(dev.capture().await.is_ok());
    }
}
