use anyhow::{Context, Result};
use chrono::{FixedOffset, NaiveTime, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    Conservative,
    #[default]
    Default,
    Aggressive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub profile: Profile,
    /// Offset of the bot's local clock from UTC. Rest windows, day rollover and
    /// daily task times are all evaluated in this offset.
    #[serde(default)]
    pub utc_offset_minutes: i32,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub vision: VisionConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TextInput {
    /// `input text`, ASCII only.
    #[default]
    Shell,
    /// ADBKeyBoard IME broadcast, handles any unicode.
    AdbKeyboard,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub adb_path: String,
    pub serial: Option<String>,
    pub app_package: String,
    pub command_timeout_ms: u64,
    pub launch_wait_ms: u64,
    /// Pause after each tap so the UI can settle before the next capture.
    pub settle_ms: u64,
    /// First search result row, as fractions of screen width/height.
    pub first_result: [f64; 2],
    pub text_input: TextInput,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            adb_path: "adb".to_string(),
            serial: None,
            app_package: "com.instagram.android".to_string(),
            command_timeout_ms: 5000,
            launch_wait_ms: 5000,
            settle_ms: 1500,
            first_result: [0.5, 0.25],
            text_input: TextInput::Shell,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionConfig {
    pub templates_dir: String,
    pub min_confidence: f32,
    pub scales: Vec<f32>,
    /// Frames are downsampled to this width before matching.
    pub match_width: u32,
    pub coordinate_variance: i32,
    /// Captures taken while waiting for a control to appear.
    pub locate_attempts: u32,
    /// Re-captures after a tap before declaring a verification mismatch.
    pub verify_retries: u32,
    pub screenshot_dir: Option<String>,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            templates_dir: "templates".to_string(),
            min_confidence: 0.8,
            scales: vec![0.90, 0.95, 1.0, 1.05, 1.10],
            match_width: 360,
            coordinate_variance: 5,
            locate_attempts: 3,
            verify_retries: 2,
            screenshot_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestWindow {
    pub start: String,
    pub end: String,
}

impl RestWindow {
    /// Parse "HH:MM" bounds. A window whose end precedes its start wraps midnight.
    pub fn bounds(&self) -> Result<(NaiveTime, NaiveTime)> {
        let start = parse_clock(&self.start).context("rest_window.start")?;
        let end = parse_clock(&self.end).context("rest_window.end")?;
        Ok((start, end))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub max_daily_follows: u32,
    pub max_daily_unfollows: u32,
    /// Shared by follows and unfollows.
    pub max_actions_per_hour: u32,
    pub min_delay_seconds: u64,
    pub max_delay_seconds: u64,
    pub min_action_spacing_seconds: u64,
    pub verify_spacing_seconds: u64,
    pub rest_window: Option<RestWindow>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_daily_follows: 100,
            max_daily_unfollows: 50,
            max_actions_per_hour: 20,
            min_delay_seconds: 30,
            max_delay_seconds: 120,
            min_action_spacing_seconds: 20,
            verify_spacing_seconds: 5,
            rest_window: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub follow_interval_minutes: u64,
    pub follows_per_batch: u32,
    pub verify_interval_minutes: u64,
    pub verify_batch_size: u32,
    pub unfollow_interval_minutes: u64,
    pub unfollows_per_batch: u32,
    pub health_interval_minutes: u64,
    pub daily_report_at: String,
    pub reconnect_at: String,
    pub tick_seconds: u64,
    pub reconnect_backoff_seconds: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            follow_interval_minutes: 5,
            follows_per_batch: 5,
            verify_interval_minutes: 60,
            verify_batch_size: 20,
            unfollow_interval_minutes: 120,
            unfollows_per_batch: 10,
            health_interval_minutes: 30,
            daily_report_at: "23:00".to_string(),
            reconnect_at: "06:00".to_string(),
            tick_seconds: 5,
            reconnect_backoff_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    pub maturation_window_hours: u64,
    /// Extra time past maturation before an unconfirmed target expires.
    pub unfollow_grace_hours: u64,
    /// Failed attempts before a target is parked as Failed.
    pub max_retries: u32,
    /// Minimum spacing between two device checks of the same target.
    pub recheck_minutes: u64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            maturation_window_hours: 24,
            unfollow_grace_hours: 0,
            max_retries: 3,
            recheck_minutes: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "follow-cycle.db".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::preset(Profile::Default)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    /// Parse a config document. The selected profile supplies every value the
    /// document leaves out; camelCase keys are accepted alongside snake_case.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let user: toml::Table = toml::from_str(content).context("Failed to parse config TOML")?;
        let user = normalize_keys(user);

        let profile = match user.get("profile") {
            Some(v) => v.clone().try_into::<Profile>().context("invalid profile")?,
            None => Profile::Default,
        };

        let mut merged = match toml::Value::try_from(Self::preset(profile))? {
            toml::Value::Table(t) => t,
            _ => anyhow::bail!("config preset did not serialize to a table"),
        };
        merge_tables(&mut merged, user);

        let config: Config = toml::Value::Table(merged)
            .try_into()
            .context("Failed to parse config TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn preset(profile: Profile) -> Self {
        let mut config = Self {
            profile,
            utc_offset_minutes: 0,
            device: DeviceConfig::default(),
            vision: VisionConfig::default(),
            limits: LimitsConfig::default(),
            schedule: ScheduleConfig::default(),
            tracking: TrackingConfig::default(),
            store: StoreConfig::default(),
        };
        match profile {
            Profile::Default => {}
            Profile::Conservative => {
                config.schedule.follows_per_batch = 5;
                config.schedule.unfollows_per_batch = 10;
                config.limits.min_delay_seconds = 60;
                config.limits.max_delay_seconds = 120;
                config.limits.max_actions_per_hour = 12;
                config.tracking.maturation_window_hours = 48;
            }
            Profile::Aggressive => {
                config.schedule.follows_per_batch = 20;
                config.schedule.unfollows_per_batch = 40;
                config.limits.min_delay_seconds = 30;
                config.limits.max_delay_seconds = 60;
                config.limits.max_actions_per_hour = 40;
                config.tracking.maturation_window_hours = 12;
            }
        }
        config
    }

    pub fn validate(&self) -> Result<()> {
        let l = &self.limits;
        if l.min_delay_seconds > l.max_delay_seconds {
            anyhow::bail!(
                "min_delay_seconds ({}) exceeds max_delay_seconds ({})",
                l.min_delay_seconds,
                l.max_delay_seconds
            );
        }
        if l.max_daily_follows == 0 || l.max_actions_per_hour == 0 {
            anyhow::bail!("max_daily_follows and max_actions_per_hour must be > 0");
        }
        if let Some(rw) = &l.rest_window {
            rw.bounds()?;
        }
        if self.vision.scales.is_empty() || self.vision.scales.iter().any(|s| *s <= 0.0) {
            anyhow::bail!("vision.scales must be a non-empty list of positive factors");
        }
        if !(self.vision.min_confidence > 0.0 && self.vision.min_confidence <= 1.0) {
            anyhow::bail!("vision.min_confidence must be in (0, 1], got {}", self.vision.min_confidence);
        }
        if self.vision.match_width < 32 {
            anyhow::bail!("vision.match_width must be at least 32");
        }
        if self.vision.coordinate_variance < 0 {
            anyhow::bail!("vision.coordinate_variance must be >= 0");
        }
        if self.schedule.follow_interval_minutes == 0 || self.schedule.tick_seconds == 0 {
            anyhow::bail!("schedule intervals must be > 0");
        }
        parse_clock(&self.schedule.daily_report_at).context("schedule.daily_report_at")?;
        parse_clock(&self.schedule.reconnect_at).context("schedule.reconnect_at")?;
        let [fx, fy] = self.device.first_result;
        if !(0.0..=1.0).contains(&fx) || !(0.0..=1.0).contains(&fy) {
            anyhow::bail!("device.first_result must be fractions of the screen");
        }
        Ok(())
    }

    pub fn local_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60)
            .unwrap_or_else(|| Utc.fix())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.device.command_timeout_ms)
    }
}

pub fn parse_clock(raw: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .with_context(|| format!("expected HH:MM, got {:?}", raw))
}

/// Convert `maxDailyFollows` style keys to `max_daily_follows`, recursively.
fn normalize_keys(table: toml::Table) -> toml::Table {
    table
        .into_iter()
        .map(|(k, v)| {
            let v = match v {
                toml::Value::Table(t) => toml::Value::Table(normalize_keys(t)),
                other => other,
            };
            (camel_to_snake(&k), v)
        })
        .collect()
}

fn camel_to_snake(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for (i, c) in key.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(b)), toml::Value::Table(o)) => merge_tables(b, o),
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Re-reads the config file when its modification time changes.
pub struct ConfigWatcher {
    path: PathBuf,
    last_modified: Option<SystemTime>,
}

impl ConfigWatcher {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            last_modified: modified_at(path),
        }
    }

    /// Returns a freshly loaded config if the file changed since the last poll.
    /// A file that fails to parse is logged and skipped; the previous config stays.
    pub fn poll(&mut self) -> Option<Config> {
        let modified = modified_at(&self.path);
        if modified.is_none() || modified == self.last_modified {
            return None;
        }
        self.last_modified = modified;
        match Config::load(&self.path) {
            Ok(config) => {
                tracing::info!(path = %self.path.display(), "configuration reloaded");
                Some(config)
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %format!("{:#}", e), "config reload rejected");
                None
            }
        }
    }
}

fn modified_at(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.limits.max_daily_follows, 100);
        assert_eq!(config.tracking.maturation_window_hours, 24);
        assert_eq!(config.schedule.follows_per_batch, 5);
        assert_eq!(config.device.app_package, "com.instagram.android");
    }

    #[test]
    fn test_camel_case_keys_are_accepted() {
        let config = Config::from_toml_str(
            r#"
            [limits]
            maxDailyFollows = 40
            maxActionsPerHour = 8
            restWindow = { start = "23:30", end = "07:00" }

            [schedule]
            followIntervalMinutes = 15
            "#,
        )
        .unwrap();
        assert_eq!(config.limits.max_daily_follows, 40);
        assert_eq!(config.limits.max_actions_per_hour, 8);
        assert_eq!(config.schedule.follow_interval_minutes, 15);
        let (start, end) = config.limits.rest_window.unwrap().bounds().unwrap();
        assert!(end < start, "window wraps midnight");
    }

    #[test]
    fn test_profile_preset_with_explicit_override() {
        let config = Config::from_toml_str(
            r#"
            profile = "aggressive"
            [tracking]
            maturation_window_hours = 30
            "#,
        )
        .unwrap();
        assert_eq!(config.profile, Profile::Aggressive);
        assert_eq!(config.schedule.follows_per_batch, 20);
        assert_eq!(config.tracking.maturation_window_hours, 30);
    }

    #[test]
    fn test_rejects_inverted_delays() {
        let err = Config::from_toml_str(
            r#"
            [limits]
            min_delay_seconds = 90
            max_delay_seconds = 30
            "#,
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("min_delay_seconds"));
    }

    #[test]
    fn test_rejects_malformed_rest_window() {
        let result = Config::from_toml_str(
            r#"
            [limits]
            rest_window = { start = "25:00", end = "07:00" }
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_camel_to_snake() {
        assert_eq!(camel_to_snake("maturationWindowHours"), "maturation_window_hours");
        assert_eq!(camel_to_snake("already_snake"), "already_snake");
    }

    #[test]
    fn test_watcher_reloads_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bot.toml");
        std::fs::write(&path, "[limits]\nmax_daily_follows = 10\n").unwrap();
        let mut watcher = ConfigWatcher::new(&path);
        assert!(watcher.poll().is_none(), "unchanged file is not reloaded");

        // Force a distinct mtime regardless of filesystem timestamp granularity.
        std::fs::write(&path, "[limits]\nmax_daily_follows = 20\n").unwrap();
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(5)).unwrap();

        let reloaded = watcher.poll().expect("changed file reloads");
        assert_eq!(reloaded.limits.max_daily_follows, 20);
    }
}
