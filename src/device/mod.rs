pub mod adb;
pub mod guard;
pub mod sim;

use crate::error::BotResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use image::GrayImage;

/// Physical properties reported by the device on connect.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub serial: String,
    pub width: u32,
    pub height: u32,
}

/// One captured screen, already converted to grayscale.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: GrayImage,
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn new(image: GrayImage, captured_at: DateTime<Utc>) -> Self {
        Self { image, captured_at }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Back,
    Home,
    Enter,
}

impl Key {
    pub fn keycode(&self) -> &'static str {
        match self {
            Key::Back => "KEYCODE_BACK",
            Key::Home => "KEYCODE_HOME",
            Key::Enter => "KEYCODE_ENTER",
        }
    }
}

/// Command channel to the controlled device.
///
/// Calls are serialized by the caller; implementations never retry. Every
/// error that means "the device cannot be reached" must be
/// `BotError::DeviceUnavailable` so the scheduler can suspend device work.
#[async_trait]
pub trait DeviceBridge: Send + Sync {
    async fn connect(&mut self) -> BotResult<DeviceInfo>;
    async fn capture(&mut self) -> BotResult<Frame>;
    async fn tap(&mut self, x: i32, y: i32) -> BotResult<()>;
    async fn swipe(&mut self, x1: i32, y1: i32, x2: i32, y2: i32, duration_ms: u32) -> BotResult<()>;
    async fn type_text(&mut self, text: &str) -> BotResult<()>;
    async fn press_key(&mut self, key: Key) -> BotResult<()>;
    async fn launch_app(&mut self, package: &str) -> BotResult<()>;
    async fn kill_app(&mut self, package: &str) -> BotResult<()>;
    async fn is_app_running(&mut self, package: &str) -> BotResult<bool>;
    async fn is_installed(&mut self, package: &str) -> BotResult<bool>;
}
