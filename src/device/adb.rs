use super::{DeviceBridge, DeviceInfo, Frame, Key};
use crate::config::{DeviceConfig, TextInput};
use crate::error::{BotError, BotResult};
use async_trait::async_trait;
use base64::Engine;
use std::process::Output;
use tokio::process::Command;

/// Drives a device through the `adb` command-line client.
///
/// Timeouts are applied by `GuardedBridge`; the child process is killed when
/// its future is dropped.
pub struct AdbBridge {
    adb_path: String,
    serial: Option<String>,
    text_input: TextInput,
}

impl AdbBridge {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            adb_path: config.adb_path.clone(),
            serial: config.serial.clone(),
            text_input: config.text_input,
        }
    }

    async fn run(&self, args: &[&str]) -> BotResult<Output> {
        let mut cmd = Command::new(&self.adb_path);
        if let Some(serial) = &self.serial {
            cmd.arg("-s").arg(serial);
        }
        cmd.args(args).kill_on_drop(true);
        let output = cmd
            .output()
            .await
            .map_err(|e| BotError::DeviceUnavailable(format!("failed to spawn adb: {}", e)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(classify_failure(&stderr));
        }
        Ok(output)
    }

    async fn shell(&self, args: &[&str]) -> BotResult<String> {
        let mut full = vec!["shell"];
        full.extend_from_slice(args);
        let output = self.run(&full).await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// adb reports a lost device through stderr; anything else is an input problem.
fn classify_failure(stderr: &str) -> BotError {
    let lost = ["no devices", "device offline", "device not found", "unauthorized", "closed"];
    if lost.iter().any(|needle| stderr.contains(needle)) {
        BotError::DeviceUnavailable(stderr.to_string())
    } else {
        BotError::Input(stderr.to_string())
    }
}

/// Parse `adb devices` output into attached, authorized serials.
pub fn parse_devices(output: &str) -> Vec<String> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some(serial), Some("device")) => Some(serial.to_string()),
                _ => None,
            }
        })
        .collect()
}

/// Parse `wm size` output; an override size wins over the physical one.
pub fn parse_screen_size(output: &str) -> Option<(u32, u32)> {
    let pick = |prefix: &str| {
        output
            .lines()
            .find(|l| l.trim_start().starts_with(prefix))
            .and_then(|l| l.rsplit(' ').next())
            .and_then(|dims| dims.split_once('x'))
            .and_then(|(w, h)| Some((w.trim().parse().ok()?, h.trim().parse().ok()?)))
    };
    pick("Override size:").or_else(|| pick("Physical size:"))
}

/// `input text` treats spaces and shell metacharacters specially.
fn escape_input_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len() * 2);
    for c in text.chars() {
        match c {
            ' ' => out.push_str("%s"),
            '&' | '<' | '>' | '(' | ')' | '|' | ';' | '\'' | '"' | '\\' | '$' | '`' | '*' | '?' | '~' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

#[async_trait]
impl DeviceBridge for AdbBridge {
    async fn connect(&mut self) -> BotResult<DeviceInfo> {
        let output = self.run(&["devices"]).await?;
        let devices = parse_devices(&String::from_utf8_lossy(&output.stdout));
        let serial = match &self.serial {
            Some(s) if devices.contains(s) => s.clone(),
            Some(s) => return Err(BotError::DeviceUnavailable(format!("device {} not attached", s))),
            None => devices
                .first()
                .cloned()
                .ok_or_else(|| BotError::DeviceUnavailable("no devices attached".to_string()))?,
        };
        self.serial = Some(serial.clone());

        let size = self.shell(&["wm", "size"]).await?;
        let (width, height) = parse_screen_size(&size)
            .ok_or_else(|| BotError::DeviceUnavailable(format!("unreadable screen size: {}", size)))?;
        tracing::info!(serial = %serial, width, height, "device connected");
        Ok(DeviceInfo { serial, width, height })
    }

    async fn capture(&mut self) -> BotResult<Frame> {
        let output = self.run(&["exec-out", "screencap", "-p"]).await?;
        let decoded = image::load_from_memory_with_format(&output.stdout, image::ImageFormat::Png)
            .map_err(|e| BotError::DeviceUnavailable(format!("undecodable screenshot: {}", e)))?;
        Ok(Frame::new(decoded.to_luma8(), chrono::Utc::now()))
    }

    async fn tap(&mut self, x: i32, y: i32) -> BotResult<()> {
        self.shell(&["input", "tap", &x.to_string(), &y.to_string()]).await?;
        Ok(())
    }

    async fn swipe(&mut self, x1: i32, y1: i32, x2: i32, y2: i32, duration_ms: u32) -> BotResult<()> {
        let args = [x1, y1, x2, y2].map(|v| v.to_string());
        let ms = duration_ms.to_string();
        self.shell(&["input", "swipe", &args[0], &args[1], &args[2], &args[3], &ms])
            .await?;
        Ok(())
    }

    async fn type_text(&mut self, text: &str) -> BotResult<()> {
        match self.text_input {
            TextInput::Shell => {
                if !text.is_ascii() {
                    return Err(BotError::Input(format!(
                        "shell text input is ASCII only, got {:?}; use text_input = \"adb-keyboard\"",
                        text
                    )));
                }
                self.shell(&["input", "text", &escape_input_text(text)]).await?;
            }
            TextInput::AdbKeyboard => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(text.as_bytes());
                self.shell(&["am", "broadcast", "-a", "ADB_INPUT_B64", "--es", "msg", &encoded])
                    .await?;
            }
        }
        Ok(())
    }

    async fn press_key(&mut self, key: Key) -> BotResult<()> {
        self.shell(&["input", "keyevent", key.keycode()]).await?;
        Ok(())
    }

    async fn launch_app(&mut self, package: &str) -> BotResult<()> {
        self.shell(&[
            "monkey",
            "-p",
            package,
            "-c",
            "android.intent.category.LAUNCHER",
            "1",
        ])
        .await?;
        Ok(())
    }

    async fn kill_app(&mut self, package: &str) -> BotResult<()> {
        self.shell(&["am", "force-stop", package]).await?;
        Ok(())
    }

    async fn is_app_running(&mut self, package: &str) -> BotResult<bool> {
        // pidof exits non-zero when nothing matches.
        match self.shell(&["pidof", package]).await {
            Ok(out) => Ok(!out.is_empty()),
            Err(BotError::Input(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn is_installed(&mut self, package: &str) -> BotResult<bool> {
        let out = self.shell(&["pm", "list", "packages", package]).await?;
        Ok(out
            .lines()
            .any(|l| l.trim().strip_prefix("package:") == Some(package)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_devices_skips_unauthorized() {
        let out = "List of devices attached\nemulator-5554\tdevice\nR58M\tunauthorized\n\n";
        assert_eq!(parse_devices(out), vec!["emulator-5554".to_string()]);
    }

    #[test]
    fn test_parse_screen_size_prefers_override() {
        assert_eq!(parse_screen_size("Physical size: 1080x2400"), Some((1080, 2400)));
        assert_eq!(
            parse_screen_size("Physical size: 1440x3200\nOverride size: 1080x2400"),
            Some((1080, 2400))
        );
        assert_eq!(parse_screen_size("garbage"), None);
    }

    #[test]
    fn test_escape_input_text() {
        assert_eq!(escape_input_text("john doe"), "john%sdoe");
        assert_eq!(escape_input_text("a&b"), "a\\&b");
        assert_eq!(escape_input_text("user.name_1"), "user.name_1");
    }

    #[test]
    fn test_classify_failure() {
        assert!(classify_failure("error: no devices/emulators found").is_device_fatal());
        assert!(!classify_failure("Error: Unknown command").is_device_fatal());
    }
}
