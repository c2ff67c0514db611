use super::{DeviceBridge, DeviceInfo, Frame, Key};
use crate::error::{BotError, BotResult};
use async_trait::async_trait;
use std::future::Future;
use std::time::{Duration, Instant};

/// Wraps any bridge with a per-call timeout and an audit log line per call.
///
/// A call that exceeds the timeout becomes `DeviceUnavailable`; the inner
/// future is dropped, which kills a spawned adb child.
pub struct GuardedBridge {
    inner: Box<dyn DeviceBridge>,
    timeout: Duration,
    /// Launching an app can legitimately take longer than a tap.
    launch_timeout: Duration,
}

impl GuardedBridge {
    pub fn new(inner: Box<dyn DeviceBridge>, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            launch_timeout: timeout * 3,
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
        self.launch_timeout = timeout * 3;
    }
}

async fn audited<T, F>(op: &str, limit: Duration, fut: F) -> BotResult<T>
where
    F: Future<Output = BotResult<T>>,
{
    let started = Instant::now();
    let result = match tokio::time::timeout(limit, fut).await {
        Ok(r) => r,
        Err(_) => Err(BotError::DeviceUnavailable(format!(
            "{} timed out after {}ms",
            op,
            limit.as_millis()
        ))),
    };
    let elapsed_ms = started.elapsed().as_millis() as u64;
    match &result {
        Ok(_) => tracing::debug!(op, elapsed_ms, "device call ok"),
        Err(e) => tracing::warn!(op, elapsed_ms, error = %e, "device call failed"),
    }
    result
}

#[async_trait]
impl DeviceBridge for GuardedBridge {
    async fn connect(&mut self) -> BotResult<DeviceInfo> {
        audited("connect", self.launch_timeout, self.inner.connect()).await
    }

    async fn capture(&mut self) -> BotResult<Frame> {
        audited("capture", self.timeout, self.inner.capture()).await
    }

    async fn tap(&mut self, x: i32, y: i32) -> BotResult<()> {
        tracing::debug!(x, y, "tap");
        audited("tap", self.timeout, self.inner.tap(x, y)).await
    }

    async fn swipe(&mut self, x1: i32, y1: i32, x2: i32, y2: i32, duration_ms: u32) -> BotResult<()> {
        let limit = self.timeout + Duration::from_millis(duration_ms as u64);
        audited("swipe", limit, self.inner.swipe(x1, y1, x2, y2, duration_ms)).await
    }

    async fn type_text(&mut self, text: &str) -> BotResult<()> {
        audited("type_text", self.timeout, self.inner.type_text(text)).await
    }

    async fn press_key(&mut self, key: Key) -> BotResult<()> {
        audited("press_key", self.timeout, self.inner.press_key(key)).await
    }

    async fn launch_app(&mut self, package: &str) -> BotResult<()> {
        audited("launch_app", self.launch_timeout, self.inner.launch_app(package)).await
    }

    async fn kill_app(&mut self, package: &str) -> BotResult<()> {
        audited("kill_app", self.timeout, self.inner.kill_app(package)).await
    }

    async fn is_app_running(&mut self, package: &str) -> BotResult<bool> {
        audited("is_app_running", self.timeout, self.inner.is_app_running(package)).await
    }

    async fn is_installed(&mut self, package: &str) -> BotResult<bool> {
        audited("is_installed", self.timeout, self.inner.is_installed(package)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::sim::{SimDevice, SimScript};

    #[tokio::test(start_paused = true)]
    async fn test_hang_becomes_device_unavailable() {
        let script = SimScript {
            hang_on_call: Some(1),
            ..SimScript::default()
        };
        let (sim, _locator) = SimDevice::new(script, 7);
        let mut bridge = GuardedBridge::new(Box::new(sim), Duration::from_secs(3));

        let err = bridge.tap(10, 10).await.unwrap_err();
        assert!(err.is_device_fatal(), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_passes_through_success() {
        let (sim, _locator) = SimDevice::new(SimScript::default(), 7);
        let mut bridge = GuardedBridge::new(Box::new(sim), Duration::from_secs(3));
        let info = bridge.connect().await.unwrap();
        assert_eq!(info.serial, "sim-0");
    }
}
