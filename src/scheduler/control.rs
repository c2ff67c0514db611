use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    Running,
    Paused,
    Stopping,
}

/// Shared run state. Pausing and stopping are only observed between actions;
/// an action already on the device always completes and gets recorded.
#[derive(Clone)]
pub struct RunControl {
    tx: Arc<watch::Sender<RunState>>,
    rx: watch::Receiver<RunState>,
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

impl RunControl {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(RunState::Running);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn state(&self) -> RunState {
        *self.rx.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == RunState::Running
    }

    pub fn is_stopping(&self) -> bool {
        self.state() == RunState::Stopping
    }

    pub fn pause(&self) {
        self.tx.send_if_modified(|s| {
            if *s == RunState::Running {
                *s = RunState::Paused;
                true
            } else {
                false
            }
        });
    }

    pub fn resume(&self) {
        self.tx.send_if_modified(|s| {
            if *s == RunState::Paused {
                *s = RunState::Running;
                true
            } else {
                false
            }
        });
    }

    /// Stopping is final.
    pub fn stop(&self) {
        self.tx.send_replace(RunState::Stopping);
    }

    /// Resolves once a stop has been requested.
    pub async fn stopped(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|s| *s == RunState::Stopping).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pause_resume() {
        let control = RunControl::new();
        control.pause();
        assert_eq!(control.state(), RunState::Paused);
        control.resume();
        assert!(control.is_running());
    }

    #[test]
    fn test_stop_is_final() {
        let control = RunControl::new();
        control.stop();
        control.resume();
        control.pause();
        assert!(control.is_stopping());
    }

    #[tokio::test]
    async fn test_stopped_resolves_for_clones() {
        let control = RunControl::new();
        let other = control.clone();
        let waiter = tokio::spawn(async move { other.stopped().await });
        control.stop();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("stop observed")
            .unwrap();
    }
}
