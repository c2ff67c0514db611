use crate::engine::QuotaWindow;
use crate::scheduler::RunState;
use crate::store::{ActionOutcome, TargetState};
use std::collections::VecDeque;
use std::time::Instant;

const MAX_LOGS: usize = 200;

#[derive(Debug, Clone)]
pub struct AppState {
    pub start_time: Instant,
    pub sim_mode: bool,
    pub run_state: RunState,
    /// "serial WxH" once attached.
    pub device: Option<String>,
    pub suspended: Option<String>,
    pub tasks: Vec<TaskLine>,
    pub targets: Vec<(TargetState, u32)>,
    pub quotas: Vec<QuotaWindow>,
    pub actions: Vec<ActionLine>,
    pub warnings: Vec<String>,
    pub logs: VecDeque<LogEntry>,
}

#[derive(Debug, Clone)]
pub struct TaskLine {
    pub name: String,
    pub cadence: String,
    pub enabled: bool,
    pub last_run: Option<String>,
    pub next_eligible: String,
    pub status: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ActionLine {
    pub time: String,
    pub kind: String,
    pub handle: String,
    pub outcome: ActionOutcome,
    pub latency_ms: u64,
    pub detail: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub time: String,
    pub level: String,
    pub message: String,
}

impl AppState {
    pub fn new(sim_mode: bool) -> Self {
        Self {
            start_time: Instant::now(),
            sim_mode,
            run_state: RunState::Running,
            device: None,
            suspended: None,
            tasks: Vec::new(),
            targets: Vec::new(),
            quotas: Vec::new(),
            actions: Vec::new(),
            warnings: Vec::new(),
            logs: VecDeque::with_capacity(MAX_LOGS),
        }
    }

    pub fn push_log(&mut self, level: &str, message: String) {
        let time = chrono::Local::now().format("%H:%M:%S%.3f").to_string();
        if self.logs.len() >= MAX_LOGS {
            self.logs.pop_front();
        }
        self.logs.push_back(LogEntry {
            time,
            level: level.to_string(),
            message,
        });
    }

    pub fn total_targets(&self) -> u32 {
        self.targets.iter().map(|(_, n)| n).sum()
    }

    pub fn uptime(&self) -> String {
        let secs = self.start_time.elapsed().as_secs();
        let h = secs / 3600;
        let m = (secs % 3600) / 60;
        format!("{}h {:02}m", h, m)
    }
}
