use crate::store::ActionKind;
use std::collections::HashMap;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct InFlight {
    pub handle: String,
    pub kind: ActionKind,
    pub started_at: Instant,
}

/// At most one device action per target at a time.
#[derive(Default)]
pub struct InFlightRegistry {
    actions: HashMap<i64, InFlight>, // target id -> running action
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the target already has an action running.
    pub fn try_register(&mut self, target_id: i64, handle: &str, kind: ActionKind) -> bool {
        if self.actions.contains_key(&target_id) {
            return false;
        }
        self.actions.insert(
            target_id,
            InFlight {
                handle: handle.to_string(),
                kind,
                started_at: Instant::now(),
            },
        );
        true
    }

    pub fn complete(&mut self, target_id: i64) -> Option<InFlight> {
        self.actions.remove(&target_id)
    }

    pub fn count(&self) -> usize {
        self.actions.len()
    }
}
