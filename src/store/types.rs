use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Lifecycle of a target account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TargetState {
    Imported,
    Followed,
    BackfillConfirmed,
    Expired,
    Unfollowed,
    Failed,
}

impl TargetState {
    pub const ALL: [TargetState; 6] = [
        TargetState::Imported,
        TargetState::Followed,
        TargetState::BackfillConfirmed,
        TargetState::Expired,
        TargetState::Unfollowed,
        TargetState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetState::Imported => "imported",
            TargetState::Followed => "followed",
            TargetState::BackfillConfirmed => "backfill_confirmed",
            TargetState::Expired => "expired",
            TargetState::Unfollowed => "unfollowed",
            TargetState::Failed => "failed",
        }
    }

    /// No further automatic work happens in these states.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TargetState::BackfillConfirmed | TargetState::Unfollowed | TargetState::Failed
        )
    }
}

impl fmt::Display for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TargetState::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| format!("unknown target state: {}", s))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Target {
    pub id: i64,
    pub handle: String,
    pub profile_ref: Option<String>,
    pub state: TargetState,
    pub followed_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub retries: u32,
    pub imported_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ActionKind {
    Follow,
    Unfollow,
    VerifyFollowBack,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Follow => "follow",
            ActionKind::Unfollow => "unfollow",
            ActionKind::VerifyFollowBack => "verify_follow_back",
        }
    }

    /// Follows and unfollows draw from quotas; verification is only spaced.
    pub fn is_quota_limited(&self) -> bool {
        !matches!(self, ActionKind::VerifyFollowBack)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "follow" => Ok(ActionKind::Follow),
            "unfollow" => Ok(ActionKind::Unfollow),
            "verify_follow_back" => Ok(ActionKind::VerifyFollowBack),
            other => Err(format!("unknown action kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ActionOutcome {
    Success,
    NotFound,
    Error,
}

impl ActionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionOutcome::Success => "success",
            ActionOutcome::NotFound => "not_found",
            ActionOutcome::Error => "error",
        }
    }
}

impl FromStr for ActionOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(ActionOutcome::Success),
            "not_found" => Ok(ActionOutcome::NotFound),
            "error" => Ok(ActionOutcome::Error),
            other => Err(format!("unknown action outcome: {}", other)),
        }
    }
}

/// One attempt against one target. Immutable once written.
#[derive(Debug, Clone, Serialize)]
pub struct ActionRecord {
    pub id: i64,
    pub target_id: i64,
    pub kind: ActionKind,
    pub at: DateTime<Utc>,
    pub outcome: ActionOutcome,
    pub latency_ms: u64,
    pub detail: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewAction {
    pub target_id: i64,
    pub kind: ActionKind,
    pub at: DateTime<Utc>,
    pub outcome: ActionOutcome,
    pub latency_ms: u64,
    pub detail: Option<String>,
}

/// Persisted scheduler bookkeeping for one named task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRow {
    pub name: String,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_eligible: Option<DateTime<Utc>>,
    pub last_status: Option<String>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Transition {
    pub target_id: i64,
    pub from: TargetState,
    pub to: TargetState,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trips_through_str() {
        for st in TargetState::ALL {
            assert_eq!(st.as_str().parse::<TargetState>().unwrap(), st);
        }
        assert!("bogus".parse::<TargetState>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(TargetState::Unfollowed.is_terminal());
        assert!(TargetState::Failed.is_terminal());
        assert!(!TargetState::Followed.is_terminal());
        assert!(!TargetState::Expired.is_terminal());
    }

    #[test]
    fn test_verification_is_not_quota_limited() {
        assert!(ActionKind::Follow.is_quota_limited());
        assert!(ActionKind::Unfollow.is_quota_limited());
        assert!(!ActionKind::VerifyFollowBack.is_quota_limited());
    }
}
