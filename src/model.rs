use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lifecycle of one schedule entry. Transitions are one-directional;
/// a terminal state is never left again.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ScheduleState {
    Pending,
    Running,
    Completed,
    Cancelled,
    FailedNoContent,
    FailedNoIdentities,
}

impl ScheduleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleState::Pending => "pending",
            ScheduleState::Running => "running",
            ScheduleState::Completed => "completed",
            ScheduleState::Cancelled => "cancelled",
            ScheduleState::FailedNoContent => "failed_no_content",
            ScheduleState::FailedNoIdentities => "failed_no_identities",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ScheduleState::Pending),
            "running" => Some(ScheduleState::Running),
            "completed" => Some(ScheduleState::Completed),
            "cancelled" => Some(ScheduleState::Cancelled),
            "failed_no_content" => Some(ScheduleState::FailedNoContent),
            "failed_no_identities" => Some(ScheduleState::FailedNoIdentities),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ScheduleState::Pending | ScheduleState::Running)
    }
}

impl fmt::Display for ScheduleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of the most recent publish attempt through an identity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum IdentityResult {
    Unknown,
    Ok,
    Failed,
}

impl IdentityResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityResult::Unknown => "unknown",
            IdentityResult::Ok => "ok",
            IdentityResult::Failed => "failed",
        }
    }

    pub fn parse_result(s: &str) -> Option<Self> {
        match s {
            "unknown" => Some(IdentityResult::Unknown),
            "ok" => Some(IdentityResult::Ok),
            "failed" => Some(IdentityResult::Failed),
            _ => None,
        }
    }
}

/// Classification of a failed publish attempt. Only `Transient` and
/// `Unknown` are worth retrying; the rest will not succeed on an
/// immediate retry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FailureKind {
    Transient,
    AuthFailure,
    ChallengeRequired,
    ContentRejected,
    Unknown,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::AuthFailure => "auth_failure",
            FailureKind::ChallengeRequired => "challenge_required",
            FailureKind::ContentRejected => "content_rejected",
            FailureKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: Uuid,
    pub user_id: i64,
    pub run_at: DateTime<Utc>,
    pub status: ScheduleState,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub id: i64,
    pub user_id: i64,
    pub label: String,
    pub credential: String,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_result: IdentityResult,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_state_round_trip() {
        for state in [
            ScheduleState::Pending,
            ScheduleState::Running,
            ScheduleState::Completed,
            ScheduleState::Cancelled,
            ScheduleState::FailedNoContent,
            ScheduleState::FailedNoIdentities,
        ] {
            assert_eq!(ScheduleState::parse_state(state.as_str()), Some(state));
        }
        assert_eq!(ScheduleState::parse_state("bogus"), None);
    }

    #[test]
    fn terminal_states() {
        assert!(!ScheduleState::Pending.is_terminal());
        assert!(!ScheduleState::Running.is_terminal());
        assert!(ScheduleState::Completed.is_terminal());
        assert!(ScheduleState::Cancelled.is_terminal());
        assert!(ScheduleState::FailedNoContent.is_terminal());
        assert!(ScheduleState::FailedNoIdentities.is_terminal());
    }

    #[test]
    fn identity_result_round_trip() {
        for result in [
            IdentityResult::Unknown,
            IdentityResult::Ok,
            IdentityResult::Failed,
        ] {
            assert_eq!(IdentityResult::parse_result(result.as_str()), Some(result));
        }
        assert_eq!(IdentityResult::parse_result(""), None);
    }
}
