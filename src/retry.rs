//! Retry decisions for failed publish attempts.
//!
//! Kept separate from the pipeline so the policy can be exercised without
//! a publisher: given the attempt number and the failure classification,
//! decide whether another attempt is worth it and how long to wait.

use crate::config;
use crate::model::FailureKind;
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { after: Duration },
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff_min: Duration,
    backoff_max: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_min: Duration, backoff_max: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_min,
            backoff_max: backoff_max.max(backoff_min),
        }
    }

    pub fn from_config(cfg: &config::Retry) -> Self {
        Self::new(
            cfg.max_attempts,
            Duration::from_millis(cfg.backoff_min_ms),
            Duration::from_millis(cfg.backoff_max_ms),
        )
    }

    /// Decide what to do after attempt number `attempt` (1-based) failed
    /// with `kind`. Credential, challenge, and content rejections are never
    /// retried: they will not succeed on an immediate retry, and hammering
    /// a locked-out credential only makes things worse. Network blips are.
    pub fn next_action(&self, attempt: u32, kind: FailureKind) -> RetryDecision {
        match kind {
            FailureKind::AuthFailure
            | FailureKind::ChallengeRequired
            | FailureKind::ContentRejected => RetryDecision::GiveUp,
            FailureKind::Transient | FailureKind::Unknown => {
                if attempt >= self.max_attempts {
                    RetryDecision::GiveUp
                } else {
                    RetryDecision::Retry {
                        after: self.backoff(attempt),
                    }
                }
            }
        }
    }

    /// Randomized backoff. The window widens with the attempt number so
    /// consecutive retries spread out further.
    fn backoff(&self, attempt: u32) -> Duration {
        let lo = self.backoff_min.as_millis() as u64;
        let hi = (self.backoff_max.as_millis() as u64)
            .saturating_mul(u64::from(attempt))
            .max(lo);
        Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
    }
}
