//! Events surfaced to the front-end: one per finished attempt, one
//! terminal summary per run.

use crate::model::ScheduleState;
use async_trait::async_trait;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptResult {
    Success { reference: Option<String> },
    Failure { error: String },
}

#[derive(Debug, Clone)]
pub struct AttemptEvent {
    pub owner_id: i64,
    pub entry_id: Uuid,
    pub content_id: i64,
    pub identity_id: i64,
    pub result: AttemptResult,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub owner_id: i64,
    pub entry_id: Uuid,
    pub success_count: u32,
    pub failure_count: u32,
    pub final_status: ScheduleState,
}

/// Delivery target for run progress. Implementations must not block the
/// run loop for long; failures to deliver are logged and swallowed.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn run_started(&self, owner_id: i64, entry_id: Uuid);
    async fn attempt_finished(&self, event: &AttemptEvent);
    async fn run_finished(&self, summary: &RunSummary);
}

/// Sink that drops everything. Useful for tools and tests that only care
/// about persisted state.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn run_started(&self, _owner_id: i64, _entry_id: Uuid) {}
    async fn attempt_finished(&self, _event: &AttemptEvent) {}
    async fn run_finished(&self, _summary: &RunSummary) {}
}
