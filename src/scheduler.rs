//! Schedule lifecycle: arm a wait for the requested instant, then drain the
//! owner's content queue through the publish pipeline until it is empty or
//! the run is cancelled.
//!
//! One owner has at most one live schedule entry and at most one run loop;
//! `create` enforces this by cooperatively stopping any predecessor before
//! arming the new timer. Cancellation is checked between items, never
//! mid-attempt, so an in-flight publish always gets its result recorded.

use crate::config::Config;
use crate::db::{self, Pool};
use crate::events::{AttemptEvent, AttemptResult, EventSink, RunSummary};
use crate::model::{ScheduleEntry, ScheduleState};
use crate::pipeline::{self, OwnerLocks, PipelineConfig, RunOutcome};
use crate::publisher::Publisher;
use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("scheduled time must be in the future")]
    InvalidTime,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Randomized delay window between successive publishes.
    pub pacing_min: Duration,
    pub pacing_max: Duration,
    pub pipeline: PipelineConfig,
}

impl SchedulerConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            pacing_min: Duration::from_millis(cfg.app.pacing_min_ms),
            pacing_max: Duration::from_millis(cfg.app.pacing_max_ms.max(cfg.app.pacing_min_ms)),
            pipeline: PipelineConfig {
                publish_timeout: Duration::from_millis(cfg.app.publish_timeout_ms),
                requeue_failed: cfg.retry.requeue_failed,
                max_post_length: cfg.app.max_post_length,
            },
        }
    }
}

/// Read-only view for the front-end; never touches the run loop.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub entry: Option<ScheduleEntry>,
    pub remaining_content: i64,
}

struct RunHandle {
    entry_id: Uuid,
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Everything a run task needs; cloned into the spawned future.
#[derive(Clone)]
struct RunContext {
    pool: Pool,
    publisher: Arc<dyn Publisher>,
    sink: Arc<dyn EventSink>,
    policy: RetryPolicy,
    cfg: SchedulerConfig,
    locks: OwnerLocks,
    jobs: Arc<Mutex<HashMap<i64, RunHandle>>>,
}

pub struct ScheduleManager {
    ctx: RunContext,
    // Serializes create/cancel/arm per owner. Never taken by run tasks,
    // so stopping a loop mid-attempt cannot deadlock against it.
    admin: OwnerLocks,
}

impl ScheduleManager {
    pub fn new(
        pool: Pool,
        publisher: Arc<dyn Publisher>,
        sink: Arc<dyn EventSink>,
        policy: RetryPolicy,
        cfg: SchedulerConfig,
    ) -> Self {
        Self {
            ctx: RunContext {
                pool,
                publisher,
                sink,
                policy,
                cfg,
                locks: OwnerLocks::default(),
                jobs: Arc::new(Mutex::new(HashMap::new())),
            },
            admin: OwnerLocks::default(),
        }
    }

    /// Create a schedule for the owner, superseding any existing one
    /// (last-writer-wins). The predecessor's loop is cooperatively stopped
    /// and awaited before the new timer is armed.
    #[instrument(skip_all)]
    pub async fn create(
        &self,
        owner_id: i64,
        run_at: DateTime<Utc>,
    ) -> Result<ScheduleEntry, ScheduleError> {
        if run_at <= Utc::now() {
            return Err(ScheduleError::InvalidTime);
        }
        let _admin = self.admin.acquire(owner_id).await;
        self.stop_job(owner_id).await;
        let entry = db::replace_active_schedule(&self.ctx.pool, owner_id, run_at).await?;
        info!(entry_id = %entry.id, owner_id, %run_at, "schedule created");
        self.arm(entry.clone()).await;
        Ok(entry)
    }

    /// Cancel the owner's active schedule, if any. The in-flight attempt
    /// (if one is running) finishes first; the loop observes the signal at
    /// its next checkpoint.
    #[instrument(skip_all)]
    pub async fn cancel(&self, owner_id: i64) -> Result<bool, ScheduleError> {
        let _admin = self.admin.acquire(owner_id).await;
        let stopped = self.stop_job(owner_id).await;
        let marked = db::cancel_active_schedules(&self.ctx.pool, owner_id).await? > 0;
        Ok(stopped || marked)
    }

    /// Snapshot of the owner's schedule state. Pure reads; always available.
    pub async fn status(&self, owner_id: i64) -> Result<StatusSnapshot, ScheduleError> {
        let entry = db::active_schedule(&self.ctx.pool, owner_id).await?;
        let remaining_content = db::count_unused_posts(&self.ctx.pool, owner_id).await?;
        Ok(StatusSnapshot {
            entry,
            remaining_content,
        })
    }

    /// Re-arm every entry that was pending or running when the process last
    /// stopped. A `run_at` in the past fires immediately: missed schedules
    /// catch up, they are not dropped.
    pub async fn reconcile_on_startup(&self) -> Result<usize, ScheduleError> {
        let entries = db::unfinished_schedules(&self.ctx.pool).await?;
        let count = entries.len();
        for entry in entries {
            let _admin = self.admin.acquire(entry.user_id).await;
            info!(entry_id = %entry.id, owner_id = entry.user_id, run_at = %entry.run_at, "re-arming persisted schedule");
            self.arm(entry).await;
        }
        Ok(count)
    }

    async fn arm(&self, entry: ScheduleEntry) {
        // Defensive: never leave two loops for one owner.
        self.stop_job(entry.user_id).await;
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let ctx = self.ctx.clone();
        let entry_id = entry.id;
        let owner_id = entry.user_id;
        let task = tokio::spawn(run_schedule(ctx, entry, cancel_rx));
        self.ctx.jobs.lock().await.insert(
            owner_id,
            RunHandle {
                entry_id,
                cancel: cancel_tx,
                task,
            },
        );
    }

    /// Signal and await the owner's run loop. Returns true if one existed.
    async fn stop_job(&self, owner_id: i64) -> bool {
        let handle = self.ctx.jobs.lock().await.remove(&owner_id);
        match handle {
            Some(handle) => {
                let _ = handle.cancel.send(true);
                if let Err(err) = handle.task.await {
                    warn!(?err, owner_id, "schedule task panicked");
                }
                true
            }
            None => false,
        }
    }
}

/// The life of one schedule entry: wait, run, finish, report.
async fn run_schedule(ctx: RunContext, entry: ScheduleEntry, mut cancelled: watch::Receiver<bool>) {
    let owner_id = entry.user_id;

    let wait = entry.run_at - Utc::now();
    if let Ok(wait) = wait.to_std() {
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = wait_for_cancel(&mut cancelled) => {}
        }
    }

    let mut success_count = 0u32;
    let mut failure_count = 0u32;
    let final_status;

    if *cancelled.borrow() {
        final_status = ScheduleState::Cancelled;
        finish(&ctx, entry.id, final_status).await;
    } else {
        // Checked at fire time, not just at creation: a stale timer for an
        // entry cancelled in the meantime must be a no-op.
        match db::mark_schedule_running(&ctx.pool, entry.id).await {
            Ok(true) => {}
            Ok(false) => {
                info!(entry_id = %entry.id, "schedule no longer active at fire time; skipping");
                remove_job(&ctx, owner_id, entry.id).await;
                return;
            }
            Err(err) => {
                error!(?err, entry_id = %entry.id, "failed to start schedule run");
                remove_job(&ctx, owner_id, entry.id).await;
                return;
            }
        }

        ctx.sink.run_started(owner_id, entry.id).await;
        final_status = drive_run(
            &ctx,
            &entry,
            &mut cancelled,
            &mut success_count,
            &mut failure_count,
        )
        .await;
        finish(&ctx, entry.id, final_status).await;
    }

    ctx.sink
        .run_finished(&RunSummary {
            owner_id,
            entry_id: entry.id,
            success_count,
            failure_count,
            final_status,
        })
        .await;
    info!(
        entry_id = %entry.id,
        owner_id,
        success_count,
        failure_count,
        status = %final_status,
        "schedule run finished"
    );
    remove_job(&ctx, owner_id, entry.id).await;
}

/// The publish loop proper: one item per iteration, pacing in between,
/// cancellation observed before each new attempt.
async fn drive_run(
    ctx: &RunContext,
    entry: &ScheduleEntry,
    cancelled: &mut watch::Receiver<bool>,
    success_count: &mut u32,
    failure_count: &mut u32,
) -> ScheduleState {
    let owner_id = entry.user_id;
    // Watermark of the last attempted item: keeps the run moving strictly
    // forward through the queue even when a failed item stays unused.
    let mut resume_after = 0i64;
    loop {
        if *cancelled.borrow() {
            return ScheduleState::Cancelled;
        }

        let outcome = pipeline::run_once(
            &ctx.pool,
            ctx.publisher.as_ref(),
            &ctx.policy,
            &ctx.locks,
            &ctx.cfg.pipeline,
            owner_id,
            resume_after,
        )
        .await;

        match outcome {
            Ok(RunOutcome::Published(attempt)) => {
                resume_after = attempt.content_id;
                *success_count += 1;
                ctx.sink
                    .attempt_finished(&AttemptEvent {
                        owner_id,
                        entry_id: entry.id,
                        content_id: attempt.content_id,
                        identity_id: attempt.identity_id,
                        result: AttemptResult::Success {
                            reference: attempt.reference,
                        },
                    })
                    .await;
            }
            Ok(RunOutcome::Failed(attempt)) => {
                // One item's exhausted retries never abort the run.
                resume_after = attempt.content_id;
                *failure_count += 1;
                ctx.sink
                    .attempt_finished(&AttemptEvent {
                        owner_id,
                        entry_id: entry.id,
                        content_id: attempt.content_id,
                        identity_id: attempt.identity_id,
                        result: AttemptResult::Failure {
                            error: attempt.error.unwrap_or_else(|| "unknown error".into()),
                        },
                    })
                    .await;
            }
            Ok(RunOutcome::NoContent) => {
                return if *success_count == 0 && *failure_count == 0 {
                    ScheduleState::FailedNoContent
                } else {
                    ScheduleState::Completed
                };
            }
            Ok(RunOutcome::NoIdentities) => {
                return ScheduleState::FailedNoIdentities;
            }
            Err(err) => {
                error!(?err, owner_id, "pipeline error; backing off");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    _ = wait_for_cancel(cancelled) => {}
                }
                continue;
            }
        }

        let pacing = {
            let mut rng = rand::thread_rng();
            let lo = ctx.cfg.pacing_min.as_millis() as u64;
            let hi = (ctx.cfg.pacing_max.as_millis() as u64).max(lo);
            Duration::from_millis(rng.gen_range(lo..=hi))
        };
        tokio::select! {
            _ = tokio::time::sleep(pacing) => {}
            _ = wait_for_cancel(cancelled) => {}
        }
    }
}

async fn finish(ctx: &RunContext, entry_id: Uuid, status: ScheduleState) {
    match db::finish_schedule(&ctx.pool, entry_id, status).await {
        Ok(true) => {}
        Ok(false) => {
            // Someone else already drove the entry terminal (e.g. a
            // superseding create). Terminal states stay as first written.
            info!(%entry_id, "schedule already terminal");
        }
        Err(err) => error!(?err, %entry_id, "failed to persist terminal schedule state"),
    }
}

async fn remove_job(ctx: &RunContext, owner_id: i64, entry_id: Uuid) {
    let mut jobs = ctx.jobs.lock().await;
    if jobs.get(&owner_id).is_some_and(|h| h.entry_id == entry_id) {
        jobs.remove(&owner_id);
    }
}

/// Resolves when cancellation is signalled; pends forever otherwise.
async fn wait_for_cancel(rx: &mut watch::Receiver<bool>) {
    if *rx.borrow() {
        return;
    }
    while rx.changed().await.is_ok() {
        if *rx.borrow() {
            return;
        }
    }
    // Sender gone without a signal: nobody can cancel any more.
    std::future::pending::<()>().await;
}
