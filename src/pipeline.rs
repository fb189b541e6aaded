//! One "publish the next pending item" step.
//!
//! `run_once` pulls the oldest unused item and the identity under the
//! rotation cursor, drives the publisher through the retry policy, and
//! records what happened. It owns no persistent state of its own; the
//! repositories do.

use crate::db::{self, IdentityForPublish, Pool, PostForPublish};
use crate::model::{FailureKind, IdentityResult};
use crate::publisher::{Publisher, PublishResult};
use crate::retry::{RetryDecision, RetryPolicy};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, instrument, warn};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Upper bound on one publisher call; exceeding it counts as transient.
    pub publish_timeout: Duration,
    /// When true, an item whose retries were exhausted stays eligible for a
    /// later run with a different identity. When false it is marked used
    /// and permanently skipped.
    pub requeue_failed: bool,
    /// Post bodies are cut to this many characters before publishing.
    pub max_post_length: usize,
}

/// What one pipeline step produced.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Published(AttemptOutcome),
    Failed(AttemptOutcome),
    NoContent,
    NoIdentities,
}

#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    pub content_id: i64,
    pub identity_id: i64,
    pub reference: Option<String>,
    pub error: Option<String>,
    pub attempts: u32,
}

/// Per-owner mutual exclusion. "Mark used" and "advance cursor" are the two
/// mutations that must not race within an owner; the lock covers one whole
/// `run_once` call and is released before any pacing delay.
#[derive(Clone, Default)]
pub struct OwnerLocks {
    inner: Arc<Mutex<HashMap<i64, Arc<Mutex<()>>>>>,
}

impl OwnerLocks {
    pub async fn acquire(&self, owner_id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(owner_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// `resume_after` is the id of the last item this run attempted (0 for a
/// fresh run): selection resumes past it, so an item left unused by an
/// exhausted-retry failure waits for a future run instead of wedging this
/// one.
#[instrument(skip_all)]
pub async fn run_once(
    pool: &Pool,
    publisher: &dyn Publisher,
    policy: &RetryPolicy,
    locks: &OwnerLocks,
    cfg: &PipelineConfig,
    owner_id: i64,
    resume_after: i64,
) -> Result<RunOutcome> {
    let _guard = locks.acquire(owner_id).await;

    let Some(post) = db::next_unused_post(pool, owner_id, resume_after).await? else {
        return Ok(RunOutcome::NoContent);
    };
    let Some(identity) = db::next_identity(pool, owner_id).await? else {
        return Ok(RunOutcome::NoIdentities);
    };

    let post = clamp_body(post, cfg.max_post_length);
    let (attempts, result) = drive_publisher(publisher, policy, cfg.publish_timeout, &identity, &post).await;

    match result {
        PublishResult::Posted { reference } => {
            if !db::mark_post_used(pool, post.id).await? {
                // The guard above makes this unreachable in-process; seeing
                // it means another writer shares the database.
                warn!(post_id = post.id, "post was already marked used");
            }
            db::advance_rotation_cursor(pool, owner_id).await?;
            db::record_identity_result(pool, identity.id, IdentityResult::Ok, None).await?;
            db::append_outcome(
                pool,
                owner_id,
                post.id,
                identity.id,
                true,
                reference.as_deref(),
                None,
            )
            .await?;
            info!(post_id = post.id, identity_id = identity.id, attempts, "published");
            Ok(RunOutcome::Published(AttemptOutcome {
                content_id: post.id,
                identity_id: identity.id,
                reference,
                error: None,
                attempts,
            }))
        }
        PublishResult::Rejected { kind, message } => {
            if !cfg.requeue_failed {
                db::mark_post_used(pool, post.id).await?;
            }
            // Advance past the failing identity either way so it does not
            // block the same rotation slot on the next item.
            db::advance_rotation_cursor(pool, owner_id).await?;
            let error = format!("{}: {}", kind, message);
            db::record_identity_result(pool, identity.id, IdentityResult::Failed, Some(&error))
                .await?;
            db::append_outcome(pool, owner_id, post.id, identity.id, false, None, Some(&error))
                .await?;
            warn!(
                post_id = post.id,
                identity_id = identity.id,
                attempts,
                %kind,
                "publish failed after retries"
            );
            Ok(RunOutcome::Failed(AttemptOutcome {
                content_id: post.id,
                identity_id: identity.id,
                reference: None,
                error: Some(error),
                attempts,
            }))
        }
    }
}

/// Drive the publisher until it succeeds or the policy gives up. Retries
/// happen inside this call; only the final result is reported upward, so
/// one item yields at most one outcome record.
async fn drive_publisher(
    publisher: &dyn Publisher,
    policy: &RetryPolicy,
    timeout: Duration,
    identity: &IdentityForPublish,
    post: &PostForPublish,
) -> (u32, PublishResult) {
    let mut attempt = 1u32;
    loop {
        let result = match tokio::time::timeout(timeout, publisher.publish(identity, post)).await {
            Ok(result) => result,
            Err(_) => PublishResult::Rejected {
                kind: FailureKind::Transient,
                message: format!("publish attempt exceeded {}ms", timeout.as_millis()),
            },
        };

        match result {
            PublishResult::Posted { .. } => return (attempt, result),
            PublishResult::Rejected { kind, .. } => match policy.next_action(attempt, kind) {
                RetryDecision::GiveUp => return (attempt, result),
                RetryDecision::Retry { after } => {
                    tokio::time::sleep(after).await;
                    attempt += 1;
                }
            },
        }
    }
}

fn clamp_body(mut post: PostForPublish, max_len: usize) -> PostForPublish {
    if post.body.chars().count() > max_len {
        post.body = post.body.chars().take(max_len).collect();
    }
    post
}
