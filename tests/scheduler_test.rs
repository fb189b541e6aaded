use chrono::{Duration as ChronoDuration, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tg_postbot::db::{self, IdentityForPublish, PostForPublish};
use tg_postbot::events::{AttemptEvent, AttemptResult, EventSink, RunSummary};
use tg_postbot::model::ScheduleState;
use tg_postbot::pipeline::PipelineConfig;
use tg_postbot::publisher::{PublishResult, Publisher};
use tg_postbot::retry::RetryPolicy;
use tg_postbot::scheduler::{ScheduleError, ScheduleManager, SchedulerConfig};
use tokio::sync::Mutex;
use uuid::Uuid;

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

async fn seed_owner(pool: &sqlx::SqlitePool) -> i64 {
    db::get_or_create_user(pool, 7, 7, Some("sched"), Some("Sched"))
        .await
        .unwrap()
}

fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        pacing_min: Duration::from_millis(1),
        pacing_max: Duration::from_millis(3),
        pipeline: PipelineConfig {
            publish_timeout: Duration::from_millis(200),
            requeue_failed: true,
            max_post_length: 280,
        },
    }
}

#[derive(Clone, Default)]
struct CountingPublisher {
    responses: Arc<Mutex<VecDeque<PublishResult>>>,
    calls: Arc<Mutex<Vec<i64>>>,
}

impl CountingPublisher {
    async fn call_count(&self) -> usize {
        self.calls.lock().await.len()
    }
}

#[async_trait::async_trait]
impl Publisher for CountingPublisher {
    async fn publish(&self, identity: &IdentityForPublish, _post: &PostForPublish) -> PublishResult {
        self.calls.lock().await.push(identity.id);
        self.responses
            .lock()
            .await
            .pop_front()
            .unwrap_or(PublishResult::Posted {
                reference: Some("https://posts.example/i/status/5".into()),
            })
    }
}

#[derive(Clone, Default)]
struct RecordingSink {
    started: Arc<Mutex<Vec<Uuid>>>,
    events: Arc<Mutex<Vec<AttemptEvent>>>,
    summaries: Arc<Mutex<Vec<RunSummary>>>,
}

impl RecordingSink {
    async fn summary_for(&self, entry_id: Uuid) -> Option<RunSummary> {
        self.summaries
            .lock()
            .await
            .iter()
            .find(|s| s.entry_id == entry_id)
            .cloned()
    }
}

#[async_trait::async_trait]
impl EventSink for RecordingSink {
    async fn run_started(&self, _owner_id: i64, entry_id: Uuid) {
        self.started.lock().await.push(entry_id);
    }

    async fn attempt_finished(&self, event: &AttemptEvent) {
        self.events.lock().await.push(event.clone());
    }

    async fn run_finished(&self, summary: &RunSummary) {
        self.summaries.lock().await.push(summary.clone());
    }
}

fn manager(
    pool: &sqlx::SqlitePool,
    publisher: &CountingPublisher,
    sink: &RecordingSink,
) -> ScheduleManager {
    ScheduleManager::new(
        pool.clone(),
        Arc::new(publisher.clone()),
        Arc::new(sink.clone()),
        RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2)),
        fast_config(),
    )
}

async fn wait_for_terminal(pool: &sqlx::SqlitePool, entry_id: Uuid) -> ScheduleState {
    for _ in 0..250 {
        if let Some(state) = db::schedule_status(pool, entry_id).await.unwrap() {
            if state.is_terminal() {
                return state;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("schedule never reached a terminal state");
}

async fn wait_for_summary(sink: &RecordingSink, entry_id: Uuid) -> RunSummary {
    for _ in 0..250 {
        if let Some(summary) = sink.summary_for(entry_id).await {
            return summary;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("run never produced a summary");
}

#[tokio::test]
async fn run_drains_queue_and_completes() {
    let pool = setup_pool().await;
    let owner = seed_owner(&pool).await;
    let publisher = CountingPublisher::default();
    let sink = RecordingSink::default();
    let manager = manager(&pool, &publisher, &sink);

    db::insert_post(&pool, owner, "first", &[]).await.unwrap();
    db::insert_post(&pool, owner, "second", &[]).await.unwrap();
    db::insert_identity(&pool, owner, "a", "cred").await.unwrap();

    let entry = manager
        .create(owner, Utc::now() + ChronoDuration::milliseconds(250))
        .await
        .unwrap();
    assert_eq!(entry.status, ScheduleState::Pending);

    assert_eq!(
        wait_for_terminal(&pool, entry.id).await,
        ScheduleState::Completed
    );
    let summary = wait_for_summary(&sink, entry.id).await;
    assert_eq!(summary.success_count, 2);
    assert_eq!(summary.failure_count, 0);
    assert_eq!(summary.final_status, ScheduleState::Completed);

    assert_eq!(sink.started.lock().await.clone(), vec![entry.id]);
    let events = sink.events.lock().await;
    assert_eq!(events.len(), 2);
    assert!(events
        .iter()
        .all(|e| matches!(e.result, AttemptResult::Success { .. })));
    drop(events);

    assert_eq!(publisher.call_count().await, 2);

    let snapshot = manager.status(owner).await.unwrap();
    assert!(snapshot.entry.is_none());
    assert_eq!(snapshot.remaining_content, 0);
}

#[tokio::test]
async fn create_rejects_past_times() {
    let pool = setup_pool().await;
    let owner = seed_owner(&pool).await;
    let publisher = CountingPublisher::default();
    let sink = RecordingSink::default();
    let manager = manager(&pool, &publisher, &sink);

    let err = manager
        .create(owner, Utc::now() - ChronoDuration::minutes(1))
        .await
        .unwrap_err();
    assert!(matches!(err, ScheduleError::InvalidTime));
    assert!(db::active_schedule(&pool, owner).await.unwrap().is_none());
}

#[tokio::test]
async fn cancel_before_fire_publishes_nothing() {
    let pool = setup_pool().await;
    let owner = seed_owner(&pool).await;
    let publisher = CountingPublisher::default();
    let sink = RecordingSink::default();
    let manager = manager(&pool, &publisher, &sink);

    db::insert_post(&pool, owner, "never sent", &[]).await.unwrap();
    db::insert_identity(&pool, owner, "a", "cred").await.unwrap();

    let entry = manager
        .create(owner, Utc::now() + ChronoDuration::seconds(30))
        .await
        .unwrap();
    assert!(manager.cancel(owner).await.unwrap());

    assert_eq!(
        db::schedule_status(&pool, entry.id).await.unwrap(),
        Some(ScheduleState::Cancelled)
    );
    let summary = wait_for_summary(&sink, entry.id).await;
    assert_eq!(summary.final_status, ScheduleState::Cancelled);
    assert_eq!(summary.success_count, 0);

    assert_eq!(publisher.call_count().await, 0);
    assert_eq!(db::count_unused_posts(&pool, owner).await.unwrap(), 1);

    // A second cancel finds nothing active.
    assert!(!manager.cancel(owner).await.unwrap());
}

#[tokio::test]
async fn new_schedule_supersedes_previous() {
    let pool = setup_pool().await;
    let owner = seed_owner(&pool).await;
    let publisher = CountingPublisher::default();
    let sink = RecordingSink::default();
    let manager = manager(&pool, &publisher, &sink);

    let first = manager
        .create(owner, Utc::now() + ChronoDuration::seconds(30))
        .await
        .unwrap();
    let second = manager
        .create(owner, Utc::now() + ChronoDuration::seconds(60))
        .await
        .unwrap();

    assert_eq!(
        db::schedule_status(&pool, first.id).await.unwrap(),
        Some(ScheduleState::Cancelled)
    );
    let live: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM schedules WHERE user_id = ? AND status != 'cancelled'",
    )
    .bind(owner)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(live, 1);

    let active = db::active_schedule(&pool, owner).await.unwrap().unwrap();
    assert_eq!(active.id, second.id);

    // The superseded entry still reports a terminal summary.
    let summary = wait_for_summary(&sink, first.id).await;
    assert_eq!(summary.final_status, ScheduleState::Cancelled);

    manager.cancel(owner).await.unwrap();
}

#[tokio::test]
async fn run_without_identities_fails_terminally() {
    let pool = setup_pool().await;
    let owner = seed_owner(&pool).await;
    let publisher = CountingPublisher::default();
    let sink = RecordingSink::default();
    let manager = manager(&pool, &publisher, &sink);

    db::insert_post(&pool, owner, "stuck", &[]).await.unwrap();

    let entry = manager
        .create(owner, Utc::now() + ChronoDuration::milliseconds(200))
        .await
        .unwrap();
    assert_eq!(
        wait_for_terminal(&pool, entry.id).await,
        ScheduleState::FailedNoIdentities
    );
    assert_eq!(publisher.call_count().await, 0);
    assert_eq!(db::count_unused_posts(&pool, owner).await.unwrap(), 1);
}

#[tokio::test]
async fn run_without_content_fails_terminally() {
    let pool = setup_pool().await;
    let owner = seed_owner(&pool).await;
    let publisher = CountingPublisher::default();
    let sink = RecordingSink::default();
    let manager = manager(&pool, &publisher, &sink);

    db::insert_identity(&pool, owner, "a", "cred").await.unwrap();

    let entry = manager
        .create(owner, Utc::now() + ChronoDuration::milliseconds(200))
        .await
        .unwrap();
    assert_eq!(
        wait_for_terminal(&pool, entry.id).await,
        ScheduleState::FailedNoContent
    );
}

#[tokio::test]
async fn failed_items_do_not_abort_the_run() {
    let pool = setup_pool().await;
    let owner = seed_owner(&pool).await;
    let publisher = CountingPublisher::default();
    publisher.responses.lock().await.push_back(PublishResult::Rejected {
        kind: tg_postbot::model::FailureKind::ContentRejected,
        message: "duplicate".into(),
    });
    let sink = RecordingSink::default();
    let manager = manager(&pool, &publisher, &sink);

    db::insert_post(&pool, owner, "bad", &[]).await.unwrap();
    db::insert_post(&pool, owner, "good", &[]).await.unwrap();
    db::insert_identity(&pool, owner, "a", "cred").await.unwrap();

    let entry = manager
        .create(owner, Utc::now() + ChronoDuration::milliseconds(200))
        .await
        .unwrap();

    // Item 1 fails permanently but stays queued; item 2 goes through and
    // the run completes rather than aborting.
    assert_eq!(
        wait_for_terminal(&pool, entry.id).await,
        ScheduleState::Completed
    );
    let summary = wait_for_summary(&sink, entry.id).await;
    assert_eq!(summary.success_count, 1);
    assert_eq!(summary.failure_count, 1);
    assert_eq!(db::count_unused_posts(&pool, owner).await.unwrap(), 1);
}

#[tokio::test]
async fn reconcile_fires_missed_schedules() {
    let pool = setup_pool().await;
    let owner = seed_owner(&pool).await;
    let publisher = CountingPublisher::default();
    let sink = RecordingSink::default();

    db::insert_post(&pool, owner, "late", &[]).await.unwrap();
    db::insert_identity(&pool, owner, "a", "cred").await.unwrap();

    // Entry persisted by a previous process, already overdue.
    let entry =
        db::replace_active_schedule(&pool, owner, Utc::now() - ChronoDuration::minutes(5))
            .await
            .unwrap();

    let manager = manager(&pool, &publisher, &sink);
    assert_eq!(manager.reconcile_on_startup().await.unwrap(), 1);

    assert_eq!(
        wait_for_terminal(&pool, entry.id).await,
        ScheduleState::Completed
    );
    assert_eq!(publisher.call_count().await, 1);
    let summary = wait_for_summary(&sink, entry.id).await;
    assert_eq!(summary.success_count, 1);
}

#[tokio::test]
async fn cancel_with_nothing_active_returns_false() {
    let pool = setup_pool().await;
    let owner = seed_owner(&pool).await;
    let publisher = CountingPublisher::default();
    let sink = RecordingSink::default();
    let manager = manager(&pool, &publisher, &sink);

    assert!(!manager.cancel(owner).await.unwrap());
}
