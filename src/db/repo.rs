use super::model::{IdentityForPublish, PostForPublish};
use crate::model::{Identity, IdentityResult, ScheduleEntry, ScheduleState};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::instrument;
use uuid::Uuid;

pub type Pool = SqlitePool;

/// A content item carries at most this many media references.
pub const MAX_MEDIA_REFS: usize = 4;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// For file-backed SQLite URLs, expand a leading `~/` and make sure the
/// parent directory exists. In-memory and non-sqlite URLs pass through.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path.is_empty() {
        return url.to_string();
    }

    let expanded = match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path.to_string(),
    };
    if let Some(parent) = std::path::Path::new(&expanded).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query {
        Some(q) => format!("sqlite://{}?{}", expanded, q),
        None => format!("sqlite://{}", expanded),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn get_or_create_user(
    pool: &Pool,
    tg_user_id: i64,
    tg_chat_id: i64,
    username: Option<&str>,
    full_name: Option<&str>,
) -> Result<i64> {
    if let Some(id) = sqlx::query_scalar::<_, i64>("SELECT id FROM users WHERE tg_user_id = ?")
        .bind(tg_user_id)
        .fetch_optional(pool)
        .await?
    {
        return Ok(id);
    }

    let rec = sqlx::query(
        "INSERT INTO users (tg_user_id, tg_chat_id, username, full_name) VALUES (?, ?, ?, ?) RETURNING id",
    )
    .bind(tg_user_id)
    .bind(tg_chat_id)
    .bind(username)
    .bind(full_name)
    .fetch_one(pool)
    .await?;
    Ok(rec.get::<i64, _>("id"))
}

pub async fn chat_id_for_user(pool: &Pool, user_id: i64) -> Result<Option<i64>> {
    let chat = sqlx::query_scalar::<_, i64>("SELECT tg_chat_id FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    Ok(chat)
}

// ---------------------------------------------------------------------------
// Content store: ordered per-user items partitioned into unused/used.

#[instrument(skip_all)]
pub async fn insert_post(
    pool: &Pool,
    user_id: i64,
    body: &str,
    media_refs: &[String],
) -> Result<i64> {
    if media_refs.len() > MAX_MEDIA_REFS {
        return Err(anyhow!(
            "a post carries at most {} media references",
            MAX_MEDIA_REFS
        ));
    }
    let media = serde_json::to_string(media_refs)?;
    let rec = sqlx::query("INSERT INTO content (user_id, body, media_refs) VALUES (?, ?, ?) RETURNING id")
        .bind(user_id)
        .bind(body)
        .bind(media)
        .fetch_one(pool)
        .await?;
    Ok(rec.get("id"))
}

/// The owner's oldest unused item beyond `after_id`, FIFO by creation
/// sequence. Run loops pass the id of the last item they attempted so a
/// failed-but-still-eligible item is not re-selected within the same run;
/// a fresh run starts over from 0.
pub async fn next_unused_post(
    pool: &Pool,
    user_id: i64,
    after_id: i64,
) -> Result<Option<PostForPublish>> {
    let row = sqlx::query(
        "SELECT id, body, media_refs FROM content WHERE user_id = ? AND used = 0 AND id > ? \
         ORDER BY id ASC LIMIT 1",
    )
    .bind(user_id)
    .bind(after_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let media_json: String = row.get("media_refs");
    let media_refs: Vec<String> =
        serde_json::from_str(&media_json).context("invalid media_refs JSON")?;
    Ok(Some(PostForPublish {
        id: row.get("id"),
        body: row.get("body"),
        media_refs,
    }))
}

pub async fn count_unused_posts(pool: &Pool, user_id: i64) -> Result<i64> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM content WHERE user_id = ? AND used = 0")
            .bind(user_id)
            .fetch_one(pool)
            .await?;
    Ok(count)
}

pub async fn count_posts(pool: &Pool, user_id: i64) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM content WHERE user_id = ?")
        .bind(user_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Mark an item used. The marker is monotonic: a second call is a no-op and
/// returns false, so at-most-once consumption can be asserted by callers.
#[instrument(skip_all)]
pub async fn mark_post_used(pool: &Pool, post_id: i64) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE content SET used = 1, used_at = CURRENT_TIMESTAMP WHERE id = ? AND used = 0",
    )
    .bind(post_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

// ---------------------------------------------------------------------------
// Identity rotator: ordered per-user identities plus a rotation cursor.

#[instrument(skip_all)]
pub async fn insert_identity(
    pool: &Pool,
    user_id: i64,
    label: &str,
    credential: &str,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO identities (user_id, label, credential) VALUES (?, ?, ?) RETURNING id",
    )
    .bind(user_id)
    .bind(label)
    .bind(credential)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

pub async fn identity_count(pool: &Pool, user_id: i64) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM identities WHERE user_id = ?")
        .bind(user_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

pub async fn list_identities(pool: &Pool, user_id: i64) -> Result<Vec<Identity>> {
    let rows = sqlx::query(
        "SELECT id, user_id, label, credential, last_used_at, last_result, last_error, created_at \
         FROM identities WHERE user_id = ? ORDER BY id ASC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| {
            let result_str: String = row.get("last_result");
            let last_result =
                IdentityResult::parse_result(&result_str).unwrap_or(IdentityResult::Unknown);
            Ok(Identity {
                id: row.get("id"),
                user_id: row.get("user_id"),
                label: row.get("label"),
                credential: row.get("credential"),
                last_used_at: row.try_get("last_used_at").ok(),
                last_result,
                last_error: row.try_get::<Option<String>, _>("last_error").ok().flatten(),
                created_at: row.get("created_at"),
            })
        })
        .collect()
}

/// Raw rotation cursor for the owner (monotonic counter; callers take it
/// modulo the current identity count).
pub async fn rotation_cursor(pool: &Pool, user_id: i64) -> Result<i64> {
    let pos: Option<i64> =
        sqlx::query_scalar("SELECT position FROM rotation_cursor WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(pool)
            .await?;
    Ok(pos.unwrap_or(0))
}

#[instrument(skip_all)]
pub async fn advance_rotation_cursor(pool: &Pool, user_id: i64) -> Result<()> {
    sqlx::query(
        "INSERT INTO rotation_cursor (user_id, position) VALUES (?, 1) \
         ON CONFLICT(user_id) DO UPDATE SET position = position + 1, updated_at = CURRENT_TIMESTAMP",
    )
    .bind(user_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// The identity the cursor points at, round-robin over the current set.
/// The cursor is reduced modulo the live count at read time, so a shrunken
/// identity set never leaves it dangling.
pub async fn next_identity(pool: &Pool, user_id: i64) -> Result<Option<IdentityForPublish>> {
    let count = identity_count(pool, user_id).await?;
    if count == 0 {
        return Ok(None);
    }
    let offset = rotation_cursor(pool, user_id).await? % count;

    let row = sqlx::query(
        "SELECT id, label, credential FROM identities WHERE user_id = ? ORDER BY id ASC LIMIT 1 OFFSET ?",
    )
    .bind(user_id)
    .bind(offset)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| IdentityForPublish {
        id: row.get("id"),
        label: row.get("label"),
        credential: row.get("credential"),
    }))
}

#[instrument(skip_all)]
pub async fn record_identity_result(
    pool: &Pool,
    identity_id: i64,
    result: IdentityResult,
    error: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE identities SET last_result = ?, last_error = ?, last_used_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(result.as_str())
    .bind(error)
    .bind(identity_id)
    .execute(pool)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Schedules: at most one pending/running entry per owner.

fn entry_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ScheduleEntry> {
    let id_str: String = row.get("id");
    let id = Uuid::parse_str(&id_str).context("invalid schedule id")?;
    let run_at_str: String = row.get("run_at");
    let run_at = DateTime::parse_from_rfc3339(&run_at_str)
        .context("invalid schedule run_at")?
        .with_timezone(&Utc);
    let status_str: String = row.get("status");
    let status = ScheduleState::parse_state(&status_str)
        .ok_or_else(|| anyhow!("schedule {} has unknown status {}", id_str, status_str))?;
    Ok(ScheduleEntry {
        id,
        user_id: row.get("user_id"),
        run_at,
        status,
        created_at: row.get("created_at"),
    })
}

/// Cancel any pending/running entry for the owner and persist a fresh
/// pending one (last-writer-wins), atomically.
#[instrument(skip_all)]
pub async fn replace_active_schedule(
    pool: &Pool,
    user_id: i64,
    run_at: DateTime<Utc>,
) -> Result<ScheduleEntry> {
    let id = Uuid::new_v4();
    let mut tx = pool.begin().await?;
    sqlx::query(
        "UPDATE schedules SET status = 'cancelled' WHERE user_id = ? AND status IN ('pending', 'running')",
    )
    .bind(user_id)
    .execute(&mut *tx)
    .await?;
    let row = sqlx::query(
        "INSERT INTO schedules (id, user_id, run_at, status) VALUES (?, ?, ?, 'pending') \
         RETURNING id, user_id, run_at, status, created_at",
    )
    .bind(id.to_string())
    .bind(user_id)
    .bind(run_at.to_rfc3339())
    .fetch_one(&mut *tx)
    .await?;
    let entry = entry_from_row(&row)?;
    tx.commit().await?;
    Ok(entry)
}

pub async fn active_schedule(pool: &Pool, user_id: i64) -> Result<Option<ScheduleEntry>> {
    let row = sqlx::query(
        "SELECT id, user_id, run_at, status, created_at FROM schedules \
         WHERE user_id = ? AND status IN ('pending', 'running') LIMIT 1",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(entry_from_row).transpose()
}

pub async fn schedule_status(pool: &Pool, entry_id: Uuid) -> Result<Option<ScheduleState>> {
    let status: Option<String> = sqlx::query_scalar("SELECT status FROM schedules WHERE id = ?")
        .bind(entry_id.to_string())
        .fetch_optional(pool)
        .await?;
    Ok(status.and_then(|s| ScheduleState::parse_state(&s)))
}

/// Guarded transition into `running`. Returns false when the entry was
/// cancelled or superseded in the meantime — a stale timer firing must
/// observe that and become a no-op.
#[instrument(skip_all)]
pub async fn mark_schedule_running(pool: &Pool, entry_id: Uuid) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE schedules SET status = 'running' WHERE id = ? AND status IN ('pending', 'running')",
    )
    .bind(entry_id.to_string())
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Guarded transition into a terminal state. Terminal states are immutable;
/// returns false when the entry already reached one.
#[instrument(skip_all)]
pub async fn finish_schedule(pool: &Pool, entry_id: Uuid, status: ScheduleState) -> Result<bool> {
    if !status.is_terminal() {
        return Err(anyhow!("{} is not a terminal schedule state", status));
    }
    let res = sqlx::query(
        "UPDATE schedules SET status = ? WHERE id = ? AND status IN ('pending', 'running')",
    )
    .bind(status.as_str())
    .bind(entry_id.to_string())
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn cancel_active_schedules(pool: &Pool, user_id: i64) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE schedules SET status = 'cancelled' WHERE user_id = ? AND status IN ('pending', 'running')",
    )
    .bind(user_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

/// Entries that were pending or running when the process last stopped.
pub async fn unfinished_schedules(pool: &Pool) -> Result<Vec<ScheduleEntry>> {
    let rows = sqlx::query(
        "SELECT id, user_id, run_at, status, created_at FROM schedules \
         WHERE status IN ('pending', 'running') ORDER BY created_at ASC",
    )
    .fetch_all(pool)
    .await?;
    rows.iter().map(entry_from_row).collect()
}

// ---------------------------------------------------------------------------
// Outcomes: append-only audit log, one row per final attempt.

#[instrument(skip_all)]
pub async fn append_outcome(
    pool: &Pool,
    user_id: i64,
    content_id: i64,
    identity_id: i64,
    success: bool,
    reference: Option<&str>,
    error: Option<&str>,
) -> Result<i64> {
    let result = if success { "success" } else { "failure" };
    let rec = sqlx::query(
        "INSERT INTO outcomes (user_id, content_id, identity_id, result, reference, error) \
         VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(user_id)
    .bind(content_id)
    .bind(identity_id)
    .bind(result)
    .bind(reference)
    .bind(error)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}
