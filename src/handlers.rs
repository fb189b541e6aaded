//! Telegram front-end: collects posts and accounts from a user, relays
//! schedule/cancel/status requests to the schedule manager, and renders
//! run events back into chat messages.

use crate::config::Config;
use crate::db::{self, Pool};
use crate::events::{AttemptEvent, AttemptResult, EventSink, RunSummary};
use crate::scheduler::{ScheduleError, ScheduleManager};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{MediaKind, MessageKind};
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Time formats accepted by /schedule, tried in order.
const TIME_FORMATS: &[&str] = &[
    "%d %B %Y @%I:%M%p",
    "%d/%m/%Y %H:%M",
    "%Y-%m-%d %H:%M",
    "%d-%m-%Y %H:%M",
    "%d %B %Y %H:%M",
];

const HELP_TEXT: &str = "Commands:\n\
/auth <code> - unlock the bot\n\
/addaccount <label> <credential> - register a posting account\n\
/accounts - list registered accounts\n\
/queue - show queued posts\n\
/schedule <time> - schedule posting (e.g. 2025-08-03 12:31)\n\
/status - show the active schedule\n\
/cancel - cancel the active schedule\n\
/time - show the current local time\n\
/help - this message\n\n\
Send a text message (or a photo with a caption) to queue it as a post.";

pub struct BotState {
    pub pool: Pool,
    pub manager: Arc<ScheduleManager>,
    pub cfg: Config,
    authorized: Mutex<HashSet<i64>>,
}

impl BotState {
    pub fn new(pool: Pool, manager: Arc<ScheduleManager>, cfg: Config) -> Self {
        Self {
            pool,
            manager,
            cfg,
            authorized: Mutex::new(HashSet::new()),
        }
    }

    fn is_authorized(&self, tg_user_id: i64) -> bool {
        self.authorized.lock().unwrap().contains(&tg_user_id)
    }

    fn authorize(&self, tg_user_id: i64) {
        self.authorized.lock().unwrap().insert(tg_user_id);
    }
}

#[instrument(skip_all)]
pub async fn handle_update(bot: &Bot, state: &BotState, msg: &Message) -> Result<()> {
    let user = match msg.from() {
        Some(u) => u,
        None => return Ok(()),
    };
    let tg_user_id = user.id.0 as i64;
    let chat_id = msg.chat.id;

    if let Some(text) = msg.text() {
        let trimmed = text.trim();

        if trimmed == "/start" {
            let _ = bot
                .send_message(
                    chat_id,
                    "Scheduled posting bot. Send /auth <code> to unlock, /help for commands.",
                )
                .await;
            return Ok(());
        }

        if let Some(code) = command_arg(trimmed, "/auth") {
            if code_matches(code, &state.cfg.telegram.access_code) {
                state.authorize(tg_user_id);
                info!(tg_user_id, "user authorized");
                let _ = bot
                    .send_message(chat_id, "Authorized. Send /help for commands.")
                    .await;
            } else {
                warn!(tg_user_id, "failed authorization attempt");
                let _ = bot.send_message(chat_id, "Incorrect code.").await;
            }
            return Ok(());
        }

        if !state.is_authorized(tg_user_id) {
            let _ = bot
                .send_message(chat_id, "Unauthorized. Send /auth <code> first.")
                .await;
            return Ok(());
        }

        let full_name = format!(
            "{} {}",
            user.first_name,
            user.last_name.clone().unwrap_or_default()
        );
        let user_id = db::get_or_create_user(
            &state.pool,
            tg_user_id,
            chat_id.0,
            user.username.as_deref(),
            Some(full_name.trim()),
        )
        .await?;

        return handle_command(bot, state, chat_id, user_id, trimmed).await;
    }

    // Non-text input: photos with captions become posts with one media ref.
    if let MessageKind::Common(common) = &msg.kind {
        match &common.media_kind {
            MediaKind::Photo(photo) => {
                if !state.is_authorized(tg_user_id) {
                    let _ = bot
                        .send_message(chat_id, "Unauthorized. Send /auth <code> first.")
                        .await;
                    return Ok(());
                }
                let Some(caption) = msg.caption() else {
                    let _ = bot
                        .send_message(chat_id, "Add a caption — it becomes the post text.")
                        .await;
                    return Ok(());
                };
                let full_name = format!(
                    "{} {}",
                    user.first_name,
                    user.last_name.clone().unwrap_or_default()
                );
                let user_id = db::get_or_create_user(
                    &state.pool,
                    tg_user_id,
                    chat_id.0,
                    user.username.as_deref(),
                    Some(full_name.trim()),
                )
                .await?;
                if let Some(size) = photo.photo.last() {
                    let path = download_file(
                        bot,
                        &state.cfg.app.data_dir,
                        tg_user_id,
                        msg.id.0 as i32,
                        size.file.id.as_ref(),
                    )
                    .await?;
                    let post_id =
                        db::insert_post(&state.pool, user_id, caption, &[path]).await?;
                    let _ = bot
                        .send_message(chat_id, format!("Queued post #{post_id} (with photo)."))
                        .await;
                }
            }
            MediaKind::Text(_) => {}
            _ => {
                let _ = bot.send_message(chat_id, "Unsupported message type.").await;
            }
        }
    }

    Ok(())
}

async fn handle_command(
    bot: &Bot,
    state: &BotState,
    chat_id: ChatId,
    user_id: i64,
    trimmed: &str,
) -> Result<()> {
    let offset_minutes = state.cfg.app.utc_offset_minutes;

    if trimmed == "/help" {
        let _ = bot.send_message(chat_id, HELP_TEXT).await;
        return Ok(());
    }

    if trimmed == "/time" {
        let _ = bot
            .send_message(
                chat_id,
                format!("Current time: {}", format_local_time(Utc::now(), offset_minutes)),
            )
            .await;
        return Ok(());
    }

    if let Some(args) = command_arg(trimmed, "/addaccount") {
        let mut parts = args.splitn(2, char::is_whitespace);
        match (parts.next().filter(|s| !s.is_empty()), parts.next()) {
            (Some(label), Some(credential)) => {
                let id =
                    db::insert_identity(&state.pool, user_id, label, credential.trim()).await?;
                let _ = bot
                    .send_message(chat_id, format!("Registered account #{id} ({label})."))
                    .await;
            }
            _ => {
                let _ = bot
                    .send_message(chat_id, "Usage: /addaccount <label> <credential>")
                    .await;
            }
        }
        return Ok(());
    }

    if trimmed == "/accounts" {
        let identities = db::list_identities(&state.pool, user_id).await?;
        if identities.is_empty() {
            let _ = bot
                .send_message(chat_id, "No accounts yet. Add one with /addaccount.")
                .await;
        } else {
            let lines: Vec<String> = identities
                .iter()
                .map(|i| format!("#{} {} — last result: {}", i.id, i.label, i.last_result.as_str()))
                .collect();
            let _ = bot.send_message(chat_id, lines.join("\n")).await;
        }
        return Ok(());
    }

    if trimmed == "/queue" {
        let total = db::count_posts(&state.pool, user_id).await?;
        let unused = db::count_unused_posts(&state.pool, user_id).await?;
        let _ = bot
            .send_message(
                chat_id,
                format!("{unused} posts waiting ({total} total queued)."),
            )
            .await;
        return Ok(());
    }

    if let Some(args) = command_arg(trimmed, "/schedule") {
        if args.is_empty() {
            let _ = bot
                .send_message(
                    chat_id,
                    "Usage: /schedule <time>. Accepted formats:\n\
                     3 August 2025 @12:31PM\n03/08/2025 12:31\n2025-08-03 12:31\n\
                     3-08-2025 12:31\n3 August 2025 12:31",
                )
                .await;
            return Ok(());
        }
        let Some(run_at) = parse_local_time(args, offset_minutes) else {
            let _ = bot
                .send_message(chat_id, "Could not parse that time. See /schedule for formats.")
                .await;
            return Ok(());
        };

        let unused = db::count_unused_posts(&state.pool, user_id).await?;
        if unused == 0 {
            let _ = bot
                .send_message(chat_id, "Queue is empty — send some posts first.")
                .await;
            return Ok(());
        }
        let accounts = db::identity_count(&state.pool, user_id).await?;
        if accounts == 0 {
            let _ = bot
                .send_message(chat_id, "No accounts — add one with /addaccount first.")
                .await;
            return Ok(());
        }

        match state.manager.create(user_id, run_at).await {
            Ok(entry) => {
                let minutes = (entry.run_at - Utc::now()).num_minutes();
                let _ = bot
                    .send_message(
                        chat_id,
                        format!(
                            "Scheduled for {} (in {} minutes).\nPosts waiting: {}, accounts: {}.",
                            format_local_time(entry.run_at, offset_minutes),
                            minutes,
                            unused,
                            accounts
                        ),
                    )
                    .await;
            }
            Err(ScheduleError::InvalidTime) => {
                let _ = bot
                    .send_message(
                        chat_id,
                        format!(
                            "Scheduled time must be in the future. Current time: {}",
                            format_local_time(Utc::now(), offset_minutes)
                        ),
                    )
                    .await;
            }
            Err(err) => {
                warn!(?err, user_id, "failed to create schedule");
                let _ = bot
                    .send_message(chat_id, "Failed to create schedule. Please try again.")
                    .await;
            }
        }
        return Ok(());
    }

    if trimmed == "/status" {
        let snapshot = state.manager.status(user_id).await?;
        let text = match snapshot.entry {
            Some(entry) => format!(
                "Schedule {}: {}\nFires at: {}\nPosts waiting: {}",
                entry.id,
                entry.status,
                format_local_time(entry.run_at, offset_minutes),
                snapshot.remaining_content
            ),
            None => format!(
                "No active schedule. {} posts waiting.",
                snapshot.remaining_content
            ),
        };
        let _ = bot.send_message(chat_id, text).await;
        return Ok(());
    }

    if trimmed == "/cancel" {
        if state.manager.cancel(user_id).await? {
            let _ = bot.send_message(chat_id, "Schedule cancelled.").await;
        } else {
            let _ = bot.send_message(chat_id, "No active schedule to cancel.").await;
        }
        return Ok(());
    }

    if trimmed.starts_with('/') {
        let _ = bot.send_message(chat_id, "Unknown command.").await;
        return Ok(());
    }

    if trimmed.is_empty() {
        return Ok(());
    }

    let post_id = db::insert_post(&state.pool, user_id, trimmed, &[]).await?;
    let _ = bot
        .send_message(chat_id, format!("Queued post #{post_id}."))
        .await;
    Ok(())
}

/// Extract the argument of a slash command, requiring an exact command
/// token ("/auth" must not match "/authx").
fn command_arg<'a>(text: &'a str, cmd: &str) -> Option<&'a str> {
    if text == cmd {
        return Some("");
    }
    text.strip_prefix(cmd)
        .and_then(|rest| rest.strip_prefix(' '))
        .map(str::trim)
}

fn code_matches(input: &str, expected: &str) -> bool {
    Sha256::digest(input.trim().as_bytes()) == Sha256::digest(expected.trim().as_bytes())
}

/// Parse a user-supplied wall-clock time in the configured offset.
pub fn parse_local_time(input: &str, offset_minutes: i32) -> Option<DateTime<Utc>> {
    let offset = FixedOffset::east_opt(offset_minutes * 60)?;
    let trimmed = input.trim();
    for fmt in TIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            if let Some(local) = offset.from_local_datetime(&naive).single() {
                return Some(local.with_timezone(&Utc));
            }
        }
    }
    None
}

pub fn format_local_time(at: DateTime<Utc>, offset_minutes: i32) -> String {
    match FixedOffset::east_opt(offset_minutes * 60) {
        Some(offset) => at
            .with_timezone(&offset)
            .format("%d %B %Y, %I:%M %p")
            .to_string(),
        None => at.format("%d %B %Y, %I:%M %p UTC").to_string(),
    }
}

async fn download_file(
    bot: &Bot,
    data_dir: &str,
    tg_user_id: i64,
    msg_id: i32,
    file_id: &str,
) -> Result<String> {
    // Resolve file path from Telegram API, then download to local storage.
    let file = bot.get_file(file_id).await?;
    let dir = format!("{}/media/{}/", data_dir, tg_user_id);
    tokio::fs::create_dir_all(&dir).await.ok();
    let ext = std::path::Path::new(&file.path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("bin");
    let path = format!("{}{}_{}.{}", dir, msg_id, file.meta.unique_id, ext);
    let mut dst = tokio::fs::File::create(&path).await?;
    bot.download_file(&file.path, &mut dst).await?;
    Ok(path)
}

/// Renders run events into chat messages for the owning user.
pub struct TelegramSink {
    bot: Bot,
    pool: Pool,
    utc_offset_minutes: i32,
}

impl TelegramSink {
    pub fn new(bot: Bot, pool: Pool, utc_offset_minutes: i32) -> Self {
        Self {
            bot,
            pool,
            utc_offset_minutes,
        }
    }

    async fn send(&self, owner_id: i64, text: String) {
        match db::chat_id_for_user(&self.pool, owner_id).await {
            Ok(Some(chat)) => {
                if let Err(err) = self.bot.send_message(ChatId(chat), text).await {
                    warn!(?err, owner_id, "failed to deliver run event");
                }
            }
            Ok(None) => warn!(owner_id, "no chat known for owner; dropping run event"),
            Err(err) => warn!(?err, owner_id, "failed to resolve chat for owner"),
        }
    }
}

#[async_trait]
impl EventSink for TelegramSink {
    async fn run_started(&self, owner_id: i64, _entry_id: Uuid) {
        self.send(
            owner_id,
            format!(
                "Starting scheduled posting at {}.",
                format_local_time(Utc::now(), self.utc_offset_minutes)
            ),
        )
        .await;
    }

    async fn attempt_finished(&self, event: &AttemptEvent) {
        let text = match &event.result {
            AttemptResult::Success { reference } => match reference {
                Some(link) => format!(
                    "Posted #{} via account #{}.\nLink: {}",
                    event.content_id, event.identity_id, link
                ),
                None => format!(
                    "Posted #{} via account #{} (no link extracted).",
                    event.content_id, event.identity_id
                ),
            },
            AttemptResult::Failure { error } => format!(
                "Failed to post #{} via account #{}: {}",
                event.content_id, event.identity_id, error
            ),
        };
        self.send(event.owner_id, text).await;
    }

    async fn run_finished(&self, summary: &RunSummary) {
        self.send(
            summary.owner_id,
            format!(
                "Run finished: {}.\nPosted: {}, failed: {}.",
                summary.final_status, summary.success_count, summary.failure_count
            ),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    const IST: i32 = 330;

    #[test]
    fn parses_all_documented_formats() {
        for input in [
            "3 August 2025 @12:31PM",
            "03/08/2025 12:31",
            "2025-08-03 12:31",
            "03-08-2025 12:31",
            "3 August 2025 12:31",
        ] {
            assert!(
                parse_local_time(input, IST).is_some(),
                "failed to parse {input}"
            );
        }
    }

    #[test]
    fn parse_applies_offset() {
        let parsed = parse_local_time("2025-08-03 12:31", IST).unwrap();
        // 12:31 IST is 07:01 UTC.
        assert_eq!(parsed.hour(), 7);
        assert_eq!(parsed.minute(), 1);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_local_time("soon", IST).is_none());
        assert!(parse_local_time("2025-08-03", IST).is_none());
        assert!(parse_local_time("", IST).is_none());
    }

    #[test]
    fn command_arg_requires_exact_token() {
        assert_eq!(command_arg("/auth 1234", "/auth"), Some("1234"));
        assert_eq!(command_arg("/auth", "/auth"), Some(""));
        assert_eq!(command_arg("/authx 1234", "/auth"), None);
        assert_eq!(command_arg("/schedule  2025-08-03 12:31", "/schedule"), Some("2025-08-03 12:31"));
    }

    #[test]
    fn access_code_comparison() {
        assert!(code_matches("STA42931", "STA42931"));
        assert!(code_matches("  STA42931  ", "STA42931"));
        assert!(!code_matches("wrong", "STA42931"));
    }
}
