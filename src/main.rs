use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use teloxide::prelude::*;
use tracing::{error, info};

use tg_postbot::config;
use tg_postbot::db;
use tg_postbot::handlers::{self, BotState, TelegramSink};
use tg_postbot::publisher::HttpPublisher;
use tg_postbot::retry::RetryPolicy;
use tg_postbot::scheduler::{ScheduleManager, SchedulerConfig};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/postbot.db", cfg.app.data_dir));

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let bot = Bot::new(cfg.telegram.bot_token.clone());

    let publisher = Arc::new(HttpPublisher::from_config(&cfg)?);
    let sink = Arc::new(TelegramSink::new(
        bot.clone(),
        pool.clone(),
        cfg.app.utc_offset_minutes,
    ));
    let manager = Arc::new(ScheduleManager::new(
        pool.clone(),
        publisher,
        sink,
        RetryPolicy::from_config(&cfg.retry),
        SchedulerConfig::from_config(&cfg),
    ));

    // Pick pending schedules back up after a restart; missed ones fire now.
    let rearmed = manager.reconcile_on_startup().await?;
    if rearmed > 0 {
        info!(rearmed, "re-armed persisted schedules");
    }

    let state = Arc::new(BotState::new(pool.clone(), manager, cfg.clone()));

    info!("starting telegram bot");
    teloxide::repl(bot, move |bot: Bot, msg: Message| {
        let state = state.clone();
        async move {
            if let Err(err) = handlers::handle_update(&bot, &state, &msg).await {
                error!(?err, "failed to handle update");
            }
            respond(())
        }
    })
    .await;

    Ok(())
}
