pub mod captions;
pub mod config;
pub mod downloader;
pub mod intake;
pub mod messaging;
pub mod prefs;
pub mod scheduler;
pub mod source;
pub mod telegram;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use config::Config;
use downloader::{FallbackPolicy, FormatPlanner, YtDlpCli};
use intake::{Intake, IntakeSettings};
use prefs::PreferenceStore;
use scheduler::{JobRunner, JobScheduler};
use telegram::{BotCommand, TelegramClient};

const POLL_TIMEOUT_SECS: u64 = 30;
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(5);

fn commands() -> Vec<BotCommand> {
    ["start", "help"]
        .iter()
        .map(|name| BotCommand {
            command: name.to_string(),
            description: "Instructions".to_string(),
        })
        .collect()
}

/// Wire everything together and long-poll until Ctrl-C, then drain the queue.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let telegram = Arc::new(TelegramClient::new(&config.bot_token, config.max_filesize));

    let me = telegram
        .get_me()
        .await
        .context("getMe failed, check BOT_TOKEN")?;
    info!(bot_id = me.id, username = me.username.as_deref().unwrap_or(""), "connected to Telegram");

    if let Err(e) = telegram.set_my_commands(&commands()).await {
        warn!(error = %e, "failed to register bot commands");
    }

    tokio::fs::create_dir_all(&config.output_folder)
        .await
        .with_context(|| format!("cannot create {}", config.output_folder.display()))?;

    let media = Arc::new(
        YtDlpCli::discover(config.ytdlp_bin.clone())
            .await
            .with_timeouts(config.metadata_timeout_secs, config.download_timeout_secs),
    );
    info!(binary = media.binary(), "using yt-dlp");

    let runner = Arc::new(JobRunner::new(
        media,
        telegram.clone(),
        FormatPlanner::new(config.planner_settings()),
        FallbackPolicy::new(config.policy_settings()),
        config.output_folder.clone(),
    ));
    let scheduler = Arc::new(JobScheduler::start(
        runner,
        config.workers,
        config.max_queue,
        None,
    ));

    let prefs = Arc::new(PreferenceStore::in_dir(&config.data_dir));
    let intake = Intake::new(
        IntakeSettings {
            bot_id: me.id,
            bot_username: me.username.clone().unwrap_or_default(),
            logs_chat_id: config.logs_chat_id,
            max_bytes: Some(config.max_filesize),
            concurrency_hint: config.concurrent_fragments,
        },
        prefs,
        telegram.clone(),
        scheduler.clone(),
    );

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut offset = 0i64;

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown requested, draining queued jobs");
                break;
            }
            polled = telegram.get_updates(offset, POLL_TIMEOUT_SECS) => match polled {
                Ok(updates) => {
                    for update in updates {
                        offset = offset.max(update.update_id + 1);
                        if let Some(message) = update.message {
                            intake.handle(message.into()).await;
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "getUpdates failed");
                    tokio::time::sleep(POLL_ERROR_BACKOFF).await;
                }
            }
        }
    }

    scheduler.shutdown().await;
    Ok(())
}
