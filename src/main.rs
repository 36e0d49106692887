// Run with: BOT_TOKEN=xxx link-downloader-bot

use anyhow::Context;
use link_downloader_lib::config::Config;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "link_downloader_lib=info,link_downloader_bot=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env before anything reads the environment
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let config = Config::from_env().context("invalid configuration")?;

    link_downloader_lib::run(config).await.context("bot stopped with an error")?;

    Ok(())
}
