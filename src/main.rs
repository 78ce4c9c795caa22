use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;

use killfeed_backend::config::KillfeedConfig;
use killfeed_backend::logging;
use killfeed_backend::module::killfeed::retry::RetryPolicy;
use killfeed_backend::module::killfeed::state::StateStore;
use killfeed_backend::module::killfeed::{
    GameinfoClient, IconCache, IngestionScheduler, OutboxNotifier, ReportRenderer,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());
    let config = KillfeedConfig::from_file(&config_path)
        .context(format!("Failed to load configuration from {}", config_path))?;

    if config.guild_id.is_empty() {
        anyhow::bail!("guild_id must be set in {}", config_path);
    }

    let _logging_guard = logging::init_logging(&config.log_dir, &config.log_level);

    tracing::info!("Killfeed backend starting...");
    tracing::info!(
        "Tracking guild {} ({}), polling every {}s",
        config.guild_id,
        if config.guild_name.is_empty() {
            "unnamed"
        } else {
            &config.guild_name
        },
        config.poll_interval_secs
    );

    let retry = RetryPolicy {
        max_attempts: config.retry_max_attempts,
        base_delay: Duration::from_millis(config.retry_base_delay_ms),
        max_delay: Duration::from_millis(config.retry_max_delay_ms),
    };

    let client = Arc::new(GameinfoClient::new(
        &config.api_base_url,
        Duration::from_secs(config.request_timeout_secs),
        retry.clone(),
    )?);

    let icons = IconCache::new(
        client.clone(),
        retry,
        &config.icon_cache_dir,
        config.icon_memory_capacity,
        config.icon_workers,
    );

    let renderer = ReportRenderer::new(
        &config.render_base_url,
        config.icon_size,
        config.top_contributors,
        &config.guild_name,
    );

    let notifier = Arc::new(OutboxNotifier::new(&config.output_dir));
    let store = StateStore::new(&config.state_path);

    let mut scheduler =
        IngestionScheduler::new(config, client, icons, renderer, notifier, store);
    scheduler.initialize().await;

    // Ctrl-C flips the shutdown flag; the scheduler stops between ticks so
    // in-flight work finishes naturally.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received shutdown signal");
            let _ = shutdown_tx.send(true);
        }
    });

    scheduler.run(shutdown_rx).await;

    tracing::info!("Killfeed backend stopped");
    Ok(())
}
