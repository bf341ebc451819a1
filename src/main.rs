use async_trait::async_trait;
use lorebot::config::Config;
use lorebot::db::{Database, OpContext};
use lorebot::discord::DiscordMessageSource;
use lorebot::maintenance::MaintenanceTask;
use lorebot::recovery::{RecoveredMessage, RecoveryEngine, RecoveryHandler};
use serenity::http::Http;
use std::sync::Arc;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

/// Records replayed messages until the chat handler takes them over.
struct LoggingRecoveryHandler;

#[async_trait]
impl RecoveryHandler for LoggingRecoveryHandler {
    async fn handle(&self, message: &RecoveredMessage) -> anyhow::Result<()> {
        if message.author_is_bot {
            return Ok(());
        }
        debug!(
            "Recovered message {} from {} in channel {}: {}",
            message.id, message.author_id, message.channel_id, message.content
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load configuration
    let config = Config::from_env()?;
    debug!("Loaded configuration: {:?}", config);

    let (shutdown, ctx) = OpContext::cancellable();

    let db = Database::connect(&ctx, &config.database).await?;
    db.initialize_schema(&ctx).await?;

    let http = Arc::new(Http::new(&config.discord_token));
    let engine = RecoveryEngine::new(
        db.clone(),
        DiscordMessageSource::new(http),
        config.recovery_max_messages,
    );
    match engine
        .recover(&ctx, config.recovery_window, &LoggingRecoveryHandler)
        .await
    {
        Ok(report) => info!(
            "Recovered {} messages across {} contexts",
            report.messages_replayed, report.contexts_recovered
        ),
        // Keep running without catch-up rather than refusing to start
        Err(e) => error!("Startup recovery failed: {}", e),
    }

    let maintenance = MaintenanceTask::new(
        db.clone(),
        config.maintenance_interval,
        config.maintenance_op_timeout,
        config.thread_ownership_max_age,
        config.checkpoint_retention,
    );
    let maintenance = tokio::spawn(maintenance.run(ctx.clone()));

    info!("Storage layer ready; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down...");
    shutdown.cancel();
    if let Err(e) = maintenance.await {
        error!("Maintenance task panicked: {:?}", e);
    }
    db.close();

    Ok(())
}
