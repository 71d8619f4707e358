// Echo bot: answers every message with its own text

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vk_bot::{BotConfig, Dispatcher, MESSAGE_NEW, RAW_EVENT};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,vk_bot=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = BotConfig::from_env().context("Failed to load configuration")?;
    tracing::info!(tokens = config.tokens.len(), "Configuration loaded");

    let dispatcher = Dispatcher::builder(config.tokens)
        .config(config.api)
        .span(tracing::info_span!("echo"))
        .build();

    dispatcher.on(MESSAGE_NEW, |event| async move {
        let Some(message) = event.message() else {
            return Ok(());
        };
        if message.out || message.text.is_empty() {
            return Ok(());
        }
        event.respond(&message.text).await?;
        Ok::<_, anyhow::Error>(())
    });

    dispatcher.on(RAW_EVENT, |event| async move {
        tracing::debug!(group_id = event.group_id, kind = %event.kind, "unhandled update");
        Ok::<_, anyhow::Error>(())
    });

    dispatcher
        .start()
        .await
        .context("Failed to start dispatcher")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    tracing::info!("Shutting down");
    dispatcher.stop().await;

    Ok(())
}
