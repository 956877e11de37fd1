use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pollbot::{BotApi, CommandRouter, Config, Dispatcher, Message, TelegramApi};

async fn command_start(cancel: CancellationToken, bot: Arc<dyn BotApi>, msg: Arc<Message>) {
    let welcome = "Hello! I'm a Telegram bot. Send me any text and I'll echo it back.";
    if let Err(e) = bot.send_message(msg.chat.id, welcome, &cancel).await {
        error!("Error sending welcome: {}", e);
    }
}

fn build_router() -> Arc<CommandRouter> {
    let router = Arc::new(CommandRouter::new());
    router.register("start", command_start);

    let names = router.commands();
    router.register(
        "help",
        move |cancel: CancellationToken, bot: Arc<dyn BotApi>, msg: Arc<Message>| {
            let mut help = String::from("Commands:\n");
            for name in &names {
                help.push_str(&format!("  /{}\n", name));
            }
            help.push_str("  /help\n");
            async move {
                if let Err(e) = bot.send_message(msg.chat.id, &help, &cancel).await {
                    error!("Error sending help: {}", e);
                }
            }
        },
    );
    router
}

/// Cancels `token` on Ctrl+C or SIGTERM.
fn spawn_signal_listener(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }

        info!("Signal received, shutting down...");
        token.cancel();
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,pollbot=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Configuration loaded successfully");
    info!("  API: {}", config.telegram.api_url);
    info!(
        "  Long poll: {}s (request timeout {}s)",
        config.polling.long_poll_timeout_secs, config.polling.request_timeout_secs
    );
    info!("  Error backoff: {:?}", config.polling.error_backoff());
    match config.polling.max_in_flight {
        Some(limit) => info!("  Max in flight: {}", limit),
        None => info!("  Max in flight: unbounded"),
    }
    match config.polling.drain_timeout() {
        Some(timeout) => info!("  Drain timeout: {:?}", timeout),
        None => info!("  Drain timeout: off (handlers detached on shutdown)"),
    }

    let api = Arc::new(TelegramApi::from_config(&config.telegram, &config.polling));
    let mut dispatcher = Dispatcher::builder(api)
        .router(build_router())
        .polling(config.polling.clone())
        .build();

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    dispatcher.run(shutdown).await.context("Bot stopped")?;

    info!("Bot stopped at offset {}", dispatcher.offset());
    Ok(())
}
