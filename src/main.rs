use anyhow::Context;
use clap::Parser;
use reqwest::Client;
use std::process::exit;
use std::sync::Arc;
use steam_account_api::broker::TwoFactorBroker;
use steam_account_api::chats::{ChatRegistry, FileChatStore};
use steam_account_api::config::Config;
use steam_account_api::http::{router, AppState, TokenList};
use steam_account_api::provider::event_channel;
use steam_account_api::session::{FileSessionStore, SessionController, SessionStore};
use steam_account_api::shutdown::Shutdown;
use steam_account_api::steam::{TradeClient, WebSessionProvider};
use steam_account_api::telegram::{run_relay, TelegramBot};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    let client = Client::builder()
        .build()
        .context("failed to create http client")?;
    let shutdown = Shutdown::new();

    let tokens = TokenList::load(&config.tokens_path).await?;

    let chats_path = config.chats_path()?;
    let registry = config.telegram_api_key.as_deref().map(|key| {
        Arc::new(ChatRegistry::new(
            FileChatStore::new(chats_path),
            TelegramBot::new(client.clone(), key),
        ))
    });
    let broker = Arc::new(TwoFactorBroker::new(registry.clone()));
    match registry {
        Some(registry) => {
            tokio::spawn(run_relay(registry, broker.clone(), shutdown.token()));
        }
        None => warn!("no telegram api key configured, 2FA codes can only be passed to /login"),
    }

    let session_store = Arc::new(FileSessionStore::new(config.session_path()?));
    let continuation = session_store.load().await.unwrap_or_else(|e| {
        warn!(error = %e, "failed to load the stored session, starting fresh");
        None
    });

    let (events, provider_events) = event_channel();
    let provider = Arc::new(WebSessionProvider::new(
        client.clone(),
        config.credentials(),
        events.clone(),
        continuation,
    ));
    let trades = Arc::new(TradeClient::new(client, events));

    let (controller, session) = SessionController::new(
        provider,
        provider_events,
        broker,
        session_store,
        trades.clone(),
        config.machine_config(),
        shutdown.clone(),
    );
    let controller = tokio::spawn(controller.run());
    session.trigger_log_on(None);

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if signal::ctrl_c().await.is_ok() {
                info!("interrupted");
                shutdown.terminate(0);
            }
        }
    });

    let addr = config.listen_addr();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to listen on {addr}"))?;
    info!(%addr, "api listening");
    axum::serve(listener, router(AppState::new(session, trades, tokens)))
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move { shutdown.cancelled().await }
        })
        .await
        .context("http server failed")?;

    let _ = controller.await;
    exit(shutdown.exit_code())
}
