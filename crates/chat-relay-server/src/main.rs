use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use chat_relay_server::config::Settings;
use chat_relay_server::services::{
    CatalogClient, ChatRelay, CompletionClient, ConversationWindow, ModelSelector,
    SessionRegistry,
};
use chat_relay_server::store::{self, HistoryStore};
use chat_relay_server::{build_router, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,chat_relay_server=debug".to_string()),
        )
        .with_target(true)
        .with_thread_ids(true)
        .json()
        .init();

    info!("🚀 Starting chat relay server...");

    // Load configuration
    let settings = Settings::load()?;
    info!("✅ Configuration loaded");
    if settings.upstream.api_key.is_empty() {
        warn!("No upstream API key configured; AI replies will fail until APP__UPSTREAM__API_KEY is set");
    }
    if settings.admin.secret.is_empty() {
        warn!("No admin secret configured; admin endpoints are disabled");
    }

    // History store
    let history_store = store::connect(&settings.store)
        .await
        .context("Failed to open history store")?;
    spawn_expiry_sweeper(
        history_store.clone(),
        Duration::from_secs(settings.store.sweep_interval_seconds.max(1)),
    );

    // Upstream clients
    let completions = Arc::new(CompletionClient::new(&settings.upstream)?);
    let catalog = Arc::new(CatalogClient::new(&settings.upstream)?);
    let selector = Arc::new(ModelSelector::new(catalog, &settings.model));

    // Warm the model choice so the first visitor does not pay for the catalog fetch
    {
        let selector = selector.clone();
        tokio::spawn(async move {
            let model = selector.resolve().await;
            info!(%model, "✅ Upstream model selected");
        });
    }

    let window = Arc::new(ConversationWindow::new(history_store, &settings.conversation));
    let registry = Arc::new(SessionRegistry::new());
    let relay = Arc::new(ChatRelay::new(
        registry,
        window,
        selector,
        completions,
        settings.relay.clone(),
        &settings.conversation,
    ));

    let addr = SocketAddr::from((
        settings.server.host.parse::<std::net::IpAddr>()?,
        settings.server.port,
    ));
    let app = build_router(AppState::new(relay, settings));

    info!("🎯 Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

fn spawn_expiry_sweeper(store: Arc<dyn HistoryStore>, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = store.purge_expired().await {
                warn!("Expiry sweep failed: {}", e);
            }
        }
    });
}
