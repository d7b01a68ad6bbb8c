//! Harvest Ledger - gamification ledger and live event feed

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use harvest_ledger::{
    bus::{spawn_logging_listener, EventBus},
    config::{load_ledger_config, Args, LogFormat, StoreKind},
    http::{self, AppState},
    notify::{LogNotifier, Notifier, WebhookNotifier},
    services::Services,
    store::{LedgerStore, MemoryStore, SqliteStore},
    views::{spawn_view, LeaderboardView},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    // Initialize tracing/logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("harvest_ledger={},info", args.log_level).into());
    let (text_layer, json_layer) = match args.log_format {
        LogFormat::Text => (Some(tracing_subscriber::fmt::layer()), None),
        LogFormat::Json => (None, Some(tracing_subscriber::fmt::layer().json())),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(text_layer)
        .with(json_layer)
        .init();

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  Harvest Ledger");
    info!("======================================");
    info!("Listen: {}", args.listen);
    info!("Store: {:?} ({})", args.store, args.data_dir.display());
    info!("Bus capacity: {}", args.bus_capacity);
    info!("Leaderboard size: {}", args.leaderboard_size);
    info!(
        "Notifications: {}",
        args.notify_webhook_url.as_deref().unwrap_or("log only")
    );
    info!("======================================");

    let ledger_config = load_ledger_config(args.config_file.as_deref())?;
    let catalog = args.resolve_catalog(&ledger_config)?;

    let store: Arc<dyn LedgerStore> = match args.store {
        StoreKind::Sqlite => Arc::new(SqliteStore::open(&args.data_dir)?),
        StoreKind::Memory => Arc::new(MemoryStore::new()),
    };
    store.upsert_badges(&catalog)?;
    info!("Badge catalog: {} badge(s)", catalog.len());

    let notifier: Arc<dyn Notifier> = match &args.notify_webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())?),
        None => Arc::new(LogNotifier),
    };

    let bus = Arc::new(EventBus::with_capacity(args.bus_capacity));
    let services = Arc::new(Services::new(
        store,
        Arc::clone(&bus),
        notifier,
        ledger_config.points.clone(),
        args.leaderboard_size,
    ));

    let _event_logger = spawn_logging_listener(Arc::clone(&bus));
    let leaderboard = spawn_view(
        LeaderboardView::new(Arc::clone(&services.leaderboard)),
        services.clone(),
        &bus,
    );
    info!("View started: {}", leaderboard.name());

    let state = Arc::new(AppState::new(
        Arc::clone(&services),
        Duration::from_millis(args.action_timeout_ms),
    ));
    let listener = tokio::net::TcpListener::bind(args.listen).await?;
    http::serve(listener, state).await?;

    leaderboard.cancel();
    info!("Harvest Ledger stopped");
    Ok(())
}
