//! bank_core - Transaction Coordination Core
//!
//! Boots the store, event emitter, transaction service and recovery worker:
//!
//! ```text
//! ┌──────────┐    ┌──────────┐    ┌─────────────┐    ┌──────────┐
//! │  Config  │───▶│  Store   │───▶│   Service   │───▶│  Events  │
//! │  (YAML)  │    │(PG / mem)│    │(init/commit)│    │(log+bus) │
//! └──────────┘    └──────────┘    └─────────────┘    └──────────┘
//!                                        ▲
//!                                 ┌──────┴──────┐
//!                                 │  Recovery   │
//!                                 │  (periodic) │
//!                                 └─────────────┘
//! ```
//!
//! Usage: `bank_core [--env <name>]` reads `config/<name>.yaml` (default `dev`).

use std::sync::Arc;

use anyhow::Context;
use bank_core::config::{AppConfig, EventBusConfig};
use bank_core::db::Database;
use bank_core::events::{EventBus, EventEmitter, HttpEventBus};
use bank_core::logging::init_logging;
use bank_core::store::{InMemoryStore, PgStore, Stores};
use bank_core::transaction::TransactionService;
use tokio::sync::watch;

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

async fn open_stores(config: &AppConfig) -> Stores {
    let Some(url) = &config.postgres_url else {
        tracing::info!("No postgres_url configured, using in-memory store");
        return Stores::from_shared(Arc::new(InMemoryStore::new()));
    };
    let connected = async {
        let db = Database::connect(url).await?;
        db.health_check().await?;
        db.migrate().await?;
        Ok::<_, sqlx::Error>(db)
    }
    .await;
    match connected {
        Ok(db) => Stores::from_shared(Arc::new(PgStore::new(db.pool().clone()))),
        Err(e) => {
            tracing::warn!(error = %e, "PostgreSQL unavailable, falling back to in-memory store");
            Stores::from_shared(Arc::new(InMemoryStore::new()))
        }
    }
}

fn open_bus(config: Option<&EventBusConfig>) -> Option<Arc<dyn EventBus>> {
    let bus = config?;
    match HttpEventBus::new(&bus.endpoint, &bus.topic, bus.timeout()) {
        Ok(http) => {
            tracing::info!(url = http.url(), "Forwarding events to bus");
            Some(Arc::new(http))
        }
        Err(e) => {
            tracing::warn!(error = %e, "Event bus disabled");
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let app_config = AppConfig::load(&env).context("loading configuration")?;
    let _log_guard = init_logging(&app_config);

    tracing::info!(
        env = %env,
        git_hash = env!("BUILD_GIT_HASH"),
        "Starting bank_core"
    );

    let stores = open_stores(&app_config).await;
    let events = Arc::new(EventEmitter::new(
        stores.events.clone(),
        open_bus(app_config.event_bus.as_ref()),
    ));
    let service = TransactionService::new(stores, events, app_config);
    let recovery = Arc::new(service.recovery_worker());

    if let Err(e) = recovery.run_startup().await {
        tracing::error!(error = %e, "Startup recovery failed");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = {
        let recovery = recovery.clone();
        tokio::spawn(async move { recovery.run(shutdown_rx).await })
    };

    tracing::info!("bank_core ready, press Ctrl+C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;

    tracing::info!("Shutdown requested");
    let _ = shutdown_tx.send(true);
    if let Err(e) = worker.await {
        tracing::error!(error = %e, "Recovery worker panicked");
    }
    tracing::info!("bank_core stopped");
    Ok(())
}
