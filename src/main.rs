mod abs_client;
mod cache;
mod completion;
mod config;
mod hardcover_client;
mod matcher;
mod rate_gate;
mod session;
mod sync;

use std::{path::Path, sync::Arc};

use abs_client::{AbsClient, LibraryService};
use anyhow::Context;
use cache::ProgressCache;
use config::Config;
use hardcover_client::HardcoverClient;
use migration::MigratorTrait;
use rate_gate::RateGate;
use sea_orm::Database;
use sync::{SyncOptions, SyncOrchestrator};
use tracing_error::ErrorLayer;
use tracing_subscriber::{EnvFilter, fmt::SubscriberBuilder, prelude::*};

type AbsHardcoverResult<T> = anyhow::Result<T>;

#[tokio::main]
async fn main() -> AbsHardcoverResult<()> {
    // Initialize tracing (logs). Respect RUST_LOG if set, default to info for our crate and warn for deps.
    let default_filter = format!(
        "{}=info,reqwest=warn,h2=warn,sqlx=warn",
        env!("CARGO_PKG_NAME")
    );
    let env_filter = std::env::var("RUST_LOG").unwrap_or(default_filter);
    SubscriberBuilder::default()
        .with_env_filter(EnvFilter::new(env_filter))
        .with_target(false)
        .with_level(true)
        .pretty()
        .finish()
        .with(ErrorLayer::default())
        .init();
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting ABS Hardcover Sync"
    );
    // Load environment variables from .env files
    if Path::new(".env.local").exists() {
        dotenvy::from_filename(".env.local")?;
    } else if Path::new(".env").exists() {
        dotenvy::from_filename(".env")?;
    };
    let config = Config::load();
    match config.validate() {
        Ok(_) => {}
        Err(e) => {
            return Err(anyhow::anyhow!(e));
        }
    }

    let db_conn = Database::connect(&config.db_connection_string)
        .await
        .with_context(|| "Failed to connect to database")?;

    migration::Migrator::up(&db_conn, None)
        .await
        .with_context(|| "Failed to run database migrations")?;

    let abs_gate = Arc::new(RateGate::new(
        "audiobookshelf",
        config.abs_max_concurrent,
        config.abs_requests_per_minute,
    ));
    let abs_client = AbsClient::new(&config.abs_base_url)?
        .with_api_key(&config.abs_api_key)
        .with_rate_gate(abs_gate);
    tracing::info!(abs_base = %config.abs_base_url, "configured ABS client");

    let hardcover_gate = Arc::new(RateGate::new(
        "hardcover",
        config.hardcover_max_concurrent,
        config.hardcover_requests_per_minute,
    ));
    let hardcover_client = HardcoverClient::new(&config.hardcover_base_url)?
        .with_token(&config.hardcover_token)
        .with_rate_gate(hardcover_gate);

    // Connectivity failures are run-fatal before any work starts.
    let status = abs_client
        .get_status()
        .await
        .with_context(|| "Failed to reach the Audiobookshelf server")?;
    tracing::info!(
        server_version = status.server_version.as_deref().unwrap_or("unknown"),
        "connected to Audiobookshelf"
    );
    let libraries = abs_client
        .get_libraries()
        .await
        .with_context(|| "Failed to list Audiobookshelf libraries")?;
    tracing::debug!(
        libraries = ?libraries.iter().map(|l| l.name.as_str()).collect::<Vec<_>>(),
        "available libraries"
    );
    let me = hardcover_client
        .get_me()
        .await
        .with_context(|| "Failed to authenticate against Hardcover")?;
    tracing::info!(
        account = me.username.as_deref().unwrap_or("unknown"),
        "connected to Hardcover"
    );

    let cache = Arc::new(ProgressCache::new(db_conn));
    let orchestrator = SyncOrchestrator::new(
        Arc::new(abs_client),
        Arc::new(hardcover_client),
        cache.clone(),
        SyncOptions::from(&config),
    );

    let result = orchestrator.run().await?;

    for detail in &result.book_details {
        tracing::debug!(
            title = %detail.title,
            status = %detail.status,
            actions = ?detail.actions,
            timing_ms = detail.timing.as_millis() as u64,
            "book result"
        );
    }
    for error in &result.errors {
        tracing::warn!(%error, "book failed during run");
    }
    tracing::info!(
        processed = result.books_processed,
        synced = result.books_synced,
        completed = result.books_completed,
        auto_added = result.books_auto_added,
        skipped = result.books_skipped,
        duplicates_removed = result.duplicates_removed,
        errors = result.errors.len(),
        "sync summary"
    );

    let stats = cache.stats().await?;
    tracing::info!(
        cached_books = stats.total,
        recently_updated = stats.recent,
        size_bytes = stats.size_on_disk_bytes,
        "cache stats"
    );

    Ok(())
}
