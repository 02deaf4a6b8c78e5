use std::sync::Arc;
use std::time::Duration;

use sea_orm::{Database, DatabaseConnection};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use httpstash::config::Config;
use httpstash::error::{AppError, AppResult};
use httpstash::fetch::{FetchConfig, Fetcher};
use httpstash::proxy::Strategy;
use httpstash::refresh::{RefreshConfig, Refresher};
use httpstash::store;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,httpstash=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting httpstash refresh daemon...");

    let config = Config::from_env()?;
    tracing::info!(
        databases = config.database_urls.len(),
        interval_secs = config.refresh_interval_seconds,
        ttl_seconds = config.ttl_seconds,
        match_url = %config.refresh_match_url,
        "Configuration loaded"
    );

    let sources = open_databases(&config).await?;
    let fetcher = Arc::new(Fetcher::new(FetchConfig::from_config(&config))?);

    let strategy = if config.rfc9111 {
        Strategy::Rfc9111
    } else {
        Strategy::Ttl
    };
    let refresher = Refresher::new(
        sources,
        fetcher,
        RefreshConfig {
            interval: Duration::from_secs(config.refresh_interval_seconds),
            ttl_seconds: config.ttl_seconds,
            match_url: config.refresh_match_url.clone(),
            strategy,
            shared_cache: config.shared_cache,
            sink_table: config.refresh_sink_table.clone(),
            ignore_status_error: config.refresh_ignore_status_error,
        },
    )?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    refresher.run(shutdown).await;
    tracing::info!("Refresh daemon shut down gracefully");
    Ok(())
}

/// Connect every configured database and discover its backing tables.
async fn open_databases(config: &Config) -> AppResult<Vec<(DatabaseConnection, Vec<String>)>> {
    let mut sources = Vec::new();
    for url in &config.database_urls {
        let db = Database::connect(url.as_str()).await?;

        let tables = if config.response_tables.is_empty() {
            store::discovery::response_tables(&db).await?
        } else {
            config.response_tables.clone()
        };
        if tables.is_empty() {
            return Err(AppError::Config(format!("no response tables found in {url:?}")));
        }

        tracing::info!(database = %url, tables = ?tables, "Database connected");
        sources.push((db, tables));
    }
    Ok(sources)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down...");
        },
        () = terminate => {
            tracing::info!("Received SIGTERM, shutting down...");
        },
    }
}
