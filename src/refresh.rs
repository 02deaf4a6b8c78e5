//! Scheduled cache refresh.
//!
//! The refresh daemon periodically scans every backing table for URLs that
//! match a SQL `LIKE` pattern and have gone stale, then re-fetches each one
//! and upserts the fresh response into the same table. A zero interval runs
//! a single cycle. Errors are isolated per table so one broken table never
//! stalls the others.

use std::sync::Arc;
use std::time::Duration;

use sea_orm::{ConnectionTrait, DatabaseConnection, DbBackend, FromQueryResult, Statement};
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, AppResult};
use crate::fetch::Fetcher;
use crate::freshness;
use crate::proxy::Strategy;
use crate::store;

#[derive(Debug, Clone)]
pub struct RefreshConfig {
    pub interval: Duration,
    pub ttl_seconds: i64,
    pub match_url: String,
    pub strategy: Strategy,
    pub shared_cache: bool,
    /// Name under which the fetch-and-store sink operates. Must not collide
    /// with a backing table.
    pub sink_table: String,
    /// Skip storing responses whose status is not 2xx.
    pub ignore_status_error: bool,
}

#[derive(Debug)]
pub struct Refresher {
    sources: Vec<(DatabaseConnection, Vec<String>)>,
    fetcher: Arc<Fetcher>,
    config: RefreshConfig,
}

#[derive(Debug, FromQueryResult)]
struct UrlRow {
    url: String,
}

#[derive(Debug, FromQueryResult)]
struct CandidateRow {
    url: String,
    header: String,
    request_time: String,
    response_time: String,
}

impl Refresher {
    /// Validate the sink name against the backing tables and build the
    /// daemon.
    ///
    /// # Errors
    ///
    /// `AppError::Config` when the sink name is invalid or equals a backing
    /// table name.
    pub fn new(
        sources: Vec<(DatabaseConnection, Vec<String>)>,
        fetcher: Arc<Fetcher>,
        config: RefreshConfig,
    ) -> AppResult<Self> {
        if !store::valid_table_name(&config.sink_table) {
            return Err(AppError::Config(format!(
                "sink table name {:?} is invalid",
                config.sink_table
            )));
        }
        for (_, tables) in &sources {
            for table in tables {
                if table.eq_ignore_ascii_case(&config.sink_table) {
                    return Err(AppError::Config(format!(
                        "use different names for the sink table and response table {table:?}"
                    )));
                }
            }
        }
        Ok(Self {
            sources,
            fetcher,
            config,
        })
    }

    /// Run refresh cycles until `shutdown` fires. A zero interval performs
    /// one cycle and returns.
    pub async fn run(&self, shutdown: CancellationToken) {
        self.run_once().await;
        if self.config.interval.is_zero() {
            return;
        }

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => self.run_once().await,
                () = shutdown.cancelled() => {
                    tracing::info!("refresh scheduler stopped");
                    return;
                }
            }
        }
    }

    /// One full scan over every table of every database.
    pub async fn run_once(&self) {
        tracing::info!("starting data verification");
        for (db, tables) in &self.sources {
            for table in tables {
                match self.refresh_table(db, table).await {
                    Ok(refreshed) => {
                        tracing::info!(table = %table, refreshed, "verification finished");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, table = %table, "error refreshing data");
                    }
                }
            }
        }
    }

    async fn refresh_table(&self, db: &DatabaseConnection, table: &str) -> AppResult<u64> {
        let urls = match self.config.strategy {
            Strategy::Ttl => self.stale_urls_ttl(db, table).await?,
            Strategy::Rfc9111 => self.stale_urls_rfc9111(db, table).await?,
        };

        let mut refreshed = 0u64;
        for url in urls {
            match self.fetcher.fetch(&url).await {
                Ok(entry) => {
                    if self.config.ignore_status_error && entry.status / 100 != 2 {
                        tracing::debug!(url = %url, status = entry.status, "skipping error status");
                        continue;
                    }
                    match store::upsert(db, table, &url, &entry).await {
                        Ok(()) => refreshed += 1,
                        Err(e) => {
                            tracing::error!(error = %e, url = %url, table = %table, "storing refreshed response failed");
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, url = %url, sink = %self.config.sink_table, "refresh fetch failed");
                }
            }
        }
        Ok(refreshed)
    }

    async fn stale_urls_ttl(&self, db: &DatabaseConnection, table: &str) -> AppResult<Vec<String>> {
        let rows = db
            .query_all(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                format!(
                    "SELECT url FROM {table} \
                     WHERE url LIKE ? AND unixepoch() - unixepoch(response_time) > ?"
                ),
                [self.config.match_url.clone().into(), self.config.ttl_seconds.into()],
            ))
            .await?;

        Ok(rows
            .iter()
            .filter_map(|row| UrlRow::from_query_result(row, "").ok())
            .map(|row| row.url)
            .collect())
    }

    async fn stale_urls_rfc9111(
        &self,
        db: &DatabaseConnection,
        table: &str,
    ) -> AppResult<Vec<String>> {
        let rows = db
            .query_all(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                format!(
                    "SELECT url, header, request_time, response_time FROM {table} \
                     WHERE url LIKE ?"
                ),
                [self.config.match_url.clone().into()],
            ))
            .await?;

        Ok(rows
            .iter()
            .filter_map(|row| CandidateRow::from_query_result(row, "").ok())
            .filter(|row| {
                freshness::cache_expired_ttl(
                    &row.header,
                    &row.request_time,
                    &row.response_time,
                    self.config.shared_cache,
                    self.config.ttl_seconds,
                )
            })
            .map(|row| row.url)
            .collect())
    }
}
