//! Multi-database repository.
//!
//! Wraps one `DatabaseEngine` per configured database. Lookups fan out to
//! every engine concurrently and the first row wins; the losing engines'
//! lookups are cancelled when their futures drop. Writes are directed by the
//! entry's `database_id`, with `FREE_CHOICE` rotating round-robin across
//! databases.

use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use sea_orm::DatabaseConnection;
use tokio::sync::Mutex;

use crate::error::{AppError, AppResult};
use crate::store::engine::DatabaseEngine;
use crate::store::{CachedResponse, FREE_CHOICE};

pub struct Repository {
    engines: Vec<DatabaseEngine>,
    next_writer: Mutex<usize>,
}

impl Repository {
    /// Build one engine per `(connection, backing tables)` pair. Ordinals
    /// are assigned in input order and become the rows' `database_id`.
    ///
    /// # Errors
    ///
    /// `AppError::Config` when a database has no backing tables or a table
    /// name is invalid.
    pub fn open(
        sources: Vec<(DatabaseConnection, Vec<String>)>,
        ttl_seconds: i64,
        cleanup_interval: Duration,
    ) -> AppResult<Self> {
        if sources.is_empty() {
            return Err(AppError::Config("no databases configured".to_string()));
        }
        let engines = sources
            .into_iter()
            .enumerate()
            .map(|(id, (conn, tables))| {
                DatabaseEngine::new(
                    conn,
                    i32::try_from(id).unwrap_or_default(),
                    tables,
                    ttl_seconds,
                    cleanup_interval,
                )
            })
            .collect::<AppResult<Vec<_>>>()?;

        Ok(Self {
            engines,
            next_writer: Mutex::new(0),
        })
    }

    #[must_use]
    pub fn database_count(&self) -> usize {
        self.engines.len()
    }

    /// First row any database returns for `url`. Non-deterministic when the
    /// URL exists in several places; whoever answers first wins.
    ///
    /// # Errors
    ///
    /// `AppError::NotFound` when no database holds the URL.
    pub async fn find_by_url(&self, url: &str) -> AppResult<CachedResponse> {
        let mut lookups: FuturesUnordered<_> = self
            .engines
            .iter()
            .map(|engine| engine.find_by_url(url))
            .collect();

        while let Some(result) = lookups.next().await {
            match result {
                Ok(row) => return Ok(row),
                Err(AppError::NotFound) => {}
                Err(e) => {
                    tracing::error!(error = %e, url, "database lookup failed");
                }
            }
        }
        Err(AppError::NotFound)
    }

    /// Route the write to the database named by `entry.database_id`, or pick
    /// one round-robin for `FREE_CHOICE` entries.
    ///
    /// # Errors
    ///
    /// `AppError::Config` for an out-of-range ordinal, `AppError::Storage`
    /// from the engine.
    pub async fn write(&self, url: &str, entry: &CachedResponse) -> AppResult<()> {
        let engine = if entry.database_id == FREE_CHOICE {
            let mut index = self.next_writer.lock().await;
            *index = (*index + 1) % self.engines.len();
            &self.engines[*index]
        } else {
            usize::try_from(entry.database_id)
                .ok()
                .and_then(|id| self.engines.get(id))
                .ok_or_else(|| {
                    AppError::Config(format!("database id {} out of range", entry.database_id))
                })?
        };
        engine.write(url, entry).await
    }

    /// Shut down every engine. In-flight lookups resolve as misses.
    pub fn close(&self) {
        for engine in &self.engines {
            engine.close();
        }
    }
}
