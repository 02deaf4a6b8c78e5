//! Per-database cache engine.
//!
//! One engine owns every backing table of a single database. Each table gets
//! a long-lived reader task consuming lookup jobs from a bounded queue;
//! `find_by_url` dispatches one job to every reader and takes the first row
//! that comes back, cancelling the siblings. Writes serialize under a single
//! async mutex that also chooses the target table round-robin and shields the
//! TTL sweeper, so the storage layer only ever sees one writer.

use std::sync::Arc;
use std::time::Duration;

use sea_orm::{DatabaseConnection, TransactionTrait};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, AppResult};
use crate::store::{self, CachedResponse};

/// Depth of each reader's job queue.
const LOOKUP_QUEUE_DEPTH: usize = 16;

struct Lookup {
    url: String,
    cancel: CancellationToken,
    // Buffered to at least the number of readers, so a cancelled or losing
    // reader can always post its answer without blocking on a consumer that
    // has already gone away.
    reply: mpsc::Sender<Option<CachedResponse>>,
}

#[derive(Debug)]
pub struct DatabaseEngine {
    database_id: i32,
    tables: Vec<String>,
    conn: DatabaseConnection,
    readers: Vec<mpsc::Sender<Lookup>>,
    write_gate: Arc<Mutex<usize>>,
    shutdown: CancellationToken,
}

impl DatabaseEngine {
    /// Spawn the reader tasks (one per table) and, when both `ttl_seconds`
    /// and `cleanup_interval` are positive, the TTL sweeper.
    ///
    /// # Errors
    ///
    /// `AppError::Config` when `tables` is empty or contains an invalid name.
    pub fn new(
        conn: DatabaseConnection,
        database_id: i32,
        tables: Vec<String>,
        ttl_seconds: i64,
        cleanup_interval: Duration,
    ) -> AppResult<Self> {
        if tables.is_empty() {
            return Err(AppError::Config(format!(
                "database {database_id} has no backing tables"
            )));
        }
        for table in &tables {
            if !store::valid_table_name(table) {
                return Err(AppError::Config(format!("table name {table:?} is invalid")));
            }
        }

        let shutdown = CancellationToken::new();
        let write_gate = Arc::new(Mutex::new(0));

        let readers = tables
            .iter()
            .map(|table| {
                let (sender, receiver) = mpsc::channel(LOOKUP_QUEUE_DEPTH);
                tokio::spawn(run_reader(
                    conn.clone(),
                    database_id,
                    table.clone(),
                    receiver,
                    shutdown.clone(),
                ));
                sender
            })
            .collect();

        if ttl_seconds > 0 && !cleanup_interval.is_zero() {
            tokio::spawn(run_sweeper(
                conn.clone(),
                tables.clone(),
                ttl_seconds,
                cleanup_interval,
                Arc::clone(&write_gate),
                shutdown.clone(),
            ));
        }

        Ok(Self {
            database_id,
            tables,
            conn,
            readers,
            write_gate,
            shutdown,
        })
    }

    #[must_use]
    pub fn database_id(&self) -> i32 {
        self.database_id
    }

    #[must_use]
    pub fn tables(&self) -> &[String] {
        &self.tables
    }

    /// Fan the lookup out to every table reader and return the first row
    /// posted back. Losing and cancelled readers report a miss; when all of
    /// them do, the URL is not cached in this database.
    ///
    /// # Errors
    ///
    /// `AppError::NotFound` when no table holds the URL. Storage errors are
    /// logged by the readers and surface as misses.
    pub async fn find_by_url(&self, url: &str) -> AppResult<CachedResponse> {
        let cancel = self.shutdown.child_token();
        // Dropping this future (external cancellation, a sibling database
        // answering first) cancels the in-flight readers.
        let _guard = cancel.clone().drop_guard();

        let (reply, mut replies) = mpsc::channel(self.readers.len());
        let mut dispatched = 0usize;
        for reader in &self.readers {
            let job = Lookup {
                url: url.to_string(),
                cancel: cancel.clone(),
                reply: reply.clone(),
            };
            if reader.send(job).await.is_ok() {
                dispatched += 1;
            }
        }
        drop(reply);

        let mut misses = 0usize;
        while let Some(found) = replies.recv().await {
            match found {
                Some(row) => return Ok(row),
                None => {
                    misses += 1;
                    if misses == dispatched {
                        return Err(AppError::NotFound);
                    }
                }
            }
        }
        Err(AppError::NotFound)
    }

    /// Persist `entry` under `url` into the next round-robin table.
    ///
    /// When the entry names the table that produced a stale hit, the old row
    /// is deleted and the new one inserted in a single transaction, keeping
    /// at most one row per URL across all tables of this database.
    ///
    /// # Errors
    ///
    /// `AppError::Storage` on bind/execute/commit failures.
    pub async fn write(&self, url: &str, entry: &CachedResponse) -> AppResult<()> {
        let mut index = self.write_gate.lock().await;
        *index = (*index + 1) % self.tables.len();
        let target = &self.tables[*index];

        if entry.table_name.is_empty() {
            store::upsert(&self.conn, target, url, entry).await?;
        } else {
            let txn = self.conn.begin().await?;
            store::delete_by_url(&txn, &entry.table_name, url).await?;
            store::upsert(&txn, target, url, entry).await?;
            txn.commit().await?;
        }

        tracing::debug!(
            url,
            table = %target,
            database_id = self.database_id,
            "response stored"
        );
        Ok(())
    }

    /// Stop the readers and the sweeper. In-flight lookups resolve as
    /// misses.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for DatabaseEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_reader(
    conn: DatabaseConnection,
    database_id: i32,
    table: String,
    mut jobs: mpsc::Receiver<Lookup>,
    shutdown: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            job = jobs.recv() => match job {
                Some(job) => job,
                None => return,
            },
            () = shutdown.cancelled() => return,
        };

        if job.cancel.is_cancelled() {
            let _ = job.reply.try_send(None);
            continue;
        }

        let found = match store::read_one(&conn, &table, &job.url).await {
            Ok(mut row) => {
                row.database_id = database_id;
                Some(row)
            }
            Err(AppError::NotFound) => None,
            Err(e) => {
                tracing::error!(error = %e, table = %table, url = %job.url, "cache lookup failed");
                None
            }
        };
        let _ = job.reply.try_send(found);
    }
}

async fn run_sweeper(
    conn: DatabaseConnection,
    tables: Vec<String>,
    ttl_seconds: i64,
    cleanup_interval: Duration,
    write_gate: Arc<Mutex<usize>>,
    shutdown: CancellationToken,
) {
    tracing::info!(
        ttl_seconds,
        interval_secs = cleanup_interval.as_secs(),
        "starting TTL sweeper"
    );
    let mut ticker = tokio::time::interval(cleanup_interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let _gate = write_gate.lock().await;
                for table in &tables {
                    let mut deleted = 0u64;
                    loop {
                        match store::cleanup_once(&conn, table, ttl_seconds).await {
                            Ok(0) => break,
                            Ok(n) => deleted += n,
                            Err(e) => {
                                tracing::error!(error = %e, table = %table, "TTL sweep failed");
                                break;
                            }
                        }
                    }
                    if deleted > 0 {
                        tracing::debug!(table = %table, deleted, "TTL sweep");
                    }
                }
            }
            () = shutdown.cancelled() => return,
        }
    }
}
