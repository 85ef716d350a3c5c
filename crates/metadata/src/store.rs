//! The metadata store: SQLite-backed transactional collections.

use crate::collection::Record;
use crate::error::{MetadataError, MetadataResult};
use crate::watch::{RawEvent, WatchFilter, WatchHub, Watcher};
use futures::future::BoxFuture;
use rand::Rng;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Embedded schema. One generic record table plus its secondary-index side
/// table; the single-row `revision` table allocates the global commit
/// revision that orders events and `list` output.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS records (
    collection  TEXT NOT NULL,
    key         TEXT NOT NULL,
    value       TEXT NOT NULL,
    created_rev INTEGER NOT NULL,
    updated_rev INTEGER NOT NULL,
    expires_at  INTEGER,
    PRIMARY KEY (collection, key)
);

CREATE INDEX IF NOT EXISTS idx_records_created ON records (collection, created_rev);

CREATE TABLE IF NOT EXISTS record_indexes (
    collection  TEXT NOT NULL,
    idx         TEXT NOT NULL,
    value       TEXT NOT NULL,
    key         TEXT NOT NULL,
    PRIMARY KEY (collection, idx, value, key)
);

CREATE INDEX IF NOT EXISTS idx_record_indexes_key ON record_indexes (collection, key);

CREATE TABLE IF NOT EXISTS revision (
    id  INTEGER PRIMARY KEY CHECK (id = 0),
    rev INTEGER NOT NULL
);

INSERT OR IGNORE INTO revision (id, rev) VALUES (0, 0);
";

/// Conflict retry budget before a transaction surfaces `Aborted`.
const MAX_TX_ATTEMPTS: u32 = 10;

/// Error types usable inside `transact` closures.
///
/// Domain error enums wrap `MetadataError` so the retry loop can spot
/// write conflicts through them.
pub trait TxError: From<MetadataError> + Send {
    fn as_metadata(&self) -> Option<&MetadataError>;

    fn is_tx_conflict(&self) -> bool {
        self.as_metadata().is_some_and(MetadataError::is_conflict)
    }
}

impl TxError for MetadataError {
    fn as_metadata(&self) -> Option<&MetadataError> {
        Some(self)
    }
}

/// SQLite-backed metadata store.
///
/// A single-writer pool sidesteps persistent "database is locked" failures;
/// write transactions queue on the pool and conflicts are retried with
/// backoff on top of that.
pub struct MetadataStore {
    pool: Pool<Sqlite>,
    hub: Arc<WatchHub>,
}

impl MetadataStore {
    /// Open (creating if missing) a store at the given path.
    pub async fn open(path: impl AsRef<Path>, busy_timeout_ms: u64) -> MetadataResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| MetadataError::Internal(format!("create {parent:?}: {e}")))?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(busy_timeout_ms));

        Self::connect(opts).await
    }

    /// Open a private in-memory store. Used by tests and by ephemeral
    /// deployments; dies with the process.
    pub async fn open_in_memory() -> MetadataResult<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?
            .busy_timeout(Duration::from_millis(5000));
        Self::connect(opts).await
    }

    async fn connect(opts: SqliteConnectOptions) -> MetadataResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;

        let store = Self {
            pool,
            hub: Arc::new(WatchHub::new()),
        };
        store.migrate().await?;
        Ok(store)
    }

    /// Apply the embedded schema.
    pub async fn migrate(&self) -> MetadataResult<()> {
        for statement in SCHEMA.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Check database connectivity.
    pub async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub(crate) fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Subscribe to changes of a collection.
    pub fn watch<T: Record>(&self, filter: WatchFilter) -> Watcher<T> {
        Watcher::new(self.hub.subscribe(T::COLLECTION), filter)
    }

    /// Run `f` transactionally: every write it stages is applied atomically
    /// on commit, or none is. Conflicts retry with backoff up to a bounded
    /// budget, then surface as `Aborted`; `f` must be safe to re-run and
    /// free of external side effects.
    pub async fn transact<R, E, F>(&self, f: F) -> Result<R, E>
    where
        E: TxError,
        F: for<'c> Fn(&'c mut Transaction) -> BoxFuture<'c, Result<R, E>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_transact(&f, false).await {
                Ok((result, events)) => {
                    self.hub.publish(events);
                    return Ok(result);
                }
                Err(e) if e.is_tx_conflict() && attempt < MAX_TX_ATTEMPTS => {
                    let backoff = conflict_backoff(attempt);
                    tracing::debug!(
                        attempt = attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "Retrying metadata transaction after conflict"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) if e.is_tx_conflict() => {
                    return Err(MetadataError::Aborted { attempts: attempt }.into());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run `f` with transactional reads and staged writes, then discard
    /// everything instead of committing.
    pub async fn dryrun_transact<R, E, F>(&self, f: F) -> Result<R, E>
    where
        E: TxError,
        F: for<'c> Fn(&'c mut Transaction) -> BoxFuture<'c, Result<R, E>>,
    {
        let (result, _events) = self.try_transact(&f, true).await?;
        Ok(result)
    }

    async fn try_transact<R, E, F>(
        &self,
        f: &F,
        dryrun: bool,
    ) -> Result<(R, Vec<(&'static str, RawEvent)>), E>
    where
        E: TxError,
        F: for<'c> Fn(&'c mut Transaction) -> BoxFuture<'c, Result<R, E>>,
    {
        let tx = self.pool.begin().await.map_err(MetadataError::from)?;
        let mut handle = Transaction {
            tx,
            revision: None,
            events: Vec::new(),
        };
        match f(&mut handle).await {
            Ok(result) => {
                let Transaction { tx, events, .. } = handle;
                if dryrun {
                    tx.rollback().await.map_err(MetadataError::from)?;
                    Ok((result, Vec::new()))
                } else {
                    tx.commit().await.map_err(MetadataError::from)?;
                    Ok((result, events))
                }
            }
            Err(e) => {
                // rollback failure is secondary to the original error
                let _ = handle.tx.rollback().await;
                Err(e)
            }
        }
    }

    /// Drop expired records. Returns the number reaped. Expired rows are
    /// already invisible to reads; this reclaims their space.
    pub async fn sweep_expired(&self) -> MetadataResult<u64> {
        let now = unix_now();
        let keys = sqlx::query_as::<_, (String, String)>(
            "SELECT collection, key FROM records WHERE expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        let mut reaped = 0;
        for (collection, key) in keys {
            sqlx::query("DELETE FROM records WHERE collection = ? AND key = ?")
                .bind(&collection)
                .bind(&key)
                .execute(&self.pool)
                .await?;
            sqlx::query("DELETE FROM record_indexes WHERE collection = ? AND key = ?")
                .bind(&collection)
                .bind(&key)
                .execute(&self.pool)
                .await?;
            reaped += 1;
        }
        Ok(reaped)
    }
}

/// An open read/write handle inside `transact`.
///
/// Writes stage change events; the store publishes them to watchers only
/// after the underlying transaction commits.
pub struct Transaction {
    pub(crate) tx: sqlx::Transaction<'static, Sqlite>,
    pub(crate) revision: Option<i64>,
    pub(crate) events: Vec<(&'static str, RawEvent)>,
}

impl Transaction {
    /// The revision all writes of this transaction share. Allocated lazily
    /// on first write so read-only transactions burn nothing.
    pub(crate) async fn write_revision(&mut self) -> MetadataResult<i64> {
        if let Some(rev) = self.revision {
            return Ok(rev);
        }
        let (rev,): (i64,) =
            sqlx::query_as("UPDATE revision SET rev = rev + 1 WHERE id = 0 RETURNING rev")
                .fetch_one(&mut *self.tx)
                .await?;
        self.revision = Some(rev);
        Ok(rev)
    }
}

fn conflict_backoff(attempt: u32) -> Duration {
    let base_ms = 10u64.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
    let capped = base_ms.min(1000);
    let jitter = rand::thread_rng().gen_range(0..=capped / 2);
    Duration::from_millis(capped + jitter)
}

pub(crate) fn unix_now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}
