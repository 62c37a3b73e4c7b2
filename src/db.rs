//! SQLite session pool.
//!
//! Every caller reaches the store through a [`SessionPool`]. The pool keeps
//! `pool.size` sessions open, grows on demand up to `pool.max_connections`
//! when all of them are busy, and closes the extra sessions again once they
//! have been idle for `pool.idle_timeout_secs`.
//!
//! # Write-Ahead Logging (WAL)
//!
//! WAL mode is enabled for all sessions, so readers never block the single
//! writer and vice versa. Writes go through [`SessionPool::write_transaction`],
//! which takes the write lock up front with `BEGIN IMMEDIATE`; concurrent
//! writers queue on it for up to `pool.busy_timeout_ms` instead of failing.
//!
//! # Session lifecycle
//!
//! - [`SessionPool::acquire`] waits up to a timeout and fails with
//!   [`Error::PoolExhausted`] when the ceiling is reached.
//! - Dropping a [`Session`] returns it to the pool. Before it is pooled again
//!   it must answer a `SELECT 1` round trip and be outside any transaction; a
//!   session that fails is closed and a fresh one is opened lazily on a later
//!   acquire.
//! - [`SessionPool::transaction`] (read snapshot) and
//!   [`SessionPool::write_transaction`] yield a [`Tx`]. `commit()` makes it
//!   durable; dropping it on any other path (including `?` early returns)
//!   rolls back. Either way the session goes back to the pool.

use sqlx::pool::PoolConnection;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteSynchronous,
};
use sqlx::{Sqlite, Transaction};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{Config, PoolConfig};
use crate::error::{Error, Result};
use crate::migrate;

/// A pooled handle to the store.
pub type Session = PoolConnection<Sqlite>;

/// A write or read transaction holding one pooled session.
pub type Tx = Transaction<'static, Sqlite>;

/// Point-in-time view of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Open sessions, idle or in use.
    pub size: u32,
    pub idle: usize,
    pub max_connections: u32,
}

/// Bounded pool of reusable SQLite sessions.
#[derive(Debug, Clone)]
pub struct SessionPool {
    inner: SqlitePool,
    max_connections: u32,
    acquire_timeout: Duration,
}

impl SessionPool {
    /// Open the pool without touching the schema.
    ///
    /// Creates the database file and its parent directories if needed.
    pub async fn connect(path: &Path, settings: &PoolConfig) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(settings.busy_timeout());

        let max_connections = settings.max_connections();
        let inner = SqlitePoolOptions::new()
            .min_connections(settings.size)
            .max_connections(max_connections)
            .acquire_timeout(settings.acquire_timeout())
            .idle_timeout(Some(settings.idle_timeout()))
            .after_release(|conn, _meta| {
                Box::pin(async move {
                    let reusable = is_reusable(conn).await;
                    if !reusable {
                        warn!("discarding session that failed its liveness check");
                    }
                    Ok(reusable)
                })
            })
            .connect_with(options)
            .await?;

        debug!(
            path = %path.display(),
            size = settings.size,
            max_connections,
            "session pool connected"
        );

        Ok(Self {
            inner,
            max_connections,
            acquire_timeout: settings.acquire_timeout(),
        })
    }

    /// Wait up to `timeout` for a session.
    ///
    /// The wait is bounded by `timeout` alone: when it is longer than the
    /// pool-wide acquire timeout the request is simply queued again.
    pub async fn acquire(&self, timeout: Duration) -> Result<Session> {
        let deadline = Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.inner.acquire()).await {
                Ok(Ok(session)) => return Ok(session),
                Ok(Err(sqlx::Error::PoolTimedOut)) if Instant::now() < deadline => {
                    debug!("session wait outlived the pool timeout, waiting again");
                }
                Ok(Err(sqlx::Error::PoolTimedOut)) | Err(_) => {
                    return Err(Error::PoolExhausted(timeout))
                }
                Ok(Err(e)) => return Err(Error::Database(e)),
            }
        }
    }

    /// Hand a session back to the pool.
    ///
    /// Equivalent to dropping it; spelled out for call sites that hold a
    /// session across several steps.
    pub fn release(&self, session: Session) {
        drop(session);
    }

    /// Begin a deferred transaction on a pooled session, waiting at most the
    /// configured acquire timeout. Use it for consistent reads.
    pub async fn transaction(&self) -> Result<Tx> {
        self.inner.begin().await.map_err(|e| self.query_error(e))
    }

    /// Begin a transaction that holds the write lock from its first statement.
    ///
    /// A deferred transaction that later tries to write fails with
    /// `database is locked` when another writer got there first; taking the
    /// lock in `BEGIN IMMEDIATE` makes it wait out `busy_timeout` instead.
    pub async fn write_transaction(&self) -> Result<Tx> {
        self.inner
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(|e| self.query_error(e))
    }

    pub fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            size: self.inner.size(),
            idle: self.inner.num_idle(),
            max_connections: self.max_connections,
        }
    }

    /// The underlying `sqlx` pool, for read-only statements that do not need
    /// an explicit session.
    pub fn sqlite(&self) -> &SqlitePool {
        &self.inner
    }

    /// Map an acquisition failure from a pooled query to the error taxonomy.
    pub(crate) fn query_error(&self, err: sqlx::Error) -> Error {
        match err {
            sqlx::Error::PoolTimedOut => Error::PoolExhausted(self.acquire_timeout),
            other => Error::Database(other),
        }
    }

    pub async fn close(&self) {
        self.inner.close().await;
    }
}

/// A session goes back into the pool only if it answers a round trip and is
/// not left inside a transaction that would keep holding its locks.
async fn is_reusable(conn: &mut SqliteConnection) -> bool {
    let answered = sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&mut *conn)
        .await
        .map(|one| one == 1)
        .unwrap_or(false);
    // `BEGIN` fails inside an open transaction.
    answered
        && sqlx::Executor::execute(&mut *conn, sqlx::raw_sql("BEGIN; ROLLBACK"))
            .await
            .is_ok()
}

/// Connect to the configured database and bring its schema up to date.
///
/// Fails with [`Error::SchemaMigration`] when the schema cannot be migrated;
/// no session is handed out in that case.
pub async fn open(config: &Config) -> Result<SessionPool> {
    let pool = SessionPool::connect(&config.db.path, &config.pool).await?;
    if let Err(e) = migrate::ensure_schema(&pool).await {
        pool.close().await;
        return Err(e);
    }
    info!(path = %config.db.path.display(), "archive index opened");
    Ok(pool)
}
