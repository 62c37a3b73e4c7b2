//! Schema creation and version-gated migrations.
//!
//! The schema version lives in `PRAGMA user_version`:
//!
//! | Version | Meaning |
//! |---------|---------|
//! | 0, no tables | fresh database, create the current schema |
//! | 0, `content` exists | unversioned legacy store, refused |
//! | 1 | `content` without `archive_path`/`line_number`, `archives` without `status`; migrated additively |
//! | 2 | current |
//! | > 2 | written by a newer release, refused |
//!
//! The search index is an FTS5 table whose `rowid` is `content.id`. It is
//! maintained exclusively by the `content_ai`/`content_ad`/`content_au`
//! triggers, so any statement that changes `content` changes the index in the
//! same transaction.

use sqlx::SqliteConnection;
use tracing::info;

use crate::config::Config;
use crate::db::{self, SessionPool};
use crate::error::{Error, Result};

pub const SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS content (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        source TEXT NOT NULL,
        date TEXT NOT NULL,
        metadata TEXT NOT NULL,
        searchable_text TEXT NOT NULL DEFAULT '',
        archive_path TEXT,
        line_number INTEGER,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE VIRTUAL TABLE IF NOT EXISTS search_index USING fts5(
        text,
        tokenize = 'unicode61 remove_diacritics 2'
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS archives (
        archive_path TEXT PRIMARY KEY,
        source TEXT NOT NULL,
        indexed_at INTEGER NOT NULL,
        record_count INTEGER NOT NULL,
        checksum TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'complete'
    )
    "#,
];

const INDEX_TRIGGERS: &[&str] = &[
    r#"
    CREATE TRIGGER IF NOT EXISTS content_ai AFTER INSERT ON content BEGIN
        INSERT INTO search_index (rowid, text) VALUES (new.id, new.searchable_text);
    END
    "#,
    r#"
    CREATE TRIGGER IF NOT EXISTS content_ad AFTER DELETE ON content BEGIN
        DELETE FROM search_index WHERE rowid = old.id;
    END
    "#,
    r#"
    CREATE TRIGGER IF NOT EXISTS content_au AFTER UPDATE ON content BEGIN
        DELETE FROM search_index WHERE rowid = old.id;
        INSERT INTO search_index (rowid, text) VALUES (new.id, new.searchable_text);
    END
    "#,
];

const SECONDARY_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_content_source_date ON content(source, date)",
    "CREATE INDEX IF NOT EXISTS idx_content_date ON content(date)",
    "CREATE INDEX IF NOT EXISTS idx_content_archive ON content(archive_path)",
];

const MIGRATE_V1_TO_V2: &[&str] = &[
    "ALTER TABLE content ADD COLUMN archive_path TEXT",
    "ALTER TABLE content ADD COLUMN line_number INTEGER",
    "ALTER TABLE archives ADD COLUMN status TEXT NOT NULL DEFAULT 'complete'",
];

/// Index rows for content that has none, e.g. rows written before the
/// triggers existed.
const BACKFILL_INDEX: &str = r#"
    INSERT INTO search_index (rowid, text)
    SELECT c.id, c.searchable_text FROM content c
    WHERE NOT EXISTS (SELECT 1 FROM search_index s WHERE s.rowid = c.id)
"#;

/// Create or migrate the schema for the configured database (`aix init`).
pub async fn run_migrations(config: &Config) -> anyhow::Result<()> {
    let pool = db::open(config).await?;
    pool.close().await;
    Ok(())
}

/// Bring the schema to [`SCHEMA_VERSION`], or fail without changing anything.
///
/// Runs under `BEGIN IMMEDIATE` so concurrent openers serialize on the write
/// lock and the version is re-read after the lock is held.
pub async fn ensure_schema(pool: &SessionPool) -> Result<()> {
    let mut session = pool.acquire(pool.acquire_timeout()).await?;

    if read_version(&mut session).await? == SCHEMA_VERSION {
        return Ok(());
    }

    sqlx::query("BEGIN IMMEDIATE").execute(&mut *session).await?;
    match apply(&mut session).await {
        Ok(()) => {
            sqlx::query("COMMIT").execute(&mut *session).await?;
            Ok(())
        }
        Err(e) => {
            // The session must not go back to the pool mid-transaction.
            if sqlx::query("ROLLBACK").execute(&mut *session).await.is_err() {
                session.close_on_drop();
            }
            Err(e)
        }
    }
}

async fn apply(conn: &mut SqliteConnection) -> Result<()> {
    let version = read_version(conn).await?;
    match version {
        SCHEMA_VERSION => Ok(()),
        0 if table_exists(conn, "content").await? => Err(Error::SchemaMigration(
            "found an unversioned content table; refusing to guess its layout".to_string(),
        )),
        0 => {
            create_current(conn).await?;
            info!(version = SCHEMA_VERSION, "created schema");
            Ok(())
        }
        1 => {
            for stmt in MIGRATE_V1_TO_V2 {
                sqlx::query(stmt).execute(&mut *conn).await.map_err(|e| {
                    Error::SchemaMigration(format!("v1 -> v2 step `{}` failed: {}", stmt, e))
                })?;
            }
            create_current(conn).await?;
            sqlx::query(BACKFILL_INDEX).execute(&mut *conn).await?;
            info!(from = 1, to = SCHEMA_VERSION, "migrated schema");
            Ok(())
        }
        other => Err(Error::SchemaMigration(format!(
            "no migration path from schema version {} to {}",
            other, SCHEMA_VERSION
        ))),
    }
}

async fn create_current(conn: &mut SqliteConnection) -> Result<()> {
    for stmt in CREATE_SCHEMA
        .iter()
        .chain(INDEX_TRIGGERS)
        .chain(SECONDARY_INDEXES)
    {
        sqlx::query(stmt).execute(&mut *conn).await?;
    }
    // PRAGMA does not accept bound parameters.
    sqlx::query(&format!("PRAGMA user_version = {}", SCHEMA_VERSION))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn read_version(conn: &mut SqliteConnection) -> Result<i64> {
    let version: i64 = sqlx::query_scalar("PRAGMA user_version")
        .fetch_one(&mut *conn)
        .await?;
    Ok(version)
}

async fn table_exists(conn: &mut SqliteConnection, name: &str) -> Result<bool> {
    let exists: bool =
        sqlx::query_scalar("SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(name)
            .fetch_one(&mut *conn)
            .await?;
    Ok(exists)
}
