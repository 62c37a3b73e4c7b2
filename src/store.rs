//! Content store and archive manifest.
//!
//! The only way to write `content` is [`insert_entries`] and the delete
//! helpers below; the search index follows through the schema triggers (see
//! [`migrate`](crate::migrate)), so a committed transaction always leaves
//! both tables in step. Write helpers take a connection so callers can group
//! them into one transaction with `&mut *tx`.

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use crate::db::SessionPool;
use crate::error::{Error, Result};
use crate::models::{ContentEntry, ManifestEntry, ManifestStatus, NewEntry};

/// Insert entries in order, returning their ids.
///
/// Ids are assigned by `AUTOINCREMENT`, so they increase with insertion order
/// and are never reused after a delete.
pub async fn insert_entries(conn: &mut SqliteConnection, entries: &[NewEntry]) -> Result<Vec<i64>> {
    let now = Utc::now().timestamp();
    let mut ids = Vec::with_capacity(entries.len());

    for entry in entries {
        let result = sqlx::query(
            r#"
            INSERT INTO content (source, date, metadata, searchable_text, archive_path, line_number, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.source.as_str())
        .bind(&entry.date)
        .bind(&entry.metadata)
        .bind(&entry.searchable_text)
        .bind(&entry.archive_path)
        .bind(entry.line_number)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        ids.push(result.last_insert_rowid());
    }

    Ok(ids)
}

/// Delete entries by id. Returns the number of rows removed.
pub async fn delete_entries(conn: &mut SqliteConnection, ids: &[i64]) -> Result<u64> {
    let mut removed = 0;
    for id in ids {
        removed += sqlx::query("DELETE FROM content WHERE id = ?")
            .bind(*id)
            .execute(&mut *conn)
            .await?
            .rows_affected();
    }
    Ok(removed)
}

/// Drop everything previously ingested from an archive: its content rows
/// and its manifest entry.
pub async fn purge_archive(conn: &mut SqliteConnection, archive_path: &str) -> Result<u64> {
    let removed = sqlx::query("DELETE FROM content WHERE archive_path = ?")
        .bind(archive_path)
        .execute(&mut *conn)
        .await?
        .rows_affected();

    sqlx::query("DELETE FROM archives WHERE archive_path = ?")
        .bind(archive_path)
        .execute(&mut *conn)
        .await?;

    Ok(removed)
}

/// Remove an archive's entries and manifest row in one transaction.
pub async fn remove_archive(pool: &SessionPool, archive_path: &str) -> Result<u64> {
    let mut tx = pool.write_transaction().await?;
    let removed = purge_archive(&mut tx, archive_path).await?;
    tx.commit().await?;
    Ok(removed)
}

pub async fn upsert_manifest(conn: &mut SqliteConnection, entry: &ManifestEntry) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO archives (archive_path, source, indexed_at, record_count, checksum, status)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(archive_path) DO UPDATE SET
            source = excluded.source,
            indexed_at = excluded.indexed_at,
            record_count = excluded.record_count,
            checksum = excluded.checksum,
            status = excluded.status
        "#,
    )
    .bind(&entry.archive_path)
    .bind(&entry.source)
    .bind(entry.indexed_at)
    .bind(entry.record_count)
    .bind(&entry.checksum)
    .bind(entry.status.as_str())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub async fn get_manifest(pool: &SessionPool, archive_path: &str) -> Result<Option<ManifestEntry>> {
    let row = sqlx::query(
        "SELECT archive_path, source, indexed_at, record_count, checksum, status FROM archives WHERE archive_path = ?",
    )
    .bind(archive_path)
    .fetch_optional(pool.sqlite())
    .await
    .map_err(|e| pool.query_error(e))?;

    Ok(row.as_ref().map(manifest_from_row))
}

pub async fn list_manifest(pool: &SessionPool) -> Result<Vec<ManifestEntry>> {
    let rows = sqlx::query(
        "SELECT archive_path, source, indexed_at, record_count, checksum, status FROM archives ORDER BY archive_path",
    )
    .fetch_all(pool.sqlite())
    .await
    .map_err(|e| pool.query_error(e))?;

    Ok(rows.iter().map(manifest_from_row).collect())
}

fn manifest_from_row(row: &SqliteRow) -> ManifestEntry {
    let status: String = row.get("status");
    ManifestEntry {
        archive_path: row.get("archive_path"),
        source: row.get("source"),
        indexed_at: row.get("indexed_at"),
        record_count: row.get("record_count"),
        checksum: row.get("checksum"),
        // Rows written before the status column existed default to complete.
        status: ManifestStatus::parse(&status).unwrap_or(ManifestStatus::Complete),
    }
}

pub async fn get_entry(pool: &SessionPool, id: i64) -> Result<Option<ContentEntry>> {
    let row = sqlx::query(
        r#"
        SELECT id, source, date, metadata, searchable_text, archive_path, line_number, created_at
        FROM content WHERE id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(pool.sqlite())
    .await
    .map_err(|e| pool.query_error(e))?;

    row.as_ref().map(entry_from_row).transpose()
}

/// Entries ingested from one archive, in insertion order.
pub async fn entries_for_archive(pool: &SessionPool, archive_path: &str) -> Result<Vec<ContentEntry>> {
    let rows = sqlx::query(
        r#"
        SELECT id, source, date, metadata, searchable_text, archive_path, line_number, created_at
        FROM content WHERE archive_path = ? ORDER BY id
        "#,
    )
    .bind(archive_path)
    .fetch_all(pool.sqlite())
    .await
    .map_err(|e| pool.query_error(e))?;

    rows.iter().map(entry_from_row).collect()
}

fn entry_from_row(row: &SqliteRow) -> Result<ContentEntry> {
    let id: i64 = row.get("id");
    let metadata: String = row.get("metadata");
    let metadata = serde_json::from_str(&metadata)
        .map_err(|source| Error::CorruptMetadata { id, source })?;

    Ok(ContentEntry {
        id,
        source: row.get("source"),
        date: row.get("date"),
        metadata,
        searchable_text: row.get("searchable_text"),
        archive_path: row.get("archive_path"),
        line_number: row.get("line_number"),
        created_at: row.get("created_at"),
    })
}
