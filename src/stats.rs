//! Index statistics and health checks.
//!
//! `aix stats` summarizes what is indexed: record counts per source, tracked
//! archives, database size, and pool occupancy. `aix check` compares the
//! content table with the search index.

use chrono::Utc;
use sqlx::Row;
use std::collections::BTreeMap;

use crate::config::Config;
use crate::db::{self, SessionPool};
use crate::error::Result;
use crate::models::{ConsistencyReport, ManifestStatus, StoreStats};
use crate::store;

/// Record counts, read from a single snapshot.
pub async fn get_stats(pool: &SessionPool) -> Result<StoreStats> {
    let mut tx = pool.transaction().await?;

    let total_records: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM content")
        .fetch_one(&mut *tx)
        .await?;
    let archives_tracked: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM archives")
        .fetch_one(&mut *tx)
        .await?;
    let rows = sqlx::query("SELECT source, COUNT(*) AS n FROM content GROUP BY source")
        .fetch_all(&mut *tx)
        .await?;

    tx.commit().await?;

    let records_by_source: BTreeMap<String, i64> = rows
        .iter()
        .map(|row| (row.get("source"), row.get("n")))
        .collect();

    Ok(StoreStats {
        total_records,
        archives_tracked,
        records_by_source,
    })
}

/// Compare the content table with the search index inside one read
/// transaction.
pub async fn check_consistency(pool: &SessionPool) -> Result<ConsistencyReport> {
    let mut tx = pool.transaction().await?;

    let content_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM content")
        .fetch_one(&mut *tx)
        .await?;
    let index_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM search_index")
        .fetch_one(&mut *tx)
        .await?;
    let missing_index: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM content c WHERE NOT EXISTS (SELECT 1 FROM search_index s WHERE s.rowid = c.id)",
    )
    .fetch_one(&mut *tx)
    .await?;
    let orphan_index: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM search_index s WHERE NOT EXISTS (SELECT 1 FROM content c WHERE c.id = s.rowid)",
    )
    .fetch_one(&mut *tx)
    .await?;
    let mismatched_text: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM content c JOIN search_index s ON s.rowid = c.id WHERE s.text IS NOT c.searchable_text",
    )
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(ConsistencyReport {
        content_rows,
        index_rows,
        missing_index,
        orphan_index,
        mismatched_text,
    })
}

/// Run the stats command: query the store and print a summary.
pub async fn run_stats(config: &Config) -> anyhow::Result<()> {
    let pool = db::open(config).await?;
    let stats = get_stats(&pool).await;
    let manifest = store::list_manifest(&pool).await;
    let status = pool.status();
    pool.close().await;
    let (stats, manifest) = (stats?, manifest?);

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Archive Index Stats");
    println!("===================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!(
        "  Pool:        {} open, {} idle, ceiling {}",
        status.size, status.idle, status.max_connections
    );
    println!();
    println!("  Records:     {}", stats.total_records);
    println!("  Archives:    {}", stats.archives_tracked);

    if !stats.records_by_source.is_empty() {
        println!();
        println!("  By source:");
        println!("  {:<12} {:>10}", "SOURCE", "RECORDS");
        println!("  {}", "-".repeat(23));
        for (source, count) in &stats.records_by_source {
            println!("  {:<12} {:>10}", source, count);
        }
    }

    if !manifest.is_empty() {
        println!();
        println!("  Archives:");
        println!(
            "  {:<10} {:>8}   {:<22} {}",
            "SOURCE", "RECORDS", "INDEXED", "PATH"
        );
        println!("  {}", "-".repeat(76));
        for entry in &manifest {
            let flag = match entry.status {
                ManifestStatus::Complete => "",
                ManifestStatus::CompleteWithErrors => " (with errors)",
            };
            println!(
                "  {:<10} {:>8}   {:<22} {}{}",
                entry.source,
                entry.record_count,
                format_ts_relative(entry.indexed_at),
                entry.archive_path,
                flag
            );
        }
    }

    println!();
    Ok(())
}

/// Run the check command: exit with an error when index and content diverge.
pub async fn run_check(config: &Config) -> anyhow::Result<()> {
    let pool = db::open(config).await?;
    let report = check_consistency(&pool).await;
    pool.close().await;
    let report = report?;

    println!("check");
    println!("  content rows:    {}", report.content_rows);
    println!("  index rows:      {}", report.index_rows);
    println!("  missing index:   {}", report.missing_index);
    println!("  orphan index:    {}", report.orphan_index);
    println!("  mismatched text: {}", report.mismatched_text);

    if !report.is_consistent() {
        anyhow::bail!("search index is out of step with content");
    }
    println!("ok");
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

fn format_ts_relative(ts: i64) -> String {
    let delta = Utc::now().timestamp() - ts;
    match delta {
        d if d < 0 => format_ts_iso(ts),
        d if d < 60 => "just now".to_string(),
        d if d < 3600 => plural(d / 60, "min"),
        d if d < 86400 => plural(d / 3600, "hour"),
        d if d < 86400 * 30 => plural(d / 86400, "day"),
        _ => format_ts_iso(ts),
    }
}

fn plural(n: i64, unit: &str) -> String {
    format!("{} {}{} ago", n, unit, if n == 1 { "" } else { "s" })
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
