//! Entry retrieval by id (`aix get`).

use anyhow::bail;

use crate::config::Config;
use crate::db;
use crate::store;

pub async fn run_get(config: &Config, id: i64) -> anyhow::Result<()> {
    let pool = db::open(config).await?;
    let entry = store::get_entry(&pool, id).await;
    pool.close().await;

    let Some(entry) = entry? else {
        bail!("entry not found: {}", id);
    };

    println!("id: {}", entry.id);
    println!("source: {}", entry.source);
    println!("date: {}", entry.date);
    if let Some(path) = &entry.archive_path {
        match entry.line_number {
            Some(line) => println!("archive: {}:{}", path, line),
            None => println!("archive: {}", path),
        }
    }
    let ingested = chrono::DateTime::from_timestamp(entry.created_at, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default();
    println!("ingested: {}", ingested);
    println!("--- text ---");
    println!("{}", entry.searchable_text);
    println!("--- record ---");
    println!("{}", serde_json::to_string_pretty(&entry.metadata)?);
    Ok(())
}
