//! Ingestion pipeline.
//!
//! Turns a JSONL archive into content entries:
//!
//! ```text
//! archive file ──read line───▶ line ──serde_json──▶ record ──extract──▶ NewEntry
//!       │                                                                  │
//!       └──────── sha256 over every byte read ─────────┐          batch of N entries
//!                                                      ▼                   ▼
//!                                   manifest row (final batch only)   one transaction
//! ```
//!
//! Memory is bounded by one line (at most `max_line_bytes`) plus one batch;
//! longer lines are skipped as parse errors. Each batch commits in its own
//! transaction, so a failure loses at most the batch in flight. The first
//! transaction also drops whatever an earlier ingestion of the same archive
//! left behind, and the manifest row is written only by the last one; a crash
//! in between leaves the manifest unset and the next run starts over cleanly.

use anyhow::Context;
use chrono::Utc;
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::checksum;
use crate::config::Config;
use crate::db::{self, SessionPool};
use crate::error::{Error, RecordError, Result};
use crate::extract;
use crate::models::{IngestStats, ManifestEntry, ManifestStatus, NewEntry, RowError, Source};
use crate::progress::{StderrProgress, SyncProgressEvent, SyncProgressReporter};
use crate::store;

/// Longest line read into memory unless configured otherwise.
pub const DEFAULT_MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Per-run ingestion settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOptions {
    /// Records committed per transaction.
    pub batch_size: usize,
    pub max_line_bytes: usize,
}

impl IngestOptions {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }

    pub fn max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes;
        self
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.ingest.batch_size).max_line_bytes(config.ingest.max_line_bytes)
    }
}

/// Key under which an archive is tracked: its canonical absolute path.
pub async fn archive_key(path: &Path) -> Result<String> {
    let canonical = tokio::fs::canonicalize(path).await?;
    Ok(canonical.to_string_lossy().into_owned())
}

/// Ingest one archive file.
///
/// Row-level problems are collected in [`IngestStats::errors`]. A batch that
/// fails to commit aborts the run with [`Error::Transaction`]; batches
/// committed before it stay durable.
pub async fn ingest(
    pool: &SessionPool,
    path: &Path,
    source: Source,
    batch_size: usize,
) -> Result<IngestStats> {
    ingest_with(pool, path, source, IngestOptions::new(batch_size)).await
}

/// [`ingest`] with every setting spelled out.
pub async fn ingest_with(
    pool: &SessionPool,
    path: &Path,
    source: Source,
    options: IngestOptions,
) -> Result<IngestStats> {
    let IngestOptions {
        batch_size,
        max_line_bytes,
    } = options;
    if batch_size == 0 {
        return Err(Error::InvalidArgument(
            "batch_size must be at least 1".to_string(),
        ));
    }
    if max_line_bytes == 0 {
        return Err(Error::InvalidArgument(
            "max_line_bytes must be at least 1".to_string(),
        ));
    }

    let started = Instant::now();
    let key = archive_key(path).await?;
    let fallback_date = extract::date_from_path(path);

    let file = tokio::fs::File::open(path).await?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = Vec::new();

    let mut pending: Vec<NewEntry> = Vec::with_capacity(batch_size.min(4096));
    let mut line_number = 0u64;
    let mut indexed = 0u64;
    let mut skipped = 0u64;
    let mut batches = 0u64;
    let mut errors = Vec::new();

    loop {
        buf.clear();
        let Some(overlong) =
            read_line_bounded(&mut reader, &mut buf, max_line_bytes, &mut hasher).await?
        else {
            break;
        };
        line_number += 1;

        if overlong {
            let error = RecordError::Parse(format!("line exceeds {} bytes", max_line_bytes));
            debug!(archive = %key, line = line_number, %error, "skipping line");
            errors.push(RowError { line_number, error });
            continue;
        }

        let raw = match line_number {
            1 => buf.strip_prefix(UTF8_BOM).unwrap_or(&buf[..]),
            _ => &buf[..],
        };
        let entry = match parse_line(raw, source, fallback_date.as_deref()) {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                if !is_blank(raw) {
                    skipped += 1;
                }
                continue;
            }
            Err(error) => {
                debug!(archive = %key, line = line_number, %error, "skipping line");
                errors.push(RowError { line_number, error });
                continue;
            }
        };

        // A full batch is only flushed once another record shows up, so the
        // last batch is always the one that carries the manifest.
        if pending.len() == batch_size {
            batches += 1;
            flush(pool, &key, &pending, batches == 1, None)
                .await
                .map_err(in_batch(batches))?;
            indexed += pending.len() as u64;
            pending.clear();
        }

        pending.push(NewEntry {
            line_number: Some(line_number as i64),
            archive_path: Some(key.clone()),
            ..entry
        });
    }

    let checksum = hex::encode(hasher.finalize());
    let status = if errors.is_empty() {
        ManifestStatus::Complete
    } else {
        ManifestStatus::CompleteWithErrors
    };
    let manifest = ManifestEntry {
        archive_path: key.clone(),
        source: source.as_str().to_string(),
        indexed_at: Utc::now().timestamp(),
        record_count: (indexed + pending.len() as u64) as i64,
        checksum: checksum.clone(),
        status,
    };

    batches += 1;
    flush(pool, &key, &pending, batches == 1, Some(&manifest))
        .await
        .map_err(in_batch(batches))?;
    indexed += pending.len() as u64;

    let stats = IngestStats {
        archive_path: key,
        source,
        indexed,
        skipped,
        errors,
        batches,
        checksum,
        duration: started.elapsed(),
    };

    info!(
        archive = %stats.archive_path,
        source = %source,
        indexed = stats.indexed,
        skipped = stats.skipped,
        errors = stats.errors.len(),
        batches = stats.batches,
        "archive ingested"
    );
    if !stats.errors.is_empty() {
        warn!(
            archive = %stats.archive_path,
            count = stats.errors.len(),
            "archive had unreadable lines"
        );
    }

    Ok(stats)
}

/// Ingest the archive only when it differs from the manifest's checksum.
///
/// Returns `None` when the file is byte-identical to the last ingestion.
pub async fn ingest_if_changed(
    pool: &SessionPool,
    path: &Path,
    source: Source,
    batch_size: usize,
) -> Result<Option<IngestStats>> {
    ingest_changed_with(pool, path, source, IngestOptions::new(batch_size)).await
}

async fn ingest_changed_with(
    pool: &SessionPool,
    path: &Path,
    source: Source,
    options: IngestOptions,
) -> Result<Option<IngestStats>> {
    let key = archive_key(path).await?;
    let previous = store::get_manifest(pool, &key).await?;
    let previous_checksum = previous.as_ref().map(|m| m.checksum.as_str());

    if !checksum::should_reindex(path, previous_checksum).await? {
        debug!(archive = %key, "archive unchanged");
        return Ok(None);
    }

    ingest_with(pool, path, source, options).await.map(Some)
}

/// An archive that failed during a directory sync.
#[derive(Debug)]
pub struct ArchiveFailure {
    pub path: PathBuf,
    pub error: Error,
}

/// Outcome of [`sync_archive_root`].
#[derive(Debug, Default)]
pub struct SyncReport {
    /// Archive files matched by the include globs under a known source directory.
    pub archives_seen: u64,
    pub archives_ingested: u64,
    pub archives_unchanged: u64,
    pub records_indexed: u64,
    pub records_skipped: u64,
    pub row_errors: u64,
    /// Top-level directories that do not name a source.
    pub unknown_dirs: Vec<String>,
    pub failures: Vec<ArchiveFailure>,
}

/// Ingest every archive under `root`.
///
/// Archives live at `<root>/<source>/...`; the first path component below
/// `root` picks the [`Source`]. Archives are processed in path order and a
/// failing archive does not stop the rest. With `full` set, change detection
/// is bypassed.
pub async fn sync_archive_root(
    pool: &SessionPool,
    root: &Path,
    include_globs: &[String],
    options: IngestOptions,
    full: bool,
    progress: &dyn SyncProgressReporter,
) -> Result<SyncReport> {
    progress.report(SyncProgressEvent::Discovering {
        root: root.display().to_string(),
    });

    let include = build_globset(include_globs)?;
    let mut report = SyncReport::default();
    let mut unknown = BTreeSet::new();
    let mut archives: Vec<(PathBuf, Source)> = Vec::new();

    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };
        if !include.is_match(relative) {
            continue;
        }

        let mut components = relative.components();
        let (Some(dir), Some(_)) = (components.next(), components.next()) else {
            // Files directly under the root belong to no source.
            continue;
        };
        let dir = dir.as_os_str().to_string_lossy().into_owned();
        match dir.parse::<Source>() {
            Ok(source) => archives.push((path.to_path_buf(), source)),
            Err(_) => {
                if unknown.insert(dir.clone()) {
                    warn!(dir = %dir, "skipping directory that names no known source");
                }
            }
        }
    }

    archives.sort();
    report.archives_seen = archives.len() as u64;
    report.unknown_dirs = unknown.into_iter().collect();
    let total = report.archives_seen;

    for (n, (path, source)) in archives.into_iter().enumerate() {
        progress.report(SyncProgressEvent::Ingesting {
            archive: path
                .strip_prefix(root)
                .unwrap_or(&path)
                .display()
                .to_string(),
            n: n as u64 + 1,
            total,
        });

        let outcome = if full {
            ingest_with(pool, &path, source, options).await.map(Some)
        } else {
            ingest_changed_with(pool, &path, source, options).await
        };

        match outcome {
            Ok(Some(stats)) => {
                report.archives_ingested += 1;
                report.records_indexed += stats.indexed;
                report.records_skipped += stats.skipped;
                report.row_errors += stats.errors.len() as u64;
            }
            Ok(None) => report.archives_unchanged += 1,
            Err(error) => {
                warn!(archive = %path.display(), %error, "archive failed");
                report.failures.push(ArchiveFailure { path, error });
            }
        }
    }

    Ok(report)
}

/// Turn one raw line into an entry. `Ok(None)` for blank lines and records
/// without searchable text.
fn parse_line(
    raw: &[u8],
    source: Source,
    fallback_date: Option<&str>,
) -> std::result::Result<Option<NewEntry>, RecordError> {
    let line = std::str::from_utf8(raw)
        .map_err(|e| RecordError::Parse(format!("invalid UTF-8: {}", e)))?
        .trim();
    if line.is_empty() {
        return Ok(None);
    }

    let record: serde_json::Value =
        serde_json::from_str(line).map_err(|e| RecordError::Parse(e.to_string()))?;

    let Some(extracted) = extract::extract(&record, source, fallback_date)? else {
        return Ok(None);
    };

    Ok(Some(NewEntry {
        source,
        date: extracted.date,
        metadata: line.to_string(),
        searchable_text: extracted.text,
        archive_path: None,
        line_number: None,
    }))
}

/// Read one line into `buf` without its `\n`, keeping at most `max_len`
/// bytes. The rest of an overlong line is consumed but not stored.
///
/// Every byte read is fed to `hasher`. Returns `None` at end of input,
/// otherwise whether the line was cut short.
async fn read_line_bounded<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max_len: usize,
    hasher: &mut Sha256,
) -> std::io::Result<Option<bool>> {
    let mut read_any = false;
    let mut overlong = false;
    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            return Ok(read_any.then_some(overlong));
        }
        read_any = true;

        let (taken, done) = match chunk.iter().position(|b| *b == b'\n') {
            Some(i) => (i + 1, true),
            None => (chunk.len(), false),
        };
        hasher.update(&chunk[..taken]);
        let content = &chunk[..if done { taken - 1 } else { taken }];
        let room = max_len.saturating_sub(buf.len());
        if content.len() > room {
            overlong = true;
        }
        buf.extend_from_slice(&content[..content.len().min(room)]);
        reader.consume(taken);

        if done {
            return Ok(Some(overlong));
        }
    }
}

fn is_blank(raw: &[u8]) -> bool {
    raw.iter().all(u8::is_ascii_whitespace)
}

async fn flush(
    pool: &SessionPool,
    key: &str,
    entries: &[NewEntry],
    first: bool,
    manifest: Option<&ManifestEntry>,
) -> Result<()> {
    let mut tx = pool.write_transaction().await?;

    if first {
        let removed = store::purge_archive(&mut tx, key).await?;
        if removed > 0 {
            debug!(archive = %key, removed, "replaced previous ingestion");
        }
    }
    store::insert_entries(&mut tx, entries).await?;
    if let Some(manifest) = manifest {
        store::upsert_manifest(&mut tx, manifest).await?;
    }

    tx.commit().await?;
    debug!(archive = %key, count = entries.len(), "batch committed");
    Ok(())
}

fn in_batch(batch: u64) -> impl FnOnce(Error) -> Error {
    move |error| match error {
        Error::Database(source) => Error::Transaction { batch, source },
        other => other,
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| Error::InvalidArgument(format!("bad glob '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| Error::InvalidArgument(e.to_string()))
}

pub async fn run_ingest(
    config: &Config,
    path: &Path,
    source: &str,
    batch_size: Option<usize>,
    force: bool,
) -> anyhow::Result<()> {
    let source: Source = source.parse().map_err(anyhow::Error::msg)?;
    let mut options = IngestOptions::from_config(config);
    if let Some(batch_size) = batch_size {
        options.batch_size = batch_size;
    }

    let pool = db::open(config).await?;
    let outcome = if force {
        ingest_with(&pool, path, source, options).await.map(Some)
    } else {
        ingest_changed_with(&pool, path, source, options).await
    };
    pool.close().await;
    let outcome = outcome.with_context(|| format!("failed to ingest {}", path.display()))?;

    let Some(stats) = outcome else {
        println!("ingest {} ({})", path.display(), source);
        println!("  unchanged since last ingestion, skipped");
        println!("ok");
        return Ok(());
    };

    println!("ingest {} ({})", path.display(), source);
    println!("  indexed: {}", stats.indexed);
    println!("  skipped (no text): {}", stats.skipped);
    println!("  errors: {}", stats.errors.len());
    for row in stats.errors.iter().take(10) {
        println!("    line {}: {}", row.line_number, row.error);
    }
    if stats.errors.len() > 10 {
        println!("    ... and {} more", stats.errors.len() - 10);
    }
    println!("  batches: {}", stats.batches);
    println!("  duration: {:.2}s", stats.duration.as_secs_f64());
    println!("ok");
    Ok(())
}

pub async fn run_sync(
    config: &Config,
    root: Option<PathBuf>,
    batch_size: Option<usize>,
    full: bool,
) -> anyhow::Result<()> {
    let root = root.unwrap_or_else(|| config.ingest.archive_root.clone());
    if !root.is_dir() {
        anyhow::bail!("archive root does not exist: {}", root.display());
    }
    let mut options = IngestOptions::from_config(config);
    if let Some(batch_size) = batch_size {
        options.batch_size = batch_size;
    }

    let pool = db::open(config).await?;
    let report = sync_archive_root(
        &pool,
        &root,
        &config.ingest.include_globs,
        options,
        full,
        &StderrProgress,
    )
    .await;
    pool.close().await;
    let report = report?;

    println!("sync {}", root.display());
    println!("  archives found: {}", report.archives_seen);
    println!("  ingested: {}", report.archives_ingested);
    println!("  unchanged: {}", report.archives_unchanged);
    println!("  records indexed: {}", report.records_indexed);
    println!("  records skipped: {}", report.records_skipped);
    println!("  row errors: {}", report.row_errors);
    for dir in &report.unknown_dirs {
        println!("  ignored directory: {}", dir);
    }
    for failure in &report.failures {
        println!("  failed: {}: {}", failure.path.display(), failure.error);
    }

    if !report.failures.is_empty() {
        anyhow::bail!("{} archive(s) failed", report.failures.len());
    }
    println!("ok");
    Ok(())
}
