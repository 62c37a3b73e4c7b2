//! Core data models used throughout the archive index.
//!
//! These types represent the records, index rows, manifest entries, and
//! search results that flow through the ingestion and query pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RecordError;

/// Collector that produced an archive file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Chat messages.
    Slack,
    /// Calendar events.
    Calendar,
    /// File activity.
    Drive,
    /// People directory snapshots.
    Roster,
}

impl Source {
    pub const ALL: [Source; 4] = [Source::Slack, Source::Calendar, Source::Drive, Source::Roster];

    /// Tag stored in `content.source`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Slack => "slack",
            Source::Calendar => "calendar",
            Source::Drive => "drive",
            Source::Roster => "roster",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "slack" => Ok(Source::Slack),
            "calendar" | "google_calendar" => Ok(Source::Calendar),
            "drive" | "gdrive" | "google_drive" => Ok(Source::Drive),
            "roster" | "employees" | "directory" => Ok(Source::Roster),
            other => Err(format!(
                "unknown source '{}'. Available: slack, calendar, drive, roster",
                other
            )),
        }
    }
}

/// Inclusive `YYYY-MM-DD` bounds, compared lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DateRange {
    pub start: String,
    pub end: String,
}

impl DateRange {
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    pub fn day(date: impl Into<String>) -> Self {
        let date = date.into();
        Self {
            start: date.clone(),
            end: date,
        }
    }
}

/// Row about to be written to the content table.
///
/// `metadata` is the serialized original record; `searchable_text` is derived
/// from it by [`extract`](crate::extract) and is never read back into it.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub source: Source,
    pub date: String,
    pub metadata: String,
    pub searchable_text: String,
    pub archive_path: Option<String>,
    pub line_number: Option<i64>,
}

/// Canonical record stored in the content table.
#[derive(Debug, Clone, Serialize)]
pub struct ContentEntry {
    pub id: i64,
    pub source: String,
    pub date: String,
    pub metadata: serde_json::Value,
    pub searchable_text: String,
    pub archive_path: Option<String>,
    pub line_number: Option<i64>,
    pub created_at: i64,
}

/// Outcome recorded for an archive after its final batch commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestStatus {
    Complete,
    CompleteWithErrors,
}

impl ManifestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManifestStatus::Complete => "complete",
            ManifestStatus::CompleteWithErrors => "complete_with_errors",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "complete" => Some(ManifestStatus::Complete),
            "complete_with_errors" => Some(ManifestStatus::CompleteWithErrors),
            _ => None,
        }
    }
}

/// Ingestion bookkeeping for one archive file.
#[derive(Debug, Clone, Serialize)]
pub struct ManifestEntry {
    pub archive_path: String,
    pub source: String,
    pub indexed_at: i64,
    pub record_count: i64,
    pub checksum: String,
    pub status: ManifestStatus,
}

/// A single search request.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub text: String,
    pub source: Option<String>,
    pub date_range: Option<DateRange>,
    pub limit: usize,
}

impl SearchQuery {
    pub const DEFAULT_LIMIT: usize = 100;

    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            source: None,
            date_range: None,
            limit: Self::DEFAULT_LIMIT,
        }
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn date_range(mut self, range: DateRange) -> Self {
        self.date_range = Some(range);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

/// A ranked hit returned by the query engine.
///
/// `relevance_score` is the FTS5 BM25 rank: lower is more relevant.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub id: i64,
    pub content: String,
    pub source: String,
    pub date: String,
    pub metadata: serde_json::Value,
    pub relevance_score: f64,
}

/// A line that could not be ingested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowError {
    /// 1-based line number in the archive file.
    pub line_number: u64,
    pub error: RecordError,
}

/// Summary of one archive ingestion.
#[derive(Debug, Clone)]
pub struct IngestStats {
    pub archive_path: String,
    pub source: Source,
    /// Records written to the content table.
    pub indexed: u64,
    /// Records with no extractable searchable text.
    pub skipped: u64,
    pub errors: Vec<RowError>,
    /// Transactions committed.
    pub batches: u64,
    /// SHA-256 of the bytes read, hex encoded.
    pub checksum: String,
    pub duration: Duration,
}

/// Read-only health snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub total_records: i64,
    pub archives_tracked: i64,
    pub records_by_source: BTreeMap<String, i64>,
}

/// Result of comparing the content table with the search index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsistencyReport {
    pub content_rows: i64,
    pub index_rows: i64,
    /// Content rows with no index row.
    pub missing_index: i64,
    /// Index rows with no content row.
    pub orphan_index: i64,
    /// Index rows whose text differs from the content row.
    pub mismatched_text: i64,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.missing_index == 0 && self.orphan_index == 0 && self.mismatched_text == 0
    }
}
