//! # Archive Index
//!
//! Local full-text search over JSONL archives written by collectors (chat,
//! calendar, drive, roster).
//!
//! Each archive line is parsed into a canonical content entry. Searchable text
//! is derived from it by a fixed extraction rule and kept in an SQLite FTS5
//! index that the schema itself keeps in step with the content table. Queries
//! are phrased conversationally ("budget review last week in slack") and come
//! back ranked by BM25.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌─────────────────────┐
//! │ JSONL archive│──▶│   ingest     │──▶│ SQLite (WAL)        │
//! │ <src>/*.jsonl│   │ parse+extract│   │ content ─trigger─▶  │
//! └──────────────┘   │ batch tx     │   │ search_index (FTS5) │
//!                    └──────────────┘   │ archives (manifest) │
//!                                       └─────────┬───────────┘
//!                                                 │ session pool
//!                          ┌──────────────────────┤
//!                          ▼                      ▼
//!                    ┌──────────┐           ┌──────────┐
//!                    │  search  │           │  stats   │
//!                    └──────────┘           └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! aix init
//! aix ingest data/archive/slack/2025-08-17.jsonl --source slack
//! aix sync                                   # everything under ingest.archive_root
//! aix search "deploy rollback last week"
//! aix stats
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Core data types |
//! | [`db`] | Session pool |
//! | [`migrate`] | Schema creation and migrations |
//! | [`store`] | Content and manifest reads/writes |
//! | [`extract`] | Searchable text and date extraction |
//! | [`checksum`] | Archive change detection |
//! | [`ingest`] | Ingestion pipeline and directory sync |
//! | [`query`] | Query enhancement |
//! | [`search`] | Ranked search |
//! | [`stats`] | Statistics and consistency checks |
//! | [`progress`] | Sync progress reporting |
//! | [`get`] | Entry retrieval command |

pub mod checksum;
pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod get;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod query;
pub mod search;
pub mod stats;
pub mod store;

pub use db::SessionPool;
pub use error::{Error, RecordError, Result};
pub use ingest::{ingest, ingest_if_changed, ingest_with, sync_archive_root, IngestOptions};
pub use models::{DateRange, IngestStats, SearchQuery, SearchResult, Source};
pub use search::search;
