use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use archive_index::config::Config;
use archive_index::error::{Error, RecordError};
use archive_index::ingest::IngestOptions;
use archive_index::models::{DateRange, ManifestStatus, NewEntry, SearchQuery, Source};
use archive_index::progress::{NoProgress, SyncProgressEvent, SyncProgressReporter};
use archive_index::{db, ingest, migrate, search, stats, store, SessionPool};
use chrono::NaiveDate;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tempfile::TempDir;

fn config_for(tmp: &TempDir) -> Config {
    Config::with_db_path(tmp.path().join("data").join("index.sqlite"))
}

async fn open_pool(tmp: &TempDir) -> SessionPool {
    db::open(&config_for(tmp)).await.unwrap()
}

fn write_archive(root: &Path, rel: &str, lines: &[&str]) -> PathBuf {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let mut body = lines.join("\n");
    body.push('\n');
    fs::write(&path, body).unwrap();
    path
}

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 8, 20).unwrap()
}

const MEETING: &str = r#"{"text":"Team meeting at 2pm","source":"x","date":"2025-08-17"}"#;
const DEADLINE: &str = r#"{"text":"Project deadline Friday","source":"x","date":"2025-08-17"}"#;

#[tokio::test]
async fn test_meeting_and_deadline_scenario() {
    let tmp = TempDir::new().unwrap();
    let pool = open_pool(&tmp).await;
    let path = write_archive(tmp.path(), "slack/2025-08-17.jsonl", &[MEETING, DEADLINE]);

    let stats = ingest::ingest(&pool, &path, Source::Slack, 1000).await.unwrap();
    assert_eq!(stats.indexed, 2);
    assert!(stats.errors.is_empty());

    let results = search::search(&pool, &SearchQuery::new("meeting")).await.unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].content.contains("Team meeting"));
    assert_eq!(results[0].source, "slack");
    assert_eq!(results[0].date, "2025-08-17");

    let results = search::search(&pool, &SearchQuery::new("project deadline").limit(1))
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].content.contains("Project deadline"));

    let results = search::search(&pool, &SearchQuery::new("nonexistent")).await.unwrap();
    assert!(results.is_empty());
}

#[tokio::test]
async fn test_malformed_line_is_recorded_not_fatal() {
    let tmp = TempDir::new().unwrap();
    let pool = open_pool(&tmp).await;
    let path = write_archive(
        tmp.path(),
        "slack/2025-08-17.jsonl",
        &[MEETING, r#"{"text": "broken"#, DEADLINE],
    );

    let stats = ingest::ingest(&pool, &path, Source::Slack, 1000).await.unwrap();
    assert_eq!(stats.indexed, 2);
    assert_eq!(stats.errors.len(), 1);
    assert_eq!(stats.errors[0].line_number, 2);
    assert!(matches!(stats.errors[0].error, RecordError::Parse(_)));

    let manifest = store::get_manifest(&pool, &stats.archive_path)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(manifest.status, ManifestStatus::CompleteWithErrors);
    assert_eq!(manifest.record_count, 2);
}

#[tokio::test]
async fn test_records_without_text_are_skipped_not_errors() {
    let tmp = TempDir::new().unwrap();
    let pool = open_pool(&tmp).await;
    let path = write_archive(
        tmp.path(),
        "drive/2025-08-17.jsonl",
        &[
            r#"{"name":"Q3 forecast.xlsx","modifiedTime":"2025-08-17T09:30:00Z"}"#,
            r#"{"id":"abc","modifiedTime":"2025-08-17T09:30:00Z"}"#,
            "",
            r#"[1, 2, 3]"#,
        ],
    );

    let stats = ingest::ingest(&pool, &path, Source::Drive, 1000).await.unwrap();
    assert_eq!(stats.indexed, 1);
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.errors.len(), 1);
    assert_eq!(stats.errors[0].line_number, 4);
    assert!(matches!(stats.errors[0].error, RecordError::Extraction(_)));
}

#[tokio::test]
async fn test_metadata_round_trips() {
    let tmp = TempDir::new().unwrap();
    let pool = open_pool(&tmp).await;
    let record = r#"{"text":"zebracorn launch notes","date":"2025-08-17","user_name":"alice","reactions":[{"name":"tada","count":3}],"edited":null,"score":1.5}"#;
    let path = write_archive(tmp.path(), "slack/2025-08-17.jsonl", &[MEETING, record]);

    ingest::ingest(&pool, &path, Source::Slack, 1000).await.unwrap();

    let results = search::search(&pool, &SearchQuery::new("zebracorn")).await.unwrap();
    assert_eq!(results.len(), 1);
    let original: serde_json::Value = serde_json::from_str(record).unwrap();
    assert_eq!(results[0].metadata, original);

    let entry = store::get_entry(&pool, results[0].id).await.unwrap().unwrap();
    assert_eq!(entry.metadata, original);
    assert_eq!(entry.line_number, Some(2));
    assert!(entry.searchable_text.contains("alice"));
}

#[tokio::test]
async fn test_limit_returns_top_ranked() {
    let tmp = TempDir::new().unwrap();
    let pool = open_pool(&tmp).await;
    let path = write_archive(
        tmp.path(),
        "slack/2025-08-17.jsonl",
        &[
            r#"{"text":"rollout planned for the new billing service and several other systems","date":"2025-08-17"}"#,
            r#"{"text":"rollout rollout rollout","date":"2025-08-17"}"#,
            r#"{"text":"the rollout slipped a week","date":"2025-08-17"}"#,
            r#"{"text":"unrelated lunch order","date":"2025-08-17"}"#,
        ],
    );
    ingest::ingest(&pool, &path, Source::Slack, 1000).await.unwrap();

    let all = search::search(&pool, &SearchQuery::new("rollout")).await.unwrap();
    assert_eq!(all.len(), 3);
    for pair in all.windows(2) {
        assert!(pair[0].relevance_score <= pair[1].relevance_score);
    }

    let top = search::search(&pool, &SearchQuery::new("rollout").limit(1))
        .await
        .unwrap();
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].id, all[0].id);
    assert_eq!(top[0].content, "rollout rollout rollout");

    let again = search::search(&pool, &SearchQuery::new("rollout")).await.unwrap();
    let ids: Vec<i64> = all.iter().map(|r| r.id).collect();
    let again_ids: Vec<i64> = again.iter().map(|r| r.id).collect();
    assert_eq!(ids, again_ids);
}

#[tokio::test]
async fn test_zero_limit_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let pool = open_pool(&tmp).await;
    let err = search::search(&pool, &SearchQuery::new("anything").limit(0))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[tokio::test]
async fn test_source_filter() {
    let tmp = TempDir::new().unwrap();
    let pool = open_pool(&tmp).await;
    let a = write_archive(
        tmp.path(),
        "slack/2025-08-18.jsonl",
        &[r#"{"text":"budget review moved","date":"2025-08-18"}"#],
    );
    let b = write_archive(
        tmp.path(),
        "calendar/2025-08-18.jsonl",
        &[r#"{"summary":"budget review","start":{"dateTime":"2025-08-18T10:00:00Z"}}"#],
    );
    ingest::ingest(&pool, &a, Source::Slack, 1000).await.unwrap();
    ingest::ingest(&pool, &b, Source::Calendar, 1000).await.unwrap();

    let both = search::search(&pool, &SearchQuery::new("budget")).await.unwrap();
    assert_eq!(both.len(), 2);

    let slack = search::search(&pool, &SearchQuery::new("budget").source("slack"))
        .await
        .unwrap();
    assert_eq!(slack.len(), 1);
    assert_eq!(slack[0].source, "slack");

    let calendar = search::search(&pool, &SearchQuery::new("budget").source("google_calendar"))
        .await
        .unwrap();
    assert_eq!(calendar.len(), 1);
    assert_eq!(calendar[0].source, "calendar");

    let phrased = search::search(&pool, &SearchQuery::new("budget in calendar"))
        .await
        .unwrap();
    assert_eq!(phrased.len(), 1);
    assert_eq!(phrased[0].source, "calendar");

    let none = search::search(&pool, &SearchQuery::new("budget").source("roster"))
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn test_date_range_filter_is_inclusive() {
    let tmp = TempDir::new().unwrap();
    let pool = open_pool(&tmp).await;
    let path = write_archive(
        tmp.path(),
        "slack/august.jsonl",
        &[
            r#"{"text":"standup notes one","date":"2025-08-15"}"#,
            r#"{"text":"standup notes two","date":"2025-08-17"}"#,
            r#"{"text":"standup notes three","date":"2025-08-20"}"#,
        ],
    );
    ingest::ingest(&pool, &path, Source::Slack, 1000).await.unwrap();

    let query = SearchQuery::new("standup").date_range(DateRange::new("2025-08-16", "2025-08-20"));
    let results = search::search(&pool, &query).await.unwrap();
    let mut dates: Vec<&str> = results.iter().map(|r| r.date.as_str()).collect();
    dates.sort();
    assert_eq!(dates, vec!["2025-08-17", "2025-08-20"]);

    let results = search::search_on(&pool, &SearchQuery::new("standup yesterday"), today(), 3)
        .await
        .unwrap();
    assert!(results.is_empty());

    let results = search::search_on(&pool, &SearchQuery::new("standup 2025-08-17"), today(), 3)
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].date, "2025-08-17");

    // An explicit range wins over a phrase in the text.
    let query = SearchQuery::new("standup today").date_range(DateRange::day("2025-08-15"));
    let results = search::search_on(&pool, &query, today(), 3).await.unwrap();
    assert!(results.is_empty(), "'today' is a search term here, not a filter");
}

#[tokio::test]
async fn test_filter_only_query_browses_newest() {
    let tmp = TempDir::new().unwrap();
    let pool = open_pool(&tmp).await;
    let path = write_archive(
        tmp.path(),
        "slack/august.jsonl",
        &[
            r#"{"text":"older","date":"2025-08-11"}"#,
            r#"{"text":"newer","date":"2025-08-19"}"#,
            r#"{"text":"newest","date":"2025-08-20"}"#,
        ],
    );
    ingest::ingest(&pool, &path, Source::Slack, 1000).await.unwrap();

    let results = search::search_on(&pool, &SearchQuery::new("in slack this week"), today(), 3)
        .await
        .unwrap();
    let texts: Vec<&str> = results.iter().map(|r| r.content.as_str()).collect();
    assert_eq!(texts, vec!["newest", "newer"]);
    assert!(results.iter().all(|r| r.relevance_score == 0.0));

    let results = search::search_on(&pool, &SearchQuery::new("  "), today(), 3)
        .await
        .unwrap();
    assert!(results.is_empty());
}

#[tokio::test]
async fn test_ingest_if_changed() {
    let tmp = TempDir::new().unwrap();
    let pool = open_pool(&tmp).await;
    let path = write_archive(tmp.path(), "slack/2025-08-17.jsonl", &[MEETING]);

    let first = ingest::ingest_if_changed(&pool, &path, Source::Slack, 1000)
        .await
        .unwrap();
    assert!(first.is_some());

    let second = ingest::ingest_if_changed(&pool, &path, Source::Slack, 1000)
        .await
        .unwrap();
    assert!(second.is_none());

    write_archive(tmp.path(), "slack/2025-08-17.jsonl", &[MEETING, DEADLINE]);
    let third = ingest::ingest_if_changed(&pool, &path, Source::Slack, 1000)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(third.indexed, 2);

    let snapshot = stats::get_stats(&pool).await.unwrap();
    assert_eq!(snapshot.total_records, 2, "re-ingestion must not duplicate");
    assert_eq!(snapshot.archives_tracked, 1);
    assert_eq!(snapshot.records_by_source.get("slack"), Some(&2));

    let manifest = store::get_manifest(&pool, &third.archive_path)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(manifest.checksum, third.checksum);
    assert_eq!(
        manifest.checksum,
        archive_index::checksum::file_checksum(&path).await.unwrap()
    );
}

#[tokio::test]
async fn test_batches_follow_batch_size() {
    let tmp = TempDir::new().unwrap();
    let pool = open_pool(&tmp).await;
    let lines: Vec<String> = (0..5)
        .map(|i| format!(r#"{{"text":"note {}","date":"2025-08-17"}}"#, i))
        .collect();
    let lines: Vec<&str> = lines.iter().map(String::as_str).collect();
    let path = write_archive(tmp.path(), "slack/2025-08-17.jsonl", &lines);

    let stats = ingest::ingest(&pool, &path, Source::Slack, 1).await.unwrap();
    assert_eq!(stats.indexed, 5);
    assert_eq!(stats.batches, 5);

    let stats = ingest::ingest(&pool, &path, Source::Slack, 2).await.unwrap();
    assert_eq!(stats.batches, 3);

    let entries = store::entries_for_archive(&pool, &stats.archive_path)
        .await
        .unwrap();
    let line_numbers: Vec<Option<i64>> = entries.iter().map(|e| e.line_number).collect();
    assert_eq!(line_numbers, vec![Some(1), Some(2), Some(3), Some(4), Some(5)]);
    assert!(entries.windows(2).all(|w| w[0].id < w[1].id));

    let err = ingest::ingest(&pool, &path, Source::Slack, 0).await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[tokio::test]
async fn test_empty_archive_gets_manifest() {
    let tmp = TempDir::new().unwrap();
    let pool = open_pool(&tmp).await;
    let path = tmp.path().join("empty.jsonl");
    fs::write(&path, "").unwrap();

    let stats = ingest::ingest(&pool, &path, Source::Roster, 10).await.unwrap();
    assert_eq!(stats.indexed, 0);
    assert_eq!(stats.batches, 1);
    let manifest = store::get_manifest(&pool, &stats.archive_path)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(manifest.record_count, 0);
    assert_eq!(manifest.status, ManifestStatus::Complete);
}

#[tokio::test]
async fn test_failed_batch_keeps_earlier_batches() {
    let tmp = TempDir::new().unwrap();
    let pool = open_pool(&tmp).await;
    sqlx::query(
        r#"
        CREATE TRIGGER reject_poison BEFORE INSERT ON content
        WHEN new.searchable_text LIKE '%poison%'
        BEGIN SELECT RAISE(ABORT, 'poisoned record'); END
        "#,
    )
    .execute(pool.sqlite())
    .await
    .unwrap();

    let path = write_archive(
        tmp.path(),
        "slack/2025-08-17.jsonl",
        &[
            r#"{"text":"alpha","date":"2025-08-17"}"#,
            r#"{"text":"bravo","date":"2025-08-17"}"#,
            r#"{"text":"poison charlie","date":"2025-08-17"}"#,
            r#"{"text":"delta","date":"2025-08-17"}"#,
        ],
    );

    let err = ingest::ingest(&pool, &path, Source::Slack, 2).await.unwrap_err();
    assert!(matches!(err, Error::Transaction { batch: 2, .. }), "got {:?}", err);

    let snapshot = stats::get_stats(&pool).await.unwrap();
    assert_eq!(snapshot.total_records, 2);
    assert_eq!(snapshot.archives_tracked, 0, "manifest stays unset");
    let report = stats::check_consistency(&pool).await.unwrap();
    assert!(report.is_consistent(), "{:?}", report);
    assert_eq!(report.index_rows, 2);

    sqlx::query("DROP TRIGGER reject_poison")
        .execute(pool.sqlite())
        .await
        .unwrap();
    let stats = ingest::ingest_if_changed(&pool, &path, Source::Slack, 2)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stats.indexed, 4);
    assert_eq!(stats::get_stats(&pool).await.unwrap().total_records, 4);
}

#[tokio::test]
async fn test_dropped_transaction_rolls_back_content_and_index() {
    let tmp = TempDir::new().unwrap();
    let pool = open_pool(&tmp).await;
    let entry = NewEntry {
        source: Source::Slack,
        date: "2025-08-17".to_string(),
        metadata: r#"{"text":"unicorn sighting"}"#.to_string(),
        searchable_text: "unicorn sighting".to_string(),
        archive_path: None,
        line_number: None,
    };

    {
        let mut tx = pool.write_transaction().await.unwrap();
        store::insert_entries(&mut tx, &[entry.clone()]).await.unwrap();
        let visible: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM search_index WHERE search_index MATCH 'unicorn'")
                .fetch_one(&mut *tx)
                .await
                .unwrap();
        assert_eq!(visible, 1, "index row is written in the same transaction");
    }

    let report = stats::check_consistency(&pool).await.unwrap();
    assert_eq!(report.content_rows, 0);
    assert_eq!(report.index_rows, 0);

    let mut tx = pool.write_transaction().await.unwrap();
    let ids = store::insert_entries(&mut tx, &[entry.clone(), entry]).await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(ids.len(), 2);
    assert!(ids[0] < ids[1]);

    let mut tx = pool.write_transaction().await.unwrap();
    assert_eq!(store::delete_entries(&mut tx, &ids[..1]).await.unwrap(), 1);
    tx.commit().await.unwrap();

    let report = stats::check_consistency(&pool).await.unwrap();
    assert!(report.is_consistent());
    assert_eq!(report.content_rows, 1);
    assert_eq!(report.index_rows, 1);
}

#[tokio::test]
async fn test_consistency_across_remove_and_reingest() {
    let tmp = TempDir::new().unwrap();
    let pool = open_pool(&tmp).await;
    let a = write_archive(tmp.path(), "slack/a.jsonl", &[MEETING, DEADLINE]);
    let b = write_archive(
        tmp.path(),
        "slack/b.jsonl",
        &[r#"{"text":"another meeting","date":"2025-08-18"}"#],
    );

    let stats_a = ingest::ingest(&pool, &a, Source::Slack, 1).await.unwrap();
    ingest::ingest(&pool, &b, Source::Slack, 1).await.unwrap();
    assert!(stats::check_consistency(&pool).await.unwrap().is_consistent());

    let removed = store::remove_archive(&pool, &stats_a.archive_path).await.unwrap();
    assert_eq!(removed, 2);
    let report = stats::check_consistency(&pool).await.unwrap();
    assert!(report.is_consistent());
    assert_eq!(report.content_rows, 1);
    assert!(store::get_manifest(&pool, &stats_a.archive_path)
        .await
        .unwrap()
        .is_none());

    let results = search::search(&pool, &SearchQuery::new("meeting")).await.unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].content.contains("another"));

    ingest::ingest(&pool, &a, Source::Slack, 1).await.unwrap();
    let report = stats::check_consistency(&pool).await.unwrap();
    assert!(report.is_consistent());
    assert_eq!(report.content_rows, 3);
    assert_eq!(store::list_manifest(&pool).await.unwrap().len(), 2);
}

fn small_pool_config(tmp: &TempDir, size: u32, ceiling: u32) -> Config {
    let mut config = config_for(tmp);
    config.pool.size = size;
    config.pool.max_connections = Some(ceiling);
    config.pool.acquire_timeout_ms = 200;
    config
}

#[tokio::test]
async fn test_pool_exhaustion_times_out() {
    let tmp = TempDir::new().unwrap();
    let pool = db::open(&small_pool_config(&tmp, 1, 1)).await.unwrap();

    let held = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let err = pool.acquire(Duration::from_millis(100)).await.unwrap_err();
    assert!(matches!(err, Error::PoolExhausted(_)));

    // A query that cannot get a session fails instead of returning nothing.
    let err = search::search(&pool, &SearchQuery::new("meeting"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PoolExhausted(_)), "got {:?}", err);

    pool.release(held);
    let again = pool.acquire(Duration::from_secs(1)).await.unwrap();
    drop(again);
    assert!(search::search(&pool, &SearchQuery::new("meeting"))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_pool_overflows_up_to_ceiling() {
    let tmp = TempDir::new().unwrap();
    let pool = db::open(&small_pool_config(&tmp, 1, 2)).await.unwrap();

    let first = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let second = pool.acquire(Duration::from_secs(1)).await.unwrap();
    assert_eq!(pool.status().size, 2);
    assert_eq!(pool.status().max_connections, 2);

    let err = pool.acquire(Duration::from_millis(100)).await.unwrap_err();
    assert!(matches!(err, Error::PoolExhausted(_)));

    drop(first);
    drop(second);
    let tx = pool.transaction().await.unwrap();
    tx.commit().await.unwrap();
}

#[tokio::test]
async fn test_acquire_waits_past_pool_timeout() {
    let tmp = TempDir::new().unwrap();
    let pool = db::open(&small_pool_config(&tmp, 1, 1)).await.unwrap();

    let held = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let releaser = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(600)).await;
        drop(held);
    });

    let started = std::time::Instant::now();
    let session = pool.acquire(Duration::from_secs(3)).await;
    assert!(session.is_ok(), "got {:?}", session.err());
    assert!(started.elapsed() >= Duration::from_millis(500));
    releaser.await.unwrap();
}

#[tokio::test]
async fn test_session_left_in_transaction_is_not_reused() {
    let tmp = TempDir::new().unwrap();
    let pool = db::open(&small_pool_config(&tmp, 1, 1)).await.unwrap();

    let mut session = pool.acquire(Duration::from_secs(1)).await.unwrap();
    sqlx::raw_sql("BEGIN IMMEDIATE")
        .execute(&mut *session)
        .await
        .unwrap();
    pool.release(session);

    // A reused session would still be inside the transaction and refuse BEGIN.
    let mut session = pool.acquire(Duration::from_secs(2)).await.unwrap();
    sqlx::raw_sql("BEGIN IMMEDIATE; ROLLBACK")
        .execute(&mut *session)
        .await
        .unwrap();
    drop(session);
    assert!(pool.status().size <= 1);

    // The discarded session took its write lock with it.
    let path = write_archive(tmp.path(), "slack/2025-08-17.jsonl", &[MEETING]);
    let stats = ingest::ingest(&pool, &path, Source::Slack, 10).await.unwrap();
    assert_eq!(stats.indexed, 1);
}

#[tokio::test]
async fn test_fresh_database_is_current_and_reopen_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let config = config_for(&tmp);

    let pool = db::open(&config).await.unwrap();
    let mut session = pool.acquire(Duration::from_secs(1)).await.unwrap();
    assert_eq!(
        migrate::read_version(&mut session).await.unwrap(),
        migrate::SCHEMA_VERSION
    );
    drop(session);

    let path = write_archive(tmp.path(), "slack/2025-08-17.jsonl", &[MEETING]);
    ingest::ingest(&pool, &path, Source::Slack, 10).await.unwrap();
    pool.close().await;

    migrate::run_migrations(&config).await.unwrap();
    let pool = db::open(&config).await.unwrap();
    assert_eq!(stats::get_stats(&pool).await.unwrap().total_records, 1);
}

async fn raw_database(tmp: &TempDir, statements: &[&str]) -> Config {
    let config = config_for(tmp);
    fs::create_dir_all(config.db.path.parent().unwrap()).unwrap();
    let raw = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(
            SqliteConnectOptions::new()
                .filename(&config.db.path)
                .create_if_missing(true),
        )
        .await
        .unwrap();
    for stmt in statements {
        sqlx::query(stmt).execute(&raw).await.unwrap();
    }
    raw.close().await;
    config
}

#[tokio::test]
async fn test_v1_schema_is_migrated_without_data_loss() {
    let tmp = TempDir::new().unwrap();
    let config = raw_database(
        &tmp,
        &[
            r#"CREATE TABLE content (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source TEXT NOT NULL,
                date TEXT NOT NULL,
                metadata TEXT NOT NULL,
                searchable_text TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL
            )"#,
            r#"CREATE TABLE archives (
                archive_path TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                indexed_at INTEGER NOT NULL,
                record_count INTEGER NOT NULL,
                checksum TEXT NOT NULL
            )"#,
            r#"INSERT INTO content (source, date, metadata, searchable_text, created_at)
               VALUES ('slack', '2025-07-01', '{"text":"legacy harvest report"}', 'legacy harvest report', 0)"#,
            r#"INSERT INTO archives VALUES ('/old/slack.jsonl', 'slack', 0, 1, 'abc')"#,
            "PRAGMA user_version = 1",
        ],
    )
    .await;

    let pool = db::open(&config).await.unwrap();

    let results = search::search(&pool, &SearchQuery::new("harvest")).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].date, "2025-07-01");

    let entry = store::get_entry(&pool, results[0].id).await.unwrap().unwrap();
    assert_eq!(entry.archive_path, None);

    let manifest = store::get_manifest(&pool, "/old/slack.jsonl")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(manifest.status, ManifestStatus::Complete);
    assert!(stats::check_consistency(&pool).await.unwrap().is_consistent());

    let mut session = pool.acquire(Duration::from_secs(1)).await.unwrap();
    assert_eq!(migrate::read_version(&mut session).await.unwrap(), 2);
}

#[tokio::test]
async fn test_newer_schema_is_refused() {
    let tmp = TempDir::new().unwrap();
    let config = raw_database(&tmp, &["PRAGMA user_version = 3"]).await;
    let err = db::open(&config).await.unwrap_err();
    assert!(matches!(err, Error::SchemaMigration(_)), "got {:?}", err);
}

#[tokio::test]
async fn test_unversioned_store_is_refused() {
    let tmp = TempDir::new().unwrap();
    let config = raw_database(&tmp, &["CREATE TABLE content (id INTEGER PRIMARY KEY, body TEXT)"]).await;
    let err = db::open(&config).await.unwrap_err();
    assert!(matches!(err, Error::SchemaMigration(_)), "got {:?}", err);
}

struct Recorder(Mutex<Vec<SyncProgressEvent>>);

impl SyncProgressReporter for Recorder {
    fn report(&self, event: SyncProgressEvent) {
        self.0.lock().unwrap().push(event);
    }
}

#[tokio::test]
async fn test_sync_archive_root() {
    let tmp = TempDir::new().unwrap();
    let pool = open_pool(&tmp).await;
    let root = tmp.path().join("archive");
    write_archive(&root, "slack/2025-08-17.jsonl", &[MEETING, DEADLINE]);
    write_archive(
        &root,
        "calendar/2025-08-18.jsonl",
        &[r#"{"summary":"Quarterly planning","start":{"date":"2025-08-18"}}"#],
    );
    write_archive(&root, "email/2025-08-18.jsonl", &[MEETING]);
    write_archive(&root, "stray.jsonl", &[MEETING]);
    write_archive(&root, "slack/notes.txt", &["not an archive"]);
    let globs = vec!["**/*.jsonl".to_string()];

    let recorder = Recorder(Mutex::new(Vec::new()));
    let options = IngestOptions::new(100);
    let report = ingest::sync_archive_root(&pool, &root, &globs, options, false, &recorder)
        .await
        .unwrap();
    assert_eq!(report.archives_seen, 2);
    assert_eq!(report.archives_ingested, 2);
    assert_eq!(report.records_indexed, 3);
    assert_eq!(report.unknown_dirs, vec!["email".to_string()]);
    assert!(report.failures.is_empty());

    let events = recorder.0.lock().unwrap().clone();
    assert_eq!(events.len(), 3);
    assert!(matches!(events[0], SyncProgressEvent::Discovering { .. }));
    assert!(matches!(
        events[2],
        SyncProgressEvent::Ingesting { n: 2, total: 2, .. }
    ));

    let report = ingest::sync_archive_root(&pool, &root, &globs, options, false, &NoProgress)
        .await
        .unwrap();
    assert_eq!(report.archives_unchanged, 2);
    assert_eq!(report.archives_ingested, 0);

    let report = ingest::sync_archive_root(&pool, &root, &globs, options, true, &NoProgress)
        .await
        .unwrap();
    assert_eq!(report.archives_ingested, 2);
    assert_eq!(stats::get_stats(&pool).await.unwrap().total_records, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_ingest_and_search_stay_consistent() {
    let tmp = TempDir::new().unwrap();
    let pool = open_pool(&tmp).await;

    let mut paths = Vec::new();
    for a in 0..4 {
        let lines: Vec<String> = (0..50)
            .map(|i| format!(r#"{{"text":"shared token archive{} row{}","date":"2025-08-17"}}"#, a, i))
            .collect();
        let lines: Vec<&str> = lines.iter().map(String::as_str).collect();
        paths.push(write_archive(tmp.path(), &format!("slack/{}.jsonl", a), &lines));
    }

    let mut tasks = Vec::new();
    for path in paths {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            ingest::ingest(&pool, &path, Source::Slack, 7).await.map(|s| s.indexed)
        }));
    }
    let mut readers = Vec::new();
    for _ in 0..4 {
        let pool = pool.clone();
        readers.push(tokio::spawn(async move {
            for _ in 0..10 {
                search::search(&pool, &SearchQuery::new("shared token"))
                    .await
                    .unwrap();
                let report = stats::check_consistency(&pool).await.unwrap();
                assert!(report.is_consistent(), "{:?}", report);
            }
        }));
    }

    let mut indexed = 0;
    for task in tasks {
        indexed += task.await.unwrap().unwrap();
    }
    for reader in readers {
        reader.await.unwrap();
    }

    assert_eq!(indexed, 200);
    let report = stats::check_consistency(&pool).await.unwrap();
    assert!(report.is_consistent());
    assert_eq!(report.content_rows, 200);
    let results = search::search(&pool, &SearchQuery::new("shared")).await.unwrap();
    assert_eq!(results.len(), 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_wait_for_the_lock() {
    let tmp = TempDir::new().unwrap();
    let pool = open_pool(&tmp).await;

    let mut paths = Vec::new();
    for a in 0..6 {
        let lines: Vec<String> = (0..100)
            .map(|i| format!(r#"{{"text":"writer{} row{}","date":"2025-08-17"}}"#, a, i))
            .collect();
        let lines: Vec<&str> = lines.iter().map(String::as_str).collect();
        paths.push(write_archive(tmp.path(), &format!("slack/w{}.jsonl", a), &lines));
    }
    // Two runs over the same archive contend on the same rows.
    paths.push(paths[0].clone());
    paths.push(paths[0].clone());

    let mut tasks = Vec::new();
    for path in paths {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            ingest::ingest(&pool, &path, Source::Slack, 1).await
        }));
    }
    for task in tasks {
        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.indexed, 100);
        assert_eq!(stats.batches, 100);
    }

    let report = stats::check_consistency(&pool).await.unwrap();
    assert!(report.is_consistent(), "{:?}", report);
    assert_eq!(store::list_manifest(&pool).await.unwrap().len(), 6);
}

#[tokio::test]
async fn test_bom_and_overlong_lines() {
    let tmp = TempDir::new().unwrap();
    let pool = open_pool(&tmp).await;
    let long = format!(r#"{{"text":"{}","date":"2025-08-17"}}"#, "x".repeat(500));

    let path = tmp.path().join("slack/2025-08-17.jsonl");
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let mut body = b"\xEF\xBB\xBF".to_vec();
    body.extend_from_slice(format!("{}\n{}\n{}\n", MEETING, long, DEADLINE).as_bytes());
    fs::write(&path, &body).unwrap();

    let options = IngestOptions::new(10).max_line_bytes(128);
    let stats = ingest::ingest_with(&pool, &path, Source::Slack, options)
        .await
        .unwrap();
    assert_eq!(stats.indexed, 2);
    assert_eq!(stats.errors.len(), 1);
    assert_eq!(stats.errors[0].line_number, 2);
    assert!(matches!(stats.errors[0].error, RecordError::Parse(_)));

    let results = search::search(&pool, &SearchQuery::new("meeting")).await.unwrap();
    assert_eq!(results.len(), 1);

    // The manifest checksum still covers the whole file, BOM included.
    let manifest = store::get_manifest(&pool, &stats.archive_path)
        .await
        .unwrap()
        .unwrap();
    let checksum = archive_index::checksum::file_checksum(&path).await.unwrap();
    assert_eq!(manifest.checksum, checksum);
}

#[tokio::test]
async fn test_out_of_range_day_count_does_not_fail_search() {
    let tmp = TempDir::new().unwrap();
    let pool = open_pool(&tmp).await;
    let path = write_archive(tmp.path(), "slack/2025-08-17.jsonl", &[MEETING]);
    ingest::ingest(&pool, &path, Source::Slack, 10).await.unwrap();

    let results = search::search(&pool, &SearchQuery::new("meeting last 100000000 days"))
        .await
        .unwrap();
    assert!(results.is_empty());
}
