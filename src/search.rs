//! Query execution and result assembly.
//!
//! A [`SearchQuery`] is enhanced (see [`query`](crate::query)) into an FTS5
//! expression plus optional source and date filters, then run as a single
//! statement that joins index hits back to `content`. Because the join is
//! evaluated inside one read snapshot, an entry deleted between index lookup
//! and assembly simply does not appear.
//!
//! Ranking uses `bm25(search_index)`: lower scores are more relevant, and ties
//! are broken by ascending id so identical queries return identical pages.

use anyhow::Context;
use chrono::{Local, NaiveDate};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::debug;

use crate::config::Config;
use crate::db::{self, SessionPool};
use crate::error::{Error, Result};
use crate::models::{DateRange, SearchQuery, SearchResult, Source};
use crate::query::enhance;

/// Terms longer than this many characters are prefix matched.
pub const DEFAULT_PREFIX_THRESHOLD: usize = 3;

/// Run a search relative to the local calendar date.
pub async fn search(pool: &SessionPool, query: &SearchQuery) -> Result<Vec<SearchResult>> {
    search_on(
        pool,
        query,
        Local::now().date_naive(),
        DEFAULT_PREFIX_THRESHOLD,
    )
    .await
}

/// Run a search with relative date phrases resolved against `today`.
///
/// Returns an empty list when nothing matches; store failures are errors.
pub async fn search_on(
    pool: &SessionPool,
    query: &SearchQuery,
    today: NaiveDate,
    prefix_threshold: usize,
) -> Result<Vec<SearchResult>> {
    if query.limit == 0 {
        return Err(Error::InvalidArgument("limit must be at least 1".to_string()));
    }

    let enhanced = enhance(
        &query.text,
        today,
        prefix_threshold,
        query.source.is_none(),
        query.date_range.is_none(),
    );

    let source = query
        .source
        .as_deref()
        .map(source_tag)
        .or_else(|| enhanced.source.map(|s| s.as_str().to_string()));
    let date_range = query.date_range.clone().or_else(|| enhanced.date_range.clone());
    let limit = query.limit as i64;

    let rows = match enhanced.match_expression() {
        Some(expr) => {
            debug!(expr = %expr, ?source, ?date_range, limit, "keyword search");
            ranked(pool, &expr, source, date_range, limit).await?
        }
        None if source.is_some() || date_range.is_some() => {
            debug!(?source, ?date_range, limit, "browse without terms");
            newest(pool, source, date_range, limit).await?
        }
        None => return Ok(Vec::new()),
    };

    rows.iter().map(result_from_row).collect()
}

/// Canonical tag for a source filter; unknown names are compared verbatim.
fn source_tag(raw: &str) -> String {
    raw.parse::<Source>()
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| raw.to_string())
}

async fn ranked(
    pool: &SessionPool,
    expr: &str,
    source: Option<String>,
    date_range: Option<DateRange>,
    limit: i64,
) -> Result<Vec<SqliteRow>> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
        r#"
        SELECT c.id, c.source, c.date, c.metadata, c.searchable_text,
               bm25(search_index) AS score
        FROM search_index
        JOIN content c ON c.id = search_index.rowid
        WHERE search_index MATCH "#,
    );
    qb.push_bind(expr.to_string());
    push_filters(&mut qb, source, date_range);
    qb.push(" ORDER BY score ASC, c.id ASC LIMIT ");
    qb.push_bind(limit);

    qb.build()
        .fetch_all(pool.sqlite())
        .await
        .map_err(|e| pool.query_error(e))
}

async fn newest(
    pool: &SessionPool,
    source: Option<String>,
    date_range: Option<DateRange>,
    limit: i64,
) -> Result<Vec<SqliteRow>> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
        r#"
        SELECT c.id, c.source, c.date, c.metadata, c.searchable_text,
               0.0 AS score
        FROM content c
        WHERE 1 = 1"#,
    );
    push_filters(&mut qb, source, date_range);
    qb.push(" ORDER BY c.date DESC, c.id DESC LIMIT ");
    qb.push_bind(limit);

    qb.build()
        .fetch_all(pool.sqlite())
        .await
        .map_err(|e| pool.query_error(e))
}

fn push_filters(
    qb: &mut QueryBuilder<'_, Sqlite>,
    source: Option<String>,
    date_range: Option<DateRange>,
) {
    if let Some(source) = source {
        qb.push(" AND c.source = ").push_bind(source);
    }
    if let Some(range) = date_range {
        qb.push(" AND c.date >= ").push_bind(range.start);
        qb.push(" AND c.date <= ").push_bind(range.end);
    }
}

fn result_from_row(row: &SqliteRow) -> Result<SearchResult> {
    let id: i64 = row.get("id");
    let metadata: String = row.get("metadata");
    let metadata =
        serde_json::from_str(&metadata).map_err(|source| Error::CorruptMetadata { id, source })?;

    Ok(SearchResult {
        id,
        content: row.get("searchable_text"),
        source: row.get("source"),
        date: row.get("date"),
        metadata,
        relevance_score: row.get("score"),
    })
}

pub async fn run_search(
    config: &Config,
    text: &str,
    source: Option<String>,
    since: Option<String>,
    until: Option<String>,
    limit: Option<usize>,
    json: bool,
) -> anyhow::Result<()> {
    let date_range = match (since, until) {
        (None, None) => None,
        (since, until) => Some(DateRange::new(
            check_date(since, "0000-01-01")?,
            check_date(until, "9999-12-31")?,
        )),
    };

    let mut query = SearchQuery::new(text).limit(limit.unwrap_or(config.search.default_limit));
    query.source = source;
    query.date_range = date_range;

    let pool = db::open(config).await?;
    let results = search_on(
        &pool,
        &query,
        Local::now().date_naive(),
        config.search.prefix_threshold,
    )
    .await;
    pool.close().await;
    let results = results?;

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }

    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, result) in results.iter().enumerate() {
        println!(
            "{}. [{:.2}] {} / {}",
            i + 1,
            result.relevance_score,
            result.source,
            result.date
        );
        println!("    excerpt: \"{}\"", excerpt(&result.content, 160));
        println!("    id: {}", result.id);
        println!();
    }

    Ok(())
}

fn check_date(value: Option<String>, open_end: &str) -> anyhow::Result<String> {
    match value {
        Some(v) => {
            NaiveDate::parse_from_str(&v, "%Y-%m-%d")
                .with_context(|| format!("invalid date '{}', expected YYYY-MM-DD", v))?;
            Ok(v)
        }
        None => Ok(open_end.to_string()),
    }
}

fn excerpt(text: &str, max_chars: usize) -> String {
    let flat = text.replace('\n', " ");
    let flat = flat.trim();
    if flat.chars().count() <= max_chars {
        return flat.to_string();
    }
    let cut: String = flat.chars().take(max_chars).collect();
    format!("{}...", cut.trim_end())
}
