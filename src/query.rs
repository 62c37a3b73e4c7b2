//! Query enhancement: from a conversational phrase to an FTS5 expression.
//!
//! 1. Split on whitespace and trim punctuation from each token.
//! 2. Pull out date phrases ("yesterday", "last week", "2025-08-17", ...) and
//!    source phrases ("in slack", "from calendar") as filters.
//! 3. Drop conversational stop words, unless nothing would be left.
//! 4. Quote every remaining term; terms longer than the prefix threshold get
//!    a trailing `*` so partial words match. Terms are ANDed.
//!
//! Quoting makes FTS5 treat `OR`, `NEAR`, `-` and stray quotes as literal text.

use chrono::{Datelike, Duration, NaiveDate};

use crate::models::{DateRange, Source};

const STOP_WORDS: &[&str] = &[
    "a", "about", "an", "and", "any", "are", "at", "did", "do", "does", "for", "find", "from",
    "get", "how", "i", "in", "is", "me", "my", "of", "on", "or", "our", "said", "show", "the",
    "to", "was", "we", "were", "what", "when", "where", "who", "with",
];

const SOURCE_PREPOSITIONS: &[&str] = &["in", "on", "from"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryTerm {
    pub text: String,
    pub prefix: bool,
}

/// A query after enhancement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnhancedQuery {
    pub terms: Vec<QueryTerm>,
    /// Source named in the text, e.g. "in slack".
    pub source: Option<Source>,
    /// Date range named in the text, e.g. "last week".
    pub date_range: Option<DateRange>,
}

impl EnhancedQuery {
    /// FTS5 `MATCH` expression, or `None` when there is nothing to match.
    pub fn match_expression(&self) -> Option<String> {
        if self.terms.is_empty() {
            return None;
        }
        let expr = self
            .terms
            .iter()
            .map(|term| {
                let quoted = format!("\"{}\"", term.text.replace('"', "\"\""));
                if term.prefix {
                    quoted + "*"
                } else {
                    quoted
                }
            })
            .collect::<Vec<_>>()
            .join(" ");
        Some(expr)
    }
}

/// Enhance `raw` relative to `today`.
///
/// `prefix_threshold`: terms with more characters than this are prefix
/// matched. Phrase extraction runs only for filters the caller has not set
/// explicitly.
pub fn enhance(
    raw: &str,
    today: NaiveDate,
    prefix_threshold: usize,
    extract_source: bool,
    extract_dates: bool,
) -> EnhancedQuery {
    let mut tokens: Vec<String> = raw.split_whitespace().filter_map(clean_token).collect();
    let mut query = EnhancedQuery::default();

    if extract_dates {
        query.date_range = take_date_phrase(&mut tokens, today);
    }
    if extract_source {
        query.source = take_source_phrase(&mut tokens);
    }

    let content: Vec<String> = tokens
        .iter()
        .filter(|t| !STOP_WORDS.contains(&t.to_lowercase().as_str()))
        .cloned()
        .collect();
    let kept = if content.is_empty() { tokens } else { content };

    query.terms = kept
        .into_iter()
        .map(|text| QueryTerm {
            prefix: text.chars().count() > prefix_threshold,
            text,
        })
        .collect();
    query
}

fn clean_token(token: &str) -> Option<String> {
    let trimmed = token.trim_matches(|c: char| !c.is_alphanumeric());
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Remove the first date phrase from `tokens` and return its range.
fn take_date_phrase(tokens: &mut Vec<String>, today: NaiveDate) -> Option<DateRange> {
    let lower: Vec<String> = tokens.iter().map(|t| t.to_lowercase()).collect();

    for i in 0..lower.len() {
        let next = lower.get(i + 1).map(String::as_str);
        let after = lower.get(i + 2).map(String::as_str);

        let found = match (lower[i].as_str(), next, after) {
            ("today", _, _) => Some((1, today, today)),
            ("yesterday", _, _) => {
                let d = today - Duration::days(1);
                Some((1, d, d))
            }
            ("this", Some("week"), _) => Some((2, week_start(today), today)),
            ("last", Some("week"), _) => {
                let start = week_start(today) - Duration::days(7);
                Some((2, start, start + Duration::days(6)))
            }
            ("this", Some("month"), _) => Some((2, month_start(today), today)),
            ("last", Some("month"), _) => {
                let end = month_start(today) - Duration::days(1);
                Some((2, month_start(end), end))
            }
            // A span past the calendar range is left as plain terms.
            ("last", Some(n), Some("days")) | ("past", Some(n), Some("days")) => n
                .parse::<i64>()
                .ok()
                .filter(|n| *n > 0)
                .and_then(Duration::try_days)
                .and_then(|span| today.checked_sub_signed(span))
                .map(|start| (3, start, today)),
            (token, _, _) => NaiveDate::parse_from_str(token, "%Y-%m-%d")
                .ok()
                .map(|d| (1, d, d)),
        };

        if let Some((len, start, end)) = found {
            tokens.drain(i..i + len);
            return Some(DateRange::new(
                start.format("%Y-%m-%d").to_string(),
                end.format("%Y-%m-%d").to_string(),
            ));
        }
    }
    None
}

/// Remove the first "in/on/from <source>" phrase and return the source.
fn take_source_phrase(tokens: &mut Vec<String>) -> Option<Source> {
    let position = tokens.windows(2).position(|pair| {
        SOURCE_PREPOSITIONS.contains(&pair[0].to_lowercase().as_str())
            && pair[1].parse::<Source>().is_ok()
    })?;
    let source = tokens[position + 1].parse::<Source>().ok()?;
    tokens.drain(position..position + 2);
    Some(source)
}

fn week_start(day: NaiveDate) -> NaiveDate {
    day - Duration::days(day.weekday().num_days_from_monday() as i64)
}

fn month_start(day: NaiveDate) -> NaiveDate {
    day.with_day(1).unwrap_or(day)
}
