//! Searchable text and date extraction for archive records.
//!
//! Collectors write records with no shared schema, so extraction is driven by
//! a fixed list of field paths per [`Source`]. A path segment of `*` walks
//! every element of an array, so `attendees.*.email` collects each attendee's
//! address.
//!
//! Only the listed fields are read. The stored record and the derived text
//! are separate columns, and nothing here ever reads a derived value back.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime};
use serde_json::{Map, Value};
use std::path::Path;

use crate::error::RecordError;
use crate::models::Source;

/// Free-text fields every collector may use.
const COMMON_TEXT_FIELDS: &[&str] = &[
    "text",
    "title",
    "subject",
    "summary",
    "name",
    "description",
    "body",
    "message",
];

const SLACK_TEXT_FIELDS: &[&str] = &[
    "user_name",
    "real_name",
    "channel_name",
    "attachments.*.text",
    "attachments.*.title",
    "files.*.name",
];

const CALENDAR_TEXT_FIELDS: &[&str] = &[
    "location",
    "organizer.email",
    "organizer.displayName",
    "attendees.*.email",
    "attendees.*.displayName",
];

const DRIVE_TEXT_FIELDS: &[&str] = &[
    "mimeType",
    "owners.*.displayName",
    "owners.*.emailAddress",
    "lastModifyingUser.displayName",
];

const ROSTER_TEXT_FIELDS: &[&str] = &[
    "email",
    "title",
    "department",
    "profile.real_name",
    "profile.title",
    "profile.email",
];

const SLACK_DATE_FIELDS: &[&str] = &["ts"];
const CALENDAR_DATE_FIELDS: &[&str] = &["start.dateTime", "start.date", "start_time"];
const DRIVE_DATE_FIELDS: &[&str] = &["modifiedTime", "createdTime"];
const GENERIC_DATE_FIELDS: &[&str] = &["timestamp", "created_at", "updated_at"];

/// Epoch values at or above this are milliseconds; as seconds it would be
/// the year 5138.
const EPOCH_MILLIS_FLOOR: f64 = 1e11;

/// What ingestion stores alongside the original record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extracted {
    pub text: String,
    /// `YYYY-MM-DD`.
    pub date: String,
}

/// Derive searchable text and a date from one record.
///
/// Returns `Ok(None)` when the record has no searchable text; such records
/// are skipped rather than stored. `fallback_date` is used when the record
/// itself carries no usable date (see [`date_from_path`]).
pub fn extract(
    record: &Value,
    source: Source,
    fallback_date: Option<&str>,
) -> Result<Option<Extracted>, RecordError> {
    let obj = record.as_object().ok_or_else(|| {
        RecordError::Extraction(format!("expected a JSON object, found {}", kind(record)))
    })?;

    let text = searchable_text(obj, source);
    if text.is_empty() {
        return Ok(None);
    }

    let date = record_date(obj, source)
        .or_else(|| fallback_date.map(str::to_string))
        .ok_or_else(|| RecordError::Extraction("no usable date field".to_string()))?;

    Ok(Some(Extracted { text, date }))
}

/// Concatenate the record's text fields, in field order, without repeats.
pub fn searchable_text(obj: &Map<String, Value>, source: Source) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for path in COMMON_TEXT_FIELDS.iter().chain(text_fields(source)) {
        collect_strings(obj, path, &mut parts);
    }

    let mut seen = std::collections::HashSet::new();
    parts
        .into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty() && seen.insert(*s))
        .collect::<Vec<_>>()
        .join(" ")
}

fn text_fields(source: Source) -> &'static [&'static str] {
    match source {
        Source::Slack => SLACK_TEXT_FIELDS,
        Source::Calendar => CALENDAR_TEXT_FIELDS,
        Source::Drive => DRIVE_TEXT_FIELDS,
        Source::Roster => ROSTER_TEXT_FIELDS,
    }
}

fn date_fields(source: Source) -> &'static [&'static str] {
    match source {
        Source::Slack => SLACK_DATE_FIELDS,
        Source::Calendar => CALENDAR_DATE_FIELDS,
        Source::Drive => DRIVE_DATE_FIELDS,
        Source::Roster => &[],
    }
}

fn record_date(obj: &Map<String, Value>, source: Source) -> Option<String> {
    std::iter::once(&"date")
        .chain(date_fields(source))
        .chain(GENERIC_DATE_FIELDS)
        .flat_map(|path| lookup(obj, path))
        .find_map(date_of)
}

fn date_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => normalize_date(s),
        Value::Number(n) => n.as_f64().and_then(epoch_date),
        _ => None,
    }
}

/// Normalize a date or timestamp to `YYYY-MM-DD`.
///
/// Accepts plain dates, RFC 3339 timestamps, naive date-times with a `T` or
/// space separator, and Unix epoch seconds (including Slack's
/// `"1692268800.000200"` form) or milliseconds. Anything that would land
/// outside the years 0000-9999 is rejected.
pub fn normalize_date(raw: &str) -> Option<String> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(d.format("%Y-%m-%d").to_string());
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.date_naive().format("%Y-%m-%d").to_string());
    }
    for fmt in [
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
    ] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.date().format("%Y-%m-%d").to_string());
        }
    }
    s.parse::<f64>().ok().and_then(epoch_date)
}

fn epoch_date(value: f64) -> Option<String> {
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let secs = if value >= EPOCH_MILLIS_FLOOR {
        value / 1000.0
    } else {
        value
    };
    DateTime::from_timestamp(secs.trunc() as i64, 0)
        .filter(|dt| dt.year() <= 9999)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
}

/// First `YYYY-MM-DD` found in the path, scanning from the file name up.
///
/// Collectors lay archives out as `<source>/<date>.jsonl` or
/// `<source>/<date>/<name>.jsonl`.
pub fn date_from_path(path: &Path) -> Option<String> {
    path.iter().rev().find_map(|component| {
        let component = component.to_string_lossy();
        component
            .get(..10)
            .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
            .map(|d| d.format("%Y-%m-%d").to_string())
    })
}

fn collect_strings<'a>(obj: &'a Map<String, Value>, path: &str, out: &mut Vec<&'a str>) {
    for value in lookup(obj, path) {
        match value {
            Value::String(s) => out.push(s),
            Value::Array(items) => out.extend(items.iter().filter_map(Value::as_str)),
            _ => {}
        }
    }
}

/// Resolve a dotted path; `*` fans out over array elements.
fn lookup<'a>(obj: &'a Map<String, Value>, path: &str) -> Vec<&'a Value> {
    let mut segments = path.split('.');
    let first = match segments.next().and_then(|key| obj.get(key)) {
        Some(v) => v,
        None => return Vec::new(),
    };

    let mut current = vec![first];
    for segment in segments {
        current = current
            .into_iter()
            .flat_map(|value| -> Vec<&'a Value> {
                match (segment, value) {
                    ("*", Value::Array(items)) => items.iter().collect(),
                    (key, Value::Object(map)) => map.get(key).into_iter().collect(),
                    _ => Vec::new(),
                }
            })
            .collect();
    }
    current
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
