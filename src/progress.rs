//! Sync progress reporting.
//!
//! `aix sync` reports what it is scanning and how many archives are left.
//! Progress goes to **stderr** so stdout stays parseable for scripts.

use std::io::Write;

/// A single progress event for a directory sync.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncProgressEvent {
    /// Walking the archive root; total unknown.
    Discovering { root: String },
    /// About to ingest archive `n` of `total`.
    Ingesting { archive: String, n: u64, total: u64 },
}

/// Receives sync progress. Called from the ingestion pipeline.
pub trait SyncProgressReporter: Send + Sync {
    fn report(&self, event: SyncProgressEvent);
}

/// Human-friendly progress on stderr: "sync  ingesting  12 / 1,024  slack/2025-08-17.jsonl".
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let line = match &event {
            SyncProgressEvent::Discovering { root } => {
                format!("sync {}  discovering...\n", root)
            }
            SyncProgressEvent::Ingesting { archive, n, total } => format!(
                "sync  ingesting  {} / {}  {}\n",
                format_number(*n),
                format_number(*total),
                archive
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Reporter used when progress is disabled.
pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

/// `1234567` as `1,234,567`.
pub fn format_number(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}
