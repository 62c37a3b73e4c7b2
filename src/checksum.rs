//! Change detection for archive files.
//!
//! An archive is fingerprinted with SHA-256 over its raw bytes, read in
//! fixed-size chunks so memory use does not depend on file size. The digest
//! is the same one the ingestion pipeline computes while it reads lines, so a
//! manifest checksum recorded at ingestion can be compared directly.

use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::AsyncReadExt;

use crate::error::Result;

const CHUNK_SIZE: usize = 64 * 1024;

/// Hex-encoded SHA-256 of the file contents.
pub async fn file_checksum(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Whether the archive must be (re)ingested.
///
/// True when there is no previous checksum or the file no longer matches it.
pub async fn should_reindex(path: &Path, previous_checksum: Option<&str>) -> Result<bool> {
    let Some(previous) = previous_checksum else {
        return Ok(true);
    };
    let current = file_checksum(path).await?;
    Ok(!current.eq_ignore_ascii_case(previous))
}
