//! # Log Snapshots
//!
//! A snapshot is one file of framed entries followed by an 8-byte trailer:
//!
//! ```text
//!   [len u32 BE][bincode(LogEntry)] … [count u32 BE][crc32 u32 BE]
//! ```
//!
//! The CRC covers every byte before the trailer. Files are written to a
//! sibling temporary path and renamed into place.

use std::path::Path;

use crate::error::{ClusterError, Result};
use crate::message::LogEntry;

const TRAILER_LEN: usize = 8;

/// Serialize `entries` into snapshot bytes
pub fn encode(entries: &[LogEntry]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for entry in entries {
        let body = bincode::serialize(entry)?;
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
    }
    let crc = crc32fast::hash(&out);
    out.extend_from_slice(&(entries.len() as u32).to_be_bytes());
    out.extend_from_slice(&crc.to_be_bytes());
    Ok(out)
}

/// Parse and verify snapshot bytes
pub fn decode(bytes: &[u8]) -> Result<Vec<LogEntry>> {
    if bytes.len() < TRAILER_LEN {
        return Err(ClusterError::Snapshot("missing trailer".into()));
    }
    let (body, trailer) = bytes.split_at(bytes.len() - TRAILER_LEN);
    let count = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]) as usize;
    let crc = u32::from_be_bytes([trailer[4], trailer[5], trailer[6], trailer[7]]);
    if crc32fast::hash(body) != crc {
        return Err(ClusterError::Snapshot("checksum mismatch".into()));
    }

    let mut entries = Vec::with_capacity(count);
    let mut rest = body;
    while !rest.is_empty() {
        if rest.len() < 4 {
            return Err(ClusterError::Snapshot("truncated frame header".into()));
        }
        let len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        rest = &rest[4..];
        if rest.len() < len {
            return Err(ClusterError::Snapshot("truncated frame".into()));
        }
        entries.push(bincode::deserialize(&rest[..len])?);
        rest = &rest[len..];
    }
    if entries.len() != count {
        return Err(ClusterError::Snapshot(format!(
            "trailer counts {count} entries, found {}",
            entries.len()
        )));
    }
    Ok(entries)
}

pub async fn write(path: &Path, entries: &[LogEntry]) -> Result<()> {
    let bytes = encode(entries)?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, &bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    tracing::debug!(path = %path.display(), entries = entries.len(), "snapshot written");
    Ok(())
}

/// Load a snapshot; a missing file is an empty log
pub async fn read(path: &Path) -> Result<Vec<LogEntry>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => decode(&bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}
