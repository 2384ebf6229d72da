//! JSON-Lines persistence for group records.
//!
//! Writers only ever append; the one exception is [`dedupe_file`], which
//! rewrites the file atomically.

use crate::error::{HarvestError, Result};
use crate::models::GroupRecord;
use crate::utils::{ensure_parent_dir, value_as_string, write_bytes_atomic};
use itertools::Itertools;
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::Path;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

/// Append records to `path`, one JSON document per line.
///
/// The whole batch is written with a single `write_all` and flushed before
/// returning.
pub async fn append_records(path: &Path, records: &[GroupRecord]) -> Result<()> {
    if records.is_empty() {
        return Ok(());
    }
    ensure_parent_dir(path).await?;

    let mut buf = Vec::with_capacity(records.len() * 160);
    for record in records {
        serde_json::to_writer(&mut buf, record)?;
        buf.push(b'\n');
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| HarvestError::io(path, e))?;
    file.write_all(&buf).await.map_err(|e| HarvestError::io(path, e))?;
    file.flush().await.map_err(|e| HarvestError::io(path, e))?;
    debug!(path = %path.display(), count = records.len(), "Appended records");
    Ok(())
}

/// Read every parsable record from `path`.
///
/// A missing file yields an empty list. Malformed lines are logged and
/// skipped.
#[instrument(level = "info", skip_all, fields(path = %path.display()))]
pub async fn read_records(path: &Path) -> Result<Vec<GroupRecord>> {
    let Some(content) = read_optional(path).await? else {
        return Ok(Vec::new());
    };

    let mut records = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_record(line) {
            Some(record) => records.push(record),
            None => warn!(line = line_no + 1, "Skipping malformed JSONL line"),
        }
    }
    info!(count = records.len(), "Read records");
    Ok(records)
}

/// Collect the ids present in `path`.
pub async fn read_ids(path: &Path) -> Result<BTreeSet<String>> {
    let Some(content) = read_optional(path).await? else {
        return Ok(BTreeSet::new());
    };
    Ok(content
        .lines()
        .filter_map(|line| serde_json::from_str::<Value>(line.trim()).ok())
        .filter_map(|v| value_as_string(v.get("id")))
        .collect())
}

/// Rewrite `path` keeping the first line for each id.
///
/// Malformed lines and lines without an id are dropped. Returns
/// `(kept, dropped)`.
#[instrument(level = "info", skip_all, fields(path = %path.display()))]
pub async fn dedupe_file(path: &Path) -> Result<(usize, usize)> {
    let Some(content) = read_optional(path).await? else {
        warn!("Output file does not exist yet");
        return Ok((0, 0));
    };

    let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
    let total = lines.len();
    let unique: Vec<(String, &str)> = lines
        .into_iter()
        .filter_map(|line| {
            let value: Value = serde_json::from_str(line.trim()).ok()?;
            value_as_string(value.get("id")).map(|id| (id, line.trim()))
        })
        .unique_by(|(id, _)| id.clone())
        .collect();

    let mut out = String::with_capacity(content.len());
    for (_, line) in &unique {
        out.push_str(line);
        out.push('\n');
    }
    write_bytes_atomic(path, out.as_bytes()).await?;

    let kept = unique.len();
    info!(kept, dropped = total - kept, "Deduplicated output file");
    Ok((kept, total - kept))
}

/// Parse a line, accepting numeric ids as well as strings.
fn parse_record(line: &str) -> Option<GroupRecord> {
    let mut value: Value = serde_json::from_str(line).ok()?;
    let id = value_as_string(value.get("id"))?;
    value["id"] = Value::String(id);
    serde_json::from_value(value).ok()
}

async fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(HarvestError::io(path, e)),
    }
}
