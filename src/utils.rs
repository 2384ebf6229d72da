//! Small helpers shared across the harvesting modules.
//!
//! - String truncation for log previews
//! - Atomic JSON persistence (write temp, then rename)
//! - Randomised pacing delays
//! - Writing values into JSON templates by pointer

use crate::error::{HarvestError, Result};
use rand::{Rng, rng};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info, instrument};

/// Truncate a string for logging purposes.
///
/// Long strings are cut to at most `max` bytes (on a char boundary) with an
/// ellipsis and byte count appended.
///
/// # Arguments
///
/// * `s` - The string to potentially truncate
/// * `max` - Maximum number of bytes to keep
///
/// # Returns
///
/// The original string if it fits, otherwise the cut prefix followed by
/// `"…(+N bytes)"`.
///
/// # Examples
///
/// ```ignore
/// assert_eq!(truncate_for_log("hello", 10), "hello");
/// assert_eq!(truncate_for_log("hello world", 5), "hello…(+6 bytes)");
/// ```
pub fn truncate_for_log(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…(+{} bytes)", &s[..cut], s.len() - cut)
}

/// Ensure the parent directory of `path` exists.
pub async fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| HarvestError::io(parent, e))?;
        }
    }
    Ok(())
}

/// Ensure a directory exists and is writable.
///
/// Creates the directory if needed, then writes and removes a probe file.
#[instrument(level = "info", skip_all, fields(path = %path.display()))]
pub async fn ensure_writable_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .await
        .map_err(|e| HarvestError::io(path, e))?;
    let probe = path.join("..__probe_write__");
    fs::write(&probe, b"")
        .await
        .map_err(|e| HarvestError::io(&probe, e))?;
    let _ = fs::remove_file(&probe).await;
    info!("Output directory is writable");
    Ok(())
}

/// Serialize `value` as JSON and replace `path` atomically.
///
/// The bytes go to a sibling `.tmp` file first, which is then renamed over
/// the destination, so readers only ever see the old or the new document.
///
/// # Errors
///
/// [`HarvestError::Json`] if serialisation fails, [`HarvestError::Io`] if
/// the temp file cannot be written or renamed.
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_bytes_atomic(path, &bytes).await
}

/// Replace `path` atomically with `bytes`.
pub async fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    ensure_parent_dir(path).await?;
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp_name);

    fs::write(&tmp, bytes)
        .await
        .map_err(|e| HarvestError::io(&tmp, e))?;
    fs::rename(&tmp, path)
        .await
        .map_err(|e| HarvestError::io(path, e))?;
    debug!(path = %path.display(), bytes = bytes.len(), "Atomically replaced file");
    Ok(())
}

/// Read a JSON document, returning `None` when the file is missing or blank.
pub async fn read_json_optional<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read_to_string(path).await {
        Ok(content) if content.trim().is_empty() => Ok(None),
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(HarvestError::io(path, e)),
    }
}

/// Pick a uniformly random delay in `[min_ms, max_ms]`.
pub fn random_delay(min_ms: u64, max_ms: u64) -> Duration {
    if max_ms <= min_ms {
        return Duration::from_millis(min_ms);
    }
    Duration::from_millis(rng().random_range(min_ms..=max_ms))
}

/// Write `value` at `pointer` inside `target`, creating objects on the way.
///
/// An empty pointer replaces the whole document. Array segments must
/// already exist.
///
/// # Arguments
///
/// * `target` - Document to modify in place
/// * `pointer` - RFC 6901 pointer such as `/args/text`
/// * `value` - Value to store
///
/// # Errors
///
/// [`HarvestError::Config`] when the pointer walks through a scalar or
/// names an array index that does not exist.
///
/// # Examples
///
/// ```ignore
/// let mut vars = json!({"args": {}});
/// set_pointer(&mut vars, "/args/text", json!("Dallas, TX"))?;
/// set_pointer(&mut vars, "/cursor", json!("abc"))?;
/// assert_eq!(vars, json!({"args": {"text": "Dallas, TX"}, "cursor": "abc"}));
/// ```
pub fn set_pointer(target: &mut Value, pointer: &str, value: Value) -> Result<()> {
    if pointer.is_empty() {
        *target = value;
        return Ok(());
    }
    let mut current = target;
    let tokens: Vec<String> = pointer
        .split('/')
        .skip(1)
        .map(|t| t.replace("~1", "/").replace("~0", "~"))
        .collect();
    let (last, parents) = tokens
        .split_last()
        .ok_or_else(|| HarvestError::Config(format!("invalid pointer {pointer:?}")))?;

    for token in parents {
        current = match current {
            Value::Object(map) => map
                .entry(token.clone())
                .or_insert_with(|| Value::Object(Default::default())),
            Value::Array(items) => {
                let index = array_index(pointer, token, items.len())?;
                &mut items[index]
            }
            _ => {
                return Err(HarvestError::Config(format!(
                    "pointer {pointer:?} crosses a non-container value"
                )));
            }
        };
    }

    match current {
        Value::Object(map) => {
            map.insert(last.clone(), value);
            Ok(())
        }
        Value::Array(items) => {
            let index = array_index(pointer, last, items.len())?;
            items[index] = value;
            Ok(())
        }
        _ => Err(HarvestError::Config(format!(
            "pointer {pointer:?} crosses a non-container value"
        ))),
    }
}

fn array_index(pointer: &str, token: &str, len: usize) -> Result<usize> {
    match token.parse::<usize>() {
        Ok(i) if i < len => Ok(i),
        _ => Err(HarvestError::Config(format!(
            "pointer {pointer:?} leaves array bounds"
        ))),
    }
}

/// Render a JSON scalar as a plain string (strings unquoted, numbers as text).
pub fn value_as_string(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_truncate_for_log_short_string() {
        assert_eq!(truncate_for_log("Hello, world!", 100), "Hello, world!");
    }

    #[test]
    fn test_truncate_for_log_long_string() {
        let s = "a".repeat(500);
        let result = truncate_for_log(&s, 100);
        assert!(result.starts_with(&"a".repeat(100)));
        assert!(result.contains("…(+400 bytes)"));
        assert_eq!(truncate_for_log("hello world", 5), "hello…(+6 bytes)");
    }

    #[test]
    fn test_truncate_for_log_respects_char_boundary() {
        let s = "é".repeat(10);
        let result = truncate_for_log(&s, 3);
        assert!(result.starts_with('é'));
        assert!(result.contains("(+18 bytes)"));
    }

    #[test]
    fn test_random_delay_bounds() {
        for _ in 0..50 {
            let d = random_delay(10, 20);
            assert!(d >= Duration::from_millis(10) && d <= Duration::from_millis(20));
        }
        assert_eq!(random_delay(5, 5), Duration::from_millis(5));
    }

    #[test]
    fn test_set_pointer_nested_and_created() {
        let mut vars = json!({"args": {"text": ""}, "cursor": null});
        set_pointer(&mut vars, "/args/text", json!("Dallas, TX")).unwrap();
        set_pointer(&mut vars, "/cursor", json!("abc")).unwrap();
        set_pointer(&mut vars, "/extra/deep", json!(1)).unwrap();
        assert_eq!(vars["args"]["text"], "Dallas, TX");
        assert_eq!(vars["cursor"], "abc");
        assert_eq!(vars["extra"]["deep"], 1);
    }

    #[test]
    fn test_set_pointer_rejects_scalar_parent() {
        let mut vars = json!({"count": 10});
        assert!(set_pointer(&mut vars, "/count/x", json!(1)).is_err());
    }

    #[test]
    fn test_value_as_string() {
        assert_eq!(value_as_string(Some(&json!("123"))), Some("123".to_string()));
        assert_eq!(value_as_string(Some(&json!(123))), Some("123".to_string()));
        assert_eq!(value_as_string(Some(&json!(null))), None);
        assert_eq!(value_as_string(None), None);
    }

    #[tokio::test]
    async fn test_write_json_atomic_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/state.json");
        write_json_atomic(&path, &json!({"cursor": "c1"})).await.unwrap();
        let back: Option<Value> = read_json_optional(&path).await.unwrap();
        assert_eq!(back.unwrap()["cursor"], "c1");
        assert!(!dir.path().join("nested/state.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_read_json_optional_missing_and_blank() {
        let dir = tempfile::tempdir().unwrap();
        let missing: Option<Value> = read_json_optional(&dir.path().join("none.json")).await.unwrap();
        assert!(missing.is_none());

        let blank = dir.path().join("blank.json");
        tokio::fs::write(&blank, "  \n").await.unwrap();
        let blank_value: Option<Value> = read_json_optional(&blank).await.unwrap();
        assert!(blank_value.is_none());
    }

    #[tokio::test]
    async fn test_ensure_writable_dir_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a/b");
        ensure_writable_dir(&target).await.unwrap();
        assert!(target.is_dir());
    }
}
