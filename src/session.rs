//! Credentials and proxies captured by the operator.
//!
//! A credential is a named cookie jar plus the per-session headers and form
//! fields that must accompany it. Two file shapes are accepted:
//!
//! ```json
//! {"name": "alice", "cookies": {"sid": "..."}, "headers": {}, "form": {"token": "..."}}
//! ```
//!
//! or a flat cookie dump where every top-level string is a cookie and the
//! optional `session_headers` / `session_payload` objects carry the extras.
//!
//! Credentials load in a fixed order (sorted by file name for directories),
//! which is the order the rotation policy walks them in.

use crate::error::{HarvestError, Result};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use tokio::fs;
use tracing::{info, instrument, warn};
use url::Url;

/// One usable session.
#[derive(Clone, Default)]
pub struct Credential {
    pub name: String,
    pub cookies: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub form: BTreeMap<String, String>,
    pub proxy: Option<String>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("name", &self.name)
            .field("cookies", &self.cookies.keys().collect::<Vec<_>>())
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .field("form", &self.form.keys().collect::<Vec<_>>())
            .field("proxy", &self.proxy.as_ref().map(|p| redact_proxy(p)))
            .finish()
    }
}

impl Credential {
    /// Render the cookie jar as a `Cookie` header value.
    pub fn cookie_header(&self) -> String {
        self.cookies
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Build a credential from one JSON document.
    pub fn from_value(value: Value, fallback_name: &str) -> Result<Credential> {
        let Value::Object(mut map) = value else {
            return Err(HarvestError::Config(format!(
                "credential {fallback_name:?} is not a JSON object"
            )));
        };

        let structured = map.get("cookies").is_some_and(Value::is_object);
        let proxy = map.remove("proxy").and_then(|v| v.as_str().map(str::to_string));
        let name = map
            .remove("name")
            .and_then(|v| v.as_str().filter(|s| !s.is_empty()).map(str::to_string))
            .unwrap_or_else(|| fallback_name.to_string());

        if structured {
            return Ok(Credential {
                name,
                cookies: take_string_map(&mut map, "cookies"),
                headers: take_string_map(&mut map, "headers"),
                form: take_string_map(&mut map, "form"),
                proxy,
            });
        }

        let headers = take_string_map(&mut map, "session_headers");
        let form = take_string_map(&mut map, "session_payload");
        let cookies = map
            .into_iter()
            .map(|(k, v)| (k, stringify_cookie(v)))
            .collect();

        Ok(Credential {
            name,
            cookies,
            headers,
            form,
            proxy,
        })
    }
}

/// Cookie, header and form values must be strings: numbers and booleans
/// keep their JSON text, objects and arrays become JSON, null becomes empty.
fn stringify_cookie(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        Value::Object(_) | Value::Array(_) => value.to_string(),
        other => other.to_string(),
    }
}

fn take_string_map(map: &mut Map<String, Value>, key: &str) -> BTreeMap<String, String> {
    match map.remove(key) {
        Some(Value::Object(inner)) => inner
            .into_iter()
            .map(|(k, v)| (k, stringify_cookie(v)))
            .collect(),
        _ => BTreeMap::new(),
    }
}

/// Hide the userinfo part of a proxy URL.
pub fn redact_proxy(proxy: &str) -> String {
    match Url::parse(proxy) {
        Ok(mut url) if !url.username().is_empty() || url.password().is_some() => {
            let _ = url.set_username("***");
            let _ = url.set_password(None);
            url.to_string()
        }
        Ok(url) => url.to_string(),
        Err(_) => "<unparsable proxy>".to_string(),
    }
}

/// Load credentials from a file or a directory of `*.json` files.
///
/// Credentials missing `required_cookie` are skipped with a warning.
///
/// # Errors
///
/// Fails when nothing usable is left after filtering.
#[instrument(level = "info", skip_all, fields(path = %path.display()))]
pub async fn load_credentials(path: &Path, required_cookie: Option<&str>) -> Result<Vec<Credential>> {
    let metadata = fs::metadata(path).await.map_err(|e| HarvestError::io(path, e))?;

    let mut loaded = Vec::new();
    if metadata.is_dir() {
        let mut files = Vec::new();
        let mut entries = fs::read_dir(path).await.map_err(|e| HarvestError::io(path, e))?;
        while let Some(entry) = entries.next_entry().await.map_err(|e| HarvestError::io(path, e))? {
            let file = entry.path();
            if file.extension().is_some_and(|ext| ext == "json") {
                files.push(file);
            }
        }
        files.sort();
        for file in files {
            let stem = file
                .file_stem()
                .map(|s| s.to_string_lossy().trim_end_matches("_cookies").to_string())
                .unwrap_or_default();
            match read_value(&file).await.and_then(|v| Credential::from_value(v, &stem)) {
                Ok(credential) => loaded.push(credential),
                Err(e) => warn!(file = %file.display(), error = %e, "Skipping unreadable credential file"),
            }
        }
    } else {
        let value = read_value(path).await?;
        let items = match value {
            Value::Array(items) => items,
            Value::Object(mut map) if map.get("credentials").is_some_and(Value::is_array) => {
                match map.remove("credentials") {
                    Some(Value::Array(items)) => items,
                    _ => Vec::new(),
                }
            }
            single => vec![single],
        };
        for (i, item) in items.into_iter().enumerate() {
            loaded.push(Credential::from_value(item, &format!("credential-{}", i + 1))?);
        }
    }

    let usable: Vec<Credential> = loaded
        .into_iter()
        .filter(|c| match required_cookie {
            Some(cookie) if c.cookies.get(cookie).is_none_or(|v| v.is_empty()) => {
                warn!(credential = %c.name, cookie, "Credential is missing the required cookie; skipping");
                false
            }
            _ => true,
        })
        .collect();

    if usable.is_empty() {
        return Err(HarvestError::Config(format!(
            "no usable credentials found in {}",
            path.display()
        )));
    }
    info!(count = usable.len(), "Loaded credentials");
    Ok(usable)
}

/// Load proxy URLs, one per line, skipping blanks and `#` comments.
#[instrument(level = "info", skip_all, fields(path = %path.display()))]
pub async fn load_proxies(path: &Path) -> Result<Vec<String>> {
    let content = fs::read_to_string(path).await.map_err(|e| HarvestError::io(path, e))?;
    let mut proxies = Vec::new();
    for line in content.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        Url::parse(line).map_err(|e| HarvestError::Config(format!("invalid proxy URL: {e}")))?;
        proxies.push(line.to_string());
    }
    info!(count = proxies.len(), "Loaded proxies");
    Ok(proxies)
}

/// Give every credential without its own proxy one from `proxies`,
/// round-robin in credential order.
pub fn assign_proxies(credentials: &mut [Credential], proxies: &[String]) {
    if proxies.is_empty() {
        return;
    }
    for (i, credential) in credentials.iter_mut().enumerate() {
        if credential.proxy.is_none() {
            credential.proxy = Some(proxies[i % proxies.len()].clone());
        }
    }
}

async fn read_value(path: &Path) -> Result<Value> {
    let content = fs::read_to_string(path).await.map_err(|e| HarvestError::io(path, e))?;
    Ok(serde_json::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_structured_credential() {
        let credential = Credential::from_value(
            json!({"cookies": {"sid": "s1", "uid": "u1"}, "form": {"token": "t"}}),
            "alice",
        )
        .unwrap();
        assert_eq!(credential.name, "alice");
        assert_eq!(credential.cookie_header(), "sid=s1; uid=u1");
        assert_eq!(credential.form.get("token").map(String::as_str), Some("t"));
    }

    #[test]
    fn test_structured_credential_with_numeric_values() {
        let credential = Credential::from_value(
            json!({
                "name": "carol",
                "cookies": {"c_user": 1000123, "xs": "a", "dpr": 1.5, "locale": null},
                "headers": {"x-asbd-id": 129477},
                "form": {"__a": 1, "__comet_req": true},
                "proxy": "http://p:1"
            }),
            "fallback",
        )
        .unwrap();
        assert_eq!(credential.name, "carol");
        assert_eq!(credential.cookies.get("c_user").unwrap(), "1000123");
        assert_eq!(credential.cookies.get("dpr").unwrap(), "1.5");
        assert_eq!(credential.cookies.get("locale").unwrap(), "");
        assert_eq!(credential.headers.get("x-asbd-id").unwrap(), "129477");
        assert_eq!(credential.form.get("__a").unwrap(), "1");
        assert_eq!(credential.form.get("__comet_req").unwrap(), "true");
        assert_eq!(credential.proxy.as_deref(), Some("http://p:1"));
        assert!(credential.cookie_header().contains("c_user=1000123"));
    }

    #[test]
    fn test_flat_cookie_dump() {
        let credential = Credential::from_value(
            json!({
                "uid": 123,
                "xs": "abc",
                "prefs": {"a": 1},
                "empty": null,
                "session_headers": {"x-lsd": "L"},
                "session_payload": {"token": "T", "rev": 5}
            }),
            "bob",
        )
        .unwrap();
        assert_eq!(credential.name, "bob");
        assert_eq!(credential.cookies.get("uid").unwrap(), "123");
        assert_eq!(credential.cookies.get("prefs").unwrap(), "{\"a\":1}");
        assert_eq!(credential.cookies.get("empty").unwrap(), "");
        assert!(!credential.cookies.contains_key("session_headers"));
        assert_eq!(credential.headers.get("x-lsd").unwrap(), "L");
        assert_eq!(credential.form.get("rev").unwrap(), "5");
    }

    #[test]
    fn test_debug_hides_secrets() {
        let credential = Credential::from_value(
            json!({"cookies": {"sid": "supersecret"}, "proxy": "http://user:pw@proxy.local:8000"}),
            "c",
        )
        .unwrap();
        let rendered = format!("{credential:?}");
        assert!(!rendered.contains("supersecret"));
        assert!(!rendered.contains("pw"));
        assert!(rendered.contains("sid"));
    }

    #[test]
    fn test_assign_proxies_round_robin() {
        let mut creds = vec![
            Credential { name: "a".into(), ..Default::default() },
            Credential { name: "b".into(), proxy: Some("http://own:1".into()), ..Default::default() },
            Credential { name: "c".into(), ..Default::default() },
        ];
        assign_proxies(&mut creds, &["http://p1:1".into(), "http://p2:2".into()]);
        assert_eq!(creds[0].proxy.as_deref(), Some("http://p1:1"));
        assert_eq!(creds[1].proxy.as_deref(), Some("http://own:1"));
        assert_eq!(creds[2].proxy.as_deref(), Some("http://p1:1"));
    }

    #[tokio::test]
    async fn test_load_directory_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("b_cookies.json"), r#"{"uid":"2"}"#).await.unwrap();
        tokio::fs::write(dir.path().join("a_cookies.json"), r#"{"uid":"1"}"#).await.unwrap();
        tokio::fs::write(dir.path().join("c_cookies.json"), r#"{"other":"x"}"#).await.unwrap();
        tokio::fs::write(dir.path().join("notes.txt"), "ignored").await.unwrap();

        let creds = load_credentials(dir.path(), Some("uid")).await.unwrap();
        let names: Vec<&str> = creds.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_load_file_with_credentials_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.json");
        tokio::fs::write(
            &path,
            r#"{"credentials":[{"name":"x","cookies":{"uid":"1"}},{"cookies":{"uid":"2"}}]}"#,
        )
        .await
        .unwrap();
        let creds = load_credentials(&path, None).await.unwrap();
        assert_eq!(creds.len(), 2);
        assert_eq!(creds[1].name, "credential-2");
    }

    #[tokio::test]
    async fn test_no_usable_credentials_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.json");
        tokio::fs::write(&path, r#"[{"cookies":{"other":"1"}}]"#).await.unwrap();
        assert!(matches!(
            load_credentials(&path, Some("uid")).await,
            Err(HarvestError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_load_proxies_skips_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxies.txt");
        tokio::fs::write(&path, "# pool\nhttp://p1:8000\n\nhttp://u:p@p2:8000\n").await.unwrap();
        let proxies = load_proxies(&path).await.unwrap();
        assert_eq!(proxies.len(), 2);
        assert_eq!(redact_proxy(&proxies[1]), "http://***@p2:8000/");
    }
}
