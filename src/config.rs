//! Job configuration loaded from a YAML file.
//!
//! The request shape is captured by the operator from a live session and
//! written into the config: endpoint, static headers and form fields, the
//! search and hovercard document ids and their variables templates. The
//! crate only substitutes the cursor, the search text and the entity id into
//! those templates.
//!
//! # Example
//!
//! ```yaml
//! endpoint: https://example.com/api/graphql/
//! form:
//!   server_timestamps: "true"
//! search:
//!   doc_id: "1234567890"
//!   friendly_name: SearchResultsPaginatedQuery
//!   variables: '{"args":{"text":""},"count":10,"cursor":null}'
//! enrich:
//!   doc_id: "9876543210"
//!   variables: {"entityID": "", "scale": "1"}
//! ```

use crate::error::{HarvestError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info, instrument};
use url::Url;

/// Top-level job description.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobConfig {
    /// GraphQL endpoint every query is posted to.
    pub endpoint: String,
    /// Headers sent with every request (credential headers override them).
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Form fields sent with every request (credential form fields override them).
    #[serde(default)]
    pub form: BTreeMap<String, String>,
    /// Cookie a credential must carry to be considered usable.
    #[serde(default)]
    pub required_cookie: Option<String>,
    /// Form field that carries a query's friendly name.
    #[serde(default = "default_friendly_name_field")]
    pub friendly_name_field: String,
    pub search: SearchQuery,
    #[serde(default)]
    pub enrich: Option<EnrichQuery>,
    #[serde(default)]
    pub pacing: Pacing,
    #[serde(default)]
    pub rotation: RotationConfig,
    #[serde(default)]
    pub paging: Paging,
    #[serde(default)]
    pub paths: Paths,
}

/// The paginated search query and where to find things in its response.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SearchQuery {
    pub doc_id: String,
    #[serde(default)]
    pub friendly_name: Option<String>,
    /// Variables template; either a JSON object or the raw JSON string copied
    /// from the browser.
    pub variables: Value,
    #[serde(default = "default_cursor_pointer")]
    pub cursor_pointer: String,
    #[serde(default = "default_text_pointer")]
    pub text_pointer: String,
    #[serde(default = "default_edges_pointer")]
    pub edges_pointer: String,
    /// Candidate record locations inside an edge, tried in order. The first
    /// one holding an object with an id (and the expected typename) wins.
    #[serde(default = "default_search_node_pointers", alias = "node_pointer", deserialize_with = "one_or_many")]
    pub node_pointers: Vec<String>,
    #[serde(default = "default_typename")]
    pub typename: Option<String>,
    #[serde(default = "default_cursor_path")]
    pub cursor_path: String,
    /// Optional `"Public · 1.2K members · 10+ posts a day"` style summary line.
    #[serde(default)]
    pub snippet_pointer: Option<String>,
}

/// The per-record hovercard query used by the enrichment pass.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EnrichQuery {
    pub doc_id: String,
    #[serde(default)]
    pub friendly_name: Option<String>,
    pub variables: Value,
    #[serde(default = "default_entity_pointer")]
    pub entity_pointer: String,
    #[serde(default = "default_hovercard_node_pointer")]
    pub node_pointer: String,
    /// Output field name -> JSON pointer relative to the hovercard node.
    #[serde(default = "default_hovercard_fields")]
    pub fields: BTreeMap<String, String>,
    /// Only records carrying this field are enriched.
    #[serde(default)]
    pub require_field: Option<String>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Pacing {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub timeout_secs: u64,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            min_delay_ms: 500,
            max_delay_ms: 2000,
            timeout_secs: 30,
        }
    }
}

impl Pacing {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Knobs of the credential rotation policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RotationConfig {
    /// Backoff rounds allowed once every credential has been throttled.
    pub max_backoff_attempts: u32,
    pub base_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub max_jitter_ms: u64,
    pub rate_limit_statuses: Vec<u16>,
    /// Case-insensitive body markers that indicate throttling.
    pub rate_limit_indicators: Vec<String>,
    /// Session failures in a row after which a credential is taken out of
    /// rotation for the rest of the run.
    pub max_consecutive_failures: u32,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            max_backoff_attempts: 3,
            base_backoff_secs: 60,
            max_backoff_secs: 900,
            max_jitter_ms: 250,
            rate_limit_statuses: vec![429, 403, 503],
            rate_limit_indicators: [
                "error:1357004",
                "Please try again later",
                "Too many requests",
                "Rate limit exceeded",
                "temporarily blocked",
                "checkpoint_required",
                "login_required",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            max_consecutive_failures: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Paging {
    pub max_pages_per_term: Option<u32>,
    /// Pages in a row that yield no new records before a term is done.
    pub max_consecutive_empty: u32,
    /// Global request budget for one run.
    pub max_requests: Option<u64>,
    pub max_term_retries: u32,
}

impl Default for Paging {
    fn default() -> Self {
        Self {
            max_pages_per_term: Some(1000),
            max_consecutive_empty: 1,
            max_requests: None,
            max_term_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Paths {
    pub output: PathBuf,
    pub state: PathBuf,
    pub enriched: PathBuf,
    pub ledger: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            output: PathBuf::from("output/groups.jsonl"),
            state: PathBuf::from("output/groups_state.json"),
            enriched: PathBuf::from("output/groups_enriched.jsonl"),
            ledger: PathBuf::from("output/accounts_status.json"),
        }
    }
}

fn default_friendly_name_field() -> String {
    "fb_api_req_friendly_name".into()
}
fn default_cursor_pointer() -> String {
    "/cursor".into()
}
fn default_text_pointer() -> String {
    "/args/text".into()
}
fn default_edges_pointer() -> String {
    "/data/serpResponse/results/edges".into()
}
fn default_search_node_pointers() -> Vec<String> {
    ["/node", "/rendering_strategy/view_model/profile", "/rendering_strategy/view_model/group"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_typename() -> Option<String> {
    Some("Group".into())
}
fn default_cursor_path() -> String {
    "/data/serpResponse/results/page_info/end_cursor".into()
}
fn default_entity_pointer() -> String {
    "/entityID".into()
}
fn default_hovercard_node_pointer() -> String {
    "/data/node/comet_hovercard_renderer/group".into()
}
fn default_hovercard_fields() -> BTreeMap<String, String> {
    [
        ("name", "/name"),
        ("url", "/url"),
        ("member_count", "/group_member_profiles/formatted_count_text"),
        ("privacy", "/privacy_info/title/text"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}
fn default_concurrency() -> usize {
    4
}

/// Load and validate a YAML job configuration.
///
/// # Errors
///
/// Returns [`HarvestError::Io`] when the file cannot be read,
/// [`HarvestError::Yaml`] when it does not parse and
/// [`HarvestError::Config`] when it parses but is unusable.
#[instrument(level = "info", skip_all, fields(path = %path.display()))]
pub async fn load_config(path: &Path) -> Result<JobConfig> {
    let raw = fs::read_to_string(path)
        .await
        .map_err(|e| HarvestError::io(path, e))?;
    let config = parse_config(&raw)?;
    info!(endpoint = %config.endpoint, search_doc = %config.search.doc_id, "Loaded job configuration");
    Ok(config)
}

/// Parse and validate configuration text.
pub fn parse_config(raw: &str) -> Result<JobConfig> {
    let mut config: JobConfig = serde_yaml::from_str(raw)?;
    config.validate()?;
    Ok(config)
}

impl JobConfig {
    /// Normalise templates and reject configurations that cannot work.
    fn validate(&mut self) -> Result<()> {
        let url = Url::parse(&self.endpoint)
            .map_err(|e| HarvestError::Config(format!("endpoint {:?}: {e}", self.endpoint)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(HarvestError::Config(format!(
                "endpoint must be http(s), got {}",
                url.scheme()
            )));
        }

        self.search.variables = resolve_template("search.variables", &self.search.variables)?;
        for (name, pointer) in [
            ("search.cursor_pointer", &self.search.cursor_pointer),
            ("search.text_pointer", &self.search.text_pointer),
            ("search.edges_pointer", &self.search.edges_pointer),
            ("search.cursor_path", &self.search.cursor_path),
        ] {
            check_pointer(name, pointer)?;
        }
        if self.search.node_pointers.is_empty() {
            return Err(HarvestError::Config("search.node_pointers must not be empty".into()));
        }
        for pointer in &self.search.node_pointers {
            check_pointer("search.node_pointers", pointer)?;
        }

        if let Some(enrich) = self.enrich.as_mut() {
            enrich.variables = resolve_template("enrich.variables", &enrich.variables)?;
            check_pointer("enrich.entity_pointer", &enrich.entity_pointer)?;
            check_pointer("enrich.node_pointer", &enrich.node_pointer)?;
            for (field, pointer) in &enrich.fields {
                check_pointer(&format!("enrich.fields.{field}"), pointer)?;
            }
            if enrich.concurrency == 0 {
                return Err(HarvestError::Config("enrich.concurrency must be at least 1".into()));
            }
        }

        if self.pacing.min_delay_ms > self.pacing.max_delay_ms {
            return Err(HarvestError::Config(
                "pacing.min_delay_ms is greater than pacing.max_delay_ms".into(),
            ));
        }
        if self.rotation.max_consecutive_failures == 0 {
            return Err(HarvestError::Config(
                "rotation.max_consecutive_failures must be at least 1".into(),
            ));
        }
        if self.paging.max_consecutive_empty == 0 {
            return Err(HarvestError::Config(
                "paging.max_consecutive_empty must be at least 1".into(),
            ));
        }
        debug!(?self.paging, ?self.pacing, "Validated configuration");
        Ok(())
    }
}

/// A single pointer string or a list of them.
fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

/// Accept a variables template as an object or as a JSON-encoded string.
fn resolve_template(name: &str, value: &Value) -> Result<Value> {
    let resolved = match value {
        Value::String(s) => serde_json::from_str::<Value>(s.trim())
            .map_err(|e| HarvestError::Config(format!("{name} is not valid JSON: {e}")))?,
        other => other.clone(),
    };
    if !resolved.is_object() {
        return Err(HarvestError::Config(format!("{name} must be a JSON object")));
    }
    Ok(resolved)
}

fn check_pointer(name: &str, pointer: &str) -> Result<()> {
    if pointer.is_empty() || pointer.starts_with('/') {
        Ok(())
    } else {
        Err(HarvestError::Config(format!(
            "{name} must be a JSON pointer starting with '/', got {pointer:?}"
        )))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const MINIMAL: &str = r#"
endpoint: https://example.com/api/graphql/
search:
  doc_id: "111"
  variables: '{"args":{"text":""},"count":10,"cursor":null}'
enrich:
  doc_id: "222"
  variables:
    entityID: ""
    scale: "1"
"#;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config = parse_config(MINIMAL).unwrap();
        assert_eq!(config.search.cursor_pointer, "/cursor");
        assert_eq!(config.search.typename.as_deref(), Some("Group"));
        assert!(config.search.variables.is_object());
        assert_eq!(config.paging.max_consecutive_empty, 1);
        assert_eq!(config.rotation.rate_limit_statuses, vec![429, 403, 503]);
        assert_eq!(config.rotation.max_consecutive_failures, 3);
        assert_eq!(config.search.node_pointers.len(), 3);
        assert_eq!(config.search.node_pointers[0], "/node");

        let enrich = config.enrich.unwrap();
        assert_eq!(enrich.entity_pointer, "/entityID");
        assert_eq!(enrich.fields.get("privacy").unwrap(), "/privacy_info/title/text");
        assert_eq!(enrich.concurrency, 4);
    }

    #[test]
    fn test_rejects_non_http_endpoint() {
        let raw = MINIMAL.replace("https://example.com/api/graphql/", "ftp://example.com/");
        assert!(matches!(parse_config(&raw), Err(HarvestError::Config(_))));
    }

    #[test]
    fn test_rejects_bad_variables_string() {
        let raw = MINIMAL.replace(r#"'{"args":{"text":""},"count":10,"cursor":null}'"#, "'{not json'");
        let err = parse_config(&raw).unwrap_err();
        assert!(err.to_string().contains("search.variables"));
    }

    #[test]
    fn test_rejects_relative_pointer() {
        let raw = format!("{MINIMAL}  entity_pointer: entityID\n");
        assert!(matches!(parse_config(&raw), Err(HarvestError::Config(_))));
    }

    #[test]
    fn test_node_pointers_accept_single_string_or_list() {
        let single = MINIMAL.replace(
            "  doc_id: \"111\"\n",
            "  doc_id: \"111\"\n  node_pointer: /result/group\n",
        );
        let config = parse_config(&single).unwrap();
        assert_eq!(config.search.node_pointers, vec!["/result/group".to_string()]);

        let list = MINIMAL.replace(
            "  doc_id: \"111\"\n",
            "  doc_id: \"111\"\n  node_pointers: [/a, /b]\n",
        );
        assert_eq!(parse_config(&list).unwrap().search.node_pointers, vec!["/a", "/b"]);

        let empty = MINIMAL.replace("  doc_id: \"111\"\n", "  doc_id: \"111\"\n  node_pointers: []\n");
        assert!(matches!(parse_config(&empty), Err(HarvestError::Config(_))));

        let relative = MINIMAL.replace("  doc_id: \"111\"\n", "  doc_id: \"111\"\n  node_pointers: [node]\n");
        assert!(matches!(parse_config(&relative), Err(HarvestError::Config(_))));
    }

    #[test]
    fn test_rejects_inverted_delays() {
        let raw = format!("{MINIMAL}pacing:\n  min_delay_ms: 10\n  max_delay_ms: 5\n");
        assert!(matches!(parse_config(&raw), Err(HarvestError::Config(_))));
    }

    #[tokio::test]
    async fn test_load_config_missing_file() {
        let err = load_config(Path::new("/definitely/not/here.yaml")).await.unwrap_err();
        assert!(matches!(err, HarvestError::Io { .. }));
    }
}
