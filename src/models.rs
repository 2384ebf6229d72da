//! Data models for harvested group records and search terms.
//!
//! - [`GroupRecord`]: one line of the JSON-Lines output
//! - [`SearchTerm`]: a term to paginate, optionally read from a search URL
//! - [`Snippet`]: the `"Public · 1.2K members · 10+ posts a day"` summary line

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

/// A group record as written to the JSON-Lines files.
///
/// Fields the enrichment pass adds beyond the named ones land in `extra`
/// and are written back out unchanged.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct GroupRecord {
    /// Identifier used for deduplication.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// `"City, ST"` derived from the search term.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_term: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub privacy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_count: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub posts_per_day: Option<String>,
    /// When the search pass first wrote the record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scraped_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl GroupRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            url: None,
            city_state: None,
            search_term: None,
            privacy: None,
            member_count: None,
            posts_per_day: None,
            scraped_at: None,
            extra: Map::new(),
        }
    }

    /// Whether the record carries a non-null value for `field`.
    pub fn has_field(&self, field: &str) -> bool {
        match field {
            "id" => true,
            "name" => self.name.is_some(),
            "url" => self.url.is_some(),
            "city_state" => self.city_state.is_some(),
            "search_term" => self.search_term.is_some(),
            "privacy" => self.privacy.is_some(),
            "member_count" => self.member_count.is_some(),
            "posts_per_day" => self.posts_per_day.is_some(),
            "scraped_at" => self.scraped_at.is_some(),
            other => self.extra.get(other).is_some_and(|v| !v.is_null()),
        }
    }

    /// Set `field` from a JSON value. Null values are ignored so enrichment
    /// never erases data the search pass found.
    ///
    /// Named fields keep their string form: numbers are rendered as text and
    /// objects or arrays as compact JSON, so a name never shows up twice in
    /// the serialised line.
    pub fn merge_field(&mut self, field: &str, value: Value) {
        if value.is_null() {
            return;
        }
        let slot = match field {
            "id" => return,
            "scraped_at" => {
                if let Some(at) = value.as_str().and_then(|s| s.parse::<DateTime<Utc>>().ok()) {
                    self.scraped_at = Some(at);
                }
                return;
            }
            "name" => &mut self.name,
            "url" => &mut self.url,
            "city_state" => &mut self.city_state,
            "search_term" => &mut self.search_term,
            "privacy" => &mut self.privacy,
            "member_count" => &mut self.member_count,
            "posts_per_day" => &mut self.posts_per_day,
            other => {
                self.extra.insert(other.to_string(), value);
                return;
            }
        };
        *slot = Some(match value {
            Value::String(s) => s,
            other => other.to_string(),
        });
    }
}

/// A search term to paginate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SearchTerm(pub String);

impl SearchTerm {
    /// Parse one line of a terms file.
    ///
    /// Blank lines and `#` comments yield `None`. Lines that look like URLs
    /// contribute their decoded `q` parameter. Other lines are used as is
    /// unless they carry `%` escapes, in which case they are form-decoded
    /// (`+` included).
    ///
    /// # Examples
    ///
    /// ```ignore
    /// assert_eq!(SearchTerm::parse_line("C++ meetup").unwrap().as_str(), "C++ meetup");
    /// assert_eq!(SearchTerm::parse_line("El+Paso%2C+TX").unwrap().as_str(), "El Paso, TX");
    /// assert!(SearchTerm::parse_line("# comment").is_none());
    /// ```
    pub fn parse_line(line: &str) -> Option<SearchTerm> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        if line.starts_with("http://") || line.starts_with("https://") {
            let url = Url::parse(line).ok()?;
            let term = url
                .query_pairs()
                .find(|(k, _)| k == "q")
                .map(|(_, v)| v.trim().to_string())?;
            return (!term.is_empty()).then_some(SearchTerm(term));
        }
        if !line.contains('%') {
            return Some(SearchTerm(line.to_string()));
        }
        let decoded = urlencoding::decode(&line.replace('+', " "))
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| line.to_string());
        Some(SearchTerm(decoded.trim().to_string()))
    }

    /// `"Dallas, TX, USA"` -> `"Dallas, TX"`; terms without a comma are kept whole.
    pub fn city_state(&self) -> String {
        let parts: Vec<&str> = self.0.split(',').map(str::trim).collect();
        if parts.len() >= 2 {
            format!("{}, {}", parts[0], parts[1])
        } else {
            self.0.trim().to_string()
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SearchTerm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pieces of a search-result summary line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snippet {
    pub privacy: Option<String>,
    pub member_count: Option<String>,
    pub posts_per_day: Option<String>,
}

const PRIVACY_WORDS: [&str; 5] = ["public", "private", "secret", "visible", "hidden"];

impl Snippet {
    /// Parse a `"Public · 1.2K members · 10+ posts a day"` style line.
    ///
    /// Segments are recognised by content rather than position, so shorter
    /// lines such as `"Private · 340 members"` still yield what they carry.
    ///
    /// # Returns
    ///
    /// `None` when no segment is recognised.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let s = Snippet::parse("Private · 340 members").unwrap();
    /// assert_eq!(s.member_count.as_deref(), Some("340 members"));
    /// assert!(s.posts_per_day.is_none());
    /// ```
    pub fn parse(snippet: &str) -> Option<Snippet> {
        let mut parsed = Snippet::default();
        for part in snippet.split('·').map(str::trim).filter(|p| !p.is_empty()) {
            let lower = part.to_lowercase();
            if lower.contains("member") {
                parsed.member_count.get_or_insert_with(|| part.to_string());
            } else if lower.contains("post") {
                parsed.posts_per_day.get_or_insert_with(|| part.to_string());
            } else if PRIVACY_WORDS.iter().any(|w| lower.contains(w)) {
                parsed.privacy.get_or_insert_with(|| part.to_string());
            }
        }
        (parsed != Snippet::default()).then_some(parsed)
    }
}
