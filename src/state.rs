//! Resumable job state.
//!
//! The state file holds the last cursor seen, every id already written and
//! the progress of each search term. It is rewritten atomically after every
//! page, so a crash costs at most the page in flight; ids that reached the
//! output file before the crash are picked up again by [`ScrapeState::reconcile`].

use crate::error::{HarvestError, Result};
use crate::utils::{read_json_optional, write_json_atomic};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TermStatus {
    #[default]
    New,
    Processing,
    Completed,
    CompletedNoCursor,
    CompletedEmpty,
    Failed,
    RateLimited,
    NetworkError,
    JsonError,
    PermanentlyFailed,
    Blocked,
}

impl TermStatus {
    pub fn is_completed(self) -> bool {
        matches!(
            self,
            TermStatus::Completed | TermStatus::CompletedNoCursor | TermStatus::CompletedEmpty
        )
    }

    pub fn is_permanent_failure(self) -> bool {
        matches!(self, TermStatus::PermanentlyFailed | TermStatus::Blocked)
    }

    pub fn is_temporary_failure(self) -> bool {
        matches!(
            self,
            TermStatus::Failed
                | TermStatus::RateLimited
                | TermStatus::NetworkError
                | TermStatus::JsonError
        )
    }

    /// Status recorded against a term whose page failed with `err`.
    pub fn for_error(err: &HarvestError) -> TermStatus {
        match err {
            HarvestError::Http(_) => TermStatus::NetworkError,
            HarvestError::Json(_) => TermStatus::JsonError,
            HarvestError::RateLimited { .. } | HarvestError::RotationExhausted { .. } => {
                TermStatus::RateLimited
            }
            HarvestError::InvalidResponse { status: 401 | 403, .. } => TermStatus::Blocked,
            HarvestError::InvalidResponse { .. } => TermStatus::JsonError,
            _ => TermStatus::Failed,
        }
    }
}

/// Progress of one search term.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TermProgress {
    pub cursor: Option<String>,
    pub pages: u32,
    pub new_records: u64,
    pub status: TermStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl TermProgress {
    /// Whether the paginator should (re)visit this term.
    pub fn should_retry(&self, max_retries: u32) -> bool {
        if self.status.is_completed() || self.status.is_permanent_failure() {
            return false;
        }
        if self.status.is_temporary_failure() {
            return self.retry_count < max_retries;
        }
        true
    }

    /// Record a failed page. Temporary failures count toward `max_retries`
    /// and turn permanent once it is reached.
    pub fn record_failure(&mut self, status: TermStatus, error: &str, max_retries: u32) {
        self.last_error = Some(error.to_string());
        self.last_updated = Some(Utc::now());
        if status.is_temporary_failure() {
            self.retry_count += 1;
            self.status = if self.retry_count >= max_retries {
                TermStatus::PermanentlyFailed
            } else {
                status
            };
        } else {
            self.status = status;
        }
    }

    pub fn touch(&mut self, status: TermStatus) {
        self.status = status;
        self.last_updated = Some(Utc::now());
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ScrapeState {
    pub last_cursor: Option<String>,
    pub seen_ids: BTreeSet<String>,
    pub terms: BTreeMap<String, TermProgress>,
}

impl ScrapeState {
    /// Load state from `path`.
    ///
    /// Missing or blank files start fresh; so does a corrupt one, with a warning.
    #[instrument(level = "info", skip_all, fields(path = %path.display()))]
    pub async fn load(path: &Path) -> ScrapeState {
        match read_json_optional::<ScrapeState>(path).await {
            Ok(Some(state)) => {
                info!(
                    seen = state.seen_ids.len(),
                    terms = state.terms.len(),
                    "Resuming from saved state"
                );
                state
            }
            Ok(None) => ScrapeState::default(),
            Err(e) => {
                warn!(error = %e, "Corrupt state file; starting fresh");
                ScrapeState::default()
            }
        }
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self).await
    }

    /// Add ids already present in the output file; returns how many were missing.
    pub fn reconcile(&mut self, output_ids: BTreeSet<String>) -> usize {
        let before = self.seen_ids.len();
        self.seen_ids.extend(output_ids);
        let added = self.seen_ids.len() - before;
        if added > 0 {
            warn!(added, "Output held ids missing from state; reconciled");
        }
        added
    }

    pub fn term_mut(&mut self, term: &str) -> &mut TermProgress {
        self.terms.entry(term.to_string()).or_default()
    }

    pub fn term(&self, term: &str) -> Option<&TermProgress> {
        self.terms.get(term)
    }
}
