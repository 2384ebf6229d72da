//! Resumable search pagination with id deduplication.
//!
//! For every search term the paginator walks the result cursor page by page,
//! appends records whose id has not been seen, and saves the job state before
//! asking for the next page. Re-running the same job therefore continues
//! where the last run stopped and never writes an id twice.
//!
//! # Stopping Rules
//!
//! A term is finished when the response carries no next cursor, when
//! `max_consecutive_empty` pages in a row bring nothing new, or when it has
//! used `max_pages_per_term` pages. The whole job stops at a page boundary on
//! Ctrl-C, on the request budget, on rate-limit exhaustion and on GraphQL
//! errors. Any other failure is recorded against the term and the job moves on.

use crate::api::{PageSource, QueryRequest};
use crate::config::{JobConfig, SearchQuery};
use crate::error::{HarvestError, Result};
use crate::models::{GroupRecord, SearchTerm, Snippet};
use crate::outputs::jsonl::{append_records, read_ids};
use crate::state::{ScrapeState, TermStatus};
use crate::utils::{random_delay, set_pointer, value_as_string};
use chrono::Utc;
use itertools::Itertools;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

/// Why a run ended before visiting every term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Interrupted,
    RequestBudget,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub terms_completed: usize,
    pub terms_failed: usize,
    pub terms_skipped: usize,
    pub new_records: u64,
    pub requests: u64,
    pub stopped: Option<StopReason>,
}

enum TermOutcome {
    Finished(TermStatus),
    Stopped(StopReason),
}

/// Flag flipped by the first Ctrl-C; both passes check it between requests.
pub fn stop_on_ctrl_c() -> Arc<AtomicBool> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; stopping after the current page");
            flag.store(true, Ordering::SeqCst);
        }
    });
    stop
}

/// Read search terms, one per line, dropping comments and repeats.
#[instrument(level = "info", skip_all, fields(path = %path.display()))]
pub async fn load_terms(path: &Path) -> Result<Vec<SearchTerm>> {
    let raw = fs::read_to_string(path)
        .await
        .map_err(|e| HarvestError::io(path, e))?;
    let terms: Vec<SearchTerm> = raw.lines().filter_map(SearchTerm::parse_line).unique().collect();
    if terms.is_empty() {
        return Err(HarvestError::Config(format!(
            "no search terms in {}",
            path.display()
        )));
    }
    info!(count = terms.len(), "Loaded search terms");
    Ok(terms)
}

/// Fill the search variables template with `term` and `cursor`.
///
/// # Arguments
///
/// * `search` - Query section of the job file
/// * `term` - Text written at `text_pointer`
/// * `cursor` - Written at `cursor_pointer`; `None` writes `null` (first page)
///
/// # Errors
///
/// [`HarvestError::Config`] if a pointer cannot be written into the template.
pub fn build_search_query(search: &SearchQuery, term: &SearchTerm, cursor: Option<&str>) -> Result<QueryRequest> {
    let mut variables = search.variables.clone();
    set_pointer(&mut variables, &search.text_pointer, Value::String(term.0.clone()))?;
    let cursor = cursor.map_or(Value::Null, |c| Value::String(c.to_string()));
    set_pointer(&mut variables, &search.cursor_pointer, cursor)?;
    Ok(QueryRequest {
        doc_id: search.doc_id.clone(),
        friendly_name: search.friendly_name.clone(),
        variables,
    })
}

/// Pull group records and the next cursor out of one search response.
pub fn extract_page(search: &SearchQuery, response: &Value, term: &SearchTerm) -> (Vec<GroupRecord>, Option<String>) {
    let city_state = term.city_state();
    let records = response
        .pointer(&search.edges_pointer)
        .and_then(Value::as_array)
        .map(|edges| {
            edges
                .iter()
                .filter_map(|edge| extract_record(search, edge, term, &city_state))
                .collect()
        })
        .unwrap_or_default();

    let next = response
        .pointer(&search.cursor_path)
        .and_then(Value::as_str)
        .filter(|c| !c.is_empty())
        .map(str::to_string);
    (records, next)
}

fn extract_record(search: &SearchQuery, edge: &Value, term: &SearchTerm, city_state: &str) -> Option<GroupRecord> {
    let (node, id) = search.node_pointers.iter().find_map(|pointer| {
        let node = edge.pointer(pointer)?;
        if let (Some(expected), Some(actual)) = (
            search.typename.as_deref(),
            node.get("__typename").and_then(Value::as_str),
        ) {
            if expected != actual {
                return None;
            }
        }
        Some((node, value_as_string(node.get("id"))?))
    })?;

    let mut record = GroupRecord::new(id);
    record.name = value_as_string(node.get("name"));
    record.url = value_as_string(node.get("url")).or_else(|| value_as_string(node.get("profile_url")));
    record.city_state = Some(city_state.to_string());
    record.search_term = Some(term.0.clone());
    record.scraped_at = Some(Utc::now());

    if let Some(pointer) = &search.snippet_pointer {
        if let Some(snippet) = edge.pointer(pointer).and_then(Value::as_str).and_then(Snippet::parse) {
            record.privacy = snippet.privacy;
            record.member_count = snippet.member_count;
            record.posts_per_day = snippet.posts_per_day;
        }
    }
    Some(record)
}

/// Drives the search pass over a [`PageSource`].
pub struct Paginator<'a, S> {
    source: &'a S,
    config: &'a JobConfig,
    state: ScrapeState,
    stop: Arc<AtomicBool>,
    requests: u64,
}

impl<'a, S: PageSource> Paginator<'a, S> {
    pub fn new(source: &'a S, config: &'a JobConfig, state: ScrapeState, stop: Arc<AtomicBool>) -> Self {
        Self {
            source,
            config,
            state,
            stop,
            requests: 0,
        }
    }

    /// Load saved state and fold in the ids already in the output file.
    pub async fn open(source: &'a S, config: &'a JobConfig, stop: Arc<AtomicBool>) -> Result<Self> {
        let mut state = ScrapeState::load(&config.paths.state).await;
        let output_ids = read_ids(&config.paths.output).await?;
        if state.reconcile(output_ids) > 0 {
            state.save(&config.paths.state).await?;
        }
        Ok(Self::new(source, config, state, stop))
    }

    pub fn state(&self) -> &ScrapeState {
        &self.state
    }

    /// Run every term in order.
    ///
    /// # Errors
    ///
    /// Fatal errors ([`HarvestError::is_fatal`]) end the run after the state
    /// has been saved; I/O errors on the output or state files end it too.
    #[instrument(level = "info", skip_all, fields(terms = terms.len()))]
    pub async fn run(&mut self, terms: &[SearchTerm]) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        let max_retries = self.config.paging.max_term_retries;

        for term in terms {
            let retry = self
                .state
                .term(term.as_str())
                .is_none_or(|p| p.should_retry(max_retries));
            if !retry {
                debug!(%term, "Skipping finished term");
                summary.terms_skipped += 1;
                continue;
            }

            let before = self.state.seen_ids.len();
            let outcome = self.scrape_term(term).await;
            summary.new_records += (self.state.seen_ids.len() - before) as u64;
            summary.requests = self.requests;

            match outcome {
                Ok(TermOutcome::Finished(status)) => {
                    info!(%term, ?status, "Term finished");
                    summary.terms_completed += 1;
                }
                Ok(TermOutcome::Stopped(reason)) => {
                    warn!(%term, ?reason, "Stopping run");
                    summary.stopped = Some(reason);
                    break;
                }
                Err(e) if e.is_fatal() => {
                    error!(%term, error = %e, "Fatal error; state saved, job halted");
                    self.save().await?;
                    return Err(e);
                }
                Err(e @ HarvestError::Io { .. }) => return Err(e),
                Err(e) => {
                    let status = TermStatus::for_error(&e);
                    warn!(%term, ?status, error = %e, "Term failed; moving on");
                    self.state
                        .term_mut(term.as_str())
                        .record_failure(status, &e.to_string(), max_retries);
                    self.save().await?;
                    summary.terms_failed += 1;
                }
            }
        }

        info!(
            completed = summary.terms_completed,
            failed = summary.terms_failed,
            skipped = summary.terms_skipped,
            new_records = summary.new_records,
            requests = summary.requests,
            "Search pass done"
        );
        Ok(summary)
    }

    async fn scrape_term(&mut self, term: &SearchTerm) -> Result<TermOutcome> {
        let config = self.config;
        let paging = &config.paging;
        let mut empty_run = 0u32;

        let progress = self.state.term_mut(term.as_str());
        progress.touch(TermStatus::Processing);
        let mut cursor = progress.cursor.clone();
        if cursor.is_some() {
            info!(%term, pages = progress.pages, "Resuming term from saved cursor");
        }

        loop {
            if self.stop.load(Ordering::SeqCst) {
                self.save().await?;
                return Ok(TermOutcome::Stopped(StopReason::Interrupted));
            }
            if paging.max_requests.is_some_and(|max| self.requests >= max) {
                self.save().await?;
                return Ok(TermOutcome::Stopped(StopReason::RequestBudget));
            }
            let pages = self.state.term_mut(term.as_str()).pages;
            if paging.max_pages_per_term.is_some_and(|max| pages >= max) {
                return self.finish(term, TermStatus::Completed).await;
            }

            if self.requests > 0 {
                sleep(random_delay(config.pacing.min_delay_ms, config.pacing.max_delay_ms)).await;
            }
            let query = build_search_query(&config.search, term, cursor.as_deref())?;
            self.requests += 1;
            let response = self.source.post(&query).await?;

            let (records, next) = extract_page(&config.search, &response, term);
            let found = records.len();
            let fresh: Vec<GroupRecord> = records
                .into_iter()
                .filter(|r| self.state.seen_ids.insert(r.id.clone()))
                .collect();
            append_records(&config.paths.output, &fresh).await?;

            self.state.last_cursor = next.clone();
            let progress = self.state.term_mut(term.as_str());
            progress.pages += 1;
            progress.new_records += fresh.len() as u64;
            progress.cursor = next.clone();
            progress.touch(TermStatus::Processing);
            let page = progress.pages;
            self.save().await?;

            info!(%term, page, found, new = fresh.len(), total = self.state.seen_ids.len(), "Page processed");

            if fresh.is_empty() {
                empty_run += 1;
            } else {
                empty_run = 0;
            }

            match next {
                None => return self.finish(term, TermStatus::CompletedNoCursor).await,
                Some(_) if empty_run >= paging.max_consecutive_empty => {
                    return self.finish(term, TermStatus::CompletedEmpty).await;
                }
                Some(c) => cursor = Some(c),
            }
        }
    }

    async fn finish(&mut self, term: &SearchTerm, status: TermStatus) -> Result<TermOutcome> {
        self.state.term_mut(term.as_str()).touch(status);
        self.save().await?;
        Ok(TermOutcome::Finished(status))
    }

    async fn save(&self) -> Result<()> {
        self.state.save(&self.config.paths.state).await
    }
}
