//! Hovercard enrichment pass.
//!
//! Reads the search output, asks the hovercard query about every record not
//! yet enriched and appends the merged record to the enriched file. The set
//! of ids already in that file is the only progress marker, so an interrupted
//! pass simply runs again.

use crate::api::{PageSource, QueryRequest};
use crate::config::{EnrichQuery, JobConfig};
use crate::error::{HarvestError, Result};
use crate::models::GroupRecord;
use crate::outputs::jsonl::{append_records, read_ids, read_records};
use crate::utils::{random_delay, set_pointer};
use futures::future;
use futures::stream::{self, StreamExt};
use itertools::Itertools;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnrichSummary {
    pub candidates: usize,
    pub already_done: usize,
    pub enriched: usize,
    pub failed: usize,
    pub interrupted: bool,
}

/// Fill the hovercard variables template with the record id.
pub fn build_hovercard_query(enrich: &EnrichQuery, id: &str) -> Result<QueryRequest> {
    let mut variables = enrich.variables.clone();
    set_pointer(&mut variables, &enrich.entity_pointer, Value::String(id.to_string()))?;
    Ok(QueryRequest {
        doc_id: enrich.doc_id.clone(),
        friendly_name: enrich.friendly_name.clone(),
        variables,
    })
}

/// Merge the configured hovercard fields into `record`.
///
/// Returns the number of fields that carried a value. A response without the
/// hovercard node is an [`HarvestError::InvalidResponse`] for this record
/// only.
pub fn apply_hovercard(enrich: &EnrichQuery, record: &mut GroupRecord, response: &Value) -> Result<usize> {
    let node = response
        .pointer(&enrich.node_pointer)
        .filter(|n| !n.is_null())
        .ok_or_else(|| HarvestError::InvalidResponse {
            status: 200,
            preview: format!("hovercard for {} has no node", record.id),
        })?;

    let mut merged = 0;
    for (field, pointer) in &enrich.fields {
        if let Some(value) = node.pointer(pointer).filter(|v| !v.is_null()) {
            record.merge_field(field, value.clone());
            merged += 1;
        }
    }
    Ok(merged)
}

/// Run the enrichment pass over `config.paths.output`.
///
/// # Errors
///
/// Fails when the config has no `enrich` section or the files cannot be
/// read or written. A fatal request error ([`HarvestError::is_fatal`]) stops
/// the pass at once; records already appended stay done.
#[instrument(level = "info", skip_all)]
pub async fn enrich_records<S: PageSource>(
    source: &S,
    config: &JobConfig,
    stop: Arc<AtomicBool>,
) -> Result<EnrichSummary> {
    let enrich = config
        .enrich
        .as_ref()
        .ok_or_else(|| HarvestError::Config("no enrich section in the job config".into()))?;

    let records = read_records(&config.paths.output).await?;
    let done = read_ids(&config.paths.enriched).await?;

    let candidates: Vec<GroupRecord> = records
        .into_iter()
        .filter(|r| enrich.require_field.as_deref().is_none_or(|f| r.has_field(f)))
        .unique_by(|r| r.id.clone())
        .collect();
    let (already, pending): (Vec<GroupRecord>, Vec<GroupRecord>) =
        candidates.into_iter().partition(|r| done.contains(&r.id));

    let mut summary = EnrichSummary {
        candidates: already.len() + pending.len(),
        already_done: already.len(),
        ..EnrichSummary::default()
    };
    info!(
        candidates = summary.candidates,
        already_done = summary.already_done,
        concurrency = enrich.concurrency,
        "Starting enrichment"
    );

    let pacing = &config.pacing;
    let mut results = stream::iter(pending)
        .take_while(|_| future::ready(!stop.load(Ordering::SeqCst)))
        .map(|mut record| async move {
            sleep(random_delay(pacing.min_delay_ms, pacing.max_delay_ms)).await;
            let outcome = match build_hovercard_query(enrich, &record.id) {
                Ok(query) => match source.post(&query).await {
                    Ok(response) => apply_hovercard(enrich, &mut record, &response),
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };
            (record, outcome)
        })
        .buffer_unordered(enrich.concurrency);

    while let Some((record, outcome)) = results.next().await {
        match outcome {
            Ok(fields) => {
                append_records(&config.paths.enriched, std::slice::from_ref(&record)).await?;
                summary.enriched += 1;
                debug!(id = %record.id, fields, "Enriched record");
                if summary.enriched % 50 == 0 {
                    info!(enriched = summary.enriched, failed = summary.failed, "Enrichment progress");
                }
            }
            Err(e) if e.is_fatal() => {
                error!(enriched = summary.enriched, error = %e, "Fatal error; stopping enrichment");
                return Err(e);
            }
            Err(e) => {
                warn!(id = %record.id, error = %e, "Enrichment failed; will retry next run");
                summary.failed += 1;
            }
        }
    }
    drop(results);

    summary.interrupted = stop.load(Ordering::SeqCst);
    info!(
        enriched = summary.enriched,
        failed = summary.failed,
        interrupted = summary.interrupted,
        "Enrichment pass done"
    );
    Ok(summary)
}
