//! # Group Harvest
//!
//! A resumable harvester for paginated GraphQL search endpoints. It walks a
//! list of search terms page by page, writes every group it finds exactly once
//! to a JSON-Lines file, and survives crashes, interrupts and rate limiting
//! without losing or duplicating work.
//!
//! ## Features
//!
//! - Request shape (endpoint, document ids, variables templates, response
//!   pointers) comes entirely from a YAML job file
//! - Several captured credentials, rotated in a fixed order when one is
//!   throttled, with exponential backoff once all of them are
//! - State saved atomically after every page; re-running resumes from the
//!   stored cursor of each term
//! - Optional hovercard enrichment pass with bounded concurrency
//! - `stats`, `dedupe` and `verify` helpers for the collected data and sessions
//!
//! ## Usage
//!
//! ```sh
//! group_harvest -c job.yaml search --credentials cookies/ --terms cities.txt
//! group_harvest -c job.yaml enrich --credentials cookies/
//! ```
//!
//! ## Architecture
//!
//! 1. **Config**: load and validate the job file
//! 2. **Session**: load credentials and proxies, build one client per slot
//! 3. **Search**: [`paginator::Paginator`] drives a [`api::RotatingClient`]
//! 4. **Enrich**: [`enricher::enrich_records`] reuses the same client
//! 5. **Report**: [`stats::build_report`] over the output file

use clap::Parser;
use std::error::Error;
use std::path::Path;
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod api;
mod cli;
mod config;
mod enricher;
mod error;
mod models;
mod outputs;
mod paginator;
mod rotation;
mod session;
mod state;
mod stats;
mod utils;

use api::{ProbeOutcome, RotatingClient, probe_credentials};
use cli::{Cli, Command, SessionArgs};
use config::{JobConfig, load_config};
use models::SearchTerm;
use outputs::jsonl;
use paginator::{Paginator, build_search_query, load_terms, stop_on_ctrl_c};
use session::{Credential, assign_proxies, load_credentials, load_proxies};
use utils::ensure_writable_dir;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = std::time::Instant::now();
    let args = Cli::parse();
    debug!(?args, "Parsed CLI arguments");

    let config = load_config(&args.config).await?;

    let outcome = match args.command {
        Command::Search { session, terms, max_requests } => {
            run_search(config, &session, &terms, max_requests).await
        }
        Command::Enrich { session } => run_enrich(&config, &session).await,
        Command::Stats { input, top } => {
            let path = input.unwrap_or_else(|| config.paths.output.clone());
            let records = jsonl::read_records(&path).await?;
            print!("{}", stats::build_report(&records, top));
            Ok(())
        }
        Command::Dedupe { input } => {
            let path = input.unwrap_or_else(|| config.paths.output.clone());
            let (kept, dropped) = jsonl::dedupe_file(&path).await?;
            println!("kept {kept}, dropped {dropped}");
            Ok(())
        }
        Command::Verify { session, term } => run_verify(&config, &session, &term).await,
    };

    let elapsed = start_time.elapsed();
    match &outcome {
        Ok(()) => info!(?elapsed, secs = elapsed.as_secs(), "Execution complete"),
        Err(e) => error!(?elapsed, error = %e, "Execution failed"),
    }
    outcome
}

async fn load_session(config: &JobConfig, args: &SessionArgs) -> Result<Vec<Credential>, Box<dyn Error>> {
    let mut credentials = load_credentials(&args.credentials, config.required_cookie.as_deref()).await?;
    if let Some(path) = &args.proxies {
        let proxies = load_proxies(path).await?;
        assign_proxies(&mut credentials, &proxies);
    }
    Ok(credentials)
}

#[instrument(level = "info", skip_all, fields(terms = %terms.display()))]
async fn run_search(
    mut config: JobConfig,
    session: &SessionArgs,
    terms: &Path,
    max_requests: Option<u64>,
) -> Result<(), Box<dyn Error>> {
    if max_requests.is_some() {
        config.paging.max_requests = max_requests;
    }
    for path in [&config.paths.output, &config.paths.state] {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            ensure_writable_dir(dir).await?;
        }
    }

    let terms = load_terms(terms).await?;
    let credentials = load_session(&config, session).await?;
    let client = RotatingClient::from_credentials(&config, credentials).await?;
    let stop = stop_on_ctrl_c();

    let mut paginator = Paginator::open(&client, &config, stop).await?;
    let result = paginator.run(&terms).await;
    client.release().await;

    let summary = result?;
    info!(
        new_records = summary.new_records,
        total_ids = paginator.state().seen_ids.len(),
        requests = client.requests(),
        stopped = ?summary.stopped,
        "Search finished"
    );
    Ok(())
}

#[instrument(level = "info", skip_all)]
async fn run_enrich(config: &JobConfig, session: &SessionArgs) -> Result<(), Box<dyn Error>> {
    if let Some(dir) = config.paths.enriched.parent().filter(|d| !d.as_os_str().is_empty()) {
        ensure_writable_dir(dir).await?;
    }
    let credentials = load_session(config, session).await?;
    let client = RotatingClient::from_credentials(config, credentials).await?;

    let result = enricher::enrich_records(&client, config, stop_on_ctrl_c()).await;
    client.release().await;

    let summary = result?;
    if summary.failed > 0 {
        warn!(failed = summary.failed, "Some records were not enriched; run again to retry them");
    }
    Ok(())
}

#[instrument(level = "info", skip_all, fields(term = %term))]
async fn run_verify(config: &JobConfig, session: &SessionArgs, term: &str) -> Result<(), Box<dyn Error>> {
    let credentials = load_session(config, session).await?;
    let query = build_search_query(&config.search, &SearchTerm(term.to_string()), None)?;

    let results = probe_credentials(config, credentials, &query).await;
    let working = results.iter().filter(|(_, o)| *o == ProbeOutcome::Ok).count();
    for (name, outcome) in &results {
        match outcome {
            ProbeOutcome::Ok => println!("{name}: ok"),
            ProbeOutcome::RateLimited => println!("{name}: rate limited"),
            ProbeOutcome::Failed(reason) => println!("{name}: error ({reason})"),
        }
    }
    info!(working, total = results.len(), "Credential check done");
    Ok(())
}
