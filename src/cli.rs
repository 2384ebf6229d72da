//! Command-line interface definitions.
//!
//! Every path can come from a flag or from the environment, so a job can be
//! driven from a shell profile or a systemd unit without repeating flags.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Resumable harvester for paginated GraphQL group search.
///
/// # Examples
///
/// ```sh
/// # Search pass over a terms file, rotating through a directory of credentials
/// group_harvest search -c job.yaml --credentials cookies/ --terms cities.txt
///
/// # Hovercard enrichment of what the search pass found
/// group_harvest enrich -c job.yaml --credentials cookies/
///
/// # Report and cleanup
/// group_harvest stats -c job.yaml --top 20
/// group_harvest dedupe -c job.yaml
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to the YAML job configuration
    #[arg(short, long, env = "HARVEST_CONFIG", global = true, default_value = "job.yaml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Paginate every search term, appending new records to the output file
    Search {
        #[command(flatten)]
        session: SessionArgs,

        /// File with one search term or search URL per line
        #[arg(short, long, env = "HARVEST_TERMS")]
        terms: PathBuf,

        /// Stop after this many requests (overrides paging.max_requests)
        #[arg(long)]
        max_requests: Option<u64>,
    },
    /// Fetch hovercard details for every record not yet enriched
    Enrich {
        #[command(flatten)]
        session: SessionArgs,
    },
    /// Print a report over the output file
    Stats {
        /// Report on this file instead of the configured output
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Number of locations to list
        #[arg(long, default_value_t = 20)]
        top: usize,
    },
    /// Rewrite the output file keeping the first line per id
    Dedupe {
        /// Deduplicate this file instead of the configured output
        #[arg(short, long)]
        input: Option<PathBuf>,
    },
    /// Issue one search request per credential and report which still work
    Verify {
        #[command(flatten)]
        session: SessionArgs,

        /// Term used for the probe request
        #[arg(long, default_value = "test")]
        term: String,
    },
}

/// Where credentials and proxies come from.
#[derive(Args, Debug)]
pub struct SessionArgs {
    /// Credentials file or directory of `*.json` credential dumps
    #[arg(long, env = "HARVEST_CREDENTIALS")]
    pub credentials: PathBuf,

    /// Optional proxy list, one URL per line, assigned round-robin
    #[arg(long, env = "HARVEST_PROXIES")]
    pub proxies: Option<PathBuf>,
}
