//! Output handling for the JSON-Lines record files.
//!
//! # Submodules
//!
//! - [`jsonl`]: append, read and deduplicate JSON-Lines files
//!
//! # Output Structure
//!
//! ```text
//! output/
//! ├── groups.jsonl            # search pass, one record per line
//! ├── groups_state.json       # cursor + seen ids + per-term progress
//! ├── groups_enriched.jsonl   # hovercard enrichment pass
//! └── accounts_status.json    # credential ledger
//! ```

pub mod jsonl;
