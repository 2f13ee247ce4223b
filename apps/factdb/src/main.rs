//! # factdb
//!
//! The main binary for the factdb fact database.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │               apps/factdb (THE BINARY)        │
//! │                                               │
//! │   ┌─────────────┐        ┌────────────────┐   │
//! │   │    CLI      │        │  factdb.toml   │   │
//! │   │   (clap)    │        │ (serde + toml) │   │
//! │   └──────┬──────┘        └───────┬────────┘   │
//! │          └──────────┬────────────┘            │
//! │                     ▼                         │
//! │             ┌───────────────┐                 │
//! │             │  factdb-core  │                 │
//! │             │  (THE ENGINE) │                 │
//! │             └───────────────┘                 │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! factdb --schema-dir schema load facts.json
//! factdb list
//! factdb query facts/0 'example.Class { name = "A".. }' --limit 10
//! factdb query facts/0 'example.Parent { child = C }' --debug --profile
//! factdb stat facts/0
//! ```

use clap::Parser;
use factdb::cli;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter when neither `FACTDB_LOG` nor `RUST_LOG` is set.
const DEFAULT_LOG_FILTER: &str = "factdb=info,factdb_core=info";

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

fn main() {
    // Initialize tracing: FACTDB_LOG_FORMAT=json enables machine-parseable output.
    let log_format = std::env::var("FACTDB_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    let filter = tracing_subscriber::EnvFilter::try_from_env("FACTDB_LOG")
        .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());

    // Logs go to stderr.
    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    // Parse CLI arguments
    let cli = cli::Cli::parse();

    // Execute command
    if let Err(e) = cli::execute(cli) {
        tracing::error!("Error: {}", e);
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
