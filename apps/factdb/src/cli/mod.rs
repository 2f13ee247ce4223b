//! # factdb CLI Module
//!
//! This module implements the command-line interface for factdb.
//!
//! ## Available Commands
//!
//! - `create` - Create a database and ingest fact files into it
//! - `load` - Build a complete database from fact files
//! - `query` - Run a query against a database
//! - `stat` - Show per-predicate statistics
//! - `list` - List databases
//! - `schema` - Show predicate definitions
//! - `dump` - Write a database as a re-ingestible fact file
//! - `owner` - Show which facts own a fact

mod commands;

use crate::config::{Config, Settings};
use clap::{Parser, Subcommand};
use factdb_core::{ExpandPolicy, FactDbError, Repo, SchemaMode};
use std::path::PathBuf;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// factdb - a content-addressed fact database
///
/// Facts are typed by versioned schemas and queried with a compiled
/// pattern-matching language.
#[derive(Parser, Debug)]
#[command(name = "factdb")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (default: ./factdb.toml if present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding the databases
    #[arg(short = 'D', long, global = true)]
    pub db_root: Option<PathBuf>,

    /// Directory of *.angle schema files
    #[arg(short = 'S', long, global = true)]
    pub schema_dir: Option<PathBuf>,

    /// Suppress progress messages
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a database and ingest fact files into it
    Create {
        /// Database name
        name: String,

        /// Database hash (default: first free one)
        #[arg(long)]
        hash: Option<String>,

        /// Fact files to ingest, one atomic commit per file
        files: Vec<PathBuf>,

        /// Leave the database building instead of finalizing it
        #[arg(long)]
        no_finalize: bool,
    },

    /// Build a complete database from fact files; unparsable files create nothing
    Load {
        /// Fact files
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Database identity (default: first file's stem with a fresh hash)
        #[arg(long)]
        db: Option<Repo>,
    },

    /// Run a query against a database
    Query {
        /// Database (name/hash)
        db: Repo,

        /// Query text
        query: String,

        /// Maximum number of results
        #[arg(short, long)]
        limit: Option<usize>,

        /// Expansion of fact references: on, off, except:P,Q or P,Q
        #[arg(short, long)]
        expand: Option<ExpandPolicy>,

        /// Schema to compile against: current or stored
        #[arg(short, long)]
        schema_mode: Option<SchemaMode>,

        /// Report facts searched per predicate
        #[arg(short, long)]
        profile: bool,

        /// Print the IR and bytecode before running
        #[arg(long)]
        debug: bool,
    },

    /// Show per-predicate fact counts and sizes
    Stat {
        /// Database (name/hash)
        db: Repo,
    },

    /// List databases
    List {
        /// Name prefix or exact name/hash
        filter: Option<String>,
    },

    /// Show predicate definitions
    Schema {
        /// Predicate name prefix (default: every predicate)
        prefix: Option<String>,

        /// Show the schema of a database instead of the live one
        #[arg(long)]
        db: Option<Repo>,

        /// Print only matching predicate names
        #[arg(long)]
        names: bool,
    },

    /// Write a complete database as a re-ingestible fact file
    Dump {
        /// Database (name/hash)
        db: Repo,

        /// Output file path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show the owners of a fact
    Owner {
        /// Database (name/hash)
        db: Repo,

        /// Fact id
        id: u64,
    },
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute the CLI with parsed arguments.
pub fn execute(cli: Cli) -> Result<(), FactDbError> {
    let config = Config::load(cli.config.as_deref())?;
    let settings = Settings::resolve(&config, cli.db_root, cli.schema_dir)?;
    let manager = open_manager(&settings)?;
    let out = Output {
        json: cli.json_mode,
        quiet: cli.quiet,
    };

    match cli.command {
        Some(Commands::Create {
            name,
            hash,
            files,
            no_finalize,
        }) => cmd_create(&manager, out, &name, hash.as_deref(), &files, !no_finalize),
        Some(Commands::Load { files, db }) => cmd_load(&manager, out, db, &files),
        Some(Commands::Query {
            db,
            query,
            limit,
            expand,
            schema_mode,
            profile,
            debug,
        }) => {
            let mut options = settings.query.clone();
            if limit.is_some() {
                options.limit = limit;
            }
            if let Some(expand) = expand {
                options.expand = expand;
            }
            if let Some(mode) = schema_mode {
                options.mode = mode;
            }
            options.profile |= profile;
            cmd_query(&manager, out, &db, &query, &options, debug)
        }
        Some(Commands::Stat { db }) => cmd_stat(&manager, out, &db),
        Some(Commands::List { filter }) => cmd_list(&manager, out, filter.as_deref()),
        Some(Commands::Schema { prefix, db, names }) => {
            cmd_schema(&manager, out, prefix.as_deref(), db.as_ref(), names)
        }
        Some(Commands::Dump { db, output }) => cmd_dump(&manager, out, &db, output.as_deref()),
        Some(Commands::Owner { db, id }) => cmd_owner(&manager, out, &db, id),
        None => {
            // No subcommand - list databases by default
            cmd_list(&manager, out, None)
        }
    }
}
