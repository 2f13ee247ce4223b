//! # Configuration
//!
//! Settings come from an optional `factdb.toml`, overridden by command-line
//! flags:
//!
//! ```toml
//! db_root = "/var/lib/factdb"
//! schema_dir = "schema"
//!
//! [query]
//! limit = 100
//! expand = "on"            # off | on | except:P,Q | P,Q
//! schema_mode = "current"  # current | stored
//! profile = false
//! ```
//!
//! Logging is configured through the environment (`FACTDB_LOG`,
//! `FACTDB_LOG_FORMAT`), not here.

use factdb_core::{ExpandPolicy, FactDbError, QueryOptions, SchemaMode};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Looked up in the working directory when no `--config` is given.
pub const CONFIG_FILE_NAME: &str = "factdb.toml";

/// Database root used when neither the file nor the flags name one.
pub const DEFAULT_DB_ROOT: &str = "factdb-db";

/// Maximum configuration file size (1 MB).
const MAX_CONFIG_FILE_SIZE: u64 = 1024 * 1024;

// =============================================================================
// FILE FORMAT
// =============================================================================

/// Contents of `factdb.toml`. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub db_root: Option<PathBuf>,
    pub schema_dir: Option<PathBuf>,
    pub query: QueryConfig,
}

/// The `[query]` table: defaults for `factdb query`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueryConfig {
    pub limit: Option<usize>,
    pub expand: Option<String>,
    pub schema_mode: Option<SchemaMode>,
    pub profile: bool,
}

impl Config {
    pub fn parse(text: &str) -> Result<Self, FactDbError> {
        toml::from_str(text).map_err(|e| FactDbError::Serialization(format!("{CONFIG_FILE_NAME}: {e}")))
    }

    /// Read `path`, or `factdb.toml` in the working directory if it exists.
    /// An explicitly named file must exist.
    pub fn load(path: Option<&Path>) -> Result<Self, FactDbError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let default = PathBuf::from(CONFIG_FILE_NAME);
                if !default.is_file() {
                    return Ok(Self::default());
                }
                default
            }
        };

        let metadata = std::fs::metadata(&path)
            .map_err(|e| FactDbError::Io(format!("{}: {e}", path.display())))?;
        if metadata.len() > MAX_CONFIG_FILE_SIZE {
            return Err(FactDbError::Serialization(format!(
                "{}: {} bytes exceeds maximum allowed {MAX_CONFIG_FILE_SIZE} bytes",
                path.display(),
                metadata.len()
            )));
        }
        let text = std::fs::read_to_string(&path)
            .map_err(|e| FactDbError::Io(format!("{}: {e}", path.display())))?;
        let config = Self::parse(&text)?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Query defaults from the `[query]` table.
    pub fn query_options(&self) -> Result<QueryOptions, FactDbError> {
        let expand = match &self.query.expand {
            Some(text) => text.parse::<ExpandPolicy>()?,
            None => ExpandPolicy::default(),
        };
        Ok(QueryOptions {
            mode: self.query.schema_mode.unwrap_or_default(),
            expand,
            limit: self.query.limit,
            profile: self.query.profile,
        })
    }
}

// =============================================================================
// RESOLVED SETTINGS
// =============================================================================

/// Configuration after command-line overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub db_root: PathBuf,
    /// Without a schema directory only the builtin schema is known.
    pub schema_dir: Option<PathBuf>,
    pub query: QueryOptions,
}

impl Settings {
    /// Apply `db_root` and `schema_dir` overrides to `config`.
    pub fn resolve(
        config: &Config,
        db_root: Option<PathBuf>,
        schema_dir: Option<PathBuf>,
    ) -> Result<Self, FactDbError> {
        Ok(Self {
            db_root: db_root
                .or_else(|| config.db_root.clone())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_ROOT)),
            schema_dir: schema_dir.or_else(|| config.schema_dir.clone()),
            query: config.query_options()?,
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================
