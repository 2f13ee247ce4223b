//! # Database Manager
//!
//! Databases are identified by a [`Repo`] (`name/hash`) and move through
//!
//! ```text
//! absent -> building -> complete
//!                    -> incomplete   (terminal)
//! ```
//!
//! A database is filled while `building`, sealed by `finalize`, and read-only
//! afterwards. The registry snapshot current at `finalize` becomes the
//! database's stored schema; queries read either through it or through the
//! live registry.

mod database;
mod manager;

pub use database::Database;
pub use manager::DatabaseManager;

use crate::FactDbError;
use crate::store::StoreState;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identity of a database.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Repo {
    pub name: String,
    pub hash: String,
}

impl Repo {
    #[must_use]
    pub fn new(name: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hash: hash.into(),
        }
    }

    /// Whether `filter` selects this repo: an exact `name/hash`, or a name
    /// prefix.
    #[must_use]
    pub fn matches(&self, filter: &str) -> bool {
        match filter.split_once('/') {
            Some((name, hash)) => self.name == name && self.hash == hash,
            None => self.name.starts_with(filter),
        }
    }
}

impl fmt::Display for Repo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.hash)
    }
}

fn valid_component(s: &str) -> bool {
    !s.is_empty()
        && s != "."
        && s != ".."
        && s.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Check that a name or hash is usable as a directory name.
pub(crate) fn check_component(kind: &str, s: &str) -> Result<(), FactDbError> {
    if valid_component(s) {
        Ok(())
    } else {
        Err(FactDbError::type_error(format!("invalid database {kind} {s:?}")))
    }
}

impl FromStr for Repo {
    type Err = FactDbError;

    /// `name/hash`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, hash) = s
            .split_once('/')
            .ok_or_else(|| FactDbError::type_error(format!("expected name/hash, found {s:?}")))?;
        check_component("name", name)?;
        check_component("hash", hash)?;
        Ok(Self::new(name, hash))
    }
}

/// One entry of [`DatabaseManager::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub repo: Repo,
    pub state: StoreState,
    /// Number of committed facts.
    pub facts: u64,
}

impl fmt::Display for DatabaseInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {} facts)", self.repo, self.state, self.facts)
    }
}
