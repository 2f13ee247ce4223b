//! # System Module
//!
//! Store statistics and per-query profiles.

mod stats;

pub use stats::*;
