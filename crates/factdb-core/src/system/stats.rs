//! # Store Statistics and Query Profiles
//!
//! Both are plain counters keyed by predicate, kept in `BTreeMap`s so that
//! listings are always in the same order.

use crate::PredicateRef;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// =============================================================================
// STATISTICS
// =============================================================================

/// Fact count and encoded size of one predicate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredicateStats {
    pub count: u64,
    pub bytes: u64,
}

impl PredicateStats {
    /// Account for one more fact of `bytes` encoded size.
    pub fn add(&mut self, bytes: u64) {
        self.count = self.count.saturating_add(1);
        self.bytes = self.bytes.saturating_add(bytes);
    }
}

/// Per-predicate statistics of a store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub predicates: BTreeMap<PredicateRef, PredicateStats>,
}

impl Statistics {
    pub fn record(&mut self, predicate: &PredicateRef, bytes: u64) {
        self.predicates.entry(predicate.clone()).or_default().add(bytes);
    }

    /// Totals across all predicates.
    #[must_use]
    pub fn total(&self) -> PredicateStats {
        self.predicates.values().fold(PredicateStats::default(), |acc, s| PredicateStats {
            count: acc.count.saturating_add(s.count),
            bytes: acc.bytes.saturating_add(s.bytes),
        })
    }
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (predicate, stats) in &self.predicates {
            writeln!(f, "{predicate}")?;
            writeln!(f, "  count: {}", stats.count)?;
            writeln!(f, "  size:  {}", stats.bytes)?;
        }
        let total = self.total();
        // tenths of a kiB, rounded half up
        let tenths = total.bytes.saturating_mul(10).saturating_add(512) / 1024;
        write!(f, "Total: {} facts ({}.{} kiB)", total.count, tenths / 10, tenths % 10)
    }
}

// =============================================================================
// PROFILE
// =============================================================================

/// Facts examined per predicate during one query execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub facts_searched: BTreeMap<PredicateRef, u64>,
}

impl Profile {
    pub fn record(&mut self, predicate: &PredicateRef) {
        let count = self.facts_searched.entry(predicate.clone()).or_default();
        *count = count.saturating_add(1);
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.facts_searched.values().fold(0, |acc, n| acc.saturating_add(*n))
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (predicate, count)) in self.facts_searched.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{predicate} : {count}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statistics_totals_and_display() {
        let mut stats = Statistics::default();
        let blob = PredicateRef::new("sys.Blob", 1);
        stats.record(&blob, 600);
        stats.record(&blob, 600);
        assert_eq!(stats.total(), PredicateStats { count: 2, bytes: 1200 });
        let text = stats.to_string();
        assert!(text.contains("sys.Blob.1\n  count: 2"));
        assert!(text.ends_with("Total: 2 facts (1.2 kiB)"));
    }

    #[test]
    fn empty_statistics() {
        assert_eq!(Statistics::default().to_string(), "Total: 0 facts (0.0 kiB)");
    }

    #[test]
    fn total_size_has_one_decimal() {
        let total = |bytes: u64| {
            let mut stats = Statistics::default();
            stats.record(&PredicateRef::new("sys.Blob", 1), bytes);
            stats.to_string().lines().last().unwrap_or_default().to_string()
        };
        assert_eq!(total(1024), "Total: 1 facts (1.0 kiB)");
        assert_eq!(total(1536), "Total: 1 facts (1.5 kiB)");
        assert_eq!(total(50), "Total: 1 facts (0.0 kiB)");
        assert_eq!(total(52), "Total: 1 facts (0.1 kiB)");
        assert_eq!(total(10 * 1024 * 1024), "Total: 1 facts (10240.0 kiB)");
    }

    #[test]
    fn profile_counts_per_predicate() {
        let mut profile = Profile::default();
        let a = PredicateRef::new("example.Class", 1);
        let b = PredicateRef::new("example.Parent", 1);
        profile.record(&a);
        profile.record(&a);
        profile.record(&b);
        assert_eq!(profile.total(), 3);
        assert_eq!(profile.to_string(), "example.Class.1 : 2\nexample.Parent.1 : 1");
    }
}
