//! # Filter Algebra
//!
//! Immutable, composable query filters. Every filter:
//!
//! - is built by a single-use builder (see [`crate::builder`]),
//! - is a conjunction of optional dimensions (an absent dimension matches
//!   everything),
//! - exposes per-dimension `test_*` predicates ANDed into a total `test`,
//! - can be intersected (ANDed) with another filter of the same type.
//!
//! ## Intersection Rules
//!
//! ```text
//!   absent  ∩ absent   = absent
//!   F       ∩ absent   = F
//!   absent  ∩ F        = F
//!   F       ∩ G        = F.intersect(G)   (may fail: EmptyIntersection)
//! ```
//!
//! The free functions in this module ([`intersect_opt`], [`intersect_ids`],
//! [`intersect_uids`]) implement these rules once; each entity filter applies
//! them dimension by dimension.
//!
//! ## Module Organization
//!
//! Primitive filters: [`range`], [`temporal`], [`version`], [`spatial`],
//! [`text`]. Entity filters: [`feature`], [`procedure`], [`foi`],
//! [`datastream`], [`obs`], [`stats`].

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};

pub mod datastream;
pub mod feature;
pub mod foi;
pub mod obs;
pub mod procedure;
pub mod range;
pub mod spatial;
pub mod stats;
pub mod temporal;
pub mod text;
pub mod version;

pub use datastream::DataStreamFilter;
pub use feature::FeatureFilter;
pub use foi::FoiFilter;
pub use obs::ObsFilter;
pub use procedure::ProcedureFilter;
pub use range::{intersect_range, RangeFilter, RangeOp};
pub use spatial::{intersect_spatial, SpatialFilter, SpatialOp};
pub use stats::{ObsClusterFilter, ObsStatsQuery};
pub use temporal::{intersect_temporal, TemporalFilter};
pub use text::{intersect_text, FullTextFilter};
pub use version::{intersect_version, VersionFilter};

/// Result-size limit meaning "unbounded".
pub const NO_LIMIT: u64 = u64::MAX;

// =============================================================================
// Filter Contract
// =============================================================================

/// Contract shared by every entity filter a store can evaluate.
///
/// The per-type `test` predicates take different candidates (a feature, a
/// data stream, an observation) and live on the concrete filter types.
pub trait QueryFilter: fmt::Debug + Clone + Send + Sync + 'static {
    /// Maximum number of results the owning store returns.
    fn limit(&self) -> u64;
}

/// A caller-supplied predicate over stored values.
///
/// # Rust Pattern: Arc<dyn Fn>
///
/// Filters are cloned freely (into background fetch tasks, into intersected
/// filters), so the closure is shared behind an `Arc` rather than boxed.
pub struct Predicate<V: ?Sized>(Arc<dyn Fn(&V) -> bool + Send + Sync>);

impl<V: ?Sized + 'static> Predicate<V> {
    pub fn new(f: impl Fn(&V) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn test(&self, value: &V) -> bool {
        (self.0)(value)
    }

    /// Predicate matching values accepted by both.
    pub fn and(&self, other: &Predicate<V>) -> Predicate<V> {
        let a = Arc::clone(&self.0);
        let b = Arc::clone(&other.0);
        Predicate(Arc::new(move |v: &V| a(v) && b(v)))
    }
}

impl<V: ?Sized> Clone for Predicate<V> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<V: ?Sized> fmt::Debug for Predicate<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Predicate(..)")
    }
}

// =============================================================================
// Intersection Helpers
// =============================================================================

/// Intersects two optional sub-filters with the absent/present rules.
pub fn intersect_opt<F: Clone>(
    a: Option<&F>,
    b: Option<&F>,
    intersect: impl FnOnce(&F, &F) -> Result<F>,
) -> Result<Option<F>> {
    match (a, b) {
        (None, None) => Ok(None),
        (Some(f), None) | (None, Some(f)) => Ok(Some(f.clone())),
        (Some(f), Some(g)) => intersect(f, g).map(Some),
    }
}

/// ANDs two optional value predicates.
pub fn intersect_predicates<V: ?Sized + 'static>(
    a: Option<&Predicate<V>>,
    b: Option<&Predicate<V>>,
) -> Option<Predicate<V>> {
    match (a, b) {
        (None, None) => None,
        (Some(p), None) | (None, Some(p)) => Some(p.clone()),
        (Some(p), Some(q)) => Some(p.and(q)),
    }
}

/// Intersects two optional internal-id sets. An empty result fails.
pub fn intersect_ids(
    a: Option<&BTreeSet<u64>>,
    b: Option<&BTreeSet<u64>>,
) -> Result<Option<BTreeSet<u64>>> {
    intersect_opt(a, b, |a, b| {
        let ids: BTreeSet<u64> = a.intersection(b).copied().collect();
        if ids.is_empty() {
            return Err(Error::empty("internal id sets are disjoint"));
        }
        Ok(ids)
    })
}

/// Intersects two optional string sets (output names, observed properties).
pub fn intersect_names(
    a: Option<&BTreeSet<String>>,
    b: Option<&BTreeSet<String>>,
    what: &str,
) -> Result<Option<BTreeSet<String>>> {
    intersect_opt(a, b, |a, b| {
        let names: BTreeSet<String> = a.intersection(b).cloned().collect();
        if names.is_empty() {
            return Err(Error::empty(format!("{} sets are disjoint", what)));
        }
        Ok(names)
    })
}

/// The smaller of two limits.
pub fn intersect_limit(a: u64, b: u64) -> u64 {
    a.min(b)
}

// =============================================================================
// Unique-ID Sets
// =============================================================================

/// A set of unique ids where entries ending in `*` match by prefix.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UidSet {
    exact: BTreeSet<String>,
    prefixes: BTreeSet<String>,
}

impl UidSet {
    /// Builds a set from patterns. Returns `None` when a bare `*` makes the
    /// set match everything.
    pub fn from_patterns<I, S>(patterns: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = UidSet::default();
        for pattern in patterns {
            let pattern = pattern.into();
            if pattern == "*" {
                return None;
            }
            match pattern.strip_suffix('*') {
                Some(prefix) => {
                    set.prefixes.insert(prefix.to_string());
                }
                None => {
                    set.exact.insert(pattern);
                }
            }
        }
        Some(set)
    }

    pub fn matches(&self, uid: &str) -> bool {
        self.exact.contains(uid) || self.prefixes.iter().any(|p| uid.starts_with(p.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.prefixes.is_empty()
    }

    /// Exact (non-wildcard) ids.
    pub fn exact_ids(&self) -> impl Iterator<Item = &str> {
        self.exact.iter().map(String::as_str)
    }

    pub fn has_wildcards(&self) -> bool {
        !self.prefixes.is_empty()
    }
}

/// Intersects two optional unique-id sets, honoring wildcard prefixes.
///
/// An exact id survives if the other set matches it; of two overlapping
/// prefixes, the longer one survives.
pub fn intersect_uids(a: Option<&UidSet>, b: Option<&UidSet>) -> Result<Option<UidSet>> {
    intersect_opt(a, b, |a, b| {
        let mut out = UidSet::default();
        out.exact.extend(a.exact.iter().filter(|id| b.matches(id)).cloned());
        out.exact.extend(b.exact.iter().filter(|id| a.matches(id)).cloned());
        for pa in &a.prefixes {
            for pb in &b.prefixes {
                if pa.starts_with(pb.as_str()) {
                    out.prefixes.insert(pa.clone());
                } else if pb.starts_with(pa.as_str()) {
                    out.prefixes.insert(pb.clone());
                }
            }
        }
        if out.is_empty() {
            return Err(Error::empty("unique id sets are disjoint"));
        }
        Ok(out)
    })
}
