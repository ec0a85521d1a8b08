//! Record-version filters.
//!
//! Mirrors [`TemporalFilter`](super::TemporalFilter): either a fixed version
//! range or the dynamic *current version*, which always passes `test` and is
//! enforced by the querying store (highest version per series).

use std::fmt;

use crate::builder::Draft;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VersionSpec {
    Range { min: u32, max: u32 },
    Current,
}

/// Filter on record versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionFilter {
    spec: VersionSpec,
}

impl VersionFilter {
    pub fn builder() -> VersionFilterBuilder {
        VersionFilterBuilder {
            draft: Draft::new("VersionFilter", None),
        }
    }

    pub fn all_versions() -> Self {
        Self {
            spec: VersionSpec::Range { min: 0, max: u32::MAX },
        }
    }

    pub fn current() -> Self {
        Self {
            spec: VersionSpec::Current,
        }
    }

    pub fn is_current_version(&self) -> bool {
        self.spec == VersionSpec::Current
    }

    pub fn is_all_versions(&self) -> bool {
        self.spec == VersionSpec::Range { min: 0, max: u32::MAX }
    }

    /// `(min, max)`; the current version is `(u32::MAX, u32::MAX)`.
    pub fn bounds(&self) -> (u32, u32) {
        match self.spec {
            VersionSpec::Range { min, max } => (min, max),
            VersionSpec::Current => (u32::MAX, u32::MAX),
        }
    }

    /// Whether `version` passes. Current-version filters always pass.
    pub fn test(&self, version: u32) -> bool {
        match self.spec {
            VersionSpec::Current => true,
            VersionSpec::Range { min, max } => min <= version && version <= max,
        }
    }

    pub fn intersect(&self, other: &VersionFilter) -> Result<VersionFilter> {
        intersect_version(self, other)
    }
}

impl fmt::Display for VersionFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.spec {
            VersionSpec::Current => f.write_str("current"),
            VersionSpec::Range { min, max } => write!(f, "[{}, {}]", min, max),
        }
    }
}

/// ANDs two version filters: current ∩ current and current ∩ all-versions
/// give current; otherwise the ranges are intersected.
pub fn intersect_version(a: &VersionFilter, b: &VersionFilter) -> Result<VersionFilter> {
    if (a.is_current_version() && (b.is_current_version() || b.is_all_versions()))
        || (a.is_all_versions() && b.is_current_version())
    {
        return Ok(VersionFilter::current());
    }

    let (a_min, a_max) = a.bounds();
    let (b_min, b_max) = b.bounds();
    let min = a_min.max(b_min);
    let max = a_max.min(b_max);
    if min > max {
        return Err(Error::empty(format!(
            "version filters {} and {} are disjoint",
            a, b
        )));
    }
    Ok(VersionFilter {
        spec: VersionSpec::Range { min, max },
    })
}

/// Builder for [`VersionFilter`].
#[derive(Debug)]
pub struct VersionFilterBuilder {
    draft: Draft<Option<VersionSpec>>,
}

impl VersionFilterBuilder {
    pub fn with_range(&mut self, min: u32, max: u32) -> &mut Self {
        self.draft.edit(|s| *s = Some(VersionSpec::Range { min, max }));
        self
    }

    pub fn with_version(&mut self, version: u32) -> &mut Self {
        self.with_range(version, version)
    }

    pub fn with_all_versions(&mut self) -> &mut Self {
        self.with_range(0, u32::MAX)
    }

    pub fn with_current_version(&mut self) -> &mut Self {
        self.draft.edit(|s| *s = Some(VersionSpec::Current));
        self
    }

    pub fn build(&mut self) -> Result<VersionFilter> {
        let spec = self
            .draft
            .take()?
            .ok_or_else(|| Error::validation("version filter needs a version range"))?;
        if let VersionSpec::Range { min, max } = spec {
            if min > max {
                return Err(Error::validation(format!(
                    "version range min {} is greater than max {}",
                    min, max
                )));
            }
        }
        Ok(VersionFilter { spec })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_precedence() {
        let current = VersionFilter::current();
        let all = VersionFilter::all_versions();
        assert!(intersect_version(&current, &all).unwrap().is_current_version());
        assert!(intersect_version(&all, &current).unwrap().is_current_version());
    }

    #[test]
    fn test_range_intersection() {
        let a = VersionFilter::builder().with_range(1, 5).build().unwrap();
        let b = VersionFilter::builder().with_range(4, 9).build().unwrap();
        assert_eq!(a.intersect(&b).unwrap().bounds(), (4, 5));

        let c = VersionFilter::builder().with_version(7).build().unwrap();
        assert!(a.intersect(&c).is_err());
    }

    #[test]
    fn test_current_always_passes() {
        assert!(VersionFilter::current().test(0));
        let f = VersionFilter::builder().with_range(2, 3).build().unwrap();
        assert!(!f.test(1));
        assert!(f.test(3));
    }
}
