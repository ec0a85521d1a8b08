//! Closed-interval filters.
//!
//! A [`RangeFilter`] is `[min, max]` plus a [`RangeOp`] saying how a candidate
//! range must relate to it. Scalar candidates are always tested for
//! containment.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::builder::Draft;
use crate::error::{Error, Result};

/// How a candidate range relates to the filter range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RangeOp {
    /// Candidate overlaps the filter range.
    #[default]
    Intersects,
    /// Filter range contains the candidate.
    Contains,
    /// Candidate equals the filter range.
    Equals,
}

/// Closed interval `[min, max]` with a comparison operator.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeFilter<T> {
    min: T,
    max: T,
    op: RangeOp,
}

impl<T: PartialOrd + Clone + fmt::Debug> RangeFilter<T> {
    pub fn builder() -> RangeFilterBuilder<T> {
        RangeFilterBuilder {
            draft: Draft::new(
                "RangeFilter",
                PartialRange {
                    min: None,
                    max: None,
                    op: RangeOp::default(),
                },
            ),
        }
    }

    /// `[min, max]` with [`RangeOp::Intersects`].
    pub fn new(min: T, max: T) -> Result<Self> {
        Self::builder().with_range(min, max).build()
    }

    pub fn min(&self) -> &T {
        &self.min
    }

    pub fn max(&self) -> &T {
        &self.max
    }

    pub fn op(&self) -> RangeOp {
        self.op
    }

    /// Whether `value` lies in `[min, max]`.
    pub fn test(&self, value: &T) -> bool {
        &self.min <= value && value <= &self.max
    }

    /// Whether the candidate range `[lo, hi]` satisfies the operator.
    pub fn test_range(&self, lo: &T, hi: &T) -> bool {
        match self.op {
            RangeOp::Intersects => lo <= &self.max && hi >= &self.min,
            RangeOp::Contains => &self.min <= lo && hi <= &self.max,
            RangeOp::Equals => lo == &self.min && hi == &self.max,
        }
    }

    pub fn intersect(&self, other: &RangeFilter<T>) -> Result<RangeFilter<T>> {
        intersect_range(self, other)
    }
}

impl<T: fmt::Display> fmt::Display for RangeFilter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

/// Interval intersection. Fails when the intervals are not connected.
///
/// The result keeps the operator of `a`.
pub fn intersect_range<T: PartialOrd + Clone + fmt::Debug>(
    a: &RangeFilter<T>,
    b: &RangeFilter<T>,
) -> Result<RangeFilter<T>> {
    let min = if a.min >= b.min { &a.min } else { &b.min };
    let max = if a.max <= b.max { &a.max } else { &b.max };
    if min > max {
        return Err(Error::empty(format!(
            "ranges [{:?}, {:?}] and [{:?}, {:?}] are disjoint",
            a.min, a.max, b.min, b.max
        )));
    }
    Ok(RangeFilter {
        min: min.clone(),
        max: max.clone(),
        op: a.op,
    })
}

#[derive(Debug)]
struct PartialRange<T> {
    min: Option<T>,
    max: Option<T>,
    op: RangeOp,
}

/// Builder for [`RangeFilter`].
#[derive(Debug)]
pub struct RangeFilterBuilder<T> {
    draft: Draft<PartialRange<T>>,
}

impl<T: PartialOrd + Clone + fmt::Debug> RangeFilterBuilder<T> {
    pub fn with_range(&mut self, min: T, max: T) -> &mut Self {
        self.draft.edit(|r| {
            r.min = Some(min);
            r.max = Some(max);
        });
        self
    }

    /// Single-value range `[value, value]`.
    pub fn with_value(&mut self, value: T) -> &mut Self {
        let max = value.clone();
        self.with_range(value, max)
    }

    pub fn with_op(&mut self, op: RangeOp) -> &mut Self {
        self.draft.edit(|r| r.op = op);
        self
    }

    pub fn build(&mut self) -> Result<RangeFilter<T>> {
        let r = self.draft.take()?;
        let (min, max) = match (r.min, r.max) {
            (Some(min), Some(max)) => (min, max),
            _ => return Err(Error::validation("range filter needs min and max")),
        };
        if min > max {
            return Err(Error::validation(format!(
                "range min {:?} is greater than max {:?}",
                min, max
            )));
        }
        Ok(RangeFilter { min, max, op: r.op })
    }
}
