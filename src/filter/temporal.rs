//! Time filters.
//!
//! A [`TemporalFilter`] is either a concrete period or one of the dynamic
//! forms below, which are resolved against the wall clock each time the
//! filter is evaluated:
//!
//! | Form | Range at evaluation time |
//! |------|--------------------------|
//! | current time (tolerance `t`) | `[now - t, now + t]` |
//! | begins now (end `e`) | `[now, e]` |
//! | ends now (begin `b`) | `[b, now]` |
//! | latest time | not a range: "the most recent record of each series" |
//!
//! The latest-time form always passes [`TemporalFilter::test`]; the querying
//! store keeps only the newest match of each series (see
//! [`crate::store::latest`]).

use std::fmt;

use chrono::{Duration, Utc};

use crate::builder::Draft;
use crate::error::{Error, Result};
use crate::filter::range::RangeOp;
use crate::types::{TimeExtent, Timestamp, TIME_MAX, TIME_MIN};

/// Tolerance used by [`TemporalFilterBuilder::with_current_time_default`].
pub const CURRENT_TIME_TOLERANCE_DEFAULT_MS: i64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq)]
enum TimeSpec {
    Range { begin: Timestamp, end: Timestamp },
    BeginsNow { end: Timestamp },
    EndsNow { begin: Timestamp },
    Current { tolerance: Duration },
    Latest,
}

/// Filter on an instant or period.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemporalFilter {
    spec: TimeSpec,
    op: RangeOp,
}

impl TemporalFilter {
    pub fn builder() -> TemporalFilterBuilder {
        TemporalFilterBuilder {
            draft: Draft::new("TemporalFilter", (None, RangeOp::default())),
        }
    }

    /// Matches every instant.
    pub fn all_times() -> Self {
        Self::concrete(TIME_MIN, TIME_MAX)
    }

    /// The latest record of each series.
    pub fn latest() -> Self {
        Self {
            spec: TimeSpec::Latest,
            op: RangeOp::default(),
        }
    }

    /// A window of `tolerance` around the evaluation time.
    pub fn current(tolerance: Duration) -> Self {
        Self {
            spec: TimeSpec::Current {
                tolerance: tolerance.max(Duration::zero()),
            },
            op: RangeOp::default(),
        }
    }

    /// The period `[begin, end]`.
    pub fn range(begin: Timestamp, end: Timestamp) -> Result<Self> {
        Self::builder().with_range(begin, end).build()
    }

    fn concrete(begin: Timestamp, end: Timestamp) -> Self {
        Self {
            spec: TimeSpec::Range { begin, end },
            op: RangeOp::default(),
        }
    }

    pub fn op(&self) -> RangeOp {
        self.op
    }

    pub fn is_latest_time(&self) -> bool {
        matches!(self.spec, TimeSpec::Latest)
    }

    pub fn is_current_time(&self) -> bool {
        matches!(self.spec, TimeSpec::Current { .. })
    }

    pub fn is_all_times(&self) -> bool {
        matches!(self.spec, TimeSpec::Range { begin, end } if begin == TIME_MIN && end == TIME_MAX)
    }

    pub fn begins_now(&self) -> bool {
        matches!(self.spec, TimeSpec::BeginsNow { .. } | TimeSpec::Current { .. })
    }

    pub fn ends_now(&self) -> bool {
        matches!(self.spec, TimeSpec::EndsNow { .. } | TimeSpec::Current { .. })
    }

    /// Tolerance of a current-time filter.
    pub fn current_tolerance(&self) -> Option<Duration> {
        match self.spec {
            TimeSpec::Current { tolerance } => Some(tolerance),
            _ => None,
        }
    }

    /// `(min, max)` evaluated at `now`.
    ///
    /// A begins-now filter whose end has already passed yields `min > max`
    /// and matches nothing.
    pub fn bounds_at(&self, now: Timestamp) -> (Timestamp, Timestamp) {
        match self.spec {
            TimeSpec::Range { begin, end } => (begin, end),
            TimeSpec::BeginsNow { end } => (now, end),
            TimeSpec::EndsNow { begin } => (begin, now),
            TimeSpec::Current { tolerance } => (
                now.checked_sub_signed(tolerance).unwrap_or(TIME_MIN),
                now.checked_add_signed(tolerance).unwrap_or(TIME_MAX),
            ),
            TimeSpec::Latest => (TIME_MAX, TIME_MAX),
        }
    }

    /// `(min, max)` evaluated at the current wall-clock time.
    pub fn bounds(&self) -> (Timestamp, Timestamp) {
        self.bounds_at(Utc::now())
    }

    /// The period matched right now, or `None` if it is empty.
    pub fn extent(&self) -> Option<TimeExtent> {
        let (min, max) = self.bounds();
        TimeExtent::new(min, max).ok()
    }

    pub fn min(&self) -> Timestamp {
        self.bounds().0
    }

    pub fn max(&self) -> Timestamp {
        self.bounds().1
    }

    /// Whether instant `t` passes. Latest-time filters always pass.
    pub fn test(&self, t: Timestamp) -> bool {
        if self.is_latest_time() {
            return true;
        }
        let (min, max) = self.bounds();
        min <= t && t <= max
    }

    /// Whether period `te` satisfies the operator. Latest-time filters always
    /// pass.
    pub fn test_extent(&self, te: &TimeExtent) -> bool {
        if self.is_latest_time() {
            return true;
        }
        let (min, max) = self.bounds();
        match self.op {
            RangeOp::Intersects => min <= te.end() && max >= te.begin(),
            RangeOp::Contains => min <= te.begin() && te.end() <= max,
            RangeOp::Equals => min == te.begin() && max == te.end(),
        }
    }

    pub fn intersect(&self, other: &TemporalFilter) -> Result<TemporalFilter> {
        intersect_temporal(self, other)
    }
}

impl fmt::Display for TemporalFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.spec {
            TimeSpec::Current { .. } => f.write_str("current"),
            TimeSpec::Latest => f.write_str("latest"),
            _ => match self.extent() {
                Some(extent) => write!(f, "{}", extent),
                None => f.write_str("[]"),
            },
        }
    }
}

/// ANDs two temporal filters.
///
/// Precedence:
/// 1. latest ∩ latest, latest ∩ all-times → latest
/// 2. current ∩ current → current with the smaller tolerance;
///    current ∩ all-times → current
/// 3. otherwise the concrete windows (dynamic forms resolved now) are
///    intersected; disjoint windows fail with `EmptyIntersection`.
pub fn intersect_temporal(a: &TemporalFilter, b: &TemporalFilter) -> Result<TemporalFilter> {
    if (a.is_latest_time() && (b.is_latest_time() || b.is_all_times()))
        || (a.is_all_times() && b.is_latest_time())
    {
        return Ok(TemporalFilter::latest());
    }

    match (a.current_tolerance(), b.current_tolerance()) {
        (Some(ta), Some(tb)) => return Ok(TemporalFilter::current(ta.min(tb))),
        (Some(ta), None) if b.is_all_times() => return Ok(TemporalFilter::current(ta)),
        (None, Some(tb)) if a.is_all_times() => return Ok(TemporalFilter::current(tb)),
        _ => {}
    }

    let now = Utc::now();
    let (a_min, a_max) = a.bounds_at(now);
    let (b_min, b_max) = b.bounds_at(now);
    let min = a_min.max(b_min);
    let max = a_max.min(b_max);
    if min > max {
        return Err(Error::empty(format!(
            "time filters {} and {} are disjoint",
            a, b
        )));
    }
    Ok(TemporalFilter {
        spec: TimeSpec::Range { begin: min, end: max },
        op: a.op,
    })
}

/// Builder for [`TemporalFilter`].
#[derive(Debug)]
pub struct TemporalFilterBuilder {
    draft: Draft<(Option<TimeSpec>, RangeOp)>,
}

impl TemporalFilterBuilder {
    fn set(&mut self, spec: TimeSpec) -> &mut Self {
        self.draft.edit(|d| d.0 = Some(spec));
        self
    }

    pub fn with_range(&mut self, begin: Timestamp, end: Timestamp) -> &mut Self {
        self.set(TimeSpec::Range { begin, end })
    }

    pub fn with_single_value(&mut self, t: Timestamp) -> &mut Self {
        self.with_range(t, t)
    }

    pub fn with_all_times(&mut self) -> &mut Self {
        self.with_range(TIME_MIN, TIME_MAX)
    }

    pub fn with_current_time(&mut self, tolerance: Duration) -> &mut Self {
        self.set(TimeSpec::Current { tolerance })
    }

    pub fn with_current_time_default(&mut self) -> &mut Self {
        self.with_current_time(Duration::milliseconds(CURRENT_TIME_TOLERANCE_DEFAULT_MS))
    }

    pub fn with_latest_time(&mut self) -> &mut Self {
        self.set(TimeSpec::Latest)
    }

    pub fn with_range_beginning_now(&mut self, end: Timestamp) -> &mut Self {
        self.set(TimeSpec::BeginsNow { end })
    }

    pub fn with_range_ending_now(&mut self, begin: Timestamp) -> &mut Self {
        self.set(TimeSpec::EndsNow { begin })
    }

    pub fn from_extent(&mut self, extent: &TimeExtent) -> &mut Self {
        self.with_range(extent.begin(), extent.end())
    }

    pub fn with_op(&mut self, op: RangeOp) -> &mut Self {
        self.draft.edit(|d| d.1 = op);
        self
    }

    pub fn build(&mut self) -> Result<TemporalFilter> {
        let (spec, op) = self.draft.take()?;
        let spec = spec.ok_or_else(|| Error::validation("temporal filter needs a time range"))?;
        match spec {
            TimeSpec::Range { begin, end } if begin > end => {
                return Err(Error::validation(format!(
                    "time range begins after it ends: {} > {}",
                    begin, end
                )));
            }
            TimeSpec::Current { tolerance } if tolerance < Duration::zero() => {
                return Err(Error::validation("current time tolerance must be >= 0"));
            }
            _ => {}
        }
        Ok(TemporalFilter { spec, op })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> Timestamp {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_latest_wins_over_all_times() {
        let latest = TemporalFilter::latest();
        let all = TemporalFilter::all_times();
        assert!(intersect_temporal(&latest, &all).unwrap().is_latest_time());
        assert!(intersect_temporal(&all, &latest).unwrap().is_latest_time());
        assert!(intersect_temporal(&latest, &latest).unwrap().is_latest_time());
    }

    #[test]
    fn test_current_keeps_smaller_tolerance() {
        let a = TemporalFilter::current(Duration::milliseconds(500));
        let b = TemporalFilter::current(Duration::milliseconds(2000));
        let c = intersect_temporal(&a, &b).unwrap();
        assert!(c.is_current_time());
        assert_eq!(c.current_tolerance(), Some(Duration::milliseconds(500)));

        let d = intersect_temporal(&TemporalFilter::all_times(), &b).unwrap();
        assert_eq!(d.current_tolerance(), Some(Duration::milliseconds(2000)));
    }

    #[test]
    fn test_fixed_ranges_intersect() {
        let a = TemporalFilter::range(t(0), t(100)).unwrap();
        let b = TemporalFilter::range(t(50), t(200)).unwrap();
        let c = a.intersect(&b).unwrap();
        assert_eq!(c.bounds(), (t(50), t(100)));

        let d = TemporalFilter::range(t(300), t(400)).unwrap();
        assert!(matches!(a.intersect(&d), Err(Error::EmptyIntersection(_))));
    }

    #[test]
    fn test_current_time_against_fixed_period_is_resolved() {
        let current = TemporalFilter::current(Duration::seconds(10));
        let past = TemporalFilter::range(t(0), t(100)).unwrap();
        assert!(current.intersect(&past).is_err());

        let around_now = TemporalFilter::range(Utc::now() - Duration::hours(1), TIME_MAX).unwrap();
        let c = current.intersect(&around_now).unwrap();
        assert!(!c.is_current_time());
        assert!(c.test(Utc::now()));
    }

    #[test]
    fn test_predicates() {
        let f = TemporalFilter::range(t(10), t(20)).unwrap();
        assert!(f.test(t(10)));
        assert!(!f.test(t(21)));
        assert!(f.test_extent(&TimeExtent::new(t(0), t(15)).unwrap()));
        assert!(!f.test_extent(&TimeExtent::new(t(21), t(30)).unwrap()));

        assert!(TemporalFilter::latest().test(t(0)));
        assert!(TemporalFilter::current(Duration::seconds(5)).test(Utc::now()));
        assert!(!TemporalFilter::current(Duration::seconds(5)).test(t(0)));
    }

    #[test]
    fn test_ending_now() {
        let f = TemporalFilter::builder()
            .with_range_ending_now(t(0))
            .build()
            .unwrap();
        assert!(f.ends_now());
        assert!(f.test(Utc::now() - Duration::seconds(1)));
        assert!(!f.test(Utc::now() + Duration::hours(1)));
    }

    #[test]
    fn test_display() {
        assert_eq!(TemporalFilter::latest().to_string(), "latest");
        assert_eq!(
            TemporalFilter::current(Duration::zero()).to_string(),
            "current"
        );
        assert_eq!(TemporalFilter::all_times().to_string(), "[-inf, +inf]");
    }

    #[test]
    fn test_builder_single_use() {
        let mut builder = TemporalFilter::builder();
        builder.with_all_times();
        let f = builder.build().unwrap();
        builder.with_latest_time();
        assert!(builder.build().is_err());
        assert!(f.is_all_times());
    }
}
