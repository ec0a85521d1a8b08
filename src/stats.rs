//! Aggregate summaries over sets of observations.
//!
//! [`ObsStats`] is one statistics bucket (counts, time ranges, bounding box
//! and an optional histogram). [`ObsCluster`] is the coarser summary of which
//! procedure observed which feature of interest, and when.

use chrono::Duration;
use geo::Rect;
use serde::{Deserialize, Serialize};

use crate::builder::Draft;
use crate::error::{Error, Result};
use crate::types::{DataStreamKey, FeatureId, TimeExtent, Timestamp};

/// Upper bound on the bins of one histogram.
pub const MAX_HISTOGRAM_BINS: usize = 100_000;

/// Observation counts over consecutive fixed-width time bins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    start: Timestamp,
    bin_size_ms: i64,
    counts: Vec<u64>,
}

impl Histogram {
    /// Empty histogram covering `range` in bins of `bin_size`.
    pub fn new(range: TimeExtent, bin_size: Duration) -> Result<Self> {
        if bin_size <= Duration::zero() {
            return Err(Error::validation("histogram bin size must be positive"));
        }
        let bin_size_ms = bin_size.num_milliseconds().max(1);
        let span = range.end().signed_duration_since(range.begin());
        let bins = (span.num_milliseconds() / bin_size_ms).saturating_add(1).max(1);
        if bins > MAX_HISTOGRAM_BINS as i64 {
            return Err(Error::InvalidRequest(format!(
                "histogram would need {bins} bins, at most {MAX_HISTOGRAM_BINS} allowed"
            )));
        }
        Ok(Self {
            start: range.begin(),
            bin_size_ms,
            counts: vec![0; bins as usize],
        })
    }

    /// Counts `t` in its bin; times outside the covered range are ignored.
    pub fn record(&mut self, t: Timestamp) {
        let offset = t.signed_duration_since(self.start).num_milliseconds();
        if offset < 0 {
            return;
        }
        let bin = (offset / self.bin_size_ms) as usize;
        if let Some(count) = self.counts.get_mut(bin) {
            *count += 1;
        }
    }

    pub fn start(&self) -> Timestamp {
        self.start
    }

    pub fn bin_size(&self) -> Duration {
        Duration::milliseconds(self.bin_size_ms)
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }
}

// =============================================================================
// ObsStats
// =============================================================================

/// Statistics over the observations of one data stream and feature of
/// interest (or of all features, see [`FeatureId::ALL`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObsStats {
    procedure_id: FeatureId,
    datastream_id: DataStreamKey,
    foi_id: FeatureId,
    phenomenon_time_range: Option<TimeExtent>,
    result_time_range: Option<TimeExtent>,
    phenomenon_bbox: Option<Rect<f64>>,
    total_obs_count: u64,
    histogram: Option<Histogram>,
}

impl ObsStats {
    pub fn builder() -> ObsStatsBuilder {
        ObsStatsBuilder {
            draft: Draft::new(
                "ObsStats",
                PartialStats {
                    foi_id: FeatureId::NONE,
                    ..Default::default()
                },
            ),
        }
    }

    pub fn procedure_id(&self) -> &FeatureId {
        &self.procedure_id
    }

    pub fn datastream_id(&self) -> DataStreamKey {
        self.datastream_id
    }

    pub fn foi_id(&self) -> &FeatureId {
        &self.foi_id
    }

    pub fn phenomenon_time_range(&self) -> Option<&TimeExtent> {
        self.phenomenon_time_range.as_ref()
    }

    /// Result time range; falls back to the phenomenon time range.
    pub fn result_time_range(&self) -> Option<&TimeExtent> {
        self.result_time_range
            .as_ref()
            .or(self.phenomenon_time_range.as_ref())
    }

    pub fn phenomenon_bbox(&self) -> Option<&Rect<f64>> {
        self.phenomenon_bbox.as_ref()
    }

    pub fn total_obs_count(&self) -> u64 {
        self.total_obs_count
    }

    pub fn histogram(&self) -> Option<&Histogram> {
        self.histogram.as_ref()
    }
}

#[derive(Debug, Default)]
struct PartialStats {
    procedure_id: Option<FeatureId>,
    datastream_id: Option<DataStreamKey>,
    foi_id: FeatureId,
    phenomenon_time_range: Option<TimeExtent>,
    result_time_range: Option<TimeExtent>,
    phenomenon_bbox: Option<Rect<f64>>,
    total_obs_count: u64,
    histogram: Option<Histogram>,
}

/// Builder for [`ObsStats`].
#[derive(Debug)]
pub struct ObsStatsBuilder {
    draft: Draft<PartialStats>,
}

impl ObsStatsBuilder {
    pub fn procedure(&mut self, id: FeatureId) -> &mut Self {
        self.draft.edit(|s| s.procedure_id = Some(id));
        self
    }

    pub fn datastream(&mut self, id: DataStreamKey) -> &mut Self {
        self.draft.edit(|s| s.datastream_id = Some(id));
        self
    }

    pub fn foi(&mut self, id: FeatureId) -> &mut Self {
        self.draft.edit(|s| s.foi_id = id);
        self
    }

    pub fn phenomenon_time_range(&mut self, range: TimeExtent) -> &mut Self {
        self.draft.edit(|s| s.phenomenon_time_range = Some(range));
        self
    }

    pub fn result_time_range(&mut self, range: TimeExtent) -> &mut Self {
        self.draft.edit(|s| s.result_time_range = Some(range));
        self
    }

    pub fn phenomenon_bbox(&mut self, bbox: Rect<f64>) -> &mut Self {
        self.draft.edit(|s| s.phenomenon_bbox = Some(bbox));
        self
    }

    pub fn total_obs_count(&mut self, count: u64) -> &mut Self {
        self.draft.edit(|s| s.total_obs_count = count);
        self
    }

    pub fn histogram(&mut self, histogram: Histogram) -> &mut Self {
        self.draft.edit(|s| s.histogram = Some(histogram));
        self
    }

    pub fn build(&mut self) -> Result<ObsStats> {
        let s = self.draft.take()?;
        if s.phenomenon_time_range.is_none() && s.result_time_range.is_none() {
            return Err(Error::validation("obs stats need at least one time range"));
        }
        Ok(ObsStats {
            procedure_id: s
                .procedure_id
                .ok_or_else(|| Error::validation("obs stats need a procedure"))?,
            datastream_id: s
                .datastream_id
                .ok_or_else(|| Error::validation("obs stats need a data stream"))?,
            foi_id: s.foi_id,
            phenomenon_time_range: s.phenomenon_time_range,
            result_time_range: s.result_time_range,
            phenomenon_bbox: s.phenomenon_bbox,
            total_obs_count: s.total_obs_count,
            histogram: s.histogram,
        })
    }
}

// =============================================================================
// ObsCluster
// =============================================================================

/// Which procedure observed which feature of interest, over which periods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObsCluster {
    procedure_id: FeatureId,
    foi_id: FeatureId,
    phenomenon_time_range: Option<TimeExtent>,
    result_time_range: Option<TimeExtent>,
    phenomenon_bbox: Option<Rect<f64>>,
}

impl ObsCluster {
    /// Creates a cluster. At least one time range is required.
    pub fn new(
        procedure_id: FeatureId,
        foi_id: FeatureId,
        phenomenon_time_range: Option<TimeExtent>,
        result_time_range: Option<TimeExtent>,
        phenomenon_bbox: Option<Rect<f64>>,
    ) -> Result<Self> {
        if phenomenon_time_range.is_none() && result_time_range.is_none() {
            return Err(Error::validation("obs cluster needs at least one time range"));
        }
        Ok(Self {
            procedure_id,
            foi_id,
            phenomenon_time_range,
            result_time_range,
            phenomenon_bbox,
        })
    }

    pub fn procedure_id(&self) -> &FeatureId {
        &self.procedure_id
    }

    pub fn foi_id(&self) -> &FeatureId {
        &self.foi_id
    }

    pub fn phenomenon_time_range(&self) -> Option<&TimeExtent> {
        self.phenomenon_time_range.as_ref()
    }

    pub fn result_time_range(&self) -> Option<&TimeExtent> {
        self.result_time_range
            .as_ref()
            .or(self.phenomenon_time_range.as_ref())
    }

    pub fn phenomenon_bbox(&self) -> Option<&Rect<f64>> {
        self.phenomenon_bbox.as_ref()
    }
}
