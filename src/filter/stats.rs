//! Statistics and cluster queries.
//!
//! Both queries wrap an [`ObsFilter`] that selects the observations to
//! summarize. [`ObsStatsQuery`] controls how buckets are formed;
//! [`ObsClusterFilter`] additionally tests the summaries themselves.

use std::collections::BTreeSet;

use chrono::Duration;

use crate::builder::Draft;
use crate::error::{Error, Result};
use crate::filter::{
    intersect_ids, intersect_limit, intersect_opt, ObsFilter, QueryFilter, TemporalFilter,
    NO_LIMIT,
};
use crate::stats::ObsCluster;

// =============================================================================
// ObsStatsQuery
// =============================================================================

/// Query for [`crate::stats::ObsStats`] buckets.
///
/// Buckets are formed per (data stream, feature of interest, result time).
/// With `aggregate_fois` set, the feature of interest is folded into a single
/// [`crate::types::FeatureId::ALL`] bucket per data stream and result time.
#[derive(Debug, Clone)]
pub struct ObsStatsQuery {
    obs_filter: ObsFilter,
    histogram_bin_size: Option<Duration>,
    aggregate_fois: bool,
    limit: u64,
}

impl QueryFilter for ObsStatsQuery {
    fn limit(&self) -> u64 {
        self.limit
    }
}

impl ObsStatsQuery {
    pub fn builder() -> ObsStatsQueryBuilder {
        ObsStatsQueryBuilder {
            draft: Draft::new(
                "ObsStatsQuery",
                ObsStatsQuery {
                    obs_filter: ObsFilter::all(),
                    histogram_bin_size: None,
                    aggregate_fois: false,
                    limit: NO_LIMIT,
                },
            ),
        }
    }

    pub fn obs_filter(&self) -> &ObsFilter {
        &self.obs_filter
    }

    /// Bin width of the per-bucket histogram, if one is wanted.
    pub fn histogram_bin_size(&self) -> Option<Duration> {
        self.histogram_bin_size
    }

    pub fn aggregate_fois(&self) -> bool {
        self.aggregate_fois
    }
}

/// Builder for [`ObsStatsQuery`].
#[derive(Debug)]
pub struct ObsStatsQueryBuilder {
    draft: Draft<ObsStatsQuery>,
}

impl ObsStatsQueryBuilder {
    pub fn with_obs_filter(&mut self, filter: ObsFilter) -> &mut Self {
        self.draft.edit(|q| q.obs_filter = filter);
        self
    }

    pub fn with_histogram_bin_size(&mut self, bin_size: Duration) -> &mut Self {
        self.draft.edit(|q| q.histogram_bin_size = Some(bin_size));
        self
    }

    pub fn aggregate_fois(&mut self, aggregate: bool) -> &mut Self {
        self.draft.edit(|q| q.aggregate_fois = aggregate);
        self
    }

    pub fn with_limit(&mut self, limit: u64) -> &mut Self {
        self.draft.edit(|q| q.limit = limit);
        self
    }

    pub fn build(&mut self) -> Result<ObsStatsQuery> {
        let query = self.draft.take()?;
        if let Some(bin) = query.histogram_bin_size {
            if bin <= Duration::zero() {
                return Err(Error::validation("histogram bin size must be positive"));
            }
        }
        Ok(query)
    }
}

// =============================================================================
// ObsClusterFilter
// =============================================================================

/// Filter on observation clusters (procedure × feature of interest).
#[derive(Debug, Clone)]
pub struct ObsClusterFilter {
    procedure_ids: Option<BTreeSet<u64>>,
    foi_ids: Option<BTreeSet<u64>>,
    phenomenon_time: Option<TemporalFilter>,
    result_time: Option<TemporalFilter>,
    limit: u64,
}

impl Default for ObsClusterFilter {
    fn default() -> Self {
        Self {
            procedure_ids: None,
            foi_ids: None,
            phenomenon_time: None,
            result_time: None,
            limit: NO_LIMIT,
        }
    }
}

impl QueryFilter for ObsClusterFilter {
    fn limit(&self) -> u64 {
        self.limit
    }
}

impl ObsClusterFilter {
    pub fn builder() -> ObsClusterFilterBuilder {
        ObsClusterFilterBuilder {
            draft: Draft::new("ObsClusterFilter", ObsClusterFilter::default()),
        }
    }

    pub fn all() -> Self {
        Self::default()
    }

    pub fn procedure_ids(&self) -> Option<&BTreeSet<u64>> {
        self.procedure_ids.as_ref()
    }

    pub fn foi_ids(&self) -> Option<&BTreeSet<u64>> {
        self.foi_ids.as_ref()
    }

    pub fn phenomenon_time(&self) -> Option<&TemporalFilter> {
        self.phenomenon_time.as_ref()
    }

    pub fn result_time(&self) -> Option<&TemporalFilter> {
        self.result_time.as_ref()
    }

    pub fn test_procedure(&self, cluster: &ObsCluster) -> bool {
        self.procedure_ids
            .as_ref()
            .map_or(true, |ids| ids.contains(&cluster.procedure_id().internal_id()))
    }

    pub fn test_foi(&self, cluster: &ObsCluster) -> bool {
        self.foi_ids
            .as_ref()
            .map_or(true, |ids| ids.contains(&cluster.foi_id().internal_id()))
    }

    pub fn test_phenomenon_time(&self, cluster: &ObsCluster) -> bool {
        match (&self.phenomenon_time, cluster.phenomenon_time_range()) {
            (None, _) => true,
            (Some(f), Some(range)) => f.test_extent(range),
            (Some(_), None) => false,
        }
    }

    pub fn test_result_time(&self, cluster: &ObsCluster) -> bool {
        match (&self.result_time, cluster.result_time_range()) {
            (None, _) => true,
            (Some(f), Some(range)) => f.test_extent(range),
            (Some(_), None) => false,
        }
    }

    pub fn test(&self, cluster: &ObsCluster) -> bool {
        self.test_procedure(cluster)
            && self.test_foi(cluster)
            && self.test_phenomenon_time(cluster)
            && self.test_result_time(cluster)
    }

    /// The observation filter selecting the observations a cluster summarizes.
    pub fn to_obs_filter(&self) -> Result<ObsFilter> {
        let mut builder = ObsFilter::builder();
        if let Some(ids) = &self.procedure_ids {
            builder.with_procedures(
                crate::filter::ProcedureFilter::builder()
                    .with_internal_ids(ids.iter().copied())
                    .build()?,
            );
        }
        if let Some(ids) = &self.foi_ids {
            builder.with_fois(ids.iter().copied());
        }
        if let Some(t) = self.phenomenon_time {
            builder.with_phenomenon_time(t);
        }
        if let Some(t) = self.result_time {
            builder.with_result_time(t);
        }
        builder.build()
    }

    pub fn intersect(&self, other: &ObsClusterFilter) -> Result<ObsClusterFilter> {
        Ok(ObsClusterFilter {
            procedure_ids: intersect_ids(self.procedure_ids.as_ref(), other.procedure_ids.as_ref())?,
            foi_ids: intersect_ids(self.foi_ids.as_ref(), other.foi_ids.as_ref())?,
            phenomenon_time: intersect_opt(
                self.phenomenon_time.as_ref(),
                other.phenomenon_time.as_ref(),
                |a, b| a.intersect(b),
            )?,
            result_time: intersect_opt(
                self.result_time.as_ref(),
                other.result_time.as_ref(),
                |a, b| a.intersect(b),
            )?,
            limit: intersect_limit(self.limit, other.limit),
        })
    }
}

/// Builder for [`ObsClusterFilter`].
#[derive(Debug)]
pub struct ObsClusterFilterBuilder {
    draft: Draft<ObsClusterFilter>,
}

impl ObsClusterFilterBuilder {
    pub fn with_procedures(&mut self, ids: impl IntoIterator<Item = u64>) -> &mut Self {
        self.draft.edit(|f| f.procedure_ids = Some(ids.into_iter().collect()));
        self
    }

    pub fn with_fois(&mut self, ids: impl IntoIterator<Item = u64>) -> &mut Self {
        self.draft.edit(|f| f.foi_ids = Some(ids.into_iter().collect()));
        self
    }

    pub fn with_phenomenon_time(&mut self, filter: TemporalFilter) -> &mut Self {
        self.draft.edit(|f| f.phenomenon_time = Some(filter));
        self
    }

    pub fn with_result_time(&mut self, filter: TemporalFilter) -> &mut Self {
        self.draft.edit(|f| f.result_time = Some(filter));
        self
    }

    pub fn with_limit(&mut self, limit: u64) -> &mut Self {
        self.draft.edit(|f| f.limit = limit);
        self
    }

    pub fn build(&mut self) -> Result<ObsClusterFilter> {
        self.draft.take()
    }
}
