//! Feature-of-interest filters.

use std::sync::Arc;

use crate::builder::Draft;
use crate::data::Feature;
use crate::error::Result;
use crate::filter::{
    intersect_opt, FeatureFilter, FullTextFilter, ObsFilter, QueryFilter, SpatialFilter,
    TemporalFilter,
};
use crate::types::FeatureKey;

/// Filter on features of interest.
///
/// Adds two nested dimensions to the feature dimensions, both resolved by the
/// store: the sampled feature (for sampling features) and the observations
/// made of the feature.
#[derive(Debug, Clone, Default)]
pub struct FoiFilter {
    base: FeatureFilter,
    sampled_feature_filter: Option<Arc<FeatureFilter>>,
    obs_filter: Option<Arc<ObsFilter>>,
}

impl QueryFilter for FoiFilter {
    fn limit(&self) -> u64 {
        self.base.limit()
    }
}

impl FoiFilter {
    pub fn builder() -> FoiFilterBuilder {
        FoiFilterBuilder {
            draft: Draft::new("FoiFilter", FoiFilter::default()),
        }
    }

    pub fn all() -> Self {
        Self::default()
    }

    pub fn base(&self) -> &FeatureFilter {
        &self.base
    }

    pub fn sampled_feature_filter(&self) -> Option<&FeatureFilter> {
        self.sampled_feature_filter.as_deref()
    }

    pub fn obs_filter(&self) -> Option<&ObsFilter> {
        self.obs_filter.as_deref()
    }

    /// Tests the feature dimensions. Nested dimensions are resolved by the
    /// store.
    pub fn test(&self, key: &FeatureKey, foi: &Feature) -> bool {
        self.base.test(key, foi)
    }

    /// Whether only identity dimensions are set.
    pub fn is_id_only(&self) -> bool {
        let b = &self.base;
        self.sampled_feature_filter.is_none()
            && self.obs_filter.is_none()
            && b.parent_ids().is_none()
            && b.valid_time().is_none()
            && b.location().is_none()
            && b.full_text().is_none()
            && b.value_predicate().is_none()
            && b.unique_ids().is_none()
    }

    pub fn intersect(&self, other: &FoiFilter) -> Result<FoiFilter> {
        Ok(FoiFilter {
            base: self.base.intersect(&other.base)?,
            sampled_feature_filter: intersect_opt(
                self.sampled_feature_filter.as_ref(),
                other.sampled_feature_filter.as_ref(),
                |a, b| Ok(Arc::new(a.intersect(b)?)),
            )?,
            obs_filter: intersect_opt(
                self.obs_filter.as_ref(),
                other.obs_filter.as_ref(),
                |a, b| Ok(Arc::new(a.intersect(b)?)),
            )?,
        })
    }
}

/// Builder for [`FoiFilter`].
#[derive(Debug)]
pub struct FoiFilterBuilder {
    draft: Draft<FoiFilter>,
}

impl FoiFilterBuilder {
    pub fn with_internal_ids(&mut self, ids: impl IntoIterator<Item = u64>) -> &mut Self {
        self.draft.edit(|f| f.base.set_internal_ids(ids));
        self
    }

    pub fn with_unique_ids<S: Into<String>>(&mut self, uids: impl IntoIterator<Item = S>) -> &mut Self {
        self.draft.edit(|f| f.base.set_unique_ids(uids));
        self
    }

    pub fn with_valid_time(&mut self, filter: TemporalFilter) -> &mut Self {
        self.draft.edit(|f| f.base.set_valid_time(filter));
        self
    }

    pub fn with_location(&mut self, filter: SpatialFilter) -> &mut Self {
        self.draft.edit(|f| f.base.set_location(filter));
        self
    }

    pub fn with_full_text(&mut self, filter: FullTextFilter) -> &mut Self {
        self.draft.edit(|f| f.base.set_full_text(filter));
        self
    }

    pub fn with_value_predicate(
        &mut self,
        predicate: impl Fn(&Feature) -> bool + Send + Sync + 'static,
    ) -> &mut Self {
        let predicate = crate::filter::Predicate::new(predicate);
        self.draft.edit(|f| f.base.set_value_predicate(predicate));
        self
    }

    pub fn with_limit(&mut self, limit: u64) -> &mut Self {
        self.draft.edit(|f| f.base.set_limit(limit));
        self
    }

    pub fn with_base(&mut self, base: FeatureFilter) -> &mut Self {
        self.draft.edit(|f| f.base = base);
        self
    }

    /// Sampling features whose sampled feature matches.
    pub fn with_sampled_features(&mut self, filter: FeatureFilter) -> &mut Self {
        self.draft.edit(|f| f.sampled_feature_filter = Some(Arc::new(filter)));
        self
    }

    /// Features of interest of at least one matching observation.
    pub fn with_observations(&mut self, filter: ObsFilter) -> &mut Self {
        self.draft.edit(|f| f.obs_filter = Some(Arc::new(filter)));
        self
    }

    pub fn build(&mut self) -> Result<FoiFilter> {
        self.draft.take()
    }
}
