//! Feature filters.
//!
//! [`FeatureFilter`] selects feature versions by identity, validity period,
//! location, keywords, parent group and an optional custom predicate. The
//! procedure and feature-of-interest filters embed one as their base.

use std::collections::BTreeSet;

use geo::Geometry;

use crate::builder::Draft;
use crate::data::Feature;
use crate::error::Result;
use crate::filter::{
    intersect_ids, intersect_limit, intersect_opt, intersect_predicates, intersect_uids,
    FullTextFilter, Predicate, QueryFilter, SpatialFilter, TemporalFilter, UidSet, NO_LIMIT,
};
use crate::types::{FeatureKey, TimeExtent};

/// Filter on feature versions.
#[derive(Debug, Clone)]
pub struct FeatureFilter {
    internal_ids: Option<BTreeSet<u64>>,
    unique_ids: Option<UidSet>,
    parent_ids: Option<BTreeSet<u64>>,
    valid_time: Option<TemporalFilter>,
    location: Option<SpatialFilter>,
    full_text: Option<FullTextFilter>,
    value_predicate: Option<Predicate<Feature>>,
    limit: u64,
}

impl Default for FeatureFilter {
    fn default() -> Self {
        Self {
            internal_ids: None,
            unique_ids: None,
            parent_ids: None,
            valid_time: None,
            location: None,
            full_text: None,
            value_predicate: None,
            limit: NO_LIMIT,
        }
    }
}

impl QueryFilter for FeatureFilter {
    fn limit(&self) -> u64 {
        self.limit
    }
}

impl FeatureFilter {
    pub fn builder() -> FeatureFilterBuilder {
        FeatureFilterBuilder {
            draft: Draft::new("FeatureFilter", FeatureFilter::default()),
        }
    }

    /// Filter matching every feature version.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn internal_ids(&self) -> Option<&BTreeSet<u64>> {
        self.internal_ids.as_ref()
    }

    pub fn unique_ids(&self) -> Option<&UidSet> {
        self.unique_ids.as_ref()
    }

    pub fn parent_ids(&self) -> Option<&BTreeSet<u64>> {
        self.parent_ids.as_ref()
    }

    pub fn valid_time(&self) -> Option<&TemporalFilter> {
        self.valid_time.as_ref()
    }

    pub fn location(&self) -> Option<&SpatialFilter> {
        self.location.as_ref()
    }

    pub fn full_text(&self) -> Option<&FullTextFilter> {
        self.full_text.as_ref()
    }

    pub fn value_predicate(&self) -> Option<&Predicate<Feature>> {
        self.value_predicate.as_ref()
    }

    /// Whether only the version valid now (or the latest one) is wanted.
    pub fn selects_current_version(&self) -> bool {
        self.valid_time
            .as_ref()
            .map(|t| t.is_current_time() || t.is_latest_time())
            .unwrap_or(false)
    }

    // -------------------------------------------------------------------------
    // Per-dimension predicates
    // -------------------------------------------------------------------------

    pub fn test_internal_id(&self, internal_id: u64) -> bool {
        self.internal_ids
            .as_ref()
            .map_or(true, |ids| ids.contains(&internal_id))
    }

    pub fn test_unique_id(&self, unique_id: &str) -> bool {
        self.unique_ids.as_ref().map_or(true, |ids| ids.matches(unique_id))
    }

    pub fn test_parent(&self, feature: &Feature) -> bool {
        self.parent_ids
            .as_ref()
            .map_or(true, |ids| ids.contains(&feature.parent_id()))
    }

    /// A feature without a validity period is valid at all times.
    pub fn test_valid_time(&self, validity: Option<&TimeExtent>) -> bool {
        match &self.valid_time {
            None => true,
            Some(filter) => filter.test_extent(&validity.copied().unwrap_or_else(TimeExtent::all_times)),
        }
    }

    /// A feature without a geometry fails any location filter.
    pub fn test_location(&self, geometry: Option<&Geometry<f64>>) -> bool {
        match (&self.location, geometry) {
            (None, _) => true,
            (Some(filter), Some(geom)) => filter.test(geom),
            (Some(_), None) => false,
        }
    }

    pub fn test_full_text(&self, feature: &Feature) -> bool {
        self.full_text
            .as_ref()
            .map_or(true, |f| f.test_any(feature.searchable_text()))
    }

    pub fn test_value_predicate(&self, feature: &Feature) -> bool {
        self.value_predicate.as_ref().map_or(true, |p| p.test(feature))
    }

    /// Tests a stored version, using the feature's own validity period.
    pub fn test(&self, key: &FeatureKey, feature: &Feature) -> bool {
        self.test_version(key, feature, feature.valid_time())
    }

    /// Tests a stored version whose effective validity period was computed by
    /// the store (a version stays valid until the next one starts).
    pub fn test_version(
        &self,
        key: &FeatureKey,
        feature: &Feature,
        validity: Option<&TimeExtent>,
    ) -> bool {
        self.test_internal_id(key.internal_id())
            && self.test_unique_id(feature.unique_id())
            && self.test_parent(feature)
            && self.test_valid_time(validity)
            && self.test_location(feature.geometry())
            && self.test_full_text(feature)
            && self.test_value_predicate(feature)
    }

    /// ANDs two feature filters dimension by dimension.
    pub fn intersect(&self, other: &FeatureFilter) -> Result<FeatureFilter> {
        Ok(FeatureFilter {
            internal_ids: intersect_ids(self.internal_ids.as_ref(), other.internal_ids.as_ref())?,
            unique_ids: intersect_uids(self.unique_ids.as_ref(), other.unique_ids.as_ref())?,
            parent_ids: intersect_ids(self.parent_ids.as_ref(), other.parent_ids.as_ref())?,
            valid_time: intersect_opt(self.valid_time.as_ref(), other.valid_time.as_ref(), |a, b| {
                a.intersect(b)
            })?,
            location: intersect_opt(self.location.as_ref(), other.location.as_ref(), |a, b| {
                a.intersect(b)
            })?,
            full_text: intersect_opt(self.full_text.as_ref(), other.full_text.as_ref(), |a, b| {
                a.intersect(b)
            })?,
            value_predicate: intersect_predicates(
                self.value_predicate.as_ref(),
                other.value_predicate.as_ref(),
            ),
            limit: intersect_limit(self.limit, other.limit),
        })
    }

    // -------------------------------------------------------------------------
    // Setters shared by the builders that embed a feature filter
    // -------------------------------------------------------------------------

    pub(crate) fn set_internal_ids(&mut self, ids: impl IntoIterator<Item = u64>) {
        self.internal_ids = Some(ids.into_iter().collect());
    }

    pub(crate) fn set_unique_ids<S: Into<String>>(&mut self, uids: impl IntoIterator<Item = S>) {
        self.unique_ids = UidSet::from_patterns(uids);
    }

    pub(crate) fn set_parent_ids(&mut self, ids: impl IntoIterator<Item = u64>) {
        self.parent_ids = Some(ids.into_iter().collect());
    }

    pub(crate) fn set_valid_time(&mut self, filter: TemporalFilter) {
        self.valid_time = Some(filter);
    }

    pub(crate) fn set_location(&mut self, filter: SpatialFilter) {
        self.location = Some(filter);
    }

    pub(crate) fn set_full_text(&mut self, filter: FullTextFilter) {
        self.full_text = Some(filter);
    }

    pub(crate) fn set_value_predicate(&mut self, predicate: Predicate<Feature>) {
        self.value_predicate = Some(predicate);
    }

    pub(crate) fn set_limit(&mut self, limit: u64) {
        self.limit = limit;
    }
}

/// Builder for [`FeatureFilter`].
#[derive(Debug)]
pub struct FeatureFilterBuilder {
    draft: Draft<FeatureFilter>,
}

impl FeatureFilterBuilder {
    pub fn with_internal_ids(&mut self, ids: impl IntoIterator<Item = u64>) -> &mut Self {
        self.draft.edit(|f| f.set_internal_ids(ids));
        self
    }

    /// Unique ids; a trailing `*` matches by prefix and a bare `*` matches all.
    pub fn with_unique_ids<S: Into<String>>(&mut self, uids: impl IntoIterator<Item = S>) -> &mut Self {
        self.draft.edit(|f| f.set_unique_ids(uids));
        self
    }

    /// Members of the given parent groups.
    pub fn with_parents(&mut self, ids: impl IntoIterator<Item = u64>) -> &mut Self {
        self.draft.edit(|f| f.set_parent_ids(ids));
        self
    }

    pub fn with_valid_time(&mut self, filter: TemporalFilter) -> &mut Self {
        self.draft.edit(|f| f.set_valid_time(filter));
        self
    }

    /// Only the version valid now.
    pub fn with_current_version(&mut self) -> &mut Self {
        self.with_valid_time(TemporalFilter::current(chrono::Duration::zero()))
    }

    /// Only the most recent version.
    pub fn with_latest_version(&mut self) -> &mut Self {
        self.with_valid_time(TemporalFilter::latest())
    }

    pub fn with_location(&mut self, filter: SpatialFilter) -> &mut Self {
        self.draft.edit(|f| f.set_location(filter));
        self
    }

    pub fn with_full_text(&mut self, filter: FullTextFilter) -> &mut Self {
        self.draft.edit(|f| f.set_full_text(filter));
        self
    }

    pub fn with_value_predicate(
        &mut self,
        predicate: impl Fn(&Feature) -> bool + Send + Sync + 'static,
    ) -> &mut Self {
        let predicate = Predicate::new(predicate);
        self.draft.edit(|f| f.set_value_predicate(predicate));
        self
    }

    pub fn with_limit(&mut self, limit: u64) -> &mut Self {
        self.draft.edit(|f| f.set_limit(limit));
        self
    }

    pub fn build(&mut self) -> Result<FeatureFilter> {
        self.draft.take()
    }
}
