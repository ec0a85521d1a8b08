//! Procedure filters.

use std::sync::Arc;

use crate::builder::Draft;
use crate::data::Feature;
use crate::error::Result;
use crate::filter::{
    intersect_opt, DataStreamFilter, FeatureFilter, FullTextFilter, QueryFilter, SpatialFilter,
    TemporalFilter,
};
use crate::types::FeatureKey;

/// Filter on procedures (sensors, actuators, processes).
///
/// Adds a data stream filter to the feature dimensions: a procedure matches
/// if at least one of its data streams does. That dimension is resolved by
/// the store.
#[derive(Debug, Clone, Default)]
pub struct ProcedureFilter {
    base: FeatureFilter,
    datastream_filter: Option<Arc<DataStreamFilter>>,
}

impl QueryFilter for ProcedureFilter {
    fn limit(&self) -> u64 {
        self.base.limit()
    }
}

impl ProcedureFilter {
    pub fn builder() -> ProcedureFilterBuilder {
        ProcedureFilterBuilder {
            draft: Draft::new("ProcedureFilter", ProcedureFilter::default()),
        }
    }

    pub fn all() -> Self {
        Self::default()
    }

    pub fn base(&self) -> &FeatureFilter {
        &self.base
    }

    pub fn datastream_filter(&self) -> Option<&DataStreamFilter> {
        self.datastream_filter.as_deref()
    }

    /// Tests the feature dimensions. The data stream dimension is resolved by
    /// the store.
    pub fn test(&self, key: &FeatureKey, procedure: &Feature) -> bool {
        self.base.test(key, procedure)
    }

    /// Whether only identity dimensions are set, so the filter can be
    /// evaluated from a procedure id alone.
    pub fn is_id_only(&self) -> bool {
        let b = &self.base;
        self.datastream_filter.is_none()
            && b.parent_ids().is_none()
            && b.valid_time().is_none()
            && b.location().is_none()
            && b.full_text().is_none()
            && b.value_predicate().is_none()
    }

    /// Tests the identity dimensions against a bare procedure id.
    pub fn test_id(&self, internal_id: u64, unique_id: Option<&str>) -> bool {
        self.base.test_internal_id(internal_id)
            && unique_id.map_or(self.base.unique_ids().is_none(), |uid| {
                self.base.test_unique_id(uid)
            })
    }

    pub fn intersect(&self, other: &ProcedureFilter) -> Result<ProcedureFilter> {
        Ok(ProcedureFilter {
            base: self.base.intersect(&other.base)?,
            datastream_filter: intersect_opt(
                self.datastream_filter.as_ref(),
                other.datastream_filter.as_ref(),
                |a, b| Ok(Arc::new(a.intersect(b)?)),
            )?,
        })
    }
}

/// Builder for [`ProcedureFilter`].
#[derive(Debug)]
pub struct ProcedureFilterBuilder {
    draft: Draft<ProcedureFilter>,
}

impl ProcedureFilterBuilder {
    pub fn with_internal_ids(&mut self, ids: impl IntoIterator<Item = u64>) -> &mut Self {
        self.draft.edit(|f| f.base.set_internal_ids(ids));
        self
    }

    pub fn with_unique_ids<S: Into<String>>(&mut self, uids: impl IntoIterator<Item = S>) -> &mut Self {
        self.draft.edit(|f| f.base.set_unique_ids(uids));
        self
    }

    /// Members of the given procedure groups.
    pub fn with_parents(&mut self, ids: impl IntoIterator<Item = u64>) -> &mut Self {
        self.draft.edit(|f| f.base.set_parent_ids(ids));
        self
    }

    pub fn with_valid_time(&mut self, filter: TemporalFilter) -> &mut Self {
        self.draft.edit(|f| f.base.set_valid_time(filter));
        self
    }

    pub fn with_latest_version(&mut self) -> &mut Self {
        self.with_valid_time(TemporalFilter::latest())
    }

    pub fn with_location(&mut self, filter: SpatialFilter) -> &mut Self {
        self.draft.edit(|f| f.base.set_location(filter));
        self
    }

    pub fn with_full_text(&mut self, filter: FullTextFilter) -> &mut Self {
        self.draft.edit(|f| f.base.set_full_text(filter));
        self
    }

    pub fn with_limit(&mut self, limit: u64) -> &mut Self {
        self.draft.edit(|f| f.base.set_limit(limit));
        self
    }

    /// Replaces all feature dimensions.
    pub fn with_base(&mut self, base: FeatureFilter) -> &mut Self {
        self.draft.edit(|f| f.base = base);
        self
    }

    /// Procedures with at least one matching data stream.
    pub fn with_datastreams(&mut self, filter: DataStreamFilter) -> &mut Self {
        self.draft.edit(|f| f.datastream_filter = Some(Arc::new(filter)));
        self
    }

    pub fn build(&mut self) -> Result<ProcedureFilter> {
        self.draft.take()
    }
}
