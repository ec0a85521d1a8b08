//! Data stream filters.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::builder::Draft;
use crate::data::DataStreamInfo;
use crate::error::Result;
use crate::filter::{
    intersect_ids, intersect_limit, intersect_names, intersect_opt, intersect_predicates,
    FullTextFilter, ObsFilter, Predicate, ProcedureFilter, QueryFilter, TemporalFilter,
    VersionFilter, NO_LIMIT,
};
use crate::types::DataStreamKey;

/// Filter on data streams.
///
/// Output names, observed properties, validity, version, keywords and the
/// custom predicate are tested on the [`DataStreamInfo`] alone. The procedure
/// and observation dimensions are resolved by the store; only the identity
/// part of a procedure filter is tested locally.
#[derive(Debug, Clone)]
pub struct DataStreamFilter {
    internal_ids: Option<BTreeSet<u64>>,
    procedure_filter: Option<Arc<ProcedureFilter>>,
    obs_filter: Option<Arc<ObsFilter>>,
    output_names: Option<BTreeSet<String>>,
    observed_properties: Option<BTreeSet<String>>,
    valid_time: Option<TemporalFilter>,
    version: Option<VersionFilter>,
    full_text: Option<FullTextFilter>,
    value_predicate: Option<Predicate<DataStreamInfo>>,
    limit: u64,
}

impl Default for DataStreamFilter {
    fn default() -> Self {
        Self {
            internal_ids: None,
            procedure_filter: None,
            obs_filter: None,
            output_names: None,
            observed_properties: None,
            valid_time: None,
            version: None,
            full_text: None,
            value_predicate: None,
            limit: NO_LIMIT,
        }
    }
}

impl QueryFilter for DataStreamFilter {
    fn limit(&self) -> u64 {
        self.limit
    }
}

impl DataStreamFilter {
    pub fn builder() -> DataStreamFilterBuilder {
        DataStreamFilterBuilder {
            draft: Draft::new("DataStreamFilter", DataStreamFilter::default()),
        }
    }

    pub fn all() -> Self {
        Self::default()
    }

    pub fn internal_ids(&self) -> Option<&BTreeSet<u64>> {
        self.internal_ids.as_ref()
    }

    pub fn procedure_filter(&self) -> Option<&ProcedureFilter> {
        self.procedure_filter.as_deref()
    }

    pub fn obs_filter(&self) -> Option<&ObsFilter> {
        self.obs_filter.as_deref()
    }

    pub fn output_names(&self) -> Option<&BTreeSet<String>> {
        self.output_names.as_ref()
    }

    pub fn observed_properties(&self) -> Option<&BTreeSet<String>> {
        self.observed_properties.as_ref()
    }

    pub fn valid_time(&self) -> Option<&TemporalFilter> {
        self.valid_time.as_ref()
    }

    pub fn version(&self) -> Option<&VersionFilter> {
        self.version.as_ref()
    }

    pub fn full_text(&self) -> Option<&FullTextFilter> {
        self.full_text.as_ref()
    }

    /// Whether only the latest version of each output is wanted.
    pub fn selects_current_version(&self) -> bool {
        self.version.map_or(false, |v| v.is_current_version())
    }

    // -------------------------------------------------------------------------
    // Per-dimension predicates
    // -------------------------------------------------------------------------

    pub fn test_internal_id(&self, key: DataStreamKey) -> bool {
        self.internal_ids
            .as_ref()
            .map_or(true, |ids| ids.contains(&key.as_raw()))
    }

    pub fn test_output_name(&self, ds: &DataStreamInfo) -> bool {
        self.output_names
            .as_ref()
            .map_or(true, |names| names.contains(ds.output_name()))
    }

    /// Whether the record schema measures any of the requested properties.
    pub fn test_observed_properties(&self, ds: &DataStreamInfo) -> bool {
        self.observed_properties.as_ref().map_or(true, |props| {
            props.iter().any(|p| ds.record_schema().has_observable(p))
        })
    }

    pub fn test_valid_time(&self, ds: &DataStreamInfo) -> bool {
        self.valid_time
            .as_ref()
            .map_or(true, |f| f.test_extent(ds.valid_time()))
    }

    pub fn test_version(&self, ds: &DataStreamInfo) -> bool {
        self.version.map_or(true, |v| v.test(ds.record_version()))
    }

    pub fn test_full_text(&self, ds: &DataStreamInfo) -> bool {
        self.full_text.as_ref().map_or(true, |f| {
            f.test_any(
                std::iter::once(ds.output_name()).chain(ds.record_schema().observables()),
            )
        })
    }

    /// Identity part of the procedure dimension.
    pub fn test_procedure_id(&self, ds: &DataStreamInfo) -> bool {
        self.procedure_filter.as_ref().map_or(true, |p| {
            p.test_id(ds.procedure_id().internal_id(), ds.procedure_id().unique_id())
        })
    }

    pub fn test_value_predicate(&self, ds: &DataStreamInfo) -> bool {
        self.value_predicate.as_ref().map_or(true, |p| p.test(ds))
    }

    /// ANDs every dimension that can be decided from the data stream alone.
    pub fn test(&self, ds: &DataStreamInfo) -> bool {
        self.test_output_name(ds)
            && self.test_observed_properties(ds)
            && self.test_valid_time(ds)
            && self.test_version(ds)
            && self.test_full_text(ds)
            && self.test_procedure_id(ds)
            && self.test_value_predicate(ds)
    }

    pub(crate) fn set_procedure_filter(&mut self, filter: ProcedureFilter) {
        self.procedure_filter = Some(Arc::new(filter));
    }

    pub fn intersect(&self, other: &DataStreamFilter) -> Result<DataStreamFilter> {
        Ok(DataStreamFilter {
            internal_ids: intersect_ids(self.internal_ids.as_ref(), other.internal_ids.as_ref())?,
            procedure_filter: intersect_opt(
                self.procedure_filter.as_ref(),
                other.procedure_filter.as_ref(),
                |a, b| Ok(Arc::new(a.intersect(b)?)),
            )?,
            obs_filter: intersect_opt(
                self.obs_filter.as_ref(),
                other.obs_filter.as_ref(),
                |a, b| Ok(Arc::new(a.intersect(b)?)),
            )?,
            output_names: intersect_names(
                self.output_names.as_ref(),
                other.output_names.as_ref(),
                "output name",
            )?,
            observed_properties: intersect_names(
                self.observed_properties.as_ref(),
                other.observed_properties.as_ref(),
                "observed property",
            )?,
            valid_time: intersect_opt(self.valid_time.as_ref(), other.valid_time.as_ref(), |a, b| {
                a.intersect(b)
            })?,
            version: intersect_opt(self.version.as_ref(), other.version.as_ref(), |a, b| {
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
}

/// Builder for [`DataStreamFilter`].
#[derive(Debug)]
pub struct DataStreamFilterBuilder {
    draft: Draft<DataStreamFilter>,
}

impl DataStreamFilterBuilder {
    pub fn with_internal_ids(&mut self, ids: impl IntoIterator<Item = u64>) -> &mut Self {
        self.draft.edit(|f| f.internal_ids = Some(ids.into_iter().collect()));
        self
    }

    pub fn with_procedures(&mut self, filter: ProcedureFilter) -> &mut Self {
        self.draft.edit(|f| f.procedure_filter = Some(Arc::new(filter)));
        self
    }

    /// Data streams of the procedures with these internal ids.
    pub fn with_procedure_ids(&mut self, ids: impl IntoIterator<Item = u64>) -> &mut Self {
        let filter = ProcedureFilter::builder().with_internal_ids(ids).build();
        if let Ok(filter) = filter {
            self.with_procedures(filter);
        }
        self
    }

    /// Data streams of the procedures with these unique ids (wildcards allowed).
    pub fn with_procedure_uids<S: Into<String>>(
        &mut self,
        uids: impl IntoIterator<Item = S>,
    ) -> &mut Self {
        let filter = ProcedureFilter::builder().with_unique_ids(uids).build();
        if let Ok(filter) = filter {
            self.with_procedures(filter);
        }
        self
    }

    /// Data streams with at least one matching observation.
    pub fn with_observations(&mut self, filter: ObsFilter) -> &mut Self {
        self.draft.edit(|f| f.obs_filter = Some(Arc::new(filter)));
        self
    }

    pub fn with_output_names<S: Into<String>>(
        &mut self,
        names: impl IntoIterator<Item = S>,
    ) -> &mut Self {
        let names: BTreeSet<String> = names.into_iter().map(Into::into).collect();
        self.draft.edit(|f| f.output_names = Some(names));
        self
    }

    /// Data streams measuring any of these property URIs.
    pub fn with_observed_properties<S: Into<String>>(
        &mut self,
        uris: impl IntoIterator<Item = S>,
    ) -> &mut Self {
        let uris: BTreeSet<String> = uris.into_iter().map(Into::into).collect();
        self.draft.edit(|f| f.observed_properties = Some(uris));
        self
    }

    pub fn with_valid_time(&mut self, filter: TemporalFilter) -> &mut Self {
        self.draft.edit(|f| f.valid_time = Some(filter));
        self
    }

    pub fn with_version(&mut self, filter: VersionFilter) -> &mut Self {
        self.draft.edit(|f| f.version = Some(filter));
        self
    }

    /// Only the latest version of each output.
    pub fn with_current_version(&mut self) -> &mut Self {
        self.with_version(VersionFilter::current())
    }

    pub fn with_full_text(&mut self, filter: FullTextFilter) -> &mut Self {
        self.draft.edit(|f| f.full_text = Some(filter));
        self
    }

    pub fn with_value_predicate(
        &mut self,
        predicate: impl Fn(&DataStreamInfo) -> bool + Send + Sync + 'static,
    ) -> &mut Self {
        let predicate = Predicate::new(predicate);
        self.draft.edit(|f| f.value_predicate = Some(predicate));
        self
    }

    pub fn with_limit(&mut self, limit: u64) -> &mut Self {
        self.draft.edit(|f| f.limit = limit);
        self
    }

    pub fn build(&mut self) -> Result<DataStreamFilter> {
        self.draft.take()
    }
}
