//! Observation filters.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::builder::Draft;
use crate::data::ObsData;
use crate::error::Result;
use crate::filter::{
    intersect_ids, intersect_limit, intersect_opt, intersect_predicates, DataStreamFilter,
    FoiFilter, Predicate, ProcedureFilter, QueryFilter, SpatialFilter, TemporalFilter, NO_LIMIT,
};

/// Filter on observations.
///
/// Data stream ids, feature-of-interest ids, times, location and the custom
/// predicate are tested on the [`ObsData`] itself. Nested data stream and
/// feature-of-interest filters are resolved to id sets by the store.
#[derive(Debug, Clone)]
pub struct ObsFilter {
    datastream_ids: Option<BTreeSet<u64>>,
    foi_ids: Option<BTreeSet<u64>>,
    datastream_filter: Option<Arc<DataStreamFilter>>,
    foi_filter: Option<Arc<FoiFilter>>,
    phenomenon_time: Option<TemporalFilter>,
    result_time: Option<TemporalFilter>,
    phenomenon_location: Option<SpatialFilter>,
    value_predicate: Option<Predicate<ObsData>>,
    limit: u64,
}

impl Default for ObsFilter {
    fn default() -> Self {
        Self {
            datastream_ids: None,
            foi_ids: None,
            datastream_filter: None,
            foi_filter: None,
            phenomenon_time: None,
            result_time: None,
            phenomenon_location: None,
            value_predicate: None,
            limit: NO_LIMIT,
        }
    }
}

impl QueryFilter for ObsFilter {
    fn limit(&self) -> u64 {
        self.limit
    }
}

impl ObsFilter {
    pub fn builder() -> ObsFilterBuilder {
        ObsFilterBuilder {
            draft: Draft::new("ObsFilter", ObsFilter::default()),
        }
    }

    pub fn all() -> Self {
        Self::default()
    }

    pub fn datastream_ids(&self) -> Option<&BTreeSet<u64>> {
        self.datastream_ids.as_ref()
    }

    pub fn foi_ids(&self) -> Option<&BTreeSet<u64>> {
        self.foi_ids.as_ref()
    }

    pub fn datastream_filter(&self) -> Option<&DataStreamFilter> {
        self.datastream_filter.as_deref()
    }

    pub fn foi_filter(&self) -> Option<&FoiFilter> {
        self.foi_filter.as_deref()
    }

    pub fn phenomenon_time(&self) -> Option<&TemporalFilter> {
        self.phenomenon_time.as_ref()
    }

    pub fn result_time(&self) -> Option<&TemporalFilter> {
        self.result_time.as_ref()
    }

    pub fn phenomenon_location(&self) -> Option<&SpatialFilter> {
        self.phenomenon_location.as_ref()
    }

    /// Whether the store must keep only the newest match per series.
    pub fn selects_latest(&self) -> bool {
        self.phenomenon_time.map_or(false, |t| t.is_latest_time())
            || self.result_time.map_or(false, |t| t.is_latest_time())
    }

    // -------------------------------------------------------------------------
    // Per-dimension predicates
    // -------------------------------------------------------------------------

    pub fn test_datastream_id(&self, obs: &ObsData) -> bool {
        self.datastream_ids
            .as_ref()
            .map_or(true, |ids| ids.contains(&obs.datastream_id().as_raw()))
    }

    /// Id 0 in the set selects observations without a feature of interest.
    pub fn test_foi_id(&self, obs: &ObsData) -> bool {
        self.foi_ids
            .as_ref()
            .map_or(true, |ids| ids.contains(&obs.foi_id()))
    }

    pub fn test_phenomenon_time(&self, obs: &ObsData) -> bool {
        self.phenomenon_time
            .as_ref()
            .map_or(true, |f| f.test(obs.phenomenon_time()))
    }

    pub fn test_result_time(&self, obs: &ObsData) -> bool {
        self.result_time
            .as_ref()
            .map_or(true, |f| f.test(obs.result_time()))
    }

    /// An observation without a location fails any location filter.
    pub fn test_phenomenon_location(&self, obs: &ObsData) -> bool {
        match (&self.phenomenon_location, obs.phenomenon_location()) {
            (None, _) => true,
            (Some(filter), Some(geom)) => filter.test(geom),
            (Some(_), None) => false,
        }
    }

    pub fn test_value_predicate(&self, obs: &ObsData) -> bool {
        self.value_predicate.as_ref().map_or(true, |p| p.test(obs))
    }

    pub fn test(&self, obs: &ObsData) -> bool {
        self.test_datastream_id(obs)
            && self.test_foi_id(obs)
            && self.test_phenomenon_time(obs)
            && self.test_result_time(obs)
            && self.test_phenomenon_location(obs)
            && self.test_value_predicate(obs)
    }

    pub fn intersect(&self, other: &ObsFilter) -> Result<ObsFilter> {
        Ok(ObsFilter {
            datastream_ids: intersect_ids(
                self.datastream_ids.as_ref(),
                other.datastream_ids.as_ref(),
            )?,
            foi_ids: intersect_ids(self.foi_ids.as_ref(), other.foi_ids.as_ref())?,
            datastream_filter: intersect_opt(
                self.datastream_filter.as_ref(),
                other.datastream_filter.as_ref(),
                |a, b| Ok(Arc::new(a.intersect(b)?)),
            )?,
            foi_filter: intersect_opt(
                self.foi_filter.as_ref(),
                other.foi_filter.as_ref(),
                |a, b| Ok(Arc::new(a.intersect(b)?)),
            )?,
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
            phenomenon_location: intersect_opt(
                self.phenomenon_location.as_ref(),
                other.phenomenon_location.as_ref(),
                |a, b| a.intersect(b),
            )?,
            value_predicate: intersect_predicates(
                self.value_predicate.as_ref(),
                other.value_predicate.as_ref(),
            ),
            limit: intersect_limit(self.limit, other.limit),
        })
    }
}

/// Builder for [`ObsFilter`].
#[derive(Debug)]
pub struct ObsFilterBuilder {
    draft: Draft<ObsFilter>,
}

impl ObsFilterBuilder {
    pub fn with_datastreams(&mut self, ids: impl IntoIterator<Item = u64>) -> &mut Self {
        self.draft.edit(|f| f.datastream_ids = Some(ids.into_iter().collect()));
        self
    }

    pub fn with_datastream_filter(&mut self, filter: DataStreamFilter) -> &mut Self {
        self.draft.edit(|f| f.datastream_filter = Some(Arc::new(filter)));
        self
    }

    /// Observations of the given procedures, through their data streams.
    ///
    /// Sets the procedure dimension of the data stream filter, keeping its
    /// other dimensions.
    pub fn with_procedures(&mut self, procedures: ProcedureFilter) -> &mut Self {
        self.draft.edit(|f| {
            let mut ds = f
                .datastream_filter
                .as_deref()
                .cloned()
                .unwrap_or_default();
            ds.set_procedure_filter(procedures);
            f.datastream_filter = Some(Arc::new(ds));
        });
        self
    }

    /// Observations from the named outputs of one procedure.
    pub fn with_procedure_outputs<S: Into<String>>(
        &mut self,
        procedure_uid: &str,
        output_names: impl IntoIterator<Item = S>,
    ) -> &mut Self {
        let filter = DataStreamFilter::builder()
            .with_procedure_uids([procedure_uid])
            .with_output_names(output_names)
            .build();
        if let Ok(filter) = filter {
            self.with_datastream_filter(filter);
        }
        self
    }

    /// Observations of features of interest with these internal ids. Id 0
    /// selects observations without one.
    pub fn with_fois(&mut self, ids: impl IntoIterator<Item = u64>) -> &mut Self {
        self.draft.edit(|f| f.foi_ids = Some(ids.into_iter().collect()));
        self
    }

    pub fn with_foi_filter(&mut self, filter: FoiFilter) -> &mut Self {
        self.draft.edit(|f| f.foi_filter = Some(Arc::new(filter)));
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

    /// Only the observations with the latest result time of each series.
    pub fn with_latest_result(&mut self) -> &mut Self {
        self.with_result_time(TemporalFilter::latest())
    }

    pub fn with_phenomenon_location(&mut self, filter: SpatialFilter) -> &mut Self {
        self.draft.edit(|f| f.phenomenon_location = Some(filter));
        self
    }

    pub fn with_value_predicate(
        &mut self,
        predicate: impl Fn(&ObsData) -> bool + Send + Sync + 'static,
    ) -> &mut Self {
        let predicate = Predicate::new(predicate);
        self.draft.edit(|f| f.value_predicate = Some(predicate));
        self
    }

    pub fn with_limit(&mut self, limit: u64) -> &mut Self {
        self.draft.edit(|f| f.limit = limit);
        self
    }

    pub fn build(&mut self) -> Result<ObsFilter> {
        self.draft.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DataBlock, DataValue};
    use crate::error::Error;
    use crate::types::{DataStreamKey, Timestamp};
    use chrono::{TimeZone, Utc};

    fn t(secs: i64) -> Timestamp {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn obs(ds: u64, foi: u64, secs: i64, value: f64) -> ObsData {
        ObsData::builder()
            .datastream(DataStreamKey::from_raw(ds))
            .foi(foi)
            .phenomenon_time(t(secs))
            .result(DataBlock::new(vec![DataValue::Double(value)]))
            .build()
            .unwrap()
    }

    #[test]
    fn test_dimensions() {
        let f = ObsFilter::builder()
            .with_datastreams([1])
            .with_fois([0, 5])
            .with_phenomenon_time(TemporalFilter::range(t(10), t(20)).unwrap())
            .build()
            .unwrap();
        assert!(f.test(&obs(1, 5, 15, 1.0)));
        assert!(f.test(&obs(1, 0, 15, 1.0)));
        assert!(!f.test(&obs(2, 5, 15, 1.0)));
        assert!(!f.test(&obs(1, 6, 15, 1.0)));
        assert!(!f.test(&obs(1, 5, 25, 1.0)));
    }

    #[test]
    fn test_location_required_when_filtered() {
        let f = ObsFilter::builder()
            .with_phenomenon_location(SpatialFilter::bbox(geo::Rect::new(
                geo::coord! { x: 0.0, y: 0.0 },
                geo::coord! { x: 1.0, y: 1.0 },
            )))
            .build()
            .unwrap();
        assert!(!f.test(&obs(1, 0, 0, 0.0)));
    }

    #[test]
    fn test_value_predicate() {
        let f = ObsFilter::builder()
            .with_value_predicate(|o| matches!(o.result().get(0), Some(DataValue::Double(v)) if *v > 20.0))
            .build()
            .unwrap();
        assert!(f.test(&obs(1, 0, 0, 25.0)));
        assert!(!f.test(&obs(1, 0, 0, 15.0)));
    }

    #[test]
    fn test_intersection_takes_min_limit_and_ands_times() {
        let a = ObsFilter::builder()
            .with_phenomenon_time(TemporalFilter::range(t(0), t(100)).unwrap())
            .with_limit(50)
            .build()
            .unwrap();
        let b = ObsFilter::builder()
            .with_phenomenon_time(TemporalFilter::range(t(50), t(150)).unwrap())
            .with_limit(10)
            .build()
            .unwrap();
        let c = a.intersect(&b).unwrap();
        assert_eq!(c.limit(), 10);
        assert_eq!(c.phenomenon_time().unwrap().bounds(), (t(50), t(100)));

        let d = ObsFilter::builder()
            .with_phenomenon_time(TemporalFilter::range(t(500), t(600)).unwrap())
            .build()
            .unwrap();
        assert!(matches!(a.intersect(&d), Err(Error::EmptyIntersection(_))));
    }

    #[test]
    fn test_with_procedures_merges_into_datastream_filter() {
        let f = ObsFilter::builder()
            .with_datastream_filter(
                DataStreamFilter::builder()
                    .with_output_names(["weather"])
                    .build()
                    .unwrap(),
            )
            .with_procedures(ProcedureFilter::builder().with_internal_ids([3]).build().unwrap())
            .build()
            .unwrap();
        let ds = f.datastream_filter().unwrap();
        assert!(ds.output_names().is_some());
        assert!(ds.procedure_filter().unwrap().base().test_internal_id(3));
    }

    #[test]
    fn test_latest_result() {
        let f = ObsFilter::builder().with_latest_result().build().unwrap();
        assert!(f.selects_latest());
        assert!(f.test(&obs(1, 0, 0, 0.0)));
    }
}
