//! In-memory observation store.
//!
//! Observations are indexed by (procedure, feature of interest, phenomenon
//! time, result time), mirroring [`ObsKey`] ordering. Selections are re-sorted
//! into phenomenon time order (result time breaking ties) before the limit is
//! applied.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use geo::{coord, BoundingRect, Rect};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::data::ObsData;
use crate::error::{Error, Result};
use crate::filter::{ObsClusterFilter, ObsFilter, ObsStatsQuery, QueryFilter};
use crate::stats::{Histogram, ObsCluster, ObsStats};
use crate::store::datastream::InMemoryDataStreamStore;
use crate::store::feature::InMemoryFoiStore;
use crate::store::latest::retain_latest;
use crate::store::{
    into_limited_iter, wants, DataStore, EntryIter, ItemIter, Link, ObsField, ObsStore,
};
use crate::types::{DataStreamKey, FeatureId, FeatureKey, ObsKey, TimeExtent, Timestamp, TIME_MIN};

type ObsIndex = (u64, u64, Timestamp, Timestamp);

fn index_of(key: &ObsKey) -> ObsIndex {
    (
        key.procedure_key().internal_id(),
        key.foi_key().internal_id(),
        key.phenomenon_time(),
        key.result_time(),
    )
}

#[derive(Debug, Serialize, Deserialize)]
struct ObsSnapshot {
    observations: Vec<(ObsKey, ObsData)>,
}

/// In-memory observation store.
#[derive(Debug)]
pub struct InMemoryObsStore {
    map: RwLock<BTreeMap<ObsIndex, (ObsKey, ObsData)>>,
    read_only: AtomicBool,
    pub(crate) datastreams: Link<InMemoryDataStreamStore>,
    pub(crate) fois: Link<InMemoryFoiStore>,
}

impl Default for InMemoryObsStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryObsStore {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(BTreeMap::new()),
            read_only: AtomicBool::new(false),
            datastreams: Link::new("data stream"),
            fois: Link::new("feature of interest"),
        }
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::Release);
    }

    fn check_writable(&self) -> Result<()> {
        if self.is_read_only() {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    /// Internal ids of the features of interest of matching observations.
    pub(crate) fn select_foi_ids(&self, filter: &ObsFilter) -> Result<BTreeSet<u64>> {
        Ok(self
            .select_matching(filter, Some(&[][..]))?
            .into_iter()
            .map(|(_, obs)| obs.foi_id())
            .collect())
    }

    /// Ids of the data streams of matching observations.
    pub(crate) fn select_datastream_ids(&self, filter: &ObsFilter) -> Result<BTreeSet<u64>> {
        Ok(self
            .select_matching(filter, Some(&[][..]))?
            .into_iter()
            .map(|(_, obs)| obs.datastream_id().as_raw())
            .collect())
    }

    fn foi_key(&self, foi_id: u64) -> FeatureKey {
        if foi_id == 0 {
            return FeatureKey::NO_FOI;
        }
        let id = match self.fois.try_get().and_then(|fois| fois.unique_id_of(foi_id)) {
            Some(uid) => FeatureId::new(foi_id, uid),
            None => FeatureId::from_internal(foi_id),
        };
        FeatureKey::new(id, TIME_MIN)
    }

    fn select_matching(
        &self,
        filter: &ObsFilter,
        fields: Option<&[ObsField]>,
    ) -> Result<Vec<(ObsKey, ObsData)>> {
        // nested filters resolve before this store is locked
        let datastream_ids = match filter.datastream_filter() {
            Some(ds_filter) => Some(self.datastreams.get()?.select_ids(ds_filter)?),
            None => None,
        };
        let foi_ids = match filter.foi_filter() {
            Some(foi_filter) => Some(self.fois.get()?.select_ids(foi_filter)?),
            None => None,
        };

        let mut selected: Vec<(ObsKey, ObsData)> = {
            let map = self.map.read();
            map.values()
                .filter(|(_, obs)| {
                    filter.test(obs)
                        && datastream_ids
                            .as_ref()
                            .map_or(true, |ids| ids.contains(&obs.datastream_id().as_raw()))
                        && foi_ids.as_ref().map_or(true, |ids| ids.contains(&obs.foi_id()))
                })
                .cloned()
                .collect()
        };
        selected.sort_by(|(ka, a), (kb, b)| {
            (a.phenomenon_time(), a.result_time(), ka).cmp(&(b.phenomenon_time(), b.result_time(), kb))
        });

        if filter.selects_latest() {
            let by_result = filter.result_time().map_or(false, |t| t.is_latest_time());
            selected = retain_latest(
                selected,
                |(_, obs)| (obs.datastream_id(), obs.foi_id()),
                |(_, obs)| {
                    if by_result {
                        obs.result_time()
                    } else {
                        obs.phenomenon_time()
                    }
                },
            );
        }

        selected.truncate(usize::try_from(filter.limit()).unwrap_or(usize::MAX));
        let keep_parameters = wants(fields, ObsField::Parameters);
        let keep_location = wants(fields, ObsField::PhenomenonLocation);
        let keep_result = wants(fields, ObsField::Result);
        for (_, obs) in &mut selected {
            obs.strip(keep_parameters, keep_location, keep_result);
        }
        Ok(selected)
    }
}

fn union_rect(a: Option<Rect<f64>>, b: Option<Rect<f64>>) -> Option<Rect<f64>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(Rect::new(
            coord! { x: a.min().x.min(b.min().x), y: a.min().y.min(b.min().y) },
            coord! { x: a.max().x.max(b.max().x), y: a.max().y.max(b.max().y) },
        )),
        (a, b) => a.or(b),
    }
}

fn extend(range: &mut Option<TimeExtent>, t: Timestamp) {
    match range {
        Some(r) => r.extend_to(t),
        None => *range = Some(TimeExtent::instant(t)),
    }
}

/// Running totals for one statistics bucket or cluster.
#[derive(Debug)]
struct Summary {
    procedure_id: FeatureId,
    foi_id: FeatureId,
    phenomenon_range: Option<TimeExtent>,
    result_range: Option<TimeExtent>,
    bbox: Option<Rect<f64>>,
    phenomenon_times: Vec<Timestamp>,
}

impl Summary {
    fn new(procedure_id: FeatureId, foi_id: FeatureId) -> Self {
        Self {
            procedure_id,
            foi_id,
            phenomenon_range: None,
            result_range: None,
            bbox: None,
            phenomenon_times: Vec::new(),
        }
    }

    fn add(&mut self, obs: &ObsData) {
        extend(&mut self.phenomenon_range, obs.phenomenon_time());
        extend(&mut self.result_range, obs.result_time());
        let rect = obs.phenomenon_location().and_then(|g| g.bounding_rect());
        self.bbox = union_rect(self.bbox, rect);
        self.phenomenon_times.push(obs.phenomenon_time());
    }
}

impl DataStore for InMemoryObsStore {
    type Key = ObsKey;
    type Value = ObsData;
    type Filter = ObsFilter;
    type Field = ObsField;

    fn select_entries(
        &self,
        filter: &ObsFilter,
        fields: Option<&[ObsField]>,
    ) -> Result<EntryIter<ObsKey, ObsData>> {
        let selected = self.select_matching(filter, fields)?;
        Ok(Box::new(selected.into_iter().map(Ok)))
    }

    fn get(&self, key: &ObsKey) -> Result<Option<ObsData>> {
        Ok(self.map.read().get(&index_of(key)).map(|(_, obs)| obs.clone()))
    }

    fn put(&self, key: ObsKey, value: ObsData) -> Result<Option<ObsData>> {
        self.check_writable()?;
        let old = self.map.write().insert(index_of(&key), (key, value));
        Ok(old.map(|(_, obs)| obs))
    }

    fn remove(&self, key: &ObsKey) -> Result<Option<ObsData>> {
        self.check_writable()?;
        Ok(self.map.write().remove(&index_of(key)).map(|(_, obs)| obs))
    }

    fn select_all_filter(&self) -> ObsFilter {
        ObsFilter::all()
    }

    fn num_records(&self) -> u64 {
        self.map.read().len() as u64
    }

    fn clear(&self) -> Result<()> {
        self.check_writable()?;
        self.map.write().clear();
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    fn backup(&self, sink: &mut dyn Write) -> Result<()> {
        let snapshot = ObsSnapshot {
            observations: self.map.read().values().cloned().collect(),
        };
        serde_json::to_writer(sink, &snapshot)?;
        Ok(())
    }

    fn restore(&self, source: &mut dyn Read) -> Result<()> {
        self.check_writable()?;
        let snapshot: ObsSnapshot = serde_json::from_reader(source)?;
        let map = snapshot
            .observations
            .into_iter()
            .map(|(key, obs)| (index_of(&key), (key, obs)))
            .collect();
        *self.map.write() = map;
        Ok(())
    }
}

impl ObsStore for InMemoryObsStore {
    /// Fails with [`Error::Duplicate`] when another data stream already has
    /// an observation under the same key; re-adding to the same data stream
    /// replaces the stored observation.
    fn add(&self, obs: ObsData) -> Result<ObsKey> {
        self.check_writable()?;
        let datastream = self
            .datastreams
            .get()?
            .get(&obs.datastream_id())?
            .ok_or_else(|| Error::NotFound(format!("data stream {}", obs.datastream_id())))?;
        let key = ObsKey::builder()
            .procedure_key(FeatureKey::new(datastream.procedure_id().clone(), TIME_MIN))
            .foi_key(self.foi_key(obs.foi_id()))
            .phenomenon_time(obs.phenomenon_time())
            .result_time(obs.result_time())
            .build()?;

        let mut map = self.map.write();
        let index = index_of(&key);
        if let Some((_, existing)) = map.get(&index) {
            if existing.datastream_id() != obs.datastream_id() {
                return Err(Error::Duplicate(format!(
                    "{} already recorded by {}",
                    key,
                    existing.datastream_id()
                )));
            }
        }
        map.insert(index, (key.clone(), obs));
        Ok(key)
    }

    fn select_statistics(&self, query: &ObsStatsQuery) -> Result<ItemIter<ObsStats>> {
        let selected = self.select_matching(
            query.obs_filter(),
            Some(&[ObsField::PhenomenonLocation][..]),
        )?;

        // observations without a separate result time share one bucket
        let mut buckets: BTreeMap<(DataStreamKey, FeatureId, Option<Timestamp>), Summary> =
            BTreeMap::new();
        for (key, obs) in &selected {
            let foi_id = if query.aggregate_fois() {
                FeatureId::ALL
            } else {
                key.foi_key().id().clone()
            };
            buckets
                .entry((obs.datastream_id(), foi_id.clone(), obs.explicit_result_time()))
                .or_insert_with(|| Summary::new(key.procedure_key().id().clone(), foi_id))
                .add(obs);
        }

        let mut stats = Vec::with_capacity(buckets.len());
        for ((datastream_id, _, _), summary) in buckets {
            let mut builder = ObsStats::builder();
            builder
                .procedure(summary.procedure_id)
                .datastream(datastream_id)
                .foi(summary.foi_id)
                .total_obs_count(summary.phenomenon_times.len() as u64);
            if let Some(range) = summary.phenomenon_range {
                builder.phenomenon_time_range(range);
                if let Some(bin_size) = query.histogram_bin_size() {
                    let mut histogram = Histogram::new(range, bin_size)?;
                    for t in &summary.phenomenon_times {
                        histogram.record(*t);
                    }
                    builder.histogram(histogram);
                }
            }
            if let Some(range) = summary.result_range {
                builder.result_time_range(range);
            }
            if let Some(bbox) = summary.bbox {
                builder.phenomenon_bbox(bbox);
            }
            stats.push(builder.build()?);
        }
        Ok(into_limited_iter(stats, query.limit()))
    }

    fn select_clusters(&self, filter: &ObsClusterFilter) -> Result<ItemIter<ObsCluster>> {
        let selected = self.select_matching(
            &filter.to_obs_filter()?,
            Some(&[ObsField::PhenomenonLocation][..]),
        )?;

        let mut groups: BTreeMap<(u64, u64), Summary> = BTreeMap::new();
        for (key, obs) in &selected {
            groups
                .entry((key.procedure_key().internal_id(), key.foi_key().internal_id()))
                .or_insert_with(|| {
                    Summary::new(key.procedure_key().id().clone(), key.foi_key().id().clone())
                })
                .add(obs);
        }

        let mut clusters = Vec::new();
        for summary in groups.into_values() {
            let cluster = ObsCluster::new(
                summary.procedure_id,
                summary.foi_id,
                summary.phenomenon_range,
                summary.result_range,
                summary.bbox,
            )?;
            if filter.test(&cluster) {
                clusters.push(cluster);
            }
        }
        Ok(into_limited_iter(clusters, filter.limit()))
    }
}
