//! In-memory feature stores (procedures and features of interest).
//!
//! Both stores share a [`FeatureTable`]: every feature has a dense internal
//! id, a unique id, and a time-ordered map of versions keyed by valid start
//! time.
//!
//! ```text
//!   internal id ─► Versions { id, versions: BTreeMap<start, Feature> }
//!   unique id ───► internal id
//! ```
//!
//! A version stays valid until the next one starts, so the effective
//! validity of version `i` is `[start_i, start_{i+1})` (clipped to the end of
//! the version's own valid time, when it has one).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::data::Feature;
use crate::error::{Error, Result};
use crate::filter::{FeatureFilter, FoiFilter, ProcedureFilter, QueryFilter};
use crate::store::{
    wants, DataStore, EntryIter, FeatureField, FeatureStore, FoiStore, Link, ProcedureStore,
};
use crate::store::datastream::InMemoryDataStreamStore;
use crate::store::obs::InMemoryObsStore;
use crate::types::{FeatureId, FeatureKey, TimeExtent, Timestamp, TIME_MAX};

// =============================================================================
// Feature Table
// =============================================================================

#[derive(Debug, Clone)]
struct Versions {
    id: FeatureId,
    versions: BTreeMap<Timestamp, Feature>,
}

impl Versions {
    /// The version valid at `now`, or the most recent one if none is yet.
    fn current(&self, now: Timestamp) -> Option<(&Timestamp, &Feature)> {
        self.versions
            .range(..=now)
            .next_back()
            .or_else(|| self.versions.iter().next_back())
    }

    /// Versions with their effective validity periods.
    fn with_validity(&self) -> Vec<(Timestamp, &Feature, TimeExtent)> {
        let starts: Vec<Timestamp> = self.versions.keys().copied().collect();
        self.versions
            .iter()
            .enumerate()
            .map(|(i, (start, feature))| {
                let mut end = starts
                    .get(i + 1)
                    .map(|next| *next - Duration::nanoseconds(1))
                    .unwrap_or(TIME_MAX);
                if let Some(own) = feature.valid_time() {
                    end = end.min(own.end());
                }
                let validity = TimeExtent::new(*start, end.max(*start))
                    .unwrap_or_else(|_| TimeExtent::instant(*start));
                (*start, feature, validity)
            })
            .collect()
    }
}

#[derive(Debug, Default)]
struct TableInner {
    features: BTreeMap<u64, Versions>,
    uid_index: HashMap<String, u64>,
    next_id: u64,
}

impl TableInner {
    fn resolve(&self, id: &FeatureId) -> Option<u64> {
        if id.internal_id() > 0 && self.features.contains_key(&id.internal_id()) {
            return Some(id.internal_id());
        }
        id.unique_id().and_then(|uid| self.uid_index.get(uid).copied())
    }

    fn allocate_id(&mut self) -> u64 {
        self.next_id = self.next_id.max(1);
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

/// Serialized form written by `backup`.
#[derive(Debug, Serialize, Deserialize)]
struct FeatureSnapshot {
    next_id: u64,
    versions: Vec<(FeatureKey, Feature)>,
}

/// Versioned feature storage shared by the procedure and FOI stores.
#[derive(Debug)]
pub(crate) struct FeatureTable {
    inner: RwLock<TableInner>,
    read_only: AtomicBool,
}

impl FeatureTable {
    fn new() -> Self {
        Self {
            inner: RwLock::new(TableInner {
                next_id: 1,
                ..TableInner::default()
            }),
            read_only: AtomicBool::new(false),
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only.load(Ordering::Acquire) {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    fn add(&self, feature: Feature) -> Result<FeatureKey> {
        self.check_writable()?;
        if feature.unique_id().is_empty() {
            return Err(Error::validation("feature needs a unique id"));
        }
        let mut inner = self.inner.write();
        if inner.uid_index.contains_key(feature.unique_id()) {
            return Err(Error::Duplicate(format!(
                "feature {} already exists",
                feature.unique_id()
            )));
        }
        let internal_id = inner.allocate_id();
        let id = FeatureId::new(internal_id, feature.unique_id());
        let start = feature.valid_start_time();
        inner.uid_index.insert(feature.unique_id().to_string(), internal_id);
        inner.features.insert(
            internal_id,
            Versions {
                id: id.clone(),
                versions: BTreeMap::from([(start, feature)]),
            },
        );
        Ok(FeatureKey::new(id, start))
    }

    fn add_version(&self, feature: Feature) -> Result<FeatureKey> {
        self.check_writable()?;
        let mut inner = self.inner.write();
        let internal_id = inner
            .uid_index
            .get(feature.unique_id())
            .copied()
            .ok_or_else(|| Error::NotFound(format!("feature {}", feature.unique_id())))?;
        let entry = inner
            .features
            .get_mut(&internal_id)
            .ok_or_else(|| Error::NotFound(format!("feature {}", feature.unique_id())))?;
        let start = feature.valid_start_time();
        if entry.versions.contains_key(&start) {
            return Err(Error::Duplicate(format!(
                "feature {} already has a version starting at {}",
                feature.unique_id(),
                start.to_rfc3339()
            )));
        }
        entry.versions.insert(start, feature);
        Ok(FeatureKey::new(entry.id.clone(), start))
    }

    fn get(&self, key: &FeatureKey) -> Option<Feature> {
        let inner = self.inner.read();
        let entry = inner.features.get(&inner.resolve(key.id())?)?;
        if key.is_latest() {
            entry.current(Utc::now()).map(|(_, f)| f.clone())
        } else {
            entry.versions.get(&key.valid_start_time()).cloned()
        }
    }

    fn put(&self, key: FeatureKey, feature: Feature) -> Result<Option<Feature>> {
        self.check_writable()?;
        if key.is_latest() {
            return Err(Error::validation(
                "cannot store a feature under the latest-version marker",
            ));
        }
        let mut inner = self.inner.write();
        let internal_id = match inner.resolve(key.id()) {
            Some(id) => id,
            None => {
                if inner.uid_index.contains_key(feature.unique_id()) {
                    return Err(Error::Duplicate(format!(
                        "feature {} already exists under another id",
                        feature.unique_id()
                    )));
                }
                let id = match key.internal_id() {
                    0 => inner.allocate_id(),
                    id => {
                        inner.next_id = inner.next_id.max(id + 1);
                        id
                    }
                };
                inner.uid_index.insert(feature.unique_id().to_string(), id);
                inner.features.insert(
                    id,
                    Versions {
                        id: FeatureId::new(id, feature.unique_id()),
                        versions: BTreeMap::new(),
                    },
                );
                id
            }
        };
        let entry = inner
            .features
            .get_mut(&internal_id)
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        if entry.id.unique_id() != Some(feature.unique_id()) {
            return Err(Error::validation(format!(
                "feature {} stored under key of {}",
                feature.unique_id(),
                entry.id
            )));
        }
        Ok(entry.versions.insert(key.valid_start_time(), feature))
    }

    fn remove(&self, key: &FeatureKey) -> Result<Option<Feature>> {
        self.check_writable()?;
        let mut inner = self.inner.write();
        let Some(internal_id) = inner.resolve(key.id()) else {
            return Ok(None);
        };
        let Some(entry) = inner.features.get_mut(&internal_id) else {
            return Ok(None);
        };
        let start = if key.is_latest() {
            match entry.current(Utc::now()) {
                Some((start, _)) => *start,
                None => return Ok(None),
            }
        } else {
            key.valid_start_time()
        };
        let removed = entry.versions.remove(&start);
        if entry.versions.is_empty() {
            if let Some(uid) = entry.id.unique_id().map(str::to_string) {
                inner.uid_index.remove(&uid);
            }
            inner.features.remove(&internal_id);
        }
        Ok(removed)
    }

    /// Versions passing `filter` and `extra`, in internal id then start time
    /// order.
    fn select(
        &self,
        filter: &FeatureFilter,
        extra: impl Fn(u64, &Feature) -> bool,
        fields: Option<&[FeatureField]>,
        limit: u64,
    ) -> Vec<(FeatureKey, Feature)> {
        let keep_description = wants(fields, FeatureField::Description);
        let keep_geometry = wants(fields, FeatureField::Geometry);
        let latest_only = filter.valid_time().map_or(false, |t| t.is_latest_time());
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);

        let inner = self.inner.read();
        let mut out = Vec::new();
        let candidates = inner
            .features
            .iter()
            .filter(|(id, _)| filter.test_internal_id(**id));
        for (internal_id, entry) in candidates {
            let mut versions = entry.with_validity();
            if latest_only {
                versions = versions.split_off(versions.len().saturating_sub(1));
            }
            for (start, feature, validity) in versions {
                if out.len() >= limit {
                    return out;
                }
                let key = FeatureKey::new(entry.id.clone(), start);
                if !filter.test_version(&key, feature, Some(&validity))
                    || !extra(*internal_id, feature)
                {
                    continue;
                }
                let mut feature = feature.clone();
                feature.strip(keep_description, keep_geometry);
                out.push((key, feature));
            }
        }
        out
    }

    fn select_ids(&self, filter: &FeatureFilter) -> BTreeSet<u64> {
        self.select(filter, |_, _| true, Some(&[][..]), filter.limit())
            .into_iter()
            .map(|(key, _)| key.internal_id())
            .collect()
    }

    fn feature_id(&self, unique_id: &str) -> Option<FeatureId> {
        let inner = self.inner.read();
        let internal_id = inner.uid_index.get(unique_id)?;
        inner.features.get(internal_id).map(|v| v.id.clone())
    }

    fn current_version_key(&self, unique_id: &str) -> Option<FeatureKey> {
        let inner = self.inner.read();
        let entry = inner.features.get(inner.uid_index.get(unique_id)?)?;
        entry
            .current(Utc::now())
            .map(|(start, _)| FeatureKey::new(entry.id.clone(), *start))
    }

    fn num_features(&self) -> u64 {
        self.inner.read().features.len() as u64
    }

    fn num_records(&self) -> u64 {
        self.inner
            .read()
            .features
            .values()
            .map(|v| v.versions.len() as u64)
            .sum()
    }

    fn clear(&self) -> Result<()> {
        self.check_writable()?;
        let mut inner = self.inner.write();
        inner.features.clear();
        inner.uid_index.clear();
        inner.next_id = 1;
        Ok(())
    }

    fn backup(&self, sink: &mut dyn Write) -> Result<()> {
        let inner = self.inner.read();
        let snapshot = FeatureSnapshot {
            next_id: inner.next_id,
            versions: inner
                .features
                .values()
                .flat_map(|entry| {
                    entry
                        .versions
                        .iter()
                        .map(|(start, f)| (FeatureKey::new(entry.id.clone(), *start), f.clone()))
                })
                .collect(),
        };
        serde_json::to_writer(sink, &snapshot)?;
        Ok(())
    }

    fn restore(&self, source: &mut dyn Read) -> Result<()> {
        self.check_writable()?;
        let snapshot: FeatureSnapshot = serde_json::from_reader(source)?;
        let mut restored = TableInner {
            next_id: snapshot.next_id.max(1),
            ..TableInner::default()
        };
        for (key, feature) in snapshot.versions {
            let internal_id = key.internal_id();
            if internal_id == 0 {
                return Err(Error::validation("snapshot feature key without internal id"));
            }
            restored
                .uid_index
                .insert(feature.unique_id().to_string(), internal_id);
            restored
                .features
                .entry(internal_id)
                .or_insert_with(|| Versions {
                    id: key.id().clone(),
                    versions: BTreeMap::new(),
                })
                .versions
                .insert(key.valid_start_time(), feature);
            restored.next_id = restored.next_id.max(internal_id + 1);
        }
        *self.inner.write() = restored;
        Ok(())
    }
}

// =============================================================================
// Store Implementations
// =============================================================================

/// In-memory procedure store.
#[derive(Debug)]
pub struct InMemoryProcedureStore {
    table: FeatureTable,
    pub(crate) datastreams: Link<InMemoryDataStreamStore>,
}

/// In-memory feature-of-interest store.
#[derive(Debug)]
pub struct InMemoryFoiStore {
    table: FeatureTable,
    pub(crate) observations: Link<InMemoryObsStore>,
}

impl InMemoryProcedureStore {
    pub fn new() -> Self {
        Self {
            table: FeatureTable::new(),
            datastreams: Link::new("data stream"),
        }
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.table.read_only.store(read_only, Ordering::Release);
    }

    /// Internal ids of the procedures matching `filter`.
    pub(crate) fn select_ids(&self, filter: &ProcedureFilter) -> Result<BTreeSet<u64>> {
        Ok(self
            .select_entries(filter, Some(&[][..]))?
            .filter_map(|e| e.ok())
            .map(|(key, _)| key.internal_id())
            .collect())
    }
}

impl InMemoryFoiStore {
    pub fn new() -> Self {
        Self {
            table: FeatureTable::new(),
            observations: Link::new("observation"),
        }
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.table.read_only.store(read_only, Ordering::Release);
    }

    /// Internal ids of the features of interest matching `filter`.
    pub(crate) fn select_ids(&self, filter: &FoiFilter) -> Result<BTreeSet<u64>> {
        Ok(self
            .select_entries(filter, Some(&[][..]))?
            .filter_map(|e| e.ok())
            .map(|(key, _)| key.internal_id())
            .collect())
    }

    /// Unique id of a feature of interest, if known.
    pub(crate) fn unique_id_of(&self, internal_id: u64) -> Option<String> {
        self.table
            .inner
            .read()
            .features
            .get(&internal_id)
            .and_then(|v| v.id.unique_id().map(str::to_string))
    }
}

impl Default for InMemoryProcedureStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for InMemoryFoiStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DataStore for InMemoryProcedureStore {
    type Key = FeatureKey;
    type Value = Feature;
    type Filter = ProcedureFilter;
    type Field = FeatureField;

    fn select_entries(
        &self,
        filter: &ProcedureFilter,
        fields: Option<&[FeatureField]>,
    ) -> Result<EntryIter<FeatureKey, Feature>> {
        // nested filters resolve before this table is locked
        let with_datastreams: Option<BTreeSet<u64>> = match filter.datastream_filter() {
            Some(ds_filter) => Some(self.datastreams.get()?.select_procedure_ids(ds_filter)?),
            None => None,
        };
        let selected = self.table.select(
            filter.base(),
            |id, _| with_datastreams.as_ref().map_or(true, |ids| ids.contains(&id)),
            fields,
            filter.limit(),
        );
        Ok(Box::new(selected.into_iter().map(Ok)))
    }

    fn get(&self, key: &FeatureKey) -> Result<Option<Feature>> {
        Ok(self.table.get(key))
    }

    fn put(&self, key: FeatureKey, value: Feature) -> Result<Option<Feature>> {
        self.table.put(key, value)
    }

    fn remove(&self, key: &FeatureKey) -> Result<Option<Feature>> {
        self.table.remove(key)
    }

    fn select_all_filter(&self) -> ProcedureFilter {
        ProcedureFilter::all()
    }

    fn num_records(&self) -> u64 {
        self.table.num_records()
    }

    fn clear(&self) -> Result<()> {
        self.table.clear()
    }

    fn is_read_only(&self) -> bool {
        self.table.read_only.load(Ordering::Acquire)
    }

    fn backup(&self, sink: &mut dyn Write) -> Result<()> {
        self.table.backup(sink)
    }

    fn restore(&self, source: &mut dyn Read) -> Result<()> {
        self.table.restore(source)
    }
}

impl FeatureStore for InMemoryProcedureStore {
    fn add(&self, feature: Feature) -> Result<FeatureKey> {
        self.table.add(feature)
    }

    fn add_version(&self, feature: Feature) -> Result<FeatureKey> {
        self.table.add_version(feature)
    }

    fn feature_id(&self, unique_id: &str) -> Option<FeatureId> {
        self.table.feature_id(unique_id)
    }

    fn num_features(&self) -> u64 {
        self.table.num_features()
    }

    fn current_version_key(&self, unique_id: &str) -> Result<Option<FeatureKey>> {
        Ok(self.table.current_version_key(unique_id))
    }
}

impl ProcedureStore for InMemoryProcedureStore {}

impl DataStore for InMemoryFoiStore {
    type Key = FeatureKey;
    type Value = Feature;
    type Filter = FoiFilter;
    type Field = FeatureField;

    fn select_entries(
        &self,
        filter: &FoiFilter,
        fields: Option<&[FeatureField]>,
    ) -> Result<EntryIter<FeatureKey, Feature>> {
        let sampled: Option<BTreeSet<u64>> = filter
            .sampled_feature_filter()
            .map(|f| self.table.select_ids(f));
        let observed: Option<BTreeSet<u64>> = match filter.obs_filter() {
            Some(obs_filter) => Some(self.observations.get()?.select_foi_ids(obs_filter)?),
            None => None,
        };
        let selected = self.table.select(
            filter.base(),
            |id, feature| {
                sampled
                    .as_ref()
                    .map_or(true, |ids| ids.contains(&feature.sampled_feature_id()))
                    && observed.as_ref().map_or(true, |ids| ids.contains(&id))
            },
            fields,
            filter.limit(),
        );
        Ok(Box::new(selected.into_iter().map(Ok)))
    }

    fn get(&self, key: &FeatureKey) -> Result<Option<Feature>> {
        Ok(self.table.get(key))
    }

    fn put(&self, key: FeatureKey, value: Feature) -> Result<Option<Feature>> {
        self.table.put(key, value)
    }

    fn remove(&self, key: &FeatureKey) -> Result<Option<Feature>> {
        self.table.remove(key)
    }

    fn select_all_filter(&self) -> FoiFilter {
        FoiFilter::all()
    }

    fn num_records(&self) -> u64 {
        self.table.num_records()
    }

    fn clear(&self) -> Result<()> {
        self.table.clear()
    }

    fn is_read_only(&self) -> bool {
        self.table.read_only.load(Ordering::Acquire)
    }

    fn backup(&self, sink: &mut dyn Write) -> Result<()> {
        self.table.backup(sink)
    }

    fn restore(&self, source: &mut dyn Read) -> Result<()> {
        self.table.restore(source)
    }
}

impl FeatureStore for InMemoryFoiStore {
    fn add(&self, feature: Feature) -> Result<FeatureKey> {
        self.table.add(feature)
    }

    fn add_version(&self, feature: Feature) -> Result<FeatureKey> {
        self.table.add_version(feature)
    }

    fn feature_id(&self, unique_id: &str) -> Option<FeatureId> {
        self.table.feature_id(unique_id)
    }

    fn num_features(&self) -> u64 {
        self.table.num_features()
    }

    fn current_version_key(&self, unique_id: &str) -> Result<Option<FeatureKey>> {
        Ok(self.table.current_version_key(unique_id))
    }
}

impl FoiStore for InMemoryFoiStore {}
