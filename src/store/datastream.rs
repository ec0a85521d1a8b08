//! In-memory data stream store.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::data::DataStreamInfo;
use crate::error::{Error, Result};
use crate::filter::{DataStreamFilter, QueryFilter};
use crate::store::feature::InMemoryProcedureStore;
use crate::store::obs::InMemoryObsStore;
use crate::store::{DataStore, DataStreamField, DataStreamStore, EntryIter, FeatureStore, Link};
use crate::types::DataStreamKey;

#[derive(Debug)]
struct DsInner {
    streams: BTreeMap<u64, DataStreamInfo>,
    next_id: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct DataStreamSnapshot {
    next_id: u64,
    streams: Vec<(DataStreamKey, DataStreamInfo)>,
}

/// In-memory store of data stream descriptions, keyed by dense ids.
#[derive(Debug)]
pub struct InMemoryDataStreamStore {
    inner: RwLock<DsInner>,
    read_only: AtomicBool,
    pub(crate) procedures: Link<InMemoryProcedureStore>,
    pub(crate) observations: Link<InMemoryObsStore>,
}

impl Default for InMemoryDataStreamStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDataStreamStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(DsInner {
                streams: BTreeMap::new(),
                next_id: 1,
            }),
            read_only: AtomicBool::new(false),
            procedures: Link::new("procedure"),
            observations: Link::new("observation"),
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

    /// Ids of the data streams matching `filter`.
    pub(crate) fn select_ids(&self, filter: &DataStreamFilter) -> Result<BTreeSet<u64>> {
        Ok(self
            .select_matching(filter)?
            .into_iter()
            .map(|(key, _)| key.as_raw())
            .collect())
    }

    /// Internal ids of the procedures owning data streams matching `filter`.
    pub(crate) fn select_procedure_ids(&self, filter: &DataStreamFilter) -> Result<BTreeSet<u64>> {
        Ok(self
            .select_matching(filter)?
            .into_iter()
            .map(|(_, ds)| ds.procedure_id().internal_id())
            .collect())
    }

    fn select_matching(
        &self,
        filter: &DataStreamFilter,
    ) -> Result<Vec<(DataStreamKey, DataStreamInfo)>> {
        // nested filters resolve before this store is locked
        let procedure_ids = match filter.procedure_filter() {
            None => None,
            Some(p) if p.is_id_only() && p.base().unique_ids().is_none() => None,
            Some(p) => match self.procedures.get() {
                Ok(store) => Some(store.select_ids(p)?),
                Err(_) if p.is_id_only() => None,
                Err(e) => return Err(e),
            },
        };
        let observed = match filter.obs_filter() {
            Some(obs_filter) => Some(self.observations.get()?.select_datastream_ids(obs_filter)?),
            None => None,
        };

        let inner = self.inner.read();
        let current_versions = filter
            .selects_current_version()
            .then(|| current_versions(&inner.streams));
        let limit = usize::try_from(filter.limit()).unwrap_or(usize::MAX);

        let selected = inner
            .streams
            .iter()
            .filter(|(id, ds)| {
                let key = DataStreamKey::from_raw(**id);
                let procedure_ok = match &procedure_ids {
                    Some(ids) => ids.contains(&ds.procedure_id().internal_id()),
                    None => filter.test_procedure_id(ds),
                };
                filter.test_internal_id(key)
                    && procedure_ok
                    && filter.test_output_name(ds)
                    && filter.test_observed_properties(ds)
                    && filter.test_valid_time(ds)
                    && filter.test_version(ds)
                    && filter.test_full_text(ds)
                    && filter.test_value_predicate(ds)
                    && observed.as_ref().map_or(true, |ids| ids.contains(*id))
                    && current_versions.as_ref().map_or(true, |current| {
                        current.get(&series_of(ds)) == Some(&ds.record_version())
                    })
            })
            .take(limit)
            .map(|(id, ds)| (DataStreamKey::from_raw(*id), ds.clone()))
            .collect();
        Ok(selected)
    }
}

/// (procedure internal id, output name) of a data stream.
fn series_of(ds: &DataStreamInfo) -> (u64, String) {
    (ds.procedure_id().internal_id(), ds.output_name().to_string())
}

/// Highest record version of each procedure output.
fn current_versions(streams: &BTreeMap<u64, DataStreamInfo>) -> HashMap<(u64, String), u32> {
    let mut current: HashMap<(u64, String), u32> = HashMap::new();
    for ds in streams.values() {
        let version = current.entry(series_of(ds)).or_insert(ds.record_version());
        *version = (*version).max(ds.record_version());
    }
    current
}

impl DataStore for InMemoryDataStreamStore {
    type Key = DataStreamKey;
    type Value = DataStreamInfo;
    type Filter = DataStreamFilter;
    type Field = DataStreamField;

    fn select_entries(
        &self,
        filter: &DataStreamFilter,
        _fields: Option<&[DataStreamField]>,
    ) -> Result<EntryIter<DataStreamKey, DataStreamInfo>> {
        let selected = self.select_matching(filter)?;
        Ok(Box::new(selected.into_iter().map(Ok)))
    }

    fn get(&self, key: &DataStreamKey) -> Result<Option<DataStreamInfo>> {
        Ok(self.inner.read().streams.get(&key.as_raw()).cloned())
    }

    fn put(&self, key: DataStreamKey, value: DataStreamInfo) -> Result<Option<DataStreamInfo>> {
        self.check_writable()?;
        if key.as_raw() == 0 {
            return Err(Error::validation("data stream id must be positive"));
        }
        let mut inner = self.inner.write();
        inner.next_id = inner.next_id.max(key.as_raw() + 1);
        Ok(inner.streams.insert(key.as_raw(), value))
    }

    fn remove(&self, key: &DataStreamKey) -> Result<Option<DataStreamInfo>> {
        self.check_writable()?;
        Ok(self.inner.write().streams.remove(&key.as_raw()))
    }

    fn select_all_filter(&self) -> DataStreamFilter {
        DataStreamFilter::all()
    }

    fn num_records(&self) -> u64 {
        self.inner.read().streams.len() as u64
    }

    fn clear(&self) -> Result<()> {
        self.check_writable()?;
        let mut inner = self.inner.write();
        inner.streams.clear();
        inner.next_id = 1;
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    fn backup(&self, sink: &mut dyn Write) -> Result<()> {
        let inner = self.inner.read();
        let snapshot = DataStreamSnapshot {
            next_id: inner.next_id,
            streams: inner
                .streams
                .iter()
                .map(|(id, ds)| (DataStreamKey::from_raw(*id), ds.clone()))
                .collect(),
        };
        serde_json::to_writer(sink, &snapshot)?;
        Ok(())
    }

    fn restore(&self, source: &mut dyn Read) -> Result<()> {
        self.check_writable()?;
        let snapshot: DataStreamSnapshot = serde_json::from_reader(source)?;
        let streams: BTreeMap<u64, DataStreamInfo> = snapshot
            .streams
            .into_iter()
            .map(|(key, ds)| (key.as_raw(), ds))
            .collect();
        let next_id = streams
            .keys()
            .next_back()
            .map_or(1, |max| max + 1)
            .max(snapshot.next_id);
        *self.inner.write() = DsInner { streams, next_id };
        Ok(())
    }
}

impl DataStreamStore for InMemoryDataStreamStore {
    /// Fails with [`Error::Duplicate`] if the procedure already has this
    /// version of the output.
    fn add(&self, info: DataStreamInfo) -> Result<DataStreamKey> {
        self.check_writable()?;
        let mut inner = self.inner.write();
        let series = series_of(&info);
        let exists = inner
            .streams
            .values()
            .any(|ds| series_of(ds) == series && ds.record_version() == info.record_version());
        if exists {
            return Err(Error::Duplicate(format!(
                "output {} version {} of {}",
                info.output_name(),
                info.record_version(),
                info.procedure_id()
            )));
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.streams.insert(id, info);
        Ok(DataStreamKey::from_raw(id))
    }

    fn latest_version(
        &self,
        procedure_uid: &str,
        output_name: &str,
    ) -> Result<Option<(DataStreamKey, DataStreamInfo)>> {
        let procedure_id = self
            .procedures
            .try_get()
            .and_then(|store| store.feature_id(procedure_uid))
            .map(|id| id.internal_id());
        let inner = self.inner.read();
        Ok(inner
            .streams
            .iter()
            .filter(|(_, ds)| {
                ds.output_name() == output_name
                    && (ds.procedure_id().unique_id() == Some(procedure_uid)
                        || Some(ds.procedure_id().internal_id()) == procedure_id)
            })
            .max_by_key(|(id, ds)| (ds.record_version(), **id))
            .map(|(id, ds)| (DataStreamKey::from_raw(*id), ds.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DataType, RecordEncoding, RecordField, RecordSchema};
    use crate::filter::ProcedureFilter;
    use crate::types::FeatureId;

    fn datastream(proc_id: u64, output: &str, version: u32) -> DataStreamInfo {
        DataStreamInfo::builder()
            .procedure(FeatureId::new(proc_id, format!("urn:proc:{}", proc_id)))
            .record_version(version)
            .record_schema(
                RecordSchema::new(output).with_field(RecordField::new("temp", DataType::Double)),
            )
            .record_encoding(RecordEncoding::default())
            .build()
            .unwrap()
    }

    #[test]
    fn test_add_and_latest_version() {
        let store = InMemoryDataStreamStore::new();
        store.add(datastream(1, "weather", 0)).unwrap();
        let v1 = store.add(datastream(1, "weather", 1)).unwrap();
        store.add(datastream(2, "weather", 5)).unwrap();
        assert!(matches!(
            store.add(datastream(1, "weather", 1)),
            Err(Error::Duplicate(_))
        ));

        let (key, ds) = store.latest_version("urn:proc:1", "weather").unwrap().unwrap();
        assert_eq!(key, v1);
        assert_eq!(ds.record_version(), 1);
        assert!(store.latest_version("urn:proc:1", "gps").unwrap().is_none());
    }

    #[test]
    fn test_current_version_filter() {
        let store = InMemoryDataStreamStore::new();
        store.add(datastream(1, "weather", 0)).unwrap();
        store.add(datastream(1, "weather", 1)).unwrap();
        store.add(datastream(1, "gps", 0)).unwrap();

        let filter = DataStreamFilter::builder().with_current_version().build().unwrap();
        let versions: Vec<(String, u32)> = store
            .select(&filter, None)
            .unwrap()
            .map(|ds| {
                let ds = ds.unwrap();
                (ds.output_name().to_string(), ds.record_version())
            })
            .collect();
        assert_eq!(versions, vec![("weather".to_string(), 1), ("gps".to_string(), 0)]);
    }

    #[test]
    fn test_id_only_procedure_filter_needs_no_link() {
        let store = InMemoryDataStreamStore::new();
        store.add(datastream(1, "weather", 0)).unwrap();
        store.add(datastream(2, "weather", 0)).unwrap();
        let filter = DataStreamFilter::builder()
            .with_procedures(ProcedureFilter::builder().with_internal_ids([2]).build().unwrap())
            .build()
            .unwrap();
        assert_eq!(store.count_matching(&filter).unwrap(), 1);

        let keyword = DataStreamFilter::builder()
            .with_procedures(ProcedureFilter::builder().with_parents([9]).build().unwrap())
            .build()
            .unwrap();
        assert!(matches!(
            store.count_matching(&keyword),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn test_limit_and_remove_entries() {
        let store = InMemoryDataStreamStore::new();
        for proc_id in 1..=5 {
            store.add(datastream(proc_id, "weather", 0)).unwrap();
        }
        let limited = DataStreamFilter::builder().with_limit(2).build().unwrap();
        assert_eq!(store.count_matching(&limited).unwrap(), 2);
        assert_eq!(store.remove_entries(&limited).unwrap(), 2);
        assert_eq!(store.size().unwrap(), 3);
    }
}
