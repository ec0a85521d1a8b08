//! # Data Stores
//!
//! Keyed, filterable record stores for features, procedures, data streams and
//! observations.
//!
//! ## The One Primitive
//!
//! Every store implements [`DataStore::select_entries`]; everything else a
//! caller may want (values only, keys only, counts, bulk removal, iteration)
//! is a default method derived from it plus `get`/`put`/`remove`:
//!
//! ```text
//!                     select_entries(filter, fields)
//!                                │
//!      ┌──────────────┬──────────┼───────────┬───────────────┐
//!      ▼              ▼          ▼           ▼               ▼
//!   select()    select_keys() count_matching() remove_entries() entries()
//!                                │
//!                          size(), is_empty()
//! ```
//!
//! ## Read Consistency
//!
//! The in-memory stores resolve nested filters first, then collect the
//! matching entries under a read lock and return an iterator over that
//! snapshot. Writers committed after the snapshot is taken are not visible to
//! it, and a long-running read never holds a lock while the caller iterates.
//!
//! ## Cross-Store Filters
//!
//! Nested filters (observations by data stream, data streams by procedure,
//! features of interest by observation, procedures by data stream) are
//! resolved through weak links set up by [`ObsDatabase::new`]. A store used
//! on its own answers nested filters with [`Error::Unsupported`].
//!
//! ## Field Projection
//!
//! `fields: None` hydrates complete values. `Some(&[...])` hydrates only the
//! listed optional fields; see [`FeatureField`] and [`ObsField`] for what
//! omitted fields are replaced with. Data streams are always fully hydrated.

use std::io::{Read, Write};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::data::{DataStreamInfo, Feature, ObsData};
use crate::error::{Error, Result};
use crate::filter::{
    DataStreamFilter, FoiFilter, ObsClusterFilter, ObsFilter, ObsStatsQuery, ProcedureFilter,
    QueryFilter,
};
use crate::stats::{ObsCluster, ObsStats};
use crate::types::{DataStreamKey, FeatureId, FeatureKey, ObsKey};

pub mod database;
pub mod datastream;
pub mod feature;
pub mod latest;
pub mod obs;

pub use database::ObsDatabase;
pub use datastream::InMemoryDataStreamStore;
pub use feature::{InMemoryFoiStore, InMemoryProcedureStore};
pub use obs::InMemoryObsStore;

/// Boxed iterator over selected entries.
pub type EntryIter<K, V> = Box<dyn Iterator<Item = Result<(K, V)>> + Send>;

/// Boxed iterator over selected items.
pub type ItemIter<T> = Box<dyn Iterator<Item = Result<T>> + Send>;

// =============================================================================
// Field Markers
// =============================================================================

/// Optional parts of a [`Feature`] a partial read may request.
///
/// An omitted description or geometry is returned as `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureField {
    Description,
    Geometry,
}

/// Optional parts of an [`ObsData`] a partial read may request.
///
/// Omitted parameters and location are returned as `None`; an omitted result
/// is returned as an empty block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObsField {
    Parameters,
    PhenomenonLocation,
    Result,
}

/// Data stream values have no optional parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataStreamField {
    RecordSchema,
}

pub(crate) fn wants<F: PartialEq>(fields: Option<&[F]>, field: F) -> bool {
    fields.map_or(true, |fields| fields.contains(&field))
}

// =============================================================================
// DataStore
// =============================================================================

/// Contract of a keyed, filterable record store.
///
/// All methods are synchronous and may block; streaming code calls them from
/// the blocking pool.
pub trait DataStore: Send + Sync {
    type Key: Clone + Ord + Send + Sync + 'static;
    type Value: Clone + Send + Sync + 'static;
    type Filter: QueryFilter;
    type Field: Copy + PartialEq + Send + Sync + 'static;

    /// Entries matching `filter`, in store order, at most `filter.limit()`.
    fn select_entries(
        &self,
        filter: &Self::Filter,
        fields: Option<&[Self::Field]>,
    ) -> Result<EntryIter<Self::Key, Self::Value>>;

    fn get(&self, key: &Self::Key) -> Result<Option<Self::Value>>;

    /// Inserts or replaces the value at `key`, returning the old value.
    fn put(&self, key: Self::Key, value: Self::Value) -> Result<Option<Self::Value>>;

    fn remove(&self, key: &Self::Key) -> Result<Option<Self::Value>>;

    /// Filter matching every record.
    fn select_all_filter(&self) -> Self::Filter;

    /// Number of stored records, counting every version.
    fn num_records(&self) -> u64;

    fn clear(&self) -> Result<()>;

    fn is_read_only(&self) -> bool;

    /// Makes pending changes durable. The in-memory stores have none.
    fn commit(&self) -> Result<()> {
        Ok(())
    }

    /// Writes a full snapshot of the store.
    fn backup(&self, sink: &mut dyn Write) -> Result<()>;

    /// Replaces the store contents with a snapshot written by `backup`.
    fn restore(&self, source: &mut dyn Read) -> Result<()>;

    // -------------------------------------------------------------------------
    // Derived operations
    // -------------------------------------------------------------------------

    fn select(
        &self,
        filter: &Self::Filter,
        fields: Option<&[Self::Field]>,
    ) -> Result<ItemIter<Self::Value>> {
        let entries = self.select_entries(filter, fields)?;
        Ok(Box::new(entries.map(|e| e.map(|(_, v)| v))))
    }

    fn select_keys(&self, filter: &Self::Filter) -> Result<ItemIter<Self::Key>> {
        let entries = self.select_entries(filter, Some(&[][..]))?;
        Ok(Box::new(entries.map(|e| e.map(|(k, _)| k))))
    }

    fn count_matching(&self, filter: &Self::Filter) -> Result<u64> {
        let mut count = 0;
        for entry in self.select_entries(filter, Some(&[][..]))? {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    /// Removes every matching record, returning how many were removed.
    fn remove_entries(&self, filter: &Self::Filter) -> Result<u64> {
        if self.is_read_only() {
            return Err(Error::ReadOnly);
        }
        let keys = self.select_keys(filter)?.collect::<Result<Vec<_>>>()?;
        let mut removed = 0;
        for key in keys {
            if self.remove(&key)?.is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn size(&self) -> Result<u64> {
        self.count_matching(&self.select_all_filter())
    }

    fn is_empty(&self) -> Result<bool> {
        Ok(self.size()? == 0)
    }

    fn contains_key(&self, key: &Self::Key) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    fn entries(&self) -> Result<EntryIter<Self::Key, Self::Value>> {
        self.select_entries(&self.select_all_filter(), None)
    }
}

// =============================================================================
// Specializations
// =============================================================================

/// A store of versioned features.
///
/// Lookups by unique id or by a bare internal id resolve to the current
/// version: the one valid now, or the most recent if none is valid yet.
pub trait FeatureStore: DataStore<Key = FeatureKey, Value = Feature, Field = FeatureField> {
    /// Adds a new feature. Fails with [`Error::Duplicate`] if its unique id
    /// is already used.
    fn add(&self, feature: Feature) -> Result<FeatureKey>;

    /// Adds a new version of an existing feature, keyed by the version's
    /// valid start time.
    fn add_version(&self, feature: Feature) -> Result<FeatureKey>;

    /// Identity of the feature with this unique id.
    fn feature_id(&self, unique_id: &str) -> Option<FeatureId>;

    /// Number of distinct features, ignoring versions.
    fn num_features(&self) -> u64;

    fn current_version(&self, unique_id: &str) -> Result<Option<Feature>> {
        match self.feature_id(unique_id) {
            Some(id) => self.get(&FeatureKey::latest(id)),
            None => Ok(None),
        }
    }

    fn current_version_by_id(&self, internal_id: u64) -> Result<Option<Feature>> {
        self.get(&FeatureKey::latest(FeatureId::from_internal(internal_id)))
    }

    /// Key of the current version.
    fn current_version_key(&self, unique_id: &str) -> Result<Option<FeatureKey>>;
}

/// A store of data stream descriptions.
pub trait DataStreamStore:
    DataStore<
    Key = DataStreamKey,
    Value = DataStreamInfo,
    Filter = DataStreamFilter,
    Field = DataStreamField,
>
{
    fn add(&self, info: DataStreamInfo) -> Result<DataStreamKey>;

    /// Latest version of the named output of a procedure.
    fn latest_version(
        &self,
        procedure_uid: &str,
        output_name: &str,
    ) -> Result<Option<(DataStreamKey, DataStreamInfo)>>;
}

/// A store of observations.
///
/// `select` returns observations in phenomenon time order, ties broken by
/// result time.
pub trait ObsStore:
    DataStore<Key = ObsKey, Value = ObsData, Filter = ObsFilter, Field = ObsField>
{
    /// Adds an observation, deriving its key from its data stream.
    fn add(&self, obs: ObsData) -> Result<ObsKey>;

    /// One statistics bucket per (data stream, feature of interest, result
    /// time) among the observations the query selects. Observations without
    /// a separate result time share the bucket of their series.
    fn select_statistics(&self, query: &ObsStatsQuery) -> Result<ItemIter<ObsStats>>;

    /// One cluster per (procedure, feature of interest).
    fn select_clusters(&self, filter: &ObsClusterFilter) -> Result<ItemIter<ObsCluster>>;
}

/// Procedures are features filtered by [`ProcedureFilter`].
pub trait ProcedureStore: FeatureStore<Filter = ProcedureFilter> {}

/// Features of interest are features filtered by [`FoiFilter`].
pub trait FoiStore: FeatureStore<Filter = FoiFilter> {}

// =============================================================================
// Store Links
// =============================================================================

/// Weak reference from one store to another, set once the stores are linked.
#[derive(Debug)]
pub(crate) struct Link<T> {
    target: RwLock<Weak<T>>,
    what: &'static str,
}

impl<T> Link<T> {
    pub(crate) fn new(what: &'static str) -> Self {
        Self {
            target: RwLock::new(Weak::new()),
            what,
        }
    }

    pub(crate) fn set(&self, target: &Arc<T>) {
        *self.target.write() = Arc::downgrade(target);
    }

    /// The linked store, or `Unsupported` when none is linked.
    pub(crate) fn get(&self) -> Result<Arc<T>> {
        self.target.read().upgrade().ok_or_else(|| {
            Error::Unsupported(format!("no {} store linked for nested filter", self.what))
        })
    }

    pub(crate) fn try_get(&self) -> Option<Arc<T>> {
        self.target.read().upgrade()
    }
}

/// Applies a limit to a collected selection.
pub(crate) fn into_limited_iter<T: Send + 'static>(items: Vec<T>, limit: u64) -> ItemIter<T> {
    let limit = usize::try_from(limit).unwrap_or(usize::MAX);
    Box::new(items.into_iter().take(limit).map(Ok))
}
