//! # Data Providers
//!
//! Entry points a service layer calls to answer observation queries. Each
//! returns a [`Subscription`] immediately; records then flow to the
//! subscriber under its own credit.
//!
//! ```text
//!   ObservationQuery ──► HistoricalProvider ──► ObsFilter ──► ObsStore ─┐
//!                   │                                                    ├──► Subscriber
//!                   └──► LiveProvider ──► topics ──► EventBus ──────────┘
//! ```
//!
//! Historical requests may ask for a replay speed, in which case results
//! are released at their recorded pace. Live requests for "latest" or
//! "current" time send the latest record of each output and complete.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::config::StreamingConfig;
use crate::data::{DataBlock, Feature, ObsData, RecordEncoding, RecordSchema};
use crate::error::{Error, Result};
use crate::event::{EventBus, Topic};
use crate::filter::{
    DataStreamFilter, FoiFilter, ObsFilter, ProcedureFilter, SpatialFilter, TemporalFilter,
    UidSet,
};
use crate::live::{LiveRequest, LiveSubscription};
use crate::store::{
    DataStore, FeatureStore, InMemoryDataStreamStore, InMemoryFoiStore, ItemIter, ObsDatabase,
};
use crate::subscription::{
    IterSource, MapSubscriber, ReplayPacing, StreamSubscription, Subscriber, Subscription,
};
use crate::timeout::TimeoutMonitor;
use crate::types::{DataStreamKey, Timestamp, TIME_MIN};

const TOO_MANY_OBS: &str =
    "too many observations requested, please further restrict the filtering options";

// =============================================================================
// Query
// =============================================================================

/// Protocol-neutral observation request.
///
/// Empty lists mean "no constraint". Procedure uids may end in `*`.
#[derive(Debug, Clone, Default)]
pub struct ObservationQuery {
    pub procedures: Vec<String>,
    /// Observed property URIs.
    pub observables: Vec<String>,
    pub output_name: Option<String>,
    /// Feature of interest uids.
    pub fois: Vec<String>,
    pub time: Option<TemporalFilter>,
    /// Applied to the location of the features of interest.
    pub spatial: Option<SpatialFilter>,
    /// Replay historical results at this multiple of real time.
    pub replay_speed: Option<f64>,
    pub limit: Option<u64>,
}

impl ObservationQuery {
    /// Data stream filter for the procedure, observable and output
    /// constraints.
    pub fn to_datastream_filter(&self) -> Result<DataStreamFilter> {
        let mut builder = DataStreamFilter::builder();
        if !self.procedures.is_empty() {
            builder.with_procedure_uids(self.procedures.iter().cloned());
        }
        if !self.observables.is_empty() {
            builder.with_observed_properties(self.observables.iter().cloned());
        }
        if let Some(name) = &self.output_name {
            builder.with_output_names([name.clone()]);
        }
        builder.build()
    }

    /// The equivalent observation store filter.
    pub fn to_obs_filter(&self) -> Result<ObsFilter> {
        let mut builder = ObsFilter::builder();
        builder.with_datastream_filter(self.to_datastream_filter()?);

        if !self.fois.is_empty() || self.spatial.is_some() {
            let mut foi = FoiFilter::builder();
            if !self.fois.is_empty() {
                foi.with_unique_ids(self.fois.iter().cloned());
            }
            if let Some(spatial) = &self.spatial {
                foi.with_location(spatial.clone());
            }
            builder.with_foi_filter(foi.build()?);
        }
        if let Some(time) = &self.time {
            builder.with_phenomenon_time(time.clone());
        }
        if let Some(limit) = self.limit {
            builder.with_limit(limit);
        }
        builder.build()
    }

    fn accepts_procedure(&self, uid: &str) -> bool {
        if self.procedures.is_empty() {
            return true;
        }
        UidSet::from_patterns(self.procedures.iter().cloned()).map_or(true, |set| set.matches(uid))
    }
}

/// An observation with its identifiers resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    pub procedure_uid: String,
    pub output_name: String,
    pub foi_uid: Option<String>,
    pub phenomenon_time: Timestamp,
    pub result_time: Timestamp,
    pub result: DataBlock,
}

/// Record structure of a result stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultTemplate {
    pub datastream: DataStreamKey,
    pub schema: RecordSchema,
    pub encoding: RecordEncoding,
}

// =============================================================================
// Historical Provider
// =============================================================================

/// Serves stored observations.
#[derive(Debug, Clone)]
pub struct HistoricalProvider {
    db: ObsDatabase,
    config: StreamingConfig,
}

impl HistoricalProvider {
    pub fn new(db: ObsDatabase, config: StreamingConfig) -> Self {
        Self { db, config }
    }

    pub fn database(&self) -> &ObsDatabase {
        &self.db
    }

    /// Structure of the results selected by `query`, taken from the current
    /// version of the first matching data stream.
    pub async fn get_result_template(&self, query: &ObservationQuery) -> Result<ResultTemplate> {
        let mut builder = DataStreamFilter::builder();
        if !query.procedures.is_empty() {
            builder.with_procedure_uids(query.procedures.iter().cloned());
        }
        if !query.observables.is_empty() {
            builder.with_observed_properties(query.observables.iter().cloned());
        }
        if let Some(name) = &query.output_name {
            builder.with_output_names([name.clone()]);
        }
        let filter = builder.with_current_version().with_limit(1).build()?;

        let datastreams = Arc::clone(self.db.datastreams());
        let found = blocking(move || {
            let mut entries = datastreams.select_entries(&filter, None)?;
            entries.next().transpose()
        })
        .await?;

        let (datastream, info) = found.ok_or_else(|| {
            Error::InvalidRequest(format!(
                "no data found for observables {:?}",
                query.observables
            ))
        })?;
        Ok(ResultTemplate {
            datastream,
            schema: info.record_schema().clone(),
            encoding: info.record_encoding().clone(),
        })
    }

    /// Streams observations matching `query`, identifiers resolved.
    pub async fn get_observations(
        &self,
        query: &ObservationQuery,
        subscriber: impl Subscriber<Observation>,
    ) -> Result<Subscription> {
        let filter = query.to_obs_filter()?;
        self.check_obs_count(&filter).await?;

        let db = self.db.clone();
        let source = IterSource::deferred(move || {
            let obs = db.observations().select(&filter, None)?;
            let mut resolver = Resolver::new(db.datastreams(), db.fois());
            let iter: ItemIter<Observation> =
                Box::new(obs.map(move |item| item.and_then(|obs| resolver.resolve(obs))));
            Ok(iter)
        });
        info!(procedures = ?query.procedures, "observation stream opened");
        Ok(StreamSubscription::spawn(source, subscriber, &self.config))
    }

    /// Streams result records matching `query`, optionally replayed at
    /// `query.replay_speed`.
    pub async fn get_results(
        &self,
        query: &ObservationQuery,
        subscriber: impl Subscriber<DataBlock>,
    ) -> Result<Subscription> {
        let filter = query.to_obs_filter()?;
        self.check_obs_count(&filter).await?;

        let store = Arc::clone(self.db.observations());
        let source = IterSource::deferred(move || store.select(&filter, None));
        let results = MapSubscriber::new(subscriber, |obs: ObsData| obs.result().clone());

        match query.replay_speed {
            Some(speed) => {
                let mut pacing = ReplayPacing::new(speed, |obs: &ObsData| obs.phenomenon_time())?;
                if let Some(begin) = query.time.as_ref().map(TemporalFilter::min) {
                    if begin != TIME_MIN {
                        pacing = pacing.starting_at(begin);
                    }
                }
                info!(speed, procedures = ?query.procedures, "result replay opened");
                Ok(StreamSubscription::spawn_replay(
                    source,
                    results,
                    &self.config,
                    pacing,
                ))
            }
            None => {
                info!(procedures = ?query.procedures, "result stream opened");
                Ok(StreamSubscription::spawn(source, results, &self.config))
            }
        }
    }

    pub fn get_features_of_interest(
        &self,
        filter: FoiFilter,
        subscriber: impl Subscriber<Feature>,
    ) -> Subscription {
        let store = Arc::clone(self.db.fois());
        let source = IterSource::deferred(move || store.select(&filter, None));
        StreamSubscription::spawn(source, subscriber, &self.config)
    }

    pub fn get_procedure_descriptions(
        &self,
        filter: ProcedureFilter,
        subscriber: impl Subscriber<Feature>,
    ) -> Subscription {
        let store = Arc::clone(self.db.procedures());
        let source = IterSource::deferred(move || store.select(&filter, None));
        StreamSubscription::spawn(source, subscriber, &self.config)
    }

    async fn check_obs_count(&self, filter: &ObsFilter) -> Result<()> {
        let max = self.config.max_obs_count;
        if max == u64::MAX {
            return Ok(());
        }
        let store = Arc::clone(self.db.observations());
        let filter = filter.clone();
        let count = blocking(move || store.count_matching(&filter)).await?;
        if count > max {
            debug!(count, max, "observation request rejected");
            return Err(Error::InvalidRequest(TOO_MANY_OBS.into()));
        }
        Ok(())
    }
}

/// Runs a store call on the blocking pool.
async fn blocking<R: Send + 'static>(f: impl FnOnce() -> Result<R> + Send + 'static) -> Result<R> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::StreamFault(format!("store task failed: {e}")))?
}

/// Caches data stream and FOI identifiers while resolving observations.
struct Resolver {
    datastreams: Arc<InMemoryDataStreamStore>,
    fois: Arc<InMemoryFoiStore>,
    streams: HashMap<DataStreamKey, (String, String)>,
    foi_uids: HashMap<u64, Option<String>>,
}

impl Resolver {
    fn new(datastreams: &Arc<InMemoryDataStreamStore>, fois: &Arc<InMemoryFoiStore>) -> Self {
        Self {
            datastreams: Arc::clone(datastreams),
            fois: Arc::clone(fois),
            streams: HashMap::new(),
            foi_uids: HashMap::new(),
        }
    }

    fn resolve(&mut self, obs: ObsData) -> Result<Observation> {
        let key = obs.datastream_id();
        if !self.streams.contains_key(&key) {
            let info = self
                .datastreams
                .get(&key)?
                .ok_or_else(|| Error::NotFound(format!("data stream {key}")))?;
            let procedure_uid = info
                .procedure_id()
                .unique_id()
                .map(str::to_string)
                .unwrap_or_else(|| info.procedure_id().to_string());
            self.streams
                .insert(key, (procedure_uid, info.output_name().to_string()));
        }
        let (procedure_uid, output_name) = self.streams[&key].clone();

        let foi_uid = if obs.has_foi() {
            match self.foi_uids.get(&obs.foi_id()) {
                Some(uid) => uid.clone(),
                None => {
                    let uid = self
                        .fois
                        .current_version_by_id(obs.foi_id())?
                        .map(|f| f.unique_id().to_string());
                    self.foi_uids.insert(obs.foi_id(), uid.clone());
                    uid
                }
            }
        } else {
            None
        };

        Ok(Observation {
            procedure_uid,
            output_name,
            foi_uid,
            phenomenon_time: obs.phenomenon_time(),
            result_time: obs.result_time(),
            result: obs.result().clone(),
        })
    }
}

// =============================================================================
// Live Provider
// =============================================================================

/// Serves records as they are published on the event bus.
#[derive(Debug, Clone)]
pub struct LiveProvider {
    bus: Arc<EventBus>,
    monitor: Arc<TimeoutMonitor>,
    config: StreamingConfig,
}

impl LiveProvider {
    pub fn new(bus: Arc<EventBus>, monitor: Arc<TimeoutMonitor>, config: StreamingConfig) -> Self {
        Self {
            bus,
            monitor,
            config,
        }
    }

    /// Outputs selected by `query`, excluded outputs left out.
    pub fn select_topics(&self, query: &ObservationQuery) -> Vec<Topic> {
        self.bus
            .topics()
            .into_iter()
            .filter(|topic| query.accepts_procedure(topic.procedure_uid()))
            .filter(|topic| {
                query
                    .output_name
                    .as_deref()
                    .map_or(true, |name| name == topic.output_name())
            })
            .filter(|topic| !self.config.is_excluded(topic.output_name()))
            .filter(|topic| {
                query.observables.is_empty()
                    || self.bus.output_schema(topic).map_or(false, |schema| {
                        query.observables.iter().any(|o| schema.has_observable(o))
                    })
            })
            .collect()
    }

    /// Streams live result records matching `query`.
    ///
    /// Fails with [`Error::InvalidRequest`] when no output matches or when
    /// the matched outputs do not share one record structure.
    pub fn get_results(
        &self,
        query: &ObservationQuery,
        subscriber: impl Subscriber<DataBlock>,
    ) -> Result<Subscription> {
        let topics = self.select_topics(query);
        let Some(first) = topics.first() else {
            return Err(Error::InvalidRequest(format!(
                "no live output matches procedures {:?}",
                query.procedures
            )));
        };

        if let Some(schema) = self.bus.output_schema(first) {
            let incompatible = topics.iter().skip(1).find(|topic| {
                self.bus
                    .output_schema(topic)
                    .map_or(false, |other| !schema.is_compatible(&other))
            });
            if let Some(topic) = incompatible {
                return Err(Error::InvalidRequest(format!(
                    "outputs {first} and {topic} have different record structures"
                )));
            }
        }

        let time = query.time.as_ref();
        let latest_only = time.map_or(false, |t| t.is_latest_time() || t.is_current_time());
        let window = match time {
            Some(t) if !latest_only => Some(t.extent().ok_or_else(|| {
                Error::empty(format!("time filter {t} matches no instant"))
            })?),
            _ => None,
        };
        let foi_uids = (!query.fois.is_empty())
            .then(|| query.fois.iter().cloned().collect::<BTreeSet<String>>());

        info!(topics = topics.len(), latest_only, "live result stream opened");
        let request = LiveRequest {
            topics,
            foi_uids,
            window,
            latest_only,
        };
        LiveSubscription::spawn(&self.bus, request, subscriber, &self.config, &self.monitor)
    }
}

// =============================================================================
// Tests
// =============================================================================
