#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use geo::Point;
use parking_lot::Mutex;

use obsdb::store::{DataStreamStore, FeatureStore, ObsStore};
use obsdb::{
    DataBlock, DataStreamInfo, DataStreamKey, DataType, DataValue, Error, Feature, FeatureId,
    ObsData, ObsDatabase, RecordEncoding, RecordField, RecordSchema, Subscriber, Subscription,
    Timestamp,
};

pub const TEMPERATURE: &str = "http://qudt.org/vocab/quantitykind/Temperature";
pub const PRESSURE: &str = "http://qudt.org/vocab/quantitykind/Pressure";

pub fn ts(secs: i64) -> Timestamp {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub fn weather_schema() -> RecordSchema {
    RecordSchema::new("weather")
        .with_field(RecordField::new("time", DataType::Time))
        .with_field(RecordField::new("temp", DataType::Double).with_definition(TEMPERATURE))
}

pub fn pressure_schema() -> RecordSchema {
    RecordSchema::new("pressure")
        .with_field(RecordField::new("time", DataType::Time))
        .with_field(RecordField::new("press", DataType::Double).with_definition(PRESSURE))
}

pub fn record(t: Timestamp, value: f64) -> DataBlock {
    DataBlock::new(vec![DataValue::from(t), DataValue::from(value)])
}

/// Second value of a record, as written by [`record`].
pub fn value_of(block: &DataBlock) -> f64 {
    match block.get(1) {
        Some(DataValue::Double(v)) => *v,
        other => panic!("unexpected record value {:?}", other),
    }
}

// =============================================================================
// Fixture
// =============================================================================

/// Two sensors, two features of interest and a weather and pressure output
/// on sensor 1, a weather output on sensor 2.
pub struct Fixture {
    pub db: ObsDatabase,
    pub sensor1: FeatureId,
    pub sensor2: FeatureId,
    pub foi_a: u64,
    pub foi_b: u64,
    pub weather1: DataStreamKey,
    pub pressure1: DataStreamKey,
    pub weather2: DataStreamKey,
}

impl Fixture {
    /// Stores `count` observations per data stream, one per second, values
    /// equal to the second index. Sensor 1 weather alternates FOIs a and b.
    pub fn new(count: i64) -> Self {
        let db = ObsDatabase::new();

        let s1 = db
            .procedures()
            .add(Feature::new("urn:osh:sensor:weather:001", "Weather station 1"))
            .unwrap();
        let s2 = db
            .procedures()
            .add(Feature::new("urn:osh:sensor:weather:002", "Weather station 2"))
            .unwrap();
        let foi_a = db
            .fois()
            .add(
                Feature::new("urn:osh:foi:site-a", "Site A")
                    .with_geometry(Point::new(1.0, 1.0)),
            )
            .unwrap();
        let foi_b = db
            .fois()
            .add(
                Feature::new("urn:osh:foi:site-b", "Site B")
                    .with_geometry(Point::new(10.0, 10.0)),
            )
            .unwrap();

        let sensor1 = FeatureId::new(s1.internal_id(), "urn:osh:sensor:weather:001");
        let sensor2 = FeatureId::new(s2.internal_id(), "urn:osh:sensor:weather:002");
        let weather1 = add_datastream(&db, &sensor1, weather_schema());
        let pressure1 = add_datastream(&db, &sensor1, pressure_schema());
        let weather2 = add_datastream(&db, &sensor2, weather_schema());

        for i in 0..count {
            let foi = if i % 2 == 0 {
                foi_a.internal_id()
            } else {
                foi_b.internal_id()
            };
            add_obs(&db, weather1, foi, ts(i), i as f64);
            add_obs(&db, pressure1, 0, ts(i), 1000.0 + i as f64);
            add_obs(&db, weather2, 0, ts(i), 100.0 + i as f64);
        }

        Self {
            db,
            sensor1,
            sensor2,
            foi_a: foi_a.internal_id(),
            foi_b: foi_b.internal_id(),
            weather1,
            pressure1,
            weather2,
        }
    }
}

pub fn add_datastream(db: &ObsDatabase, procedure: &FeatureId, schema: RecordSchema) -> DataStreamKey {
    db.datastreams()
        .add(
            DataStreamInfo::builder()
                .procedure(procedure.clone())
                .record_schema(schema)
                .record_encoding(RecordEncoding::default())
                .build()
                .unwrap(),
        )
        .unwrap()
}

pub fn add_obs(db: &ObsDatabase, ds: DataStreamKey, foi: u64, t: Timestamp, value: f64) {
    let obs = ObsData::builder()
        .datastream(ds)
        .foi(foi)
        .phenomenon_time(t)
        .result(record(t, value))
        .build()
        .unwrap();
    db.observations().add(obs).unwrap();
}

// =============================================================================
// Subscribers
// =============================================================================

#[derive(Debug)]
pub struct Log<T> {
    pub items: Vec<T>,
    pub errors: Vec<Error>,
    pub completions: usize,
    pub subscription: Option<Subscription>,
}

impl<T> Default for Log<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            errors: Vec::new(),
            completions: 0,
            subscription: None,
        }
    }
}

impl<T> Log<T> {
    pub fn is_terminated(&self) -> bool {
        self.completions > 0 || !self.errors.is_empty()
    }
}

/// Subscriber recording every callback. Requests `initial` on subscribe and,
/// if `refill` is set, requests `refill` more each time that many items have
/// arrived.
pub struct Recorder<T> {
    log: Arc<Mutex<Log<T>>>,
    initial: Option<u64>,
    refill: Option<u64>,
    since_refill: u64,
}

impl<T> Recorder<T> {
    pub fn new(initial: Option<u64>) -> (Self, Arc<Mutex<Log<T>>>) {
        let log = Arc::new(Mutex::new(Log::default()));
        let recorder = Self {
            log: Arc::clone(&log),
            initial,
            refill: None,
            since_refill: 0,
        };
        (recorder, log)
    }

    /// Requests `n`, then `n` more after every `n` items.
    pub fn in_chunks(n: u64) -> (Self, Arc<Mutex<Log<T>>>) {
        let (mut recorder, log) = Self::new(Some(n));
        recorder.refill = Some(n);
        (recorder, log)
    }
}

impl<T: Send + 'static> Subscriber<T> for Recorder<T> {
    fn on_subscribe(&mut self, subscription: Subscription) {
        if let Some(n) = self.initial {
            subscription.request(n);
        }
        self.log.lock().subscription = Some(subscription);
    }

    fn on_next(&mut self, item: T) {
        let mut log = self.log.lock();
        log.items.push(item);
        if let Some(n) = self.refill {
            self.since_refill += 1;
            if self.since_refill == n {
                self.since_refill = 0;
                if let Some(subscription) = &log.subscription {
                    subscription.request(n);
                }
            }
        }
    }

    fn on_error(&mut self, error: Error) {
        self.log.lock().errors.push(error);
    }

    fn on_complete(&mut self) {
        self.log.lock().completions += 1;
    }
}

pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}

/// Waits until the subscription behind `log` has completed or failed.
pub async fn terminated<T>(log: &Arc<Mutex<Log<T>>>) {
    eventually(Duration::from_secs(5), Duration::from_millis(5), || {
        log.lock().is_terminated().then_some(())
    })
    .await
}
