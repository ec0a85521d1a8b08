//! ObsDB Streaming Benchmark
//!
//! A standalone binary that streams stored observations to many concurrent
//! consumers through the full pipeline: store query, subscription actor,
//! record writer and buffered output.
//! Run with: `cargo run --bin stream_bench -- [OPTIONS]`
//!
//! This is separate from the regular test suite because:
//! 1. It can take a long time to run
//! 2. It's configurable via command-line arguments
//! 3. It reports detailed metrics
//!
//! # Examples
//!
//! ```bash
//! # Default run: 100k observations over 10 data streams, 10 consumers
//! cargo run --release --bin stream_bench
//!
//! # Slow consumers: the transport flips readiness every millisecond
//! cargo run --release --bin stream_bench -- --consumers 50 --slow
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{TimeZone, Utc};

use obsdb::output::MemoryTransport;
use obsdb::store::{DataStreamStore, FeatureStore, ObsStore};
use obsdb::{
    AsyncRecordWriter, BufferedAsyncOutput, DataBlock, DataStreamInfo, DataType, DataValue,
    Feature, FeatureId, HistoricalProvider, ObsData, ObsDatabase, ObservationQuery,
    RecordEncoding, RecordField, RecordSchema, StreamingConfig, TextResultEncoder,
};

/// Benchmark configuration
struct Config {
    /// Total number of observations to store
    num_obs: usize,
    /// Number of procedures, one data stream each
    num_datastreams: usize,
    /// Number of concurrent consumers
    consumers: usize,
    /// Records fetched per store read
    batch_size: usize,
    /// Whether the transport periodically stops accepting writes
    slow: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_obs: 100_000,
            num_datastreams: 10,
            consumers: 10,
            batch_size: 100,
            slow: false,
        }
    }
}

fn parse_args() -> Config {
    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--observations" | "-n" => {
                i += 1;
                config.num_obs = args[i].parse().expect("Invalid --observations value");
            }
            "--datastreams" | "-d" => {
                i += 1;
                config.num_datastreams = args[i].parse().expect("Invalid --datastreams value");
            }
            "--consumers" | "-c" => {
                i += 1;
                config.consumers = args[i].parse().expect("Invalid --consumers value");
            }
            "--batch" | "-b" => {
                i += 1;
                config.batch_size = args[i].parse().expect("Invalid --batch value");
            }
            "--slow" => {
                config.slow = true;
            }
            "--help" | "-h" => {
                println!(
                    r#"ObsDB Streaming Benchmark

Usage: stream_bench [OPTIONS]

Options:
  -n, --observations <N> Total observations stored (default: 100000)
  -d, --datastreams <N>  Number of data streams (default: 10)
  -c, --consumers <N>    Concurrent consumers (default: 10)
  -b, --batch <N>        Records per store fetch (default: 100)
  --slow                 Transport flips readiness every millisecond
  -h, --help             Show this help
"#
                );
                std::process::exit(0);
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                std::process::exit(1);
            }
        }
        i += 1;
    }

    config.num_datastreams = config.num_datastreams.max(1);
    config.consumers = config.consumers.max(1);
    config
}

fn populate(db: &ObsDatabase, config: &Config) -> Vec<String> {
    let schema = RecordSchema::new("weather")
        .with_field(RecordField::new("time", DataType::Time))
        .with_field(
            RecordField::new("temp", DataType::Double).with_definition("http://qudt.org/temperature"),
        );
    let per_stream = config.num_obs / config.num_datastreams;
    let mut uids = Vec::new();

    for d in 0..config.num_datastreams {
        let uid = format!("urn:bench:sensor:{d}");
        let key = db
            .procedures()
            .add(Feature::new(uid.as_str(), format!("Sensor {d}")))
            .expect("add procedure");
        let ds = db
            .datastreams()
            .add(
                DataStreamInfo::builder()
                    .procedure(FeatureId::new(key.internal_id(), uid.as_str()))
                    .record_schema(schema.clone())
                    .record_encoding(RecordEncoding::default())
                    .build()
                    .expect("build data stream"),
            )
            .expect("add data stream");

        for i in 0..per_stream {
            let t = Utc.timestamp_opt(1_600_000_000 + i as i64, 0).unwrap();
            let obs = ObsData::builder()
                .datastream(ds)
                .phenomenon_time(t)
                .result(DataBlock::new(vec![
                    DataValue::from(t),
                    DataValue::from(20.0 + (i % 100) as f64 / 10.0),
                ]))
                .build()
                .expect("build observation");
            db.observations().add(obs).expect("add observation");
        }
        uids.push(uid);
    }
    uids
}

#[tokio::main]
async fn main() {
    let config = parse_args();

    println!("ObsDB Streaming Benchmark");
    println!("=========================");
    println!("Observations: {}", config.num_obs);
    println!("Datastreams:  {}", config.num_datastreams);
    println!("Consumers:    {}", config.consumers);
    println!("Batch size:   {}", config.batch_size);
    println!(
        "Transport:    {}",
        if config.slow { "flapping readiness" } else { "always ready" }
    );
    println!();

    let db = ObsDatabase::new();
    let load_start = Instant::now();
    let uids = populate(&db, &config);
    let per_stream = (config.num_obs / config.num_datastreams) as u64;
    println!("Loaded in {:?}", load_start.elapsed());

    let provider = HistoricalProvider::new(
        db,
        StreamingConfig {
            batch_size: config.batch_size,
            ..StreamingConfig::default()
        },
    );

    // Metrics
    let records = Arc::new(AtomicU64::new(0));
    let bytes = Arc::new(AtomicU64::new(0));
    let errors = Arc::new(AtomicU64::new(0));

    println!("Streaming...");
    let start = Instant::now();

    let mut handles = Vec::new();
    for consumer in 0..config.consumers {
        let provider = provider.clone();
        let uid = uids[consumer % uids.len()].clone();
        let records = records.clone();
        let bytes = bytes.clone();
        let errors = errors.clone();
        let slow = config.slow;

        let handle = tokio::spawn(async move {
            let (transport, probe) = MemoryTransport::new();
            let writer = AsyncRecordWriter::new(
                TextResultEncoder::new(&RecordEncoding::default()).expect("text encoder"),
                BufferedAsyncOutput::new(transport),
            );
            let query = ObservationQuery {
                procedures: vec![uid],
                ..ObservationQuery::default()
            };

            let done = Arc::new(AtomicBool::new(false));
            let flapper = slow.then(|| {
                let writer = writer.clone();
                let probe = probe.clone();
                let done = done.clone();
                tokio::spawn(async move {
                    let mut ready = true;
                    while !done.load(Ordering::Relaxed) {
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        ready = !ready;
                        probe.set_ready(ready);
                        if ready {
                            writer.notify_ready();
                        }
                    }
                    probe.set_ready(true);
                    writer.notify_ready();
                })
            });

            if let Err(e) = provider.get_results(&query, writer.clone()).await {
                eprintln!("consumer {consumer}: {e}");
                errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
            let outcome = writer.finished().await;
            done.store(true, Ordering::Relaxed);
            if let Some(flapper) = flapper {
                let _ = flapper.await;
            }

            match outcome {
                Ok(count) => {
                    records.fetch_add(count, Ordering::Relaxed);
                    bytes.fetch_add(probe.written().len() as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    eprintln!("consumer {consumer}: {e}");
                    errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        });
        handles.push(handle);
    }

    for handle in handles {
        handle.await.unwrap();
    }
    let elapsed = start.elapsed();

    let streamed = records.load(Ordering::Relaxed);
    let error_count = errors.load(Ordering::Relaxed);

    println!();
    println!("Results");
    println!("-------");
    println!("Records streamed: {}", streamed);
    println!("Bytes written:    {}", bytes.load(Ordering::Relaxed));
    println!("Errors:           {}", error_count);
    println!("Duration:         {:?}", elapsed);
    println!(
        "Throughput:       {:.2} records/sec",
        streamed as f64 / elapsed.as_secs_f64()
    );
    println!();

    println!("Verifying...");
    assert_eq!(error_count, 0, "{} consumers failed", error_count);
    let expected = per_stream * config.consumers as u64;
    assert_eq!(
        streamed, expected,
        "Record count mismatch: {} streamed, {} expected",
        streamed, expected
    );
    println!("  Every consumer received its full data stream ✓");
    println!();
    println!("Benchmark PASSED ✓");
}
