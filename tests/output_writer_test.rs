mod common;

use std::io::Write;
use std::time::Duration;

use proptest::prelude::*;

use obsdb::output::MemoryTransport;
use obsdb::writer::JsonArrayEncoder;
use obsdb::{
    AsyncRecordWriter, BufferedAsyncOutput, Error, HistoricalProvider, ObservationQuery,
    RecordEncoding, StreamingConfig, TextResultEncoder, WriteListener, WriterStatus,
};

use common::{ts, Fixture};

struct Ignore;

impl WriteListener<MemoryTransport> for Ignore {
    fn on_write_possible(
        &mut self,
        _output: &mut BufferedAsyncOutput<MemoryTransport>,
    ) -> obsdb::Result<()> {
        Ok(())
    }
}

// =============================================================================
// Buffered Output
// =============================================================================

proptest! {
    #[test]
    fn deferred_writes_reach_the_transport_unchanged(
        chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 0..32),
    ) {
        let (transport, probe) = MemoryTransport::new();
        let mut output = BufferedAsyncOutput::with_capacity(transport, 4096);
        probe.set_ready(false);

        for chunk in &chunks {
            output.write_all(chunk).unwrap();
        }
        output.flush().unwrap();
        prop_assert!(probe.written().is_empty());
        prop_assert_eq!(probe.flushes(), 0);

        probe.set_ready(true);
        output.notify_ready(&mut Ignore).unwrap();

        let expected: Vec<u8> = chunks.concat();
        prop_assert_eq!(probe.written(), expected);
        prop_assert_eq!(probe.flushes(), 1);
        prop_assert!(output.buffered().is_empty());
    }
}

#[test]
fn overflow_while_not_ready_is_fatal_for_the_write() {
    let (transport, probe) = MemoryTransport::new();
    let mut output = BufferedAsyncOutput::with_capacity(transport, 8);
    probe.set_ready(false);

    output.write_bytes(b"12345").unwrap();
    let err = output.write_bytes(b"6789").unwrap_err();
    assert!(matches!(
        err,
        Error::CapacityExceeded {
            what: "output buffer",
            capacity: 8
        }
    ));
    assert_eq!(output.buffered(), b"12345");
}

#[test]
fn ready_output_writes_through_in_order() {
    let (transport, probe) = MemoryTransport::new();
    let mut output = BufferedAsyncOutput::new(transport);

    output.write_bytes(b"a").unwrap();
    probe.set_ready(false);
    output.write_bytes(b"b").unwrap();
    probe.set_ready(true);
    output.write_bytes(b"c").unwrap();

    assert_eq!(probe.written(), b"abc");
    output.close().unwrap();
    assert!(probe.is_closed());
}

// =============================================================================
// Record Writer
// =============================================================================

fn pressure_query() -> ObservationQuery {
    ObservationQuery {
        procedures: vec!["urn:osh:sensor:weather:001".into()],
        output_name: Some("pressure".into()),
        ..ObservationQuery::default()
    }
}

#[tokio::test]
async fn results_are_written_as_delimited_text() {
    let f = Fixture::new(3);
    let provider = HistoricalProvider::new(f.db.clone(), StreamingConfig::default());
    let (transport, probe) = MemoryTransport::new();
    let writer = AsyncRecordWriter::new(
        TextResultEncoder::new(&RecordEncoding::default()).unwrap(),
        BufferedAsyncOutput::new(transport),
    );

    provider.get_results(&pressure_query(), writer.clone()).await.unwrap();
    assert_eq!(writer.finished().await.unwrap(), 3);

    let expected: String = (0..3)
        .map(|i| format!("{},{}\n", ts(i).to_rfc3339(), 1000 + i))
        .collect();
    assert_eq!(String::from_utf8(probe.written()).unwrap(), expected);
    assert!(probe.is_closed());
    assert_eq!(writer.status(), WriterStatus::Finished { records: 3 });
}

#[tokio::test]
async fn slow_transport_receives_every_record() {
    let f = Fixture::new(200);
    let provider = HistoricalProvider::new(
        f.db.clone(),
        StreamingConfig {
            batch_size: 16,
            ..StreamingConfig::default()
        },
    );
    let (transport, probe) = MemoryTransport::new();
    let writer = AsyncRecordWriter::new(
        TextResultEncoder::new(&RecordEncoding::default()).unwrap(),
        BufferedAsyncOutput::new(transport),
    );

    let flapper = {
        let writer = writer.clone();
        let probe = probe.clone();
        tokio::spawn(async move {
            let mut ready = true;
            while writer.status() == WriterStatus::Running {
                tokio::time::sleep(Duration::from_millis(1)).await;
                ready = !ready;
                probe.set_ready(ready);
                if ready {
                    writer.notify_ready();
                }
            }
        })
    };

    provider.get_results(&pressure_query(), writer.clone()).await.unwrap();
    let written = tokio::time::timeout(Duration::from_secs(10), writer.finished())
        .await
        .unwrap()
        .unwrap();
    flapper.await.unwrap();

    assert_eq!(written, 200);
    let text = String::from_utf8(probe.written()).unwrap();
    assert_eq!(text.lines().count(), 200);
    assert!(text.lines().last().unwrap().ends_with(",1199"));
}

#[tokio::test]
async fn observations_are_written_as_a_json_array() {
    let f = Fixture::new(4);
    let provider = HistoricalProvider::new(f.db.clone(), StreamingConfig::default());
    let (transport, probe) = MemoryTransport::new();
    let writer = AsyncRecordWriter::new(JsonArrayEncoder::new(), BufferedAsyncOutput::new(transport));

    provider
        .get_observations(&pressure_query(), writer.clone())
        .await
        .unwrap();
    assert_eq!(writer.finished().await.unwrap(), 4);

    let json: serde_json::Value = serde_json::from_slice(&probe.written()).unwrap();
    let array = json.as_array().unwrap();
    assert_eq!(array.len(), 4);
    assert_eq!(array[0]["output_name"], "pressure");
    assert_eq!(array[0]["procedure_uid"], "urn:osh:sensor:weather:001");
}

#[tokio::test]
async fn client_disconnect_cancels_the_stream() {
    let f = Fixture::new(100);
    let provider = HistoricalProvider::new(f.db.clone(), StreamingConfig::default());
    let (transport, probe) = MemoryTransport::new();
    probe.set_ready(false);
    let writer = AsyncRecordWriter::new(
        TextResultEncoder::new(&RecordEncoding::default()).unwrap(),
        BufferedAsyncOutput::new(transport),
    );

    let subscription = provider
        .get_results(&pressure_query(), writer.clone())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    probe.disconnect();
    writer.notify_ready();
    probe.set_ready(true);
    writer.notify_ready();

    let err = tokio::time::timeout(Duration::from_secs(5), writer.finished())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, Error::StreamFault(_)));
    common::eventually(Duration::from_secs(5), Duration::from_millis(5), || {
        subscription.is_cancelled().then_some(())
    })
    .await;
    assert!(probe.written().is_empty());
}

// =============================================================================
// Configuration
// =============================================================================

#[test]
fn config_loads_from_json_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("streaming.json");
    std::fs::write(
        &path,
        r#"{
            "batch_size": 250,
            "live_data_timeout_ms": 2500,
            "excluded_outputs": ["video"]
        }"#,
    )
    .unwrap();

    let config = StreamingConfig::load(&path).unwrap();
    assert_eq!(config.batch_size, 250);
    assert_eq!(config.live_data_timeout, Duration::from_millis(2500));
    assert!(config.is_excluded("video"));
    assert_eq!(
        config.output_buffer_size,
        StreamingConfig::default().output_buffer_size
    );
}

#[test]
fn invalid_config_is_rejected() {
    assert!(matches!(
        StreamingConfig::from_json(r#"{ "batch_size": 0 }"#),
        Err(Error::Validation(_))
    ));
    assert!(matches!(
        StreamingConfig::from_json("{ not json"),
        Err(Error::Json(_))
    ));
    assert!(matches!(
        StreamingConfig::load("/nonexistent/streaming.json"),
        Err(Error::Io(_))
    ));
}
