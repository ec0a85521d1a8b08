mod common;

use chrono::Duration;
use geo::{coord, Rect};

use obsdb::filter::{
    DataStreamFilter, FoiFilter, ObsClusterFilter, ObsFilter, ObsStatsQuery, ProcedureFilter,
    SpatialFilter, TemporalFilter,
};
use obsdb::store::{DataStore, ObsStore};
use obsdb::{Error, ObsData, ObsDatabase};

use common::{add_obs, record, ts, value_of, Fixture};

fn values(db: &ObsDatabase, filter: &ObsFilter) -> Vec<f64> {
    db.observations()
        .select(filter, None)
        .unwrap()
        .map(|obs| value_of(obs.unwrap().result()))
        .collect()
}

// =============================================================================
// Nested Filters
// =============================================================================

#[test]
fn procedure_uid_wildcards_reach_observations() {
    let f = Fixture::new(4);

    let all_weather = ObsFilter::builder()
        .with_procedures(
            ProcedureFilter::builder()
                .with_unique_ids(["urn:osh:sensor:weather:*"])
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();
    assert_eq!(f.db.observations().count_matching(&all_weather).unwrap(), 12);

    let sensor1 = ObsFilter::builder()
        .with_procedures(
            ProcedureFilter::builder()
                .with_unique_ids(["urn:osh:sensor:weather:001"])
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();
    assert_eq!(f.db.observations().count_matching(&sensor1).unwrap(), 8);
}

#[test]
fn procedure_outputs_select_one_stream_in_time_order() {
    let f = Fixture::new(4);
    let filter = ObsFilter::builder()
        .with_procedure_outputs("urn:osh:sensor:weather:001", ["pressure"])
        .build()
        .unwrap();
    assert_eq!(values(&f.db, &filter), vec![1000.0, 1001.0, 1002.0, 1003.0]);
}

#[test]
fn foi_location_filter_selects_nearby_observations() {
    let f = Fixture::new(10);
    let near_a = SpatialFilter::bbox(Rect::new(
        coord! { x: 0.0, y: 0.0 },
        coord! { x: 2.0, y: 2.0 },
    ));
    let filter = ObsFilter::builder()
        .with_foi_filter(FoiFilter::builder().with_location(near_a).build().unwrap())
        .build()
        .unwrap();

    assert_eq!(values(&f.db, &filter), vec![0.0, 2.0, 4.0, 6.0, 8.0]);
}

#[test]
fn datastreams_with_matching_observations() {
    let f = Fixture::new(4);
    let filter = DataStreamFilter::builder()
        .with_observations(ObsFilter::builder().with_fois([f.foi_b]).build().unwrap())
        .build()
        .unwrap();

    let keys: Vec<_> = f
        .db
        .datastreams()
        .select_keys(&filter)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(keys, vec![f.weather1]);
}

#[test]
fn fois_with_matching_observations() {
    let f = Fixture::new(4);
    let filter = FoiFilter::builder()
        .with_observations(
            ObsFilter::builder()
                .with_datastreams([f.weather1.as_raw()])
                .with_phenomenon_time(TemporalFilter::range(ts(1), ts(1)).unwrap())
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();

    let uids: Vec<String> = f
        .db
        .fois()
        .select(&filter, None)
        .unwrap()
        .map(|foi| foi.unwrap().unique_id().to_string())
        .collect();
    assert_eq!(uids, vec!["urn:osh:foi:site-b".to_string()]);
}

// =============================================================================
// Ordering and Latest
// =============================================================================

#[test]
fn result_time_breaks_phenomenon_time_ties() {
    let f = Fixture::new(2);
    for (result_secs, value) in [(5, 105.0), (3, 103.0)] {
        let obs = ObsData::builder()
            .datastream(f.weather2)
            .phenomenon_time(ts(0))
            .result_time(ts(result_secs))
            .result(record(ts(0), value))
            .build()
            .unwrap();
        f.db.observations().add(obs).unwrap();
    }

    let filter = ObsFilter::builder()
        .with_datastreams([f.weather2.as_raw()])
        .build()
        .unwrap();
    assert_eq!(values(&f.db, &filter), vec![100.0, 103.0, 105.0, 101.0]);
}

#[test]
fn latest_keeps_newest_per_feature_of_interest() {
    let f = Fixture::new(10);
    let filter = ObsFilter::builder()
        .with_datastreams([f.weather1.as_raw()])
        .with_phenomenon_time(TemporalFilter::latest())
        .build()
        .unwrap();

    let latest: Vec<(u64, f64)> = f
        .db
        .observations()
        .select(&filter, None)
        .unwrap()
        .map(|obs| {
            let obs = obs.unwrap();
            (obs.foi_id(), value_of(obs.result()))
        })
        .collect();
    assert_eq!(latest, vec![(f.foi_a, 8.0), (f.foi_b, 9.0)]);
}

#[test]
fn same_key_from_another_datastream_is_duplicate() {
    let f = Fixture::new(1);
    let err = {
        let obs = ObsData::builder()
            .datastream(f.pressure1)
            .foi(f.foi_a)
            .phenomenon_time(ts(0))
            .result(record(ts(0), -1.0))
            .build()
            .unwrap();
        f.db.observations().add(obs).unwrap_err()
    };
    assert!(matches!(err, Error::Duplicate(_)));
}

// =============================================================================
// Statistics and Clusters
// =============================================================================

#[test]
fn statistics_with_histogram() {
    let f = Fixture::new(10);
    let weather1 = ObsFilter::builder()
        .with_datastreams([f.weather1.as_raw()])
        .build()
        .unwrap();

    let per_foi: Vec<_> = f
        .db
        .observations()
        .select_statistics(
            &ObsStatsQuery::builder()
                .with_obs_filter(weather1.clone())
                .build()
                .unwrap(),
        )
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(per_foi.len(), 2);
    assert!(per_foi.iter().all(|s| s.total_obs_count() == 5));
    assert!(per_foi.iter().all(|s| s.histogram().is_none()));

    let aggregated: Vec<_> = f
        .db
        .observations()
        .select_statistics(
            &ObsStatsQuery::builder()
                .with_obs_filter(weather1)
                .with_histogram_bin_size(Duration::seconds(5))
                .aggregate_fois(true)
                .build()
                .unwrap(),
        )
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(aggregated.len(), 1);
    let stats = &aggregated[0];
    assert_eq!(stats.total_obs_count(), 10);
    assert_eq!(stats.datastream_id(), f.weather1);
    let range = stats.phenomenon_time_range().unwrap();
    assert_eq!((range.begin(), range.end()), (ts(0), ts(9)));
    assert_eq!(stats.histogram().unwrap().counts(), &[5, 5]);
}

#[test]
fn clusters_per_procedure_and_feature_of_interest() {
    let f = Fixture::new(6);
    let all: Vec<_> = f
        .db
        .observations()
        .select_clusters(&ObsClusterFilter::all())
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    // sensor 1: site a, site b, none; sensor 2: none
    assert_eq!(all.len(), 4);

    let sensor2 = ObsClusterFilter::builder()
        .with_procedures([f.sensor2.internal_id()])
        .build()
        .unwrap();
    let clusters: Vec<_> = f
        .db
        .observations()
        .select_clusters(&sensor2)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(clusters.len(), 1);
    let range = clusters[0].phenomenon_time_range().unwrap();
    assert_eq!((range.begin(), range.end()), (ts(0), ts(5)));
}

// =============================================================================
// Snapshots and Read-Only Mode
// =============================================================================

#[test]
fn backup_restores_into_a_fresh_database() {
    let f = Fixture::new(5);
    let dir = tempfile::tempdir().unwrap();
    f.db.backup_dir(dir.path()).unwrap();

    let restored = ObsDatabase::new();
    restored.restore_dir(dir.path()).unwrap();
    assert_eq!(restored.observations().num_records(), 15);

    let filter = ObsFilter::builder()
        .with_procedure_outputs("urn:osh:sensor:weather:001", ["pressure"])
        .build()
        .unwrap();
    assert_eq!(
        values(&restored, &filter),
        vec![1000.0, 1001.0, 1002.0, 1003.0, 1004.0]
    );
}

#[test]
fn read_only_database_rejects_writes_but_serves_reads() {
    let f = Fixture::new(3);
    f.db.set_read_only(true);

    let obs = ObsData::builder()
        .datastream(f.weather1)
        .phenomenon_time(ts(100))
        .result(record(ts(100), 0.0))
        .build()
        .unwrap();
    assert!(matches!(f.db.observations().add(obs), Err(Error::ReadOnly)));
    assert_eq!(f.db.observations().num_records(), 9);

    f.db.set_read_only(false);
    add_obs(&f.db, f.weather1, 0, ts(100), 0.0);
    assert_eq!(f.db.observations().num_records(), 10);
}
