mod common;

use chrono::Duration;
use proptest::prelude::*;

use obsdb::filter::{
    intersect_opt, intersect_range, intersect_temporal, DataStreamFilter, ObsFilter, QueryFilter,
    RangeFilter, TemporalFilter,
};
use obsdb::{DataStreamInfo, Error, FeatureId, FeatureKey, RecordEncoding, RecordSchema};

use common::{ts, weather_schema};

// =============================================================================
// Builders
// =============================================================================

#[test]
fn builders_are_single_use() {
    let mut builder = ObsFilter::builder();
    builder.with_limit(5);
    let built = builder.build().unwrap();

    builder.with_limit(10);
    assert!(matches!(builder.build(), Err(Error::Validation(_))));
    assert_eq!(built.limit(), 5);

    let mut ds = DataStreamFilter::builder();
    ds.with_output_names(["weather"]);
    let first = ds.build().unwrap();
    ds.with_output_names(["other"]);
    assert!(ds.build().is_err());
    assert!(first.output_names().unwrap().contains("weather"));
}

#[test]
fn feature_key_validation() {
    let err = FeatureKey::builder()
        .internal_id(0)
        .unique_id("")
        .build()
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let key = FeatureKey::builder().internal_id(5).build().unwrap();
    assert_eq!(key.internal_id(), 5);
    assert!(key.unique_id().is_none());
}

// =============================================================================
// Intersections
// =============================================================================

#[test]
fn intersection_with_absent_is_identity() {
    let range = RangeFilter::new(1, 5).unwrap();
    let left = intersect_opt(Some(&range), None, intersect_range).unwrap();
    let right = intersect_opt(None, Some(&range), intersect_range).unwrap();
    assert_eq!(left, Some(range.clone()));
    assert_eq!(right, Some(range));

    let none: Option<RangeFilter<i32>> = intersect_opt(None, None, intersect_range).unwrap();
    assert!(none.is_none());
}

#[test]
fn range_intersection() {
    let a = RangeFilter::new(1, 5).unwrap();
    let b = RangeFilter::new(3, 8).unwrap();
    let both = intersect_range(&a, &b).unwrap();
    assert_eq!((*both.min(), *both.max()), (3, 5));

    let c = RangeFilter::new(1, 2).unwrap();
    let d = RangeFilter::new(5, 8).unwrap();
    assert!(matches!(
        intersect_range(&c, &d),
        Err(Error::EmptyIntersection(_))
    ));
}

#[test]
fn temporal_special_cases_take_precedence() {
    let latest = intersect_temporal(&TemporalFilter::latest(), &TemporalFilter::all_times()).unwrap();
    assert!(latest.is_latest_time());

    let current = intersect_temporal(
        &TemporalFilter::current(Duration::milliseconds(500)),
        &TemporalFilter::current(Duration::milliseconds(2000)),
    )
    .unwrap();
    assert!(current.is_current_time());
    assert_eq!(current.current_tolerance(), Some(Duration::milliseconds(500)));
}

#[test]
fn disjoint_time_ranges_fail() {
    let a = TemporalFilter::range(ts(0), ts(10)).unwrap();
    let b = TemporalFilter::range(ts(20), ts(30)).unwrap();
    assert!(matches!(
        intersect_temporal(&a, &b),
        Err(Error::EmptyIntersection(_))
    ));
}

#[test]
fn obs_filter_intersection_keeps_both_dimensions() {
    let mut a = ObsFilter::builder();
    a.with_phenomenon_time(TemporalFilter::range(ts(0), ts(100)).unwrap());
    let mut b = ObsFilter::builder();
    b.with_phenomenon_time(TemporalFilter::range(ts(50), ts(200)).unwrap())
        .with_limit(7);

    let both = a.build().unwrap().intersect(&b.build().unwrap()).unwrap();
    let time = both.phenomenon_time().unwrap();
    assert_eq!((time.min(), time.max()), (ts(50), ts(100)));
    assert_eq!(both.limit(), 7);
}

// =============================================================================
// Predicates
// =============================================================================

fn datastream(schema: RecordSchema, version: u32) -> DataStreamInfo {
    DataStreamInfo::builder()
        .procedure(FeatureId::new(3, "urn:osh:sensor:1"))
        .record_schema(schema)
        .record_encoding(RecordEncoding::default())
        .record_version(version)
        .build()
        .unwrap()
}

#[test]
fn output_name_predicate_depends_only_on_name() {
    let filter = DataStreamFilter::builder()
        .with_output_names(["temp"])
        .build()
        .unwrap();

    for version in [0, 1, 7] {
        assert!(filter.test(&datastream(RecordSchema::new("temp"), version)));
        assert!(!filter.test(&datastream(weather_schema(), version)));
    }
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #[test]
    fn range_intersection_is_commutative_and_contained(
        a_min in -1000i64..1000, a_len in 0i64..500,
        b_min in -1000i64..1000, b_len in 0i64..500,
    ) {
        let a = RangeFilter::new(a_min, a_min + a_len).unwrap();
        let b = RangeFilter::new(b_min, b_min + b_len).unwrap();
        let disjoint = a_min + a_len < b_min || b_min + b_len < a_min;

        match (intersect_range(&a, &b), intersect_range(&b, &a)) {
            (Ok(ab), Ok(ba)) => {
                prop_assert!(!disjoint);
                prop_assert_eq!((ab.min(), ab.max()), (ba.min(), ba.max()));
                prop_assert!(a.test(ab.min()) && a.test(ab.max()));
                prop_assert!(b.test(ab.min()) && b.test(ab.max()));
            }
            (Err(Error::EmptyIntersection(_)), Err(Error::EmptyIntersection(_))) => {
                prop_assert!(disjoint);
            }
            other => prop_assert!(false, "unexpected result {:?}", other),
        }
    }
}
