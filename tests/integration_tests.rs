use std::path::PathBuf;

use tripscope::backend::LocalBackend;
use tripscope::engine::AggregationEngine;
use tripscope::join::{GeoJoinView, JoinedView};
use tripscope::loader::{load_trips, load_zones};
use tripscope::model::KeyValue;
use tripscope::partition::PartitionSampler;
use tripscope::query::{AggregationRequest, DerivedExpr, Predicate, Statistic};
use tripscope::ExploreError;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

fn joined() -> JoinedView {
    let facts = load_trips(fixture("trips.csv")).expect("Failed to load trips");
    let zones = load_zones(fixture("zones.csv")).expect("Failed to load zones");
    GeoJoinView::new()
        .build("trips_zones", &facts, &zones)
        .expect("Failed to join")
}

fn midtown_to_airport() -> AggregationRequest {
    AggregationRequest::new()
        .filter(Predicate::eq("pickup_zone_id", 1))
        .unwrap()
        .filter(Predicate::eq("dropoff_zone_id", 2))
        .unwrap()
        .derive(
            "trip_time",
            DerivedExpr::seconds_between("pickup_datetime", "dropoff_datetime"),
        )
        .unwrap()
        .derive("pickup_hour", DerivedExpr::hour_of("pickup_datetime"))
        .unwrap()
        .group_by(["pickup_hour"])
        .unwrap()
        .count()
        .unwrap()
        .aggregate("trip_time", Statistic::Mean)
        .unwrap()
}

#[test]
fn test_join_drops_unresolvable_trips() {
    let view = joined();
    // trip 11 has no dropoff zone
    assert_eq!(view.len(), 11);
    assert!(!view.row_ids().contains(&11));
    assert!(view.iter().all(|r| !r.pickup.neighborhood.is_empty()));
}

#[tokio::test]
async fn test_full_pipeline() {
    let view = joined();
    let engine = AggregationEngine::new(LocalBackend::new(4), 100);
    let result = engine
        .execute(&midtown_to_airport(), &view)
        .await
        .unwrap()
        .sorted_by_key();

    // trip 12 has no dropoff time, so it never reaches hour 9
    let expected = [(8, 3, 2000.0), (9, 2, 2100.0), (17, 2, 3300.0)];
    assert_eq!(result.len(), expected.len());
    for (row, (hour, count, mean)) in result.rows.iter().zip(expected) {
        assert_eq!(row.key, vec![KeyValue::Int(hour)]);
        assert_eq!(row.size, count);
        assert_eq!(result.stat(row, "count"), Some(count as f64));
        assert_eq!(result.stat(row, "mean_trip_time"), Some(mean));
    }
}

#[tokio::test]
async fn test_percentile_bands() {
    let view = joined();
    let request = midtown_to_airport()
        .percentiles("trip_time", &[0.1, 0.25, 0.5, 0.75, 0.9])
        .unwrap();
    let engine = AggregationEngine::new(LocalBackend::new(2), 100);
    let result = engine.execute(&request, &view).await.unwrap();

    let eight = result.find(&[KeyValue::Int(8)]).unwrap();
    let bands: Vec<f64> = ["p10", "p25", "p50", "p75", "p90"]
        .iter()
        .map(|p| result.stat(eight, &format!("{p}_trip_time")).unwrap())
        .collect();
    assert_eq!(bands[2], 1800.0);
    assert!((bands[3] - 2100.0).abs() < 1e-9);
    assert!((bands[4] - 2280.0).abs() < 1e-9);
    for row in &result.rows {
        assert!(row.stats[2..].windows(2).all(|w| w[0] <= w[1]));
    }
}

#[tokio::test]
async fn test_busiest_dropoffs() {
    let view = joined();
    let request = AggregationRequest::new()
        .filter(Predicate::eq("pickup_neighborhood", "Midtown"))
        .unwrap()
        .group_by(["dropoff_neighborhood"])
        .unwrap()
        .count()
        .unwrap()
        .top_n(1)
        .unwrap();
    let engine = AggregationEngine::new(LocalBackend::new(3), 1);
    let result = engine.execute(&request, &view).await.unwrap();
    assert_eq!(result.len(), 1);
    assert_eq!(result.rows[0].key, vec![KeyValue::from("Airport")]);
    assert_eq!(result.rows[0].size, 8);
}

#[tokio::test]
async fn test_result_too_large_is_not_truncated() {
    let view = joined();
    let request = AggregationRequest::new()
        .group_by(["trip_id"])
        .unwrap()
        .count()
        .unwrap();
    let engine = AggregationEngine::new(LocalBackend::new(2), 5);
    let err = engine.execute(&request, &view).await.unwrap_err();
    assert!(matches!(err, ExploreError::ResultTooLarge { cap: 5, .. }));
}

#[tokio::test]
async fn test_statistics_over_a_partition() {
    let view = joined();
    let parts = PartitionSampler::split(
        &view,
        &[Predicate::eq("pickup_zone_id", 1)],
        &[("train", 0.5), ("test", 0.5)],
        42,
    )
    .unwrap();
    assert_eq!(parts["train"].len() + parts["test"].len(), 9);

    let engine = AggregationEngine::new(LocalBackend::new(2), 100);
    let count = AggregationRequest::new().count().unwrap();
    for (name, part) in &parts {
        let result = engine.execute(&count, part).await.unwrap();
        let total: u64 = result.rows.iter().map(|r| r.size).sum();
        assert_eq!(total as usize, part.len(), "partition {name}");
    }
}
