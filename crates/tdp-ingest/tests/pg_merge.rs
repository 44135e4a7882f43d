//! Postgres-backed merge tests
//!
//! These exercise the real staging COPY and merge statements, so they need
//! a disposable database:
//!
//! ```text
//! TDP_TEST_DATABASE_URL=postgresql://localhost/tdp_test \
//!     cargo test -p tdp-ingest --test pg_merge -- --ignored
//! ```

use chrono::{DateTime, TimeZone, Utc};
use sqlx::PgPool;
use tdp_common::types::Row;
use tdp_ingest::extract::Source;
use tdp_ingest::repository::{PgRepository, StagingStore};

async fn test_repository() -> PgRepository {
    let url = std::env::var("TDP_TEST_DATABASE_URL")
        .expect("TDP_TEST_DATABASE_URL must point at a disposable database");
    let pool = PgPool::connect(&url).await.expect("connect test database");

    let repo = PgRepository::new(pool);
    repo.run_migrations().await.expect("apply migrations");

    sqlx::query("TRUNCATE staging_weather, core_weather, staging_stop_events, core_stop_events")
        .execute(repo.pool())
        .await
        .expect("truncate test tables");

    repo
}

fn weather_row(recorded_at: DateTime<Utc>, temperature: f64) -> Row {
    let mut row = Row::new();
    row.push("recorded_at", recorded_at);
    row.push("fetched_at", Utc::now());
    row.push("temperature", temperature);
    row.push("precipitation_probability", 20i64);
    row.push("wind_speed", 7.5);
    row.push("conditions", "Partly Cloudy");
    row
}

fn batch_tag(batch: &str) -> Vec<(String, String)> {
    vec![("source_batch".to_string(), batch.to_string())]
}

async fn core_weather_snapshot(repo: &PgRepository) -> Vec<(DateTime<Utc>, f64, String)> {
    sqlx::query_as(
        "SELECT recorded_at, temperature, source_batch FROM core_weather ORDER BY recorded_at",
    )
    .fetch_all(repo.pool())
    .await
    .expect("read core_weather")
}

#[tokio::test]
#[ignore] // requires TDP_TEST_DATABASE_URL
async fn merging_the_same_batch_twice_is_a_no_op() {
    let repo = test_repository().await;
    let hour = Utc.with_ymd_and_hms(2026, 8, 6, 14, 0, 0).unwrap();

    let staged = repo
        .load_staging(Source::Weather, &[weather_row(hour, 88.0)], &batch_tag("20260806T140000Z"))
        .await
        .unwrap();
    assert_eq!(staged, 1);

    repo.merge_core(Source::Weather).await.unwrap();
    let first = core_weather_snapshot(&repo).await;

    repo.merge_core(Source::Weather).await.unwrap();
    let second = core_weather_snapshot(&repo).await;

    assert_eq!(first, second);
    assert_eq!(second.len(), 1);
}

#[tokio::test]
#[ignore] // requires TDP_TEST_DATABASE_URL
async fn duplicate_keys_resolve_to_the_newest_batch() {
    let repo = test_repository().await;
    let hour = Utc.with_ymd_and_hms(2026, 8, 6, 15, 0, 0).unwrap();

    repo.load_staging(Source::Weather, &[weather_row(hour, 80.0)], &batch_tag("20260806T150000Z"))
        .await
        .unwrap();
    repo.load_staging(Source::Weather, &[weather_row(hour, 84.0)], &batch_tag("20260806T151000Z"))
        .await
        .unwrap();

    repo.merge_core(Source::Weather).await.unwrap();

    let rows = core_weather_snapshot(&repo).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].1, 84.0);
    assert_eq!(rows[0].2, "20260806T151000Z");
}

#[tokio::test]
#[ignore] // requires TDP_TEST_DATABASE_URL
async fn replaying_an_old_batch_does_not_regress_core() {
    let repo = test_repository().await;
    let hour = Utc.with_ymd_and_hms(2026, 8, 6, 16, 0, 0).unwrap();

    repo.load_staging(Source::Weather, &[weather_row(hour, 90.0)], &batch_tag("20260806T161000Z"))
        .await
        .unwrap();
    repo.merge_core(Source::Weather).await.unwrap();

    // Staging still holds history when an older batch is replayed.
    repo.load_staging(Source::Weather, &[weather_row(hour, 70.0)], &batch_tag("20260806T160000Z"))
        .await
        .unwrap();
    repo.merge_core(Source::Weather).await.unwrap();

    let rows = core_weather_snapshot(&repo).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].1, 90.0, "older batch must not overwrite newer core data");
}

#[tokio::test]
#[ignore] // requires TDP_TEST_DATABASE_URL
async fn stop_events_dedupe_on_their_composite_key() {
    let repo = test_repository().await;
    let observed = Utc.with_ymd_and_hms(2026, 8, 6, 8, 30, 0).unwrap();

    let row = |eta: Option<&str>| {
        let mut r = Row::new();
        r.push("vehicle_id", 101i64);
        r.push("route_id", 7i64);
        r.push("latitude", 33.7756);
        r.push("longitude", -84.3963);
        r.push("observed_at", observed);
        r.push("day_of_week", "Thursday");
        r.push("month", "08");
        r.push("time_of_day", "04:30:00");
        r.push("ground_speed", 18.5);
        r.push("next_stop_id", Some(42i64));
        r.push("eta_to_stop", eta.map(str::to_string));
        r
    };

    // Same observation seen in two overlapping cycles, second with an
    // updated ETA.
    repo.load_staging(
        Source::Transit,
        &[row(Some("04:35:00"))],
        &batch_tag("20260806T083000Z"),
    )
    .await
    .unwrap();
    repo.load_staging(
        Source::Transit,
        &[row(Some("04:37:00"))],
        &batch_tag("20260806T084000Z"),
    )
    .await
    .unwrap();

    repo.merge_core(Source::Transit).await.unwrap();

    let rows: Vec<(i64, Option<String>)> =
        sqlx::query_as("SELECT vehicle_id, eta_to_stop FROM core_stop_events")
            .fetch_all(repo.pool())
            .await
            .unwrap();

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].1.as_deref(), Some("04:37:00"));
}
