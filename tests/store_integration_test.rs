use chrono::NaiveDate;
use strava_ingest::dashboard::{DashboardFilter, ALL};
use strava_ingest::db::LocalStore;
use strava_ingest::models::{NormalizedActivity, RawActivity};
use strava_ingest::normalizer::normalize_one;
use strava_ingest::warehouse::{SqliteWarehouse, TableRef, Warehouse};
use tempfile::TempDir;
use tokio_test::assert_ok;

fn raw(id: i64, meters: f64, start: &str) -> RawActivity {
    let mut activity = RawActivity::with_id(id);
    activity.name = Some(format!("Activity {}", id));
    activity.activity_type = Some("Run".to_string());
    activity.sport_type = Some("Run".to_string());
    activity.distance = Some(meters);
    activity.average_speed = Some(2.68224);
    activity.start_date_local = Some(start.to_string());
    activity
}

fn row(id: i64, sport: &str, date: &str, city: Option<&str>) -> NormalizedActivity {
    let mut activity = raw(id, 1609.344 * id as f64, &format!("{}T07:00:00Z", date));
    activity.sport_type = Some(sport.to_string());
    activity.start_latlng = Some(vec![40.0, -105.0]);
    let mut row = normalize_one(&activity);
    row.city = city.map(str::to_string);
    row
}

fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

fn table() -> TableRef {
    "local.strava.activities".parse().unwrap()
}

/// Upserting the same batch twice leaves the raw row count unchanged
#[tokio::test]
async fn test_upsert_raw_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let store = assert_ok!(LocalStore::open(&dir.path().join("strava.db")).await);

    let batch = vec![
        raw(1, 1609.344, "2024-01-01T07:00:00Z"),
        raw(2, 3218.688, "2024-01-02T07:00:00Z"),
        raw(3, 0.0, "2024-01-03T07:00:00Z"),
    ];

    let first = store.upsert_raw(&batch).await.unwrap();
    assert_eq!(first.inserted, 3);
    assert_eq!(first.skipped, 0);

    let second = store.upsert_raw(&batch).await.unwrap();
    assert_eq!(second.inserted, 0);
    assert_eq!(second.skipped, 3);
    assert_eq!(second.total(), 3);

    assert_eq!(store.raw_count().await.unwrap(), 3);
}

/// Existing raw payloads are kept when the same id arrives again
#[tokio::test]
async fn test_upsert_raw_does_not_overwrite() {
    let dir = TempDir::new().unwrap();
    let store = LocalStore::open(&dir.path().join("strava.db")).await.unwrap();

    store
        .upsert_raw(&[raw(7, 1000.0, "2024-01-01T07:00:00Z")])
        .await
        .unwrap();
    store
        .upsert_raw(&[raw(7, 9999.0, "2024-01-01T07:00:00Z")])
        .await
        .unwrap();
    store.rebuild_cleaned().await.unwrap();

    let cleaned = store.cleaned_activities().await.unwrap();
    assert_eq!(cleaned.len(), 1);
    assert_eq!(cleaned[0].distance_miles, Some(0.62));
}

/// Fields the typed record does not model still reach the raw table
#[tokio::test]
async fn test_upsert_raw_keeps_full_payload() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("strava.db");
    let store = LocalStore::open(&path).await.unwrap();

    let activity: RawActivity = serde_json::from_value(serde_json::json!({
        "id": 42,
        "name": "Tempo",
        "distance": 8046.72,
        "suffer_score": 57,
        "map": { "summary_polyline": "abc" }
    }))
    .unwrap();
    store.upsert_raw(&[activity]).await.unwrap();

    let pool = sqlx::SqlitePool::connect_with(
        sqlx::sqlite::SqliteConnectOptions::new().filename(&path),
    )
    .await
    .unwrap();
    let payload: String = sqlx::query_scalar("SELECT payload FROM raw_activities WHERE id = 42")
        .fetch_one(&pool)
        .await
        .unwrap();
    let stored: serde_json::Value = serde_json::from_str(&payload).unwrap();

    assert_eq!(stored["suffer_score"], 57);
    assert_eq!(stored["map"]["summary_polyline"], "abc");
    assert_eq!(stored["name"], "Tempo");

    store.rebuild_cleaned().await.unwrap();
    let cleaned = store.cleaned_activities().await.unwrap();
    assert_eq!(cleaned[0].distance_miles, Some(5.0));
}

/// Rebuild replaces the cleaned table with the normalized raw history
#[tokio::test]
async fn test_rebuild_cleaned_from_raw() {
    let dir = TempDir::new().unwrap();
    let store = LocalStore::open(&dir.path().join("nested/dir/strava.db"))
        .await
        .unwrap();

    store
        .upsert_raw(&[
            raw(1, 1609.344, "2024-01-01T07:00:00Z"),
            raw(2, 3218.688, "2024-01-03T07:00:00Z"),
        ])
        .await
        .unwrap();
    assert_eq!(store.rebuild_cleaned().await.unwrap(), 2);

    store
        .upsert_raw(&[raw(3, 0.0, "2024-01-02T07:00:00Z")])
        .await
        .unwrap();
    assert_eq!(store.rebuild_cleaned().await.unwrap(), 3);
    assert_eq!(store.cleaned_count().await.unwrap(), 3);

    let cleaned = store.cleaned_activities().await.unwrap();
    let ids: Vec<i64> = cleaned.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![2, 3, 1]);

    let first = &cleaned[0];
    assert_eq!(first.distance_miles, Some(2.0));
    assert_eq!(first.local_start_date, Some(date("2024-01-03")));
    assert_eq!(first.pace_min_per_mile, Some(10.0));
    assert_eq!(first.activity_type.as_deref(), Some("Run"));
}

/// Two loads leave only the second set in the table
#[tokio::test]
async fn test_sqlite_warehouse_full_replace() {
    let dir = TempDir::new().unwrap();
    let warehouse = SqliteWarehouse::open(&dir.path().join("warehouse.db"), &table())
        .await
        .unwrap();
    assert_eq!(warehouse.table(), "activities");

    let first = vec![
        row(1, "Run", "2024-01-05", Some("Boulder")),
        row(2, "Run", "2024-01-06", Some("Boulder")),
        row(3, "Ride", "2024-01-07", None),
    ];
    assert_eq!(assert_ok!(warehouse.load_replace(&first).await), 3);

    let second = vec![
        row(10, "Walk", "2024-01-08", Some("Denver")),
        row(11, "Run", "2024-01-09", None),
    ];
    assert_eq!(warehouse.load_replace(&second).await.unwrap(), 2);

    let filter = DashboardFilter::new(date("2000-01-01"), date("2100-01-01")).unwrap();
    let rows = warehouse.query(&filter).await.unwrap();
    let names: Vec<&str> = rows.iter().filter_map(|r| r.name.as_deref()).collect();
    assert_eq!(names, vec!["Activity 11", "Activity 10"]);
}

/// Loading an empty set empties the table
#[tokio::test]
async fn test_sqlite_warehouse_replace_with_nothing() {
    let dir = TempDir::new().unwrap();
    let warehouse = SqliteWarehouse::open(&dir.path().join("warehouse.db"), &table())
        .await
        .unwrap();

    warehouse
        .load_replace(&[row(1, "Run", "2024-01-05", None)])
        .await
        .unwrap();
    assert_eq!(warehouse.load_replace(&[]).await.unwrap(), 0);

    let domains = warehouse.domains().await.unwrap();
    assert!(domains.sports.is_empty());
    assert_eq!(domains.min_date, None);
}

/// A January query with "(All)" returns every type in that month, newest first
#[tokio::test]
async fn test_dashboard_query_filters() {
    let dir = TempDir::new().unwrap();
    let warehouse = SqliteWarehouse::open(&dir.path().join("warehouse.db"), &table())
        .await
        .unwrap();

    warehouse
        .load_replace(&[
            row(1, "Run", "2023-12-31", Some("Boulder")),
            row(2, "Run", "2024-01-01", Some("Boulder")),
            row(3, "Ride", "2024-01-15", Some("Denver")),
            row(4, "Walk", "2024-01-31", None),
            row(5, "Run", "2024-02-01", Some("Boulder")),
        ])
        .await
        .unwrap();

    let january = DashboardFilter::new(date("2024-01-01"), date("2024-01-31")).unwrap();

    let all = warehouse
        .query(&january.clone().with_types([ALL]).with_cities([ALL]))
        .await
        .unwrap();
    let dates: Vec<NaiveDate> = all.iter().map(|r| r.date).collect();
    assert_eq!(
        dates,
        vec![date("2024-01-31"), date("2024-01-15"), date("2024-01-01")]
    );
    let types: Vec<&str> = all.iter().filter_map(|r| r.subtype.as_deref()).collect();
    assert_eq!(types, vec!["Walk", "Ride", "Run"]);

    let rides = warehouse
        .query(&january.clone().with_types(["Ride", "Walk"]))
        .await
        .unwrap();
    assert_eq!(rides.len(), 2);

    let boulder = warehouse
        .query(&january.clone().with_cities(["Boulder"]))
        .await
        .unwrap();
    assert_eq!(boulder.len(), 1);
    assert_eq!(boulder[0].date, date("2024-01-01"));
    assert_eq!(boulder[0].distance_miles, Some(2.0));
    assert_eq!(boulder[0].start_latitude, Some(40.0));

    let domains = warehouse.domains().await.unwrap();
    assert_eq!(domains.sports, vec!["Ride", "Run", "Walk"]);
    assert_eq!(domains.cities, vec!["Boulder", "Denver"]);
    assert_eq!(domains.min_date, Some(date("2023-12-31")));
    assert_eq!(domains.max_date, Some(date("2024-02-01")));
    assert_eq!(domains.sport_choices()[0], ALL);
}
