use chrono::NaiveDate;
use serde_json::json;
use std::path::Path;
use strava_ingest::config::Config;
use strava_ingest::dashboard::DashboardFilter;
use strava_ingest::error::AppError;
use strava_ingest::pipeline::{Pipeline, RunOptions};
use strava_ingest::warehouse::{SqliteWarehouse, Warehouse};
use tempfile::TempDir;
use tokio_test::assert_ok;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CONFIG: &str = r#"
strava:
  client_id: "12345"
  client_secret: secret
  refresh_token: refresh
  per_page: 50
warehouse:
  backend: sqlite
  table: local.strava.activities
geocode:
  enabled: true
  precision: 3
"#;

/// Config pointed at the mock server and a scratch directory
fn test_config(server: &MockServer, dir: &Path) -> Config {
    let mut config = Config::from_yaml(CONFIG).unwrap();
    config.strava.api_base_url = server.uri();
    config.strava.token_url = format!("{}/oauth/token", server.uri());
    config.geocode.base_url = server.uri();
    config.geocode.min_interval_ms = 1;
    config.warehouse.sqlite_path = dir.join("warehouse.db");
    config.store.path = dir.join("store/strava.db");
    config.export.local_dir = Some(dir.join("exports"));
    config
}

async fn mount_strava(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "strava-token",
            "expires_in": 21600
        })))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/athlete/activities"))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {
                "id": 3,
                "name": "Treadmill",
                "type": "Run",
                "sport_type": "VirtualRun",
                "distance": 0.0,
                "average_speed": 0.0,
                "start_date_local": "2024-01-03T18:00:00Z",
                "start_latlng": []
            },
            {
                "id": 2,
                "name": "Two miles",
                "type": "Run",
                "sport_type": "Run",
                "distance": 3218.688,
                "average_speed": 2.68224,
                "start_date_local": "2024-01-02T07:00:00Z",
                "timezone": "(GMT-07:00) America/Denver",
                "start_latlng": [40.01499, -105.27001]
            },
            {
                "id": 1,
                "name": "One mile",
                "type": "Run",
                "sport_type": "Run",
                "distance": 1609.344,
                "total_elevation_gain": 50.0,
                "start_date_local": "2024-01-01T07:00:00Z",
                "start_latlng": [40.015, -105.27]
            }
        ])))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/athlete/activities"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(server)
        .await;
}

async fn mount_nominatim(server: &MockServer, expected_calls: u64) {
    Mock::given(method("GET"))
        .and(path("/reverse"))
        .and(query_param("format", "jsonv2"))
        .and(query_param("lat", "40.015"))
        .and(query_param("lon", "-105.27"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "address": {
                "city": "Boulder",
                "state": "Colorado",
                "country": "United States"
            }
        })))
        .expect(expected_calls)
        .mount(server)
        .await;
}

fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

/// Fetch, normalize, geocode, load and mirror in one run
#[tokio::test]
async fn test_full_run_loads_warehouse_and_writes_csv() {
    let server = MockServer::start().await;
    mount_strava(&server).await;
    mount_nominatim(&server, 1).await;

    let dir = TempDir::new().unwrap();
    let config = test_config(&server, dir.path());

    let report = assert_ok!(Pipeline::run(&config, RunOptions::default()).await);
    assert_eq!(report.fetched, 3);
    assert_eq!(report.normalized, 3);
    assert_eq!(report.loaded, Some(3));
    assert_eq!(report.raw_inserted, None);
    assert_eq!(report.drive, None);

    let stats = report.geocode.expect("geocoding ran");
    assert_eq!(stats.unique_keys, 1);
    assert_eq!(stats.lookups, 1);
    assert_eq!(stats.enriched_rows, 2);

    let csv_path = report.local_csv.expect("local CSV written");
    let expected_name = format!(
        "strava_transformed_{}.csv",
        chrono::Utc::now().date_naive().format("%Y%m%d")
    );
    assert_eq!(csv_path.file_name().unwrap().to_str(), Some(expected_name.as_str()));
    let csv = std::fs::read_to_string(&csv_path).unwrap();
    assert!(csv.starts_with("id,name,type,subtype,"));
    assert_eq!(csv.lines().count(), 4);
    assert!(csv.contains("America/Denver"));

    let warehouse = SqliteWarehouse::open(
        &config.warehouse.sqlite_path,
        &config.warehouse.table_ref().unwrap(),
    )
    .await
    .unwrap();
    let filter = DashboardFilter::new(date("2024-01-01"), date("2024-01-31")).unwrap();
    let mut rows = warehouse.query(&filter).await.unwrap();
    rows.sort_by_key(|r| r.date);

    let miles: Vec<Option<f64>> = rows.iter().map(|r| r.distance_miles).collect();
    assert_eq!(miles, vec![Some(1.0), Some(2.0), Some(0.0)]);

    let cities: Vec<Option<&str>> = rows.iter().map(|r| r.city.as_deref()).collect();
    assert_eq!(cities, vec![Some("Boulder"), Some("Boulder"), None]);

    assert_eq!(rows[1].pace_min_per_mile, Some(10.0));
    assert_eq!(rows[2].pace_min_per_mile, None);
    assert_eq!(rows[0].elevation_gain, Some(164.04));
}

/// A dry run prepares rows but writes nothing
#[tokio::test]
async fn test_dry_run_writes_nothing() {
    let server = MockServer::start().await;
    mount_strava(&server).await;

    let dir = TempDir::new().unwrap();
    let config = test_config(&server, dir.path());

    let options = RunOptions {
        skip_geocode: true,
        dry_run: true,
        ..RunOptions::default()
    };
    let report = Pipeline::run(&config, options).await.unwrap();

    assert_eq!(report.normalized, 3);
    assert_eq!(report.geocode, None);
    assert_eq!(report.loaded, None);
    assert_eq!(report.local_csv, None);
    assert!(!config.warehouse.sqlite_path.exists());
}

/// The incremental path keeps raw payloads and only inserts new ids
#[tokio::test]
async fn test_incremental_run_is_idempotent() {
    let server = MockServer::start().await;
    mount_strava(&server).await;

    let dir = TempDir::new().unwrap();
    let mut config = test_config(&server, dir.path());
    config.store.enabled = true;

    let options = RunOptions {
        skip_geocode: true,
        skip_mirror: true,
        ..RunOptions::default()
    };

    let first = Pipeline::run(&config, options).await.unwrap();
    assert_eq!(first.raw_inserted, Some(3));
    assert_eq!(first.loaded, Some(3));
    assert_eq!(first.local_csv, None);

    let second = Pipeline::run(&config, options).await.unwrap();
    assert_eq!(second.raw_inserted, Some(0));
    assert_eq!(second.loaded, Some(3));
}

/// A failed fetch aborts before anything is loaded
#[tokio::test]
async fn test_fetch_failure_aborts_run() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "access_token": "t" })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/athlete/activities"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let config = test_config(&server, dir.path());

    let result = Pipeline::run(&config, RunOptions::default()).await;
    assert!(matches!(result, Err(AppError::Fetch(_))));
    assert!(!config.warehouse.sqlite_path.exists());
    assert!(!dir.path().join("exports").exists());
}

/// Geocoder outages degrade to empty places instead of failing the run
#[tokio::test]
async fn test_geocode_outage_does_not_fail_run() {
    let server = MockServer::start().await;
    mount_strava(&server).await;
    Mock::given(method("GET"))
        .and(path("/reverse"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let config = test_config(&server, dir.path());
    let options = RunOptions {
        skip_mirror: true,
        ..RunOptions::default()
    };

    let report = Pipeline::run(&config, options).await.unwrap();
    let stats = report.geocode.unwrap();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.enriched_rows, 0);
    assert_eq!(report.loaded, Some(3));
}

#[tokio::test]
async fn test_extract_skips_warehouse() {
    let server = MockServer::start().await;
    mount_strava(&server).await;

    let dir = TempDir::new().unwrap();
    let config = test_config(&server, dir.path());

    let rows = Pipeline::extract(&config, true).await.unwrap();
    let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![3, 2, 1]);
    assert_eq!(rows[1].timezone_name.as_deref(), Some("America/Denver"));
    assert!(!config.warehouse.sqlite_path.exists());
}
