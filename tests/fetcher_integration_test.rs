use serde_json::json;
use strava_ingest::auth::refresh_access_token;
use strava_ingest::config::OAuthCredentials;
use strava_ingest::error::AppError;
use strava_ingest::fetcher::ActivityFetcher;
use tokio_test::{assert_err, assert_ok};
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn credentials(server: &MockServer) -> OAuthCredentials {
    OAuthCredentials {
        client_id: "12345".to_string(),
        client_secret: "secret".to_string(),
        refresh_token: "refresh-me".to_string(),
        token_url: format!("{}/oauth/token", server.uri()),
    }
}

fn activity(id: i64) -> serde_json::Value {
    json!({
        "id": id,
        "name": format!("Activity {}", id),
        "type": "Run",
        "sport_type": "Run",
        "distance": 5000.0,
        "moving_time": 1500,
        "start_date_local": "2024-01-15T07:30:00Z",
        "start_latlng": [40.015, -105.27]
    })
}

/// Token refresh posts the refresh credential as a form and returns the access token
#[tokio::test]
async fn test_refresh_returns_access_token() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=refresh-me"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "fresh-token",
            "expires_in": 21600
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = reqwest::Client::new();
    let token = assert_ok!(refresh_access_token(&client, &credentials(&server)).await);
    assert_eq!(token, "fresh-token");
}

/// A rejected refresh is an auth error and is not retried
#[tokio::test]
async fn test_refresh_unauthorized_is_auth_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid refresh token"))
        .expect(1)
        .mount(&server)
        .await;

    let client = reqwest::Client::new();
    let result = refresh_access_token(&client, &credentials(&server)).await;

    match result {
        Err(AppError::Auth(msg)) => assert!(msg.contains("401"), "got: {}", msg),
        other => panic!("Expected Auth error, got: {:?}", other),
    }
}

#[tokio::test]
async fn test_refresh_without_access_token_is_auth_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "expires_in": 60 })))
        .mount(&server)
        .await;

    let client = reqwest::Client::new();
    let err = assert_err!(refresh_access_token(&client, &credentials(&server)).await);
    assert!(matches!(err, AppError::Auth(_)));
}

/// Pages are requested in order and fetching stops at the first empty page
#[tokio::test]
async fn test_fetch_all_stops_at_empty_page() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/athlete/activities"))
        .and(query_param("page", "1"))
        .and(query_param("per_page", "2"))
        .and(header("authorization", "Bearer token-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([activity(3), activity(2)])))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/athlete/activities"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([activity(1)])))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/athlete/activities"))
        .and(query_param("page", "3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/athlete/activities"))
        .and(query_param("page", "4"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([activity(0)])))
        .expect(0)
        .mount(&server)
        .await;

    let fetcher = ActivityFetcher::with_client(reqwest::Client::new(), &server.uri(), 2);
    let activities = assert_ok!(fetcher.fetch_all("token-1").await);

    let ids: Vec<i64> = activities.iter().map(|a| a.id).collect();
    assert_eq!(ids, vec![3, 2, 1]);
    assert_eq!(activities[0].sport_type.as_deref(), Some("Run"));
    assert_eq!(activities[0].start_latlng, Some(vec![40.015, -105.27]));
}

/// A failed page mid-run fails the whole fetch
#[tokio::test]
async fn test_fetch_all_fails_on_mid_run_error() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/athlete/activities"))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([activity(2)])))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/athlete/activities"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
        .expect(1)
        .mount(&server)
        .await;

    let fetcher = ActivityFetcher::with_client(reqwest::Client::new(), &server.uri(), 200);
    let result = fetcher.fetch_all("token").await;

    match result {
        Err(AppError::Fetch(msg)) => {
            assert!(msg.contains("Page 2"), "got: {}", msg);
            assert!(msg.contains("500"), "got: {}", msg);
        }
        other => panic!("Expected Fetch error, got: {:?}", other),
    }
}

#[tokio::test]
async fn test_fetch_all_rejects_malformed_page() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/athlete/activities"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "message": "not a list" })))
        .mount(&server)
        .await;

    let fetcher = ActivityFetcher::with_client(reqwest::Client::new(), &server.uri(), 200);
    let err = assert_err!(fetcher.fetch_all("token").await);
    assert!(matches!(err, AppError::Fetch(_)));
}
