//! HTTP plumbing shared by the API clients.

use crate::error::Result;
use reqwest::{Client, Response};
use std::time::Duration;

pub const USER_AGENT: &str = concat!("strava-ingest/", env!("CARGO_PKG_VERSION"));

/// Boundary for `multipart/related` uploads (BigQuery load jobs, Drive create)
const BOUNDARY: &str = "strava_ingest_boundary_7f3a9c";

/// Build a client with the pipeline's fixed per-request timeout
pub fn build_client(timeout_seconds: u64) -> Result<Client> {
    build_client_with_agent(USER_AGENT, timeout_seconds)
}

pub fn build_client_with_agent(user_agent: &str, timeout_seconds: u64) -> Result<Client> {
    let client = Client::builder()
        .user_agent(user_agent)
        .timeout(Duration::from_secs(timeout_seconds))
        .build()?;
    Ok(client)
}

/// Status and body of a failed response, for error messages
pub async fn describe_failure(response: Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let body = body.trim();
    if body.is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, truncate(body, 500))
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Body of a two-part `multipart/related` upload: JSON metadata, then media.
///
/// Returns the `Content-Type` header value and the encoded body.
pub fn multipart_related(
    metadata: &serde_json::Value,
    media_type: &str,
    media: &[u8],
) -> (String, Vec<u8>) {
    let mut body = Vec::with_capacity(media.len() + 512);
    body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
    body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    body.extend_from_slice(metadata.to_string().as_bytes());
    body.extend_from_slice(format!("\r\n--{}\r\n", BOUNDARY).as_bytes());
    body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", media_type).as_bytes());
    body.extend_from_slice(media);
    body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());

    (format!("multipart/related; boundary={}", BOUNDARY), body)
}
