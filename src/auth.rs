use crate::config::OAuthCredentials;
use crate::error::{AppError, Result};
use crate::http::describe_failure;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Exchange a refresh token for a short-lived access token.
///
/// One POST, no retry and no caching: callers refresh once per run.
pub async fn refresh_access_token(client: &Client, creds: &OAuthCredentials) -> Result<String> {
    debug!("Refreshing access token at {}", creds.token_url);

    let response = client
        .post(&creds.token_url)
        .form(&[
            ("client_id", creds.client_id.as_str()),
            ("client_secret", creds.client_secret.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", creds.refresh_token.as_str()),
        ])
        .send()
        .await
        .map_err(|e| AppError::Auth(format!("Token request to {} failed: {}", creds.token_url, e)))?;

    if !response.status().is_success() {
        return Err(AppError::Auth(format!(
            "Token refresh rejected: {}",
            describe_failure(response).await
        )));
    }

    let body: TokenResponse = response
        .json()
        .await
        .map_err(|e| AppError::Auth(format!("Malformed token response: {}", e)))?;

    let token = body
        .access_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AppError::Auth("Token response has no access_token".to_string()))?;

    if let Some(expires_in) = body.expires_in {
        info!("Access token refreshed (expires in {}s)", expires_in);
    } else {
        info!("Access token refreshed");
    }

    Ok(token)
}
