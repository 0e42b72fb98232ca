use crate::config::MAX_PER_PAGE;
use crate::error::{AppError, Result};
use crate::http::{build_client, describe_failure};
use crate::models::RawActivity;
use reqwest::Client;
use tracing::{debug, info};

pub struct ActivityFetcher {
    client: Client,
    base_url: String,
    per_page: u32,
}

impl ActivityFetcher {
    pub fn new(base_url: &str, per_page: u32, timeout_seconds: u64) -> Result<Self> {
        Ok(Self::with_client(build_client(timeout_seconds)?, base_url, per_page))
    }

    pub fn with_client(client: Client, base_url: &str, per_page: u32) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            per_page: per_page.clamp(1, MAX_PER_PAGE),
        }
    }

    /// Fetch every activity, page by page, until an empty page comes back.
    ///
    /// Order is whatever the API returns (newest first). Any failed page
    /// fails the whole fetch; nothing partial is returned.
    pub async fn fetch_all(&self, access_token: &str) -> Result<Vec<RawActivity>> {
        let mut activities = Vec::new();
        let mut page = 1u32;

        loop {
            let batch = self.fetch_page(access_token, page).await?;
            if batch.is_empty() {
                debug!("Page {} is empty, stopping", page);
                break;
            }

            debug!("Page {}: {} activities", page, batch.len());
            activities.extend(batch);
            page += 1;
        }

        info!(
            "Fetched {} activities across {} page(s)",
            activities.len(),
            page - 1
        );
        Ok(activities)
    }

    async fn fetch_page(&self, access_token: &str, page: u32) -> Result<Vec<RawActivity>> {
        let url = format!("{}/athlete/activities", self.base_url);

        let response = self
            .client
            .get(&url)
            .bearer_auth(access_token)
            .query(&[("per_page", self.per_page), ("page", page)])
            .send()
            .await
            .map_err(|e| AppError::Fetch(format!("Request for page {} failed: {}", page, e)))?;

        if !response.status().is_success() {
            return Err(AppError::Fetch(format!(
                "Page {} returned {}",
                page,
                describe_failure(response).await
            )));
        }

        response
            .json::<Vec<RawActivity>>()
            .await
            .map_err(|e| AppError::Fetch(format!("Page {} is not a valid activity list: {}", page, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_page_is_clamped() {
        let fetcher = ActivityFetcher::with_client(Client::new(), "https://example.com/api/v3/", 500);
        assert_eq!(fetcher.per_page, 200);
        assert_eq!(fetcher.base_url, "https://example.com/api/v3");

        let fetcher = ActivityFetcher::with_client(Client::new(), "https://example.com", 0);
        assert_eq!(fetcher.per_page, 1);
    }
}
