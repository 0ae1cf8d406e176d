use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{ACCEPT, USER_AGENT};
use serde_json::Value;
use tracing::debug;

use crate::config::HttpSettings;
use crate::error::ExtractError;

/// Generic desktop UA; some storefronts block obvious bots.
const BROWSER_UA: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36";

pub const ACCEPT_HTML: &str = "text/html,application/xhtml+xml;q=0.9,*/*;q=0.8";
pub const ACCEPT_JSON: &str = "application/json";

/// A fetched document and the URL it was finally served from.
pub struct Page {
    pub url: String,
    pub body: String,
}

/// Shared client for all extractors in a run.
#[derive(Clone)]
pub struct HttpClient {
    inner: reqwest::Client,
}

impl HttpClient {
    pub fn new(settings: &HttpSettings) -> Result<Self> {
        let inner = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .danger_accept_invalid_certs(settings.accept_invalid_certs)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { inner })
    }

    /// GET a URL; timeouts, connection failures and non-2xx are network errors.
    pub async fn get_text(&self, url: &str, accept: &str) -> Result<Page, ExtractError> {
        debug!(url, "GET");
        let response = self
            .inner
            .get(url)
            .header(USER_AGENT, BROWSER_UA)
            .header(ACCEPT, accept)
            .send()
            .await?
            .error_for_status()?;
        let final_url = response.url().to_string();
        let body = response.text().await?;
        Ok(Page {
            url: final_url,
            body,
        })
    }

    pub async fn get_json(&self, url: &str, accept: &str) -> Result<Value, ExtractError> {
        let page = self.get_text(url, accept).await?;
        serde_json::from_str(&page.body)
            .map_err(|e| ExtractError::Parse(format!("invalid JSON from {}: {}", url, e)))
    }
}
