use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use tracing::debug;
use url::Url;

use super::remote::{RecordStore, RemoteRow};
use crate::error::SinkError;
use crate::extract::text::clip_chars;

/// Supabase-style PostgREST endpoint; a batch is a single bulk insert.
pub struct PostgrestStore {
    client: reqwest::Client,
    base: Url,
    key: String,
}

impl PostgrestStore {
    pub fn new(endpoint: &str, key: Option<&str>, timeout: Duration) -> Result<Self, SinkError> {
        let key = key
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| SinkError::Unavailable("remote service role key is not set".into()))?;
        let base = Url::parse(endpoint)
            .map_err(|e| SinkError::Unavailable(format!("invalid endpoint '{}': {}", endpoint, e)))?;
        if !matches!(base.scheme(), "http" | "https") || base.host_str().is_none() {
            return Err(SinkError::Unavailable(format!(
                "endpoint '{}' is not an http(s) URL",
                endpoint
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SinkError::Unavailable(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base,
            key: key.to_string(),
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base.as_str().trim_end_matches('/'), table)
    }
}

#[async_trait]
impl RecordStore for PostgrestStore {
    fn target(&self) -> String {
        self.base.as_str().trim_end_matches('/').to_string()
    }

    async fn append(&self, table: &str, rows: &[RemoteRow]) -> Result<usize, SinkError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let url = self.table_url(table);
        debug!(url = %url, rows = rows.len(), "POST");

        let response = self
            .client
            .post(&url)
            .header("apikey", &self.key)
            .header(AUTHORIZATION, format!("Bearer {}", self.key))
            .header(CONTENT_TYPE, "application/json")
            .header("Prefer", "return=minimal")
            .json(rows)
            .send()
            .await
            .map_err(|e| SinkError::WriteFailed(format!("POST {}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::WriteFailed(format!(
                "POST {} returned {}: {}",
                url,
                status,
                clip_chars(body.trim(), 300)
            )));
        }
        Ok(rows.len())
    }
}
