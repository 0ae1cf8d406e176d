use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::postgrest::PostgrestStore;
use super::sqlite::SqliteStore;
use crate::config::{HttpSettings, RemoteSettings};
use crate::error::SinkError;
use crate::extract::text::clip_chars;
use crate::models::{Metadata, ProductObservation};

/// Width of the bounded varchar columns.
pub const VARCHAR_LEN: usize = 200;

/// One row of the remote price table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRow {
    pub brand: String,
    pub description: String,
    pub site: String,
    pub size: Option<String>,
    pub ply: Option<String>,
    pub price: Option<f64>,
    pub total_reviews: Option<i64>,
    pub total_rating: Option<f64>,
    pub source_url: String,
    pub metadata: Metadata,
    /// Omitted rows take the store's write time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collected_at: Option<DateTime<Utc>>,
}

impl From<&ProductObservation> for RemoteRow {
    fn from(obs: &ProductObservation) -> Self {
        let bounded = |field: &str, value: &str| {
            if value.chars().count() > VARCHAR_LEN {
                warn!(field, value, "truncating to {} characters", VARCHAR_LEN);
            }
            clip_chars(value, VARCHAR_LEN)
        };
        Self {
            brand: bounded("brand", &obs.brand),
            description: obs.description.clone(),
            site: bounded("site", &obs.site),
            size: obs.size.as_deref().map(|s| bounded("size", s)),
            ply: obs.ply.as_deref().map(|p| bounded("ply", p)),
            price: obs.price,
            total_reviews: obs.total_reviews,
            total_rating: obs.total_rating,
            source_url: obs.source_url.clone(),
            metadata: obs.metadata.clone(),
            collected_at: Some(obs.collected_at),
        }
    }
}

impl RemoteRow {
    pub fn into_observation(self, written_at: DateTime<Utc>) -> ProductObservation {
        ProductObservation {
            brand: self.brand,
            description: self.description,
            site: self.site,
            size: self.size,
            ply: self.ply,
            price: self.price,
            total_reviews: self.total_reviews,
            total_rating: self.total_rating,
            source_url: self.source_url,
            metadata: self.metadata,
            collected_at: self.collected_at.unwrap_or(written_at),
        }
    }
}

/// An append-only relational table reachable by name.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Where rows go, for logs and reports (never includes credentials).
    fn target(&self) -> String;

    /// Insert every row or none of them.
    async fn append(&self, table: &str, rows: &[RemoteRow]) -> Result<usize, SinkError>;
}

/// Appends a batch into one table of a [`RecordStore`].
#[derive(Clone)]
pub struct RemoteSink {
    store: Arc<dyn RecordStore>,
    table: String,
}

impl RemoteSink {
    pub fn new(store: Arc<dyn RecordStore>, table: &str) -> Result<Self, SinkError> {
        validate_table(table)?;
        Ok(Self {
            store,
            table: table.to_string(),
        })
    }

    pub fn target(&self) -> String {
        format!("{}/{}", self.store.target(), self.table)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub async fn write(&self, observations: &[ProductObservation]) -> Result<usize, SinkError> {
        let rows: Vec<RemoteRow> = observations.iter().map(RemoteRow::from).collect();
        self.store.append(&self.table, &rows).await
    }
}

/// Table names are interpolated into SQL and URLs.
pub fn validate_table(table: &str) -> Result<(), SinkError> {
    let ok = !table.is_empty()
        && table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(SinkError::Unavailable(format!("invalid table name '{}'", table)))
    }
}

/// Budget for one bulk write: four page-fetch timeouts.
pub fn remote_timeout(http: &HttpSettings) -> Duration {
    Duration::from_secs(http.timeout_secs.max(1) * 4)
}

/// Pick a backend from the endpoint scheme.
pub fn open_store(
    settings: &RemoteSettings,
    timeout: Duration,
) -> Result<Arc<dyn RecordStore>, SinkError> {
    let url = settings
        .url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| SinkError::Unavailable("no remote endpoint configured".into()))?;

    if let Some(path) = url.strip_prefix("sqlite://") {
        return Ok(Arc::new(SqliteStore::open(path)?));
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        let store = PostgrestStore::new(url, settings.service_role_key.as_deref(), timeout)?;
        return Ok(Arc::new(store));
    }
    Err(SinkError::Unavailable(format!(
        "unsupported remote endpoint scheme in '{}'",
        url
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::sample_observation;

    #[test]
    fn row_round_trip_is_exact() {
        let mut obs = sample_observation("Ultra Soft");
        obs.set_meta("raw_name", "Kleenex Ultra Soft 3 Ply");
        obs.total_rating = None;
        let encoded = serde_json::to_string(&RemoteRow::from(&obs)).unwrap();
        let row: RemoteRow = serde_json::from_str(&encoded).unwrap();
        assert_eq!(row.into_observation(Utc::now()), obs);
    }

    #[test]
    fn missing_collected_at_takes_write_time() {
        let obs = sample_observation("Ultra Soft");
        let mut row = RemoteRow::from(&obs);
        row.collected_at = None;
        let encoded = serde_json::to_value(&row).unwrap();
        assert!(encoded.get("collected_at").is_none());

        let written_at = obs.collected_at + chrono::Duration::seconds(5);
        assert_eq!(row.into_observation(written_at).collected_at, written_at);
    }

    #[test]
    fn long_identity_fields_are_clipped() {
        let mut obs = sample_observation("Ultra Soft");
        obs.brand = "K".repeat(250);
        obs.description = "D".repeat(250);
        let row = RemoteRow::from(&obs);
        assert_eq!(row.brand.len(), VARCHAR_LEN);
        assert_eq!(row.description.len(), 250);
    }

    #[test]
    fn table_names() {
        assert!(validate_table("tissue_prices").is_ok());
        assert!(validate_table("prices; drop table x").is_err());
        assert!(validate_table("").is_err());
    }

    #[test]
    fn store_selection_by_scheme() {
        let mut settings = RemoteSettings::default();
        assert!(matches!(
            open_store(&settings, Duration::from_secs(5)),
            Err(SinkError::Unavailable(_))
        ));

        settings.url = Some("https://project.supabase.co".into());
        assert!(matches!(
            open_store(&settings, Duration::from_secs(5)),
            Err(SinkError::Unavailable(m)) if m.contains("key")
        ));

        settings.service_role_key = Some("secret".into());
        let store = open_store(&settings, Duration::from_secs(5)).unwrap();
        assert_eq!(store.target(), "https://project.supabase.co");

        settings.url = Some("ftp://example.com".into());
        assert!(open_store(&settings, Duration::from_secs(5)).is_err());

        let dir = tempfile::tempdir().unwrap();
        settings.url = Some(format!("sqlite://{}", dir.path().join("p.sqlite").display()));
        let store = open_store(&settings, Duration::from_secs(5)).unwrap();
        assert!(store.target().starts_with("sqlite://"));
    }
}
