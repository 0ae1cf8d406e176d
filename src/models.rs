use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ExtractError;

/// Open key/value document attached to every observation.
pub type Metadata = serde_json::Map<String, Value>;

/// One parsed price/rating/review snapshot from a single successful fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductObservation {
    pub brand: String,
    pub description: String,
    pub site: String,
    pub size: Option<String>,
    pub ply: Option<String>,
    pub price: Option<f64>,
    pub total_reviews: Option<i64>,
    pub total_rating: Option<f64>,
    pub source_url: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub collected_at: DateTime<Utc>,
}

impl ProductObservation {
    /// Identity fields must be present; everything else may be undisclosed.
    pub fn validate(&self) -> Result<(), ExtractError> {
        for (field, value) in [
            ("brand", &self.brand),
            ("description", &self.description),
            ("site", &self.site),
            ("source_url", &self.source_url),
        ] {
            if value.trim().is_empty() {
                return Err(ExtractError::Validation(format!("empty {}", field)));
            }
        }
        Ok(())
    }

    pub fn set_meta(&mut self, key: &str, value: impl Into<Value>) {
        self.metadata.insert(key.to_string(), value.into());
    }
}

/// An observation as stored by a sink, with the sink-assigned row id.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedRecord {
    pub id: i64,
    pub observation: ProductObservation,
}

#[cfg(test)]
pub(crate) fn sample_observation(description: &str) -> ProductObservation {
    ProductObservation {
        brand: "Kleenex".into(),
        description: description.into(),
        site: "Cold Storage".into(),
        size: Some("10 x 200".into()),
        ply: Some("3".into()),
        price: Some(12.5),
        total_reviews: Some(34),
        total_rating: Some(4.5),
        source_url: "https://coldstorage.com.sg/en/p/1".into(),
        metadata: Metadata::new(),
        collected_at: Utc::now(),
    }
}
