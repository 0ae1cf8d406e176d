use async_trait::async_trait;
use serde_json::Value;

use super::text::{value_f64, value_i64};
use super::SiteExtractor;
use crate::error::ExtractError;
use crate::models::ProductObservation;
use crate::registry::ScrapeJob;

/// Offline storefront that echoes job options; used to smoke-test the pipeline.
pub struct ExampleExtractor;

#[async_trait]
impl SiteExtractor for ExampleExtractor {
    fn name(&self) -> &'static str {
        "example"
    }

    async fn fetch(&self, job: &ScrapeJob) -> Result<Vec<ProductObservation>, ExtractError> {
        let opt = |key: &str| job.option(key).map(|v| Value::String(v.to_string()));

        let mut obs = job.observe(&job.entry.description, job.option("url"));
        obs.size = obs.size.or_else(|| Some("24 mega rolls".into()));
        obs.ply = obs.ply.or_else(|| Some("3".into()));
        obs.price = Some(value_f64(opt("price").as_ref(), "price")?.unwrap_or(29.99));
        obs.total_reviews =
            Some(value_i64(opt("total_reviews").as_ref(), "total_reviews")?.unwrap_or(1200));
        obs.total_rating =
            Some(value_f64(opt("total_rating").as_ref(), "total_rating")?.unwrap_or(4.8));
        obs.set_meta("note", "static example storefront");
        Ok(vec![obs])
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::catalog::CatalogEntry;
    use crate::registry::testing::job_with;

    fn entry() -> CatalogEntry {
        CatalogEntry::new(
            "example-ultra-soft",
            "Example Brand",
            "Ultra Soft Mega Pack",
            "Example Store",
            "https://example.com/toilet-paper",
        )
    }

    #[tokio::test]
    async fn echoes_options() {
        let job = job_with(
            "example",
            entry(),
            Arc::new(ExampleExtractor),
            &[("price", "24.99"), ("total_reviews", "1500"), ("total_rating", "4.9")],
        );
        let obs = ExampleExtractor.fetch(&job).await.unwrap();
        assert_eq!(obs.len(), 1);
        assert_eq!(obs[0].price, Some(24.99));
        assert_eq!(obs[0].total_reviews, Some(1500));
        assert_eq!(obs[0].total_rating, Some(4.9));
        assert_eq!(obs[0].size.as_deref(), Some("24 mega rolls"));
        assert_eq!(obs[0].source_url, "https://example.com/toilet-paper");
    }

    #[tokio::test]
    async fn bad_option_is_validation_error() {
        let job = job_with("example", entry(), Arc::new(ExampleExtractor), &[("price", "cheap")]);
        let err = ExampleExtractor.fetch(&job).await.unwrap_err();
        assert!(matches!(err, ExtractError::Validation(_)));
    }
}
