pub mod coldstorage;
pub mod example;
pub mod fairprice;
pub mod http;
pub mod redmart;
pub mod text;

use async_trait::async_trait;

use crate::error::ExtractError;
use crate::models::ProductObservation;
use crate::registry::ScrapeJob;

/// Upper bound on listing pages walked per job.
pub const MAX_PAGES: u32 = 20;

/// Per-storefront extraction capability.
///
/// Implementations only read from the network, so a failed call is safe to retry.
#[async_trait]
pub trait SiteExtractor: Send + Sync {
    /// Short storefront name used in logs and job listings.
    fn name(&self) -> &'static str;

    async fn fetch(&self, job: &ScrapeJob) -> Result<Vec<ProductObservation>, ExtractError>;
}

/// Whether a storefront listing name belongs to the job's catalog entry.
///
/// The target is the `product_name` option when set, otherwise the brand.
/// Listings call this on the raw name, before any field is coerced.
pub fn matches_job(job: &ScrapeJob, name: &str) -> bool {
    text::normalize_name(name).contains(&text::normalize_name(listing_target(job)))
}

fn listing_target(job: &ScrapeJob) -> &str {
    job.option("product_name").unwrap_or(&job.entry.brand)
}

/// Close a listing walk over `scanned` named items.
///
/// Zero matches is a parse error. Kept observations get `description_override`
/// applied, with the storefront name preserved in `original_description`.
pub fn finish_listing(
    job: &ScrapeJob,
    matched: Vec<ProductObservation>,
    scanned: usize,
) -> Result<Vec<ProductObservation>, ExtractError> {
    if matched.is_empty() {
        return Err(ExtractError::Parse(format!(
            "no listing matched '{}' ({} candidates)",
            listing_target(job),
            scanned
        )));
    }
    let override_desc = job.option("description_override");
    Ok(matched
        .into_iter()
        .map(|mut obs| {
            if let Some(desc) = override_desc {
                let original = std::mem::replace(&mut obs.description, desc.to_string());
                obs.set_meta("original_description", original);
            }
            obs
        })
        .collect())
}
