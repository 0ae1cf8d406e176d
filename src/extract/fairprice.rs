use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::http::{HttpClient, ACCEPT_JSON};
use super::text::{extract_ply, value_f64, value_i64, value_str};
use super::{finish_listing, matches_job, SiteExtractor, MAX_PAGES};
use crate::error::ExtractError;
use crate::models::ProductObservation;
use crate::registry::ScrapeJob;

const PRODUCT_BASE: &str = "https://www.fairprice.com.sg/product/";

/// FairPrice brand-filtered category API.
pub struct FairPriceExtractor {
    http: HttpClient,
}

impl FairPriceExtractor {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }
}

/// One page of category results.
#[derive(Debug)]
pub struct CategoryPage {
    /// Products matching the job; only these have their fields coerced.
    pub observations: Vec<ProductObservation>,
    /// Every product on the page, matched or not.
    pub scanned: usize,
    pub total_pages: u32,
}

#[async_trait]
impl SiteExtractor for FairPriceExtractor {
    fn name(&self) -> &'static str {
        "fairprice"
    }

    async fn fetch(&self, job: &ScrapeJob) -> Result<Vec<ProductObservation>, ExtractError> {
        let template = job.require_option("api_url")?;
        let mut matched = Vec::new();
        let mut scanned = 0usize;
        let mut page = 1u32;

        loop {
            let url = template.replace("{page}", &page.to_string());
            let payload = self.http.get_json(&url, ACCEPT_JSON).await?;
            let parsed = match parse_page(job, &payload, page)? {
                Some(parsed) => parsed,
                None if page == 1 => {
                    return Err(ExtractError::Parse(
                        "category response has no product collection".into(),
                    ))
                }
                None => break,
            };
            debug!(
                job = %job.id,
                page,
                total = parsed.total_pages,
                matched = parsed.observations.len(),
                "category page"
            );
            if parsed.scanned == 0 {
                break;
            }
            scanned += parsed.scanned;
            matched.extend(parsed.observations);
            if page >= parsed.total_pages || page >= MAX_PAGES {
                break;
            }
            page += 1;
        }

        finish_listing(job, matched, scanned)
    }
}

/// Observations on one API page; `None` when the payload has no collection.
pub fn parse_page(
    job: &ScrapeJob,
    payload: &Value,
    page: u32,
) -> Result<Option<CategoryPage>, ExtractError> {
    let Some(collection) = find_collection(payload) else {
        return Ok(None);
    };
    let items: &[Value] = collection
        .get("product")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let observations = items
        .iter()
        .filter(|item| matches_job(job, item_name(item)))
        .map(|item| to_observation(job, item))
        .collect::<Result<Vec<_>, _>>()?;
    let total_pages = value_i64(
        collection.get("pagination").and_then(|p| p.get("total_pages")),
        "total_pages",
    )?
    .map(|n| n.clamp(0, u32::MAX as i64) as u32)
    .unwrap_or(page);

    Ok(Some(CategoryPage {
        observations,
        scanned: items.len(),
        total_pages,
    }))
}

fn find_collection(payload: &Value) -> Option<&Map<String, Value>> {
    payload
        .pointer("/data/page/layouts")?
        .as_array()?
        .iter()
        .filter_map(|layout| {
            let value = layout
                .get("value")
                .filter(|v| !is_empty(v))
                .or_else(|| layout.get("data"))?;
            value.get("collection")?.as_object()
        })
        .find(|collection| !collection.is_empty())
}

fn is_empty(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::Object(m) => m.is_empty(),
        Value::Array(a) => a.is_empty(),
        _ => false,
    }
}

fn item_name(item: &Value) -> &str {
    item.get("name").and_then(Value::as_str).unwrap_or("").trim()
}

fn to_observation(job: &ScrapeJob, item: &Value) -> Result<ProductObservation, ExtractError> {
    let name = item_name(item);
    let source_url = value_str(item.get("slug")).map(|slug| format!("{}{}", PRODUCT_BASE, slug));

    let final_price = value_f64(item.get("final_price"), "final_price")?;
    // Informational only: an unreadable MRP is stored as null.
    let list_price = value_f64(item.pointer("/storeSpecificData/0/mrp"), "mrp")
        .ok()
        .flatten();
    let offers = item.get("offers").cloned().unwrap_or_else(|| json!([]));
    let promotion_price = value_f64(offers.pointer("/0/price"), "offer price")?;
    let stats = item.pointer("/reviews/statistics");
    let meta = item.get("metaData");
    let display_unit = value_str(meta.and_then(|m| m.get("DisplayUnit")));

    let mut obs = job.observe(name, source_url.as_deref());
    obs.price = promotion_price.filter(|p| *p > 0.0).or(final_price);
    obs.total_reviews = value_i64(stats.and_then(|s| s.get("total")), "total_reviews")?;
    obs.total_rating = value_f64(stats.and_then(|s| s.get("average")), "total_rating")?;
    obs.size = obs.size.or_else(|| display_unit.clone());
    obs.ply = obs.ply.or_else(|| extract_ply(name));
    obs.set_meta("raw_name", name);
    obs.set_meta("list_price", json!(list_price));
    obs.set_meta("promotion_price", json!(promotion_price));
    obs.set_meta("display_unit", json!(display_unit));
    obs.set_meta(
        "country_of_origin",
        json!(value_str(meta.and_then(|m| m.get("Country of Origin")))),
    );
    obs.set_meta("offers", offers);
    Ok(obs)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::catalog::CatalogEntry;
    use crate::config::HttpSettings;
    use crate::registry::testing::job_with;

    fn job(options: &[(&str, &str)]) -> ScrapeJob {
        let http = HttpClient::new(&HttpSettings::default()).unwrap();
        let entry = CatalogEntry::new(
            "fairprice-kleenex",
            "Kleenex",
            "Kleenex assortment at FairPrice",
            "FairPrice",
            "https://www.fairprice.com.sg/category/bathroom-tissues?filter=brand%3Akleenex",
        );
        job_with(
            "fairprice-kleenex",
            entry,
            Arc::new(FairPriceExtractor::new(http)),
            options,
        )
    }

    fn fixture() -> Value {
        let raw = std::fs::read_to_string("tests/fixtures/fairprice_page.json").unwrap();
        serde_json::from_str(&raw).unwrap()
    }

    #[test]
    fn parses_category_page() {
        let page = parse_page(&job(&[]), &fixture(), 1).unwrap().unwrap();
        assert_eq!(page.total_pages, 2);
        assert_eq!(page.scanned, 2);
        assert_eq!(page.observations.len(), 2);

        let promo = &page.observations[0];
        assert_eq!(promo.description, "Kleenex Ultra Soft Bath Tissue 3 Ply 10 x 200s");
        assert_eq!(promo.price, Some(11.95));
        assert_eq!(promo.metadata["list_price"], 14.2);
        assert_eq!(promo.metadata["promotion_price"], 11.95);
        assert_eq!(promo.total_reviews, Some(87));
        assert_eq!(promo.total_rating, Some(4.6));
        assert_eq!(promo.size.as_deref(), Some("10 x 200 sheets"));
        assert_eq!(promo.ply.as_deref(), Some("3"));
        assert_eq!(
            promo.source_url,
            "https://www.fairprice.com.sg/product/kleenex-ultra-soft-bath-tissue-10-x-200s-13007531"
        );
        assert_eq!(promo.metadata["country_of_origin"], "Korea");

        let plain = &page.observations[1];
        assert_eq!(plain.price, Some(6.5));
        assert!(plain.metadata["promotion_price"].is_null());
        assert_eq!(plain.total_reviews, None);
        assert_eq!(plain.metadata["offers"], json!([]));
    }

    #[test]
    fn layout_without_collection() {
        let payload = json!({"data": {"page": {"layouts": [{"name": "Banner", "value": {}}]}}});
        assert!(parse_page(&job(&[]), &payload, 1).unwrap().is_none());
        assert!(parse_page(&job(&[]), &json!({"error": "oops"}), 1).unwrap().is_none());
    }

    #[test]
    fn collection_under_data_key() {
        let payload = json!({"data": {"page": {"layouts": [
            {"name": "ProductCollection", "data": {"collection": {
                "product": [{"name": "Kleenex Cottonelle", "slug": "k-1", "final_price": "4.10"}]
            }}}
        ]}}});
        let page = parse_page(&job(&[]), &payload, 3).unwrap().unwrap();
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.observations[0].price, Some(4.1));
    }

    #[test]
    fn non_numeric_price_is_validation_error() {
        let payload = json!({"data": {"page": {"layouts": [
            {"value": {"collection": {"product": [{"name": "Kleenex", "final_price": "call us"}]}}}
        ]}}});
        assert!(matches!(
            parse_page(&job(&[]), &payload, 1),
            Err(ExtractError::Validation(_))
        ));
    }

    #[test]
    fn broken_product_for_another_brand_is_ignored() {
        let payload = json!({"data": {"page": {"layouts": [
            {"value": {"collection": {"product": [
                {"name": "Vinda Deluxe", "final_price": "call us",
                 "reviews": {"statistics": {"total": "many"}}},
                {"name": "Kleenex Clean Care", "slug": "k-2", "final_price": "6.50",
                 "storeSpecificData": [{"mrp": "n/a"}]}
            ]}}}
        ]}}});
        let page = parse_page(&job(&[]), &payload, 1).unwrap().unwrap();
        assert_eq!(page.scanned, 2);
        assert_eq!(page.observations.len(), 1);
        assert_eq!(page.observations[0].price, Some(6.5));
        assert!(page.observations[0].metadata["list_price"].is_null());
    }

    #[test]
    fn page_without_matches_still_counts_products() {
        let payload = json!({"data": {"page": {"layouts": [
            {"value": {"collection": {"product": [{"name": "Vinda Deluxe", "final_price": "3.00"}]}}}
        ]}}});
        let page = parse_page(&job(&[]), &payload, 1).unwrap().unwrap();
        assert_eq!(page.scanned, 1);
        assert!(page.observations.is_empty());
    }

    #[test]
    fn size_option_wins_over_display_unit() {
        let page = parse_page(&job(&[("size", "10 rolls")]), &fixture(), 1)
            .unwrap()
            .unwrap();
        assert_eq!(page.observations[0].size.as_deref(), Some("10 rolls"));
    }
}
