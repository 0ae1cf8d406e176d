use std::collections::HashSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

use super::http::{HttpClient, ACCEPT_HTML};
use super::text::{extract_ply, size_from_patterns, value_f64, value_i64, value_price, value_str};
use super::{finish_listing, matches_job, SiteExtractor, MAX_PAGES};
use crate::error::ExtractError;
use crate::models::ProductObservation;
use crate::registry::ScrapeJob;

const ACCEPT_LISTING: &str = "application/json, text/javascript, */*; q=0.01";

static HOST: LazyLock<Url> = LazyLock::new(|| Url::parse("https://redmart.lazada.sg").unwrap());

static TRACKING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)var\s+pdpTrackingData\s*=\s*"((?:\\.|[^"])*)";"#).unwrap()
});
static REVIEW_RATING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)"reviewRating"\s*:\s*\{[^}]*"ratingValue"\s*:\s*"([^"]+)""#).unwrap()
});
static AGGREGATE_RATING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?s)"aggregateRating"\s*:\s*\{[^}]*"ratingValue"\s*:\s*"([^"]+)"[^}]*"reviewCount"\s*:\s*"([^"]+)""#,
    )
    .unwrap()
});

/// RedMart (Lazada) brand listings served as JSON with `ajax=true`.
///
/// Jobs without an `api_url` fall back to scraping a single product page.
pub struct RedMartExtractor {
    http: HttpClient,
}

impl RedMartExtractor {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }

    async fn listing(
        &self,
        job: &ScrapeJob,
        api_url: &str,
    ) -> Result<Vec<ProductObservation>, ExtractError> {
        let mut url = api_url.to_string();
        let mut seen = HashSet::new();
        let mut matched = Vec::new();
        let mut pages = 0u32;

        loop {
            pages += 1;
            let payload = self.http.get_json(&url, ACCEPT_LISTING).await?;
            let Some(items) = parse_listing(job, &payload, &mut seen)? else {
                break;
            };
            debug!(job = %job.id, page = pages, matched = items.len(), seen = seen.len(), "listing page");
            matched.extend(items);

            match next_url(&payload) {
                Some(next) if next != url && pages < MAX_PAGES => url = next,
                _ => break,
            }
        }

        finish_listing(job, matched, seen.len())
    }
}

#[async_trait]
impl SiteExtractor for RedMartExtractor {
    fn name(&self) -> &'static str {
        "redmart"
    }

    async fn fetch(&self, job: &ScrapeJob) -> Result<Vec<ProductObservation>, ExtractError> {
        if let Some(api_url) = job.option("api_url") {
            return self.listing(job, api_url).await;
        }
        let url = job.require_option("url")?;
        let page = self.http.get_text(url, ACCEPT_HTML).await?;
        parse_product_page(job, &page.url, &page.body).map(|obs| vec![obs])
    }
}

/// New listing items on one page that match the job; `None` when the page
/// has no items at all.
///
/// Items already in `seen` (by `nid`, else `itemId`) are skipped. Every new
/// id is recorded, matched or not.
pub fn parse_listing(
    job: &ScrapeJob,
    payload: &Value,
    seen: &mut HashSet<String>,
) -> Result<Option<Vec<ProductObservation>>, ExtractError> {
    let items = match payload.pointer("/mods/listItems").and_then(Value::as_array) {
        Some(items) if !items.is_empty() => items,
        _ => return Ok(None),
    };

    let mut out = Vec::new();
    for item in items {
        let Some(id) = value_str(item.get("nid")).or_else(|| value_str(item.get("itemId"))) else {
            continue;
        };
        if !seen.insert(id) || !matches_job(job, item_name(item)) {
            continue;
        }
        out.push(to_observation(job, item)?);
    }
    Ok(Some(out))
}

/// Absolute URL of the next listing page, forced to the JSON variant.
pub fn next_url(payload: &Value) -> Option<String> {
    let href = value_str(payload.pointer("/seoInfo/nextHref"))?;
    let mut next = HOST.join(&href).ok()?;

    let mut pairs: Vec<(String, String)> = next
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    match pairs.iter_mut().find(|(k, _)| k == "ajax") {
        Some(pair) => pair.1 = "true".into(),
        None => pairs.push(("ajax".into(), "true".into())),
    }
    if !pairs.iter().any(|(k, _)| k == "m") {
        pairs.push(("m".into(), "redmart".into()));
    }
    next.query_pairs_mut().clear().extend_pairs(pairs);
    Some(next.to_string())
}

fn is_blank(v: &&Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn item_name(item: &Value) -> &str {
    item.get("name").and_then(Value::as_str).unwrap_or("").trim()
}

fn to_observation(job: &ScrapeJob, item: &Value) -> Result<ProductObservation, ExtractError> {
    let name = item_name(item);
    let source_url = value_str(item.get("productUrl")).map(|u| {
        if u.starts_with("//") {
            format!("https:{}", u)
        } else {
            HOST.join(&u).map(|j| j.to_string()).unwrap_or(u)
        }
    });
    let price_raw = item
        .get("priceShow")
        .filter(|v| !is_blank(v))
        .or_else(|| item.get("price"));

    let mut obs = job.observe(name, source_url.as_deref());
    obs.price = value_price(price_raw, "price")?;
    obs.total_rating = value_f64(item.get("ratingScore"), "ratingScore")?;
    obs.total_reviews = value_i64(item.get("review"), "review")?;
    obs.size = obs.size.or_else(|| listing_size(item, name));
    obs.ply = obs.ply.or_else(|| extract_ply(name));
    obs.set_meta("raw_name", name);
    for (key, field) in [
        ("price_display", "priceShow"),
        ("seller", "sellerName"),
        ("item_sold", "itemSoldCntShow"),
        ("package_info", "packageInfo"),
        ("badges", "icons"),
        ("categories", "categories"),
    ] {
        obs.set_meta(key, item.get(field).cloned().unwrap_or(Value::Null));
    }
    Ok(obs)
}

fn listing_size(item: &Value, name: &str) -> Option<String> {
    value_str(item.get("packageInfo"))
        .or_else(|| size_from_patterns(name))
        .or_else(|| {
            let lines: Vec<&str> = item
                .get("description")?
                .as_array()?
                .iter()
                .filter_map(Value::as_str)
                .collect();
            size_from_patterns(&lines.join(" "))
        })
}

/// Price and ratings from a product page's tracking script and JSON-LD.
pub fn parse_product_page(
    job: &ScrapeJob,
    page_url: &str,
    html: &str,
) -> Result<ProductObservation, ExtractError> {
    let tracking = tracking_data(html);
    let field = |key: &str| tracking.as_ref().and_then(|t| t.get(key));

    let mut price = value_price(field("pdt_price"), "pdt_price")?;
    let mut rating = value_f64(field("ratingValue"), "ratingValue")?;
    let mut reviews = value_i64(field("reviewCount"), "reviewCount")?;

    if let Some(c) = REVIEW_RATING_RE.captures(html) {
        rating = rating.or_else(|| c[1].trim().parse().ok());
    }
    if let Some(c) = AGGREGATE_RATING_RE.captures(html) {
        rating = rating.or_else(|| c[1].trim().parse().ok());
        reviews = reviews.or_else(|| c[2].trim().parse::<f64>().ok().map(|f| f.trunc() as i64));
    }
    if tracking.is_none() && rating.is_none() && reviews.is_none() {
        return Err(ExtractError::Parse(format!(
            "no tracking data or ratings on {}",
            page_url
        )));
    }
    price = price.filter(|p| *p > 0.0);

    let page_name = value_str(field("pdt_name")).unwrap_or_default();
    let description = job.option("description_override").unwrap_or(&page_name);
    let mut obs = job.observe(description, Some(page_url));
    obs.price = price;
    obs.total_rating = rating;
    obs.total_reviews = reviews;
    obs.ply = obs.ply.or_else(|| extract_ply(&page_name));
    obs.set_meta("source_note", "product-page");
    obs.set_meta("tracking_data", json!(tracking));
    Ok(obs)
}

/// `pdpTrackingData` is a JSON object serialised into a JS string literal.
fn tracking_data(html: &str) -> Option<Value> {
    let literal = TRACKING_RE.captures(html)?.get(1)?.as_str();
    let decoded: String = serde_json::from_str(&format!("\"{}\"", literal)).ok()?;
    serde_json::from_str::<Value>(&decoded)
        .ok()
        .filter(Value::is_object)
}
