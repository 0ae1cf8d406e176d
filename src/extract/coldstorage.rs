use std::sync::LazyLock;

use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use serde_json::json;
use tracing::debug;
use url::Url;

use super::http::{HttpClient, ACCEPT_HTML};
use super::text::{digits, extract_ply, size_tokens};
use super::{finish_listing, matches_job, SiteExtractor};
use crate::error::ExtractError;
use crate::models::ProductObservation;
use crate::registry::ScrapeJob;

fn selector(css: &str) -> Selector {
    Selector::parse(css).unwrap()
}

static CARD: LazyLock<Selector> =
    LazyLock::new(|| selector("div.list-wrapper div.row-container a.ware-wrapper"));
static NAME: LazyLock<Selector> = LazyLock::new(|| selector(".name"));
static PRICE: LazyLock<Selector> = LazyLock::new(|| selector(".price-box .price"));
static CENTS: LazyLock<Selector> = LazyLock::new(|| selector(".price-box .small-price"));
static LINE_PRICE: LazyLock<Selector> = LazyLock::new(|| selector(".price-box .line-price"));
static SOLD: LazyLock<Selector> = LazyLock::new(|| selector(".sold"));
static INFO: LazyLock<Selector> = LazyLock::new(|| selector(".info-content"));
static TITLE: LazyLock<Selector> = LazyLock::new(|| selector(".title"));
static PRICE_LINE: LazyLock<Selector> = LazyLock::new(|| selector(".price-line"));
static LINE_WHOLE: LazyLock<Selector> = LazyLock::new(|| selector(".price"));
static LINE_FRACTION: LazyLock<Selector> = LazyLock::new(|| selector(".price-small"));

/// Cold Storage category listings (HTML), or a single product detail page.
pub struct ColdStorageExtractor {
    http: HttpClient,
}

impl ColdStorageExtractor {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }
}

#[async_trait]
impl SiteExtractor for ColdStorageExtractor {
    fn name(&self) -> &'static str {
        "coldstorage"
    }

    async fn fetch(&self, job: &ScrapeJob) -> Result<Vec<ProductObservation>, ExtractError> {
        if let Some(detail_url) = job.option("detail_url") {
            let page = self.http.get_text(detail_url, ACCEPT_HTML).await?;
            return parse_detail(job, &page.url, &page.body).map(|obs| vec![obs]);
        }
        let url = job.require_option("url")?;
        let page = self.http.get_text(url, ACCEPT_HTML).await?;
        parse_listing(job, &page.url, &page.body)
    }
}

/// Product cards on a category page, filtered to the job's brand.
pub fn parse_listing(
    job: &ScrapeJob,
    page_url: &str,
    html: &str,
) -> Result<Vec<ProductObservation>, ExtractError> {
    let doc = Html::parse_document(html);
    let base = Url::parse(page_url).ok();
    let mut cards = 0usize;
    let mut named = 0usize;
    let mut matched = Vec::new();

    for card in doc.select(&CARD) {
        cards += 1;
        let name = text_of(card.select(&NAME).next());
        if name.is_empty() {
            continue;
        }
        named += 1;
        if !matches_job(job, &name) {
            continue;
        }
        let href = card.value().attr("href").unwrap_or("").trim();
        let listing_url = match (&base, href) {
            (_, "") => None,
            (Some(base), href) => base.join(href).ok().map(|u| u.to_string()),
            (None, href) => Some(href.to_string()),
        };

        let mut obs = job.observe(&name, listing_url.as_deref());
        obs.price = card_price(&card)?;
        obs.size = obs.size.or_else(|| size_tokens(&name, &job.entry.brand));
        obs.ply = obs.ply.or_else(|| extract_ply(&name));
        obs.set_meta("raw_name", name.as_str());
        obs.set_meta("list_price", json!(line_price(&card)));
        obs.set_meta("sold_out", card.select(&SOLD).next().is_some());
        matched.push(obs);
    }

    if cards == 0 {
        return Err(ExtractError::Parse(format!(
            "no product cards on {}; layout may have changed",
            page_url
        )));
    }
    finish_listing(job, matched, named)
}

/// A single product page; no brand filtering since the page is the product.
pub fn parse_detail(
    job: &ScrapeJob,
    page_url: &str,
    html: &str,
) -> Result<ProductObservation, ExtractError> {
    let doc = Html::parse_document(html);
    let missing = |what: &str| ExtractError::Parse(format!("no {} on {}", what, page_url));
    let info = doc.select(&INFO).next().ok_or_else(|| missing(".info-content"))?;
    let title = info.select(&TITLE).next().ok_or_else(|| missing(".title"))?;
    let price_line = info.select(&PRICE_LINE).next().ok_or_else(|| missing(".price-line"))?;

    let name = text_of(Some(title));
    let description = job.option("description_override").unwrap_or(&name);
    let mut obs = job.observe(description, Some(page_url));
    obs.price = detail_price(&price_line)?;
    obs.size = obs.size.or_else(|| size_tokens(&name, &job.entry.brand));
    obs.ply = obs.ply.or_else(|| extract_ply(&name));
    obs.set_meta("detail_url", page_url);
    obs.set_meta("original_description", name.as_str());
    Ok(obs)
}

fn text_of(el: Option<ElementRef>) -> String {
    el.map(|e| {
        e.text()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    })
    .unwrap_or_default()
}

fn parse_amount(raw: String, field: &str) -> Result<f64, ExtractError> {
    raw.parse()
        .map_err(|_| ExtractError::Validation(format!("{} is not numeric: {}", field, raw)))
}

/// Dollars and cents are rendered in separate elements.
fn card_price(card: &ElementRef) -> Result<Option<f64>, ExtractError> {
    let dollars = digits(&text_of(card.select(&PRICE).next()));
    if dollars.is_empty() {
        return Ok(None);
    }
    let cents = match digits(&text_of(card.select(&CENTS).next())) {
        c if c.is_empty() => "00".to_string(),
        c => format!("{:0>2}", c),
    };
    parse_amount(format!("{}.{}", dollars, cents), "price").map(Some)
}

/// Struck-through price; informational only, so unreadable text is `None`.
fn line_price(card: &ElementRef) -> Option<f64> {
    let raw: String = text_of(card.select(&LINE_PRICE).next())
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    if raw.is_empty() {
        return None;
    }
    let parsed = raw.parse().ok();
    if parsed.is_none() {
        debug!(raw = %raw, "unreadable list price");
    }
    parsed
}

fn detail_price(line: &ElementRef) -> Result<Option<f64>, ExtractError> {
    let Some(whole_el) = line.select(&LINE_WHOLE).next() else {
        return Ok(None);
    };
    let whole = digits(&text_of(Some(whole_el)));
    let fraction = digits(&text_of(line.select(&LINE_FRACTION).next()));
    if whole.is_empty() && fraction.is_empty() {
        return Ok(None);
    }
    let whole = if whole.is_empty() { "0".to_string() } else { whole };
    parse_amount(format!("{}.{:0<2}", whole, fraction), "price").map(Some)
}
