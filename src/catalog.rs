use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::CatalogError;

/// Canonical identity of one trackable product-at-storefront pairing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub key: String,
    pub brand: String,
    pub description: String,
    pub site: String,
    pub size: Option<String>,
    pub ply: Option<String>,
    /// Canonical storefront URL; observations fall back to it.
    pub url: String,
    /// Site-specific options such as an API URL template.
    pub extra_options: BTreeMap<String, String>,
}

impl CatalogEntry {
    pub fn new(key: &str, brand: &str, description: &str, site: &str, url: &str) -> Self {
        Self {
            key: key.to_string(),
            brand: brand.to_string(),
            description: description.to_string(),
            site: site.to_string(),
            size: None,
            ply: None,
            url: url.to_string(),
            extra_options: BTreeMap::new(),
        }
    }

    pub fn with_size(mut self, size: &str) -> Self {
        self.size = Some(size.to_string());
        self
    }

    pub fn with_ply(mut self, ply: &str) -> Self {
        self.ply = Some(ply.to_string());
        self
    }

    pub fn with_option(mut self, key: &str, value: impl Into<String>) -> Self {
        self.extra_options.insert(key.to_string(), value.into());
        self
    }
}

/// Immutable registry of catalog entries, built once at startup.
#[derive(Debug, Clone)]
pub struct ProductCatalog {
    entries: Vec<Arc<CatalogEntry>>,
    index: HashMap<String, usize>,
}

impl ProductCatalog {
    pub fn new(entries: Vec<CatalogEntry>) -> Result<Self, CatalogError> {
        let mut index = HashMap::with_capacity(entries.len());
        let mut stored = Vec::with_capacity(entries.len());
        for entry in entries {
            if index.contains_key(&entry.key) {
                return Err(CatalogError::Duplicate(entry.key));
            }
            index.insert(entry.key.clone(), stored.len());
            stored.push(Arc::new(entry));
        }
        Ok(Self { entries: stored, index })
    }

    pub fn lookup(&self, key: &str) -> Result<Arc<CatalogEntry>, CatalogError> {
        self.index
            .get(key)
            .map(|&i| Arc::clone(&self.entries[i]))
            .ok_or_else(|| CatalogError::NotFound(key.to_string()))
    }

    /// All entries in table order.
    pub fn all(&self) -> impl Iterator<Item = &Arc<CatalogEntry>> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// The tissue catalog tracked in production.
    pub fn builtin() -> Result<Self, CatalogError> {
        let mut entries = vec![CatalogEntry::new(
            "example-ultra-soft",
            "Example Brand",
            "Ultra Soft Mega Pack",
            "Example Store",
            "https://example.com/toilet-paper",
        )
        .with_size("24 Mega Rolls")
        .with_ply("3")
        .with_option("total_reviews", "1500")
        .with_option("total_rating", "4.9")
        .with_option("price", "24.99")];

        entries.extend(COLD_STORAGE.iter().map(|&(brand, pro_id)| {
            CatalogEntry::new(
                &format!("coldstorage-{}", brand.to_lowercase()),
                brand,
                &format!("{} assortment at Cold Storage", brand),
                "Cold Storage",
                &format!("{}?proCatId=1&proId={}", COLD_STORAGE_CATEGORY, pro_id),
            )
        }));

        entries.extend(FAIRPRICE.iter().map(|&(brand, description)| {
            let filter = brand.to_lowercase();
            CatalogEntry::new(
                &format!("fairprice-{}", filter),
                brand,
                description,
                "FairPrice",
                &format!(
                    "https://www.fairprice.com.sg/category/bathroom-tissues?filter=brand%3A{}",
                    filter
                ),
            )
            .with_option("api_url", fairprice_api_url(&filter))
        }));

        entries.extend(REDMART.iter().map(|&(brand, listing, api)| {
            CatalogEntry::new(
                &format!("redmart-{}", brand.to_lowercase()),
                brand,
                &format!("{} assortment at RedMart", brand),
                "RedMart",
                &format!("{}/{}?m=redmart", REDMART_HOUSEHOLD, listing),
            )
            .with_option(
                "api_url",
                format!("{}/{}/?ajax=true&m=redmart", REDMART_HOUSEHOLD, api),
            )
        }));

        Self::new(entries)
    }
}

// ── Built-in table ──

const COLD_STORAGE_CATEGORY: &str =
    "https://coldstorage.com.sg/en/category/100013-100174-101066/1.html";

/// (brand, Cold Storage brand filter id)
const COLD_STORAGE: &[(&str, &str)] = &[
    ("Kleenex", "32643"),
    ("Nootrees", "46847"),
    ("Paseo", "42272"),
    ("Pursoft", "48698"),
    ("Vinda", "33232"),
    ("Tempo", "32949"),
    ("Cloversoft", "45287"),
];

/// (brand, description)
const FAIRPRICE: &[(&str, &str)] = &[
    ("Kleenex", "Kleenex assortment at FairPrice"),
    ("Paseo", "Paseo assortment at FairPrice"),
    ("Pursoft", "Pursoft assortment at FairPrice"),
    ("FairPrice", "FairPrice house-brand bathroom tissues"),
    ("Beautex", "Beautex assortment at FairPrice"),
    ("Neutra", "Neutra assortment at FairPrice"),
    ("Cloversoft", "Cloversoft assortment at FairPrice"),
    ("Nootrees", "Nootrees assortment at FairPrice"),
    ("Tempo", "Tempo assortment at FairPrice"),
];

const REDMART_HOUSEHOLD: &str =
    "https://redmart.lazada.sg/shop-groceries-laundry-household-paper";

/// (brand, listing path, ajax listing path)
const REDMART: &[(&str, &str, &str)] = &[
    ("Tempo", "tem-po/", "tem-po"),
    ("Kleenex", "kleenex/", "kleenex"),
    ("Pursoft", "pursoft/", "pursoft"),
    ("Vinda", "vin-da/", "vin-da"),
    ("Beautex", "", "beautex"),
    ("Paseo", "", "paseo_1"),
    ("Cloversoft", "", "cloversoft"),
    ("Nootrees", "nootrees/", "nootrees"),
];

const FAIRPRICE_EXPERIMENTS: &str = "ls_deltime-sortA%2CsearchVariant-B%2Cgv-A%2Cshelflife-B%2Cds-A%2Cls_comsl-B%2C\
cartfiller-a%2Ccatnav-hide%2Ccatbubog-B%2Csbanner-A%2Ccount-b%2Ccam-a%2Cpromobanner-c%2C\
algopers-b%2Cdlv_pref_mf-B%2Cdelivery_pref_ffs-C%2Cdelivery_pref_pfc-C%2Ccrtalc-B%2C\
crt-v-wbble-A%2Czero_search_swimlane-A%2Csd-var-a%2CslotIncentive-eco%2Cosmos-on%2Cgsc-a%2C\
camp-lbl-B%2Cpoa-entry-A";

/// Category API URL for one brand filter; `{page}` is substituted per request.
fn fairprice_api_url(brand_filter: &str) -> String {
    format!(
        "https://website-api.omni.fairprice.com.sg/api/layout/category/v2?\
         algopers=prm-ppb-1%2Cprm-ep-1%2Ct-epds-1%2Ct-ppb-0%2Ct-ep-0&\
         category=bathroom-tissues&experiments={}&filter=brand%3A{}&includeTagDetails=true&\
         orderType=DELIVERY&page={{page}}&url=bathroom-tissues",
        FAIRPRICE_EXPERIMENTS, brand_filter
    )
}
