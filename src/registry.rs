use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::Utc;

use crate::catalog::{CatalogEntry, ProductCatalog};
use crate::error::{ExtractError, RegistryError};
use crate::extract::{
    coldstorage::ColdStorageExtractor, example::ExampleExtractor, fairprice::FairPriceExtractor,
    http::HttpClient, redmart::RedMartExtractor, SiteExtractor,
};
use crate::models::{Metadata, ProductObservation};

/// Sentinel accepted in place of explicit job ids.
pub const ALL_JOBS: &str = "all";

/// A bound unit of work for one run.
#[derive(Clone)]
pub struct ScrapeJob {
    pub id: String,
    pub entry: Arc<CatalogEntry>,
    pub extractor: Arc<dyn SiteExtractor>,
    pub options: BTreeMap<String, String>,
}

impl fmt::Debug for ScrapeJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScrapeJob")
            .field("id", &self.id)
            .field("entry", &self.entry.key)
            .field("extractor", &self.extractor.name())
            .field("options", &self.options)
            .finish()
    }
}

impl ScrapeJob {
    /// Non-empty option value.
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn require_option(&self, key: &str) -> Result<&str, ExtractError> {
        self.option(key).ok_or_else(|| {
            ExtractError::Parse(format!("job '{}' has no '{}' option", self.id, key))
        })
    }

    /// Start an observation carrying this job's identity.
    ///
    /// A blank description falls back to the catalog description and a missing
    /// source URL falls back to the catalog's canonical URL.
    pub fn observe(&self, description: &str, source_url: Option<&str>) -> ProductObservation {
        let description = match description.trim() {
            "" => self.entry.description.clone(),
            d => d.to_string(),
        };
        let source_url = source_url
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .unwrap_or(&self.entry.url)
            .to_string();

        let mut metadata = Metadata::new();
        metadata.insert("job_id".into(), self.id.clone().into());
        metadata.insert("job_description".into(), self.entry.description.clone().into());

        ProductObservation {
            brand: self.entry.brand.clone(),
            description,
            site: self.entry.site.clone(),
            size: self.option("size").map(str::to_string),
            ply: self.option("ply").map(str::to_string),
            price: None,
            total_reviews: None,
            total_rating: None,
            source_url,
            metadata,
            collected_at: Utc::now(),
        }
    }

    /// Storefront host this job talks to; used to serialise requests per site.
    pub fn host(&self) -> String {
        url::Url::parse(&self.entry.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| self.entry.site.clone())
    }
}

/// Which registered jobs a run should execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobSelection {
    All,
    Ids(Vec<String>),
}

impl JobSelection {
    /// No ids, or the `all` sentinel anywhere, selects every job.
    pub fn from_args(ids: &[String]) -> Self {
        if ids.is_empty() || ids.iter().any(|id| id == ALL_JOBS) {
            Self::All
        } else {
            Self::Ids(ids.to_vec())
        }
    }
}

struct Registration {
    id: String,
    entry: Arc<CatalogEntry>,
    extractor: Arc<dyn SiteExtractor>,
    options: BTreeMap<String, String>,
}

/// Binds catalog entries to extractors and options.
#[derive(Default)]
pub struct JobRegistry {
    registrations: Vec<Registration>,
    index: HashMap<String, usize>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job; options derived from the entry are overlaid with `extra`.
    pub fn register(
        &mut self,
        id: &str,
        entry: Arc<CatalogEntry>,
        extractor: Arc<dyn SiteExtractor>,
        extra: BTreeMap<String, String>,
    ) -> Result<(), RegistryError> {
        if self.index.contains_key(id) {
            return Err(RegistryError::Duplicate(id.to_string()));
        }
        let mut options = options_from_entry(&entry);
        options.extend(extra);
        self.index.insert(id.to_string(), self.registrations.len());
        self.registrations.push(Registration {
            id: id.to_string(),
            entry,
            extractor,
            options,
        });
        Ok(())
    }

    /// Register a catalog entry under its own key.
    pub fn register_entry(
        &mut self,
        catalog: &ProductCatalog,
        key: &str,
        extractor: Arc<dyn SiteExtractor>,
    ) -> Result<(), RegistryError> {
        let entry = catalog.lookup(key).map_err(|source| RegistryError::Catalog {
            job: key.to_string(),
            source,
        })?;
        self.register(key, entry, extractor, BTreeMap::new())
    }

    /// Every built-in storefront job, in the order they were historically run.
    pub fn builtin(catalog: &ProductCatalog, http: &HttpClient) -> Result<Self, RegistryError> {
        let example: Arc<dyn SiteExtractor> = Arc::new(ExampleExtractor);
        let coldstorage: Arc<dyn SiteExtractor> = Arc::new(ColdStorageExtractor::new(http.clone()));
        let fairprice: Arc<dyn SiteExtractor> = Arc::new(FairPriceExtractor::new(http.clone()));
        let redmart: Arc<dyn SiteExtractor> = Arc::new(RedMartExtractor::new(http.clone()));

        let mut registry = Self::new();
        let example_entry = catalog.lookup("example-ultra-soft").map_err(|source| {
            RegistryError::Catalog {
                job: "example".into(),
                source,
            }
        })?;
        registry.register("example", example_entry, example, BTreeMap::new())?;
        for key in COLD_STORAGE_JOBS {
            registry.register_entry(catalog, key, Arc::clone(&coldstorage))?;
        }
        for key in FAIRPRICE_JOBS {
            registry.register_entry(catalog, key, Arc::clone(&fairprice))?;
        }
        for key in REDMART_JOBS {
            registry.register_entry(catalog, key, Arc::clone(&redmart))?;
        }
        Ok(registry)
    }

    /// Resolve a selection into executable jobs.
    ///
    /// Validation is exhaustive: every unresolved id is reported at once.
    pub fn build(&self, selection: &JobSelection) -> Result<Vec<ScrapeJob>, RegistryError> {
        let indices: Vec<usize> = match selection {
            JobSelection::All => (0..self.registrations.len()).collect(),
            JobSelection::Ids(ids) => {
                let mut seen = HashSet::new();
                let mut unknown = Vec::new();
                let mut found = Vec::new();
                for id in ids {
                    if !seen.insert(id.as_str()) {
                        continue;
                    }
                    match self.index.get(id.as_str()) {
                        Some(&i) => found.push(i),
                        None => unknown.push(id.clone()),
                    }
                }
                if !unknown.is_empty() {
                    return Err(RegistryError::UnknownJob(unknown));
                }
                found
            }
        };

        Ok(indices
            .into_iter()
            .map(|i| {
                let r = &self.registrations[i];
                ScrapeJob {
                    id: r.id.clone(),
                    entry: Arc::clone(&r.entry),
                    extractor: Arc::clone(&r.extractor),
                    options: r.options.clone(),
                }
            })
            .collect())
    }

    /// (job id, catalog entry, extractor name) for every registration.
    pub fn describe(&self) -> impl Iterator<Item = (&str, &CatalogEntry, &'static str)> {
        self.registrations
            .iter()
            .map(|r| (r.id.as_str(), r.entry.as_ref(), r.extractor.name()))
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }
}

fn options_from_entry(entry: &CatalogEntry) -> BTreeMap<String, String> {
    let mut options = BTreeMap::new();
    options.insert("url".to_string(), entry.url.clone());
    if let Some(size) = &entry.size {
        options.insert("size".to_string(), size.clone());
    }
    if let Some(ply) = &entry.ply {
        options.insert("ply".to_string(), ply.clone());
    }
    options.extend(entry.extra_options.clone());
    options
}

const COLD_STORAGE_JOBS: &[&str] = &[
    "coldstorage-kleenex",
    "coldstorage-nootrees",
    "coldstorage-paseo",
    "coldstorage-pursoft",
    "coldstorage-vinda",
    "coldstorage-tempo",
    "coldstorage-cloversoft",
];

const FAIRPRICE_JOBS: &[&str] = &[
    "fairprice-kleenex",
    "fairprice-paseo",
    "fairprice-pursoft",
    "fairprice-fairprice",
    "fairprice-beautex",
    "fairprice-neutra",
    "fairprice-cloversoft",
    "fairprice-nootrees",
    "fairprice-tempo",
];

const REDMART_JOBS: &[&str] = &[
    "redmart-tempo",
    "redmart-kleenex",
    "redmart-pursoft",
    "redmart-vinda",
    "redmart-beautex",
    "redmart-paseo",
    "redmart-cloversoft",
    "redmart-nootrees",
];


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HttpSettings;

    fn builtin() -> JobRegistry {
        let catalog = ProductCatalog::builtin().unwrap();
        let http = HttpClient::new(&HttpSettings::default()).unwrap();
        JobRegistry::builtin(&catalog, &http).unwrap()
    }

    #[test]
    fn all_follows_registration_order() {
        let registry = builtin();
        let jobs = registry.build(&JobSelection::All).unwrap();
        assert_eq!(jobs.len(), registry.len());
        assert_eq!(jobs[0].id, "example");
        assert_eq!(jobs[1].id, "coldstorage-kleenex");
        assert_eq!(jobs.last().unwrap().id, "redmart-nootrees");
    }

    #[test]
    fn explicit_ids_keep_request_order() {
        let registry = builtin();
        let selection = JobSelection::Ids(vec![
            "redmart-vinda".into(),
            "fairprice-neutra".into(),
            "redmart-vinda".into(),
        ]);
        let jobs = registry.build(&selection).unwrap();
        let ids: Vec<&str> = jobs.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["redmart-vinda", "fairprice-neutra"]);
        assert_eq!(jobs[1].extractor.name(), "fairprice");
    }

    #[test]
    fn unknown_ids_reported_together() {
        let registry = builtin();
        let selection = JobSelection::Ids(vec![
            "coldstorage-kleenex".into(),
            "coldstorage-klenex".into(),
            "walmart-tempo".into(),
        ]);
        assert_eq!(
            registry.build(&selection).unwrap_err(),
            RegistryError::UnknownJob(vec!["coldstorage-klenex".into(), "walmart-tempo".into()])
        );
    }

    #[test]
    fn all_sentinel_selects_everything() {
        assert_eq!(JobSelection::from_args(&[]), JobSelection::All);
        assert_eq!(
            JobSelection::from_args(&["example".into(), "all".into()]),
            JobSelection::All
        );
        assert_eq!(
            JobSelection::from_args(&["example".into()]),
            JobSelection::Ids(vec!["example".into()])
        );
    }

    #[test]
    fn options_include_entry_fields() {
        let registry = builtin();
        let jobs = registry
            .build(&JobSelection::Ids(vec!["example".into(), "fairprice-tempo".into()]))
            .unwrap();
        assert_eq!(jobs[0].option("size"), Some("24 Mega Rolls"));
        assert_eq!(jobs[0].option("price"), Some("24.99"));
        assert!(jobs[1].option("api_url").unwrap().contains("brand%3Atempo"));
        assert_eq!(jobs[1].option("url"), Some(jobs[1].entry.url.as_str()));
        assert_eq!(jobs[1].host(), "www.fairprice.com.sg");
    }

    #[test]
    fn observe_falls_back_to_catalog() {
        let registry = builtin();
        let job = registry
            .build(&JobSelection::Ids(vec!["coldstorage-vinda".into()]))
            .unwrap()
            .remove(0);
        let obs = job.observe("", None);
        assert_eq!(obs.description, "Vinda assortment at Cold Storage");
        assert_eq!(obs.source_url, job.entry.url);
        assert_eq!(obs.metadata["job_id"], "coldstorage-vinda");
        let obs = job.observe("Vinda Deluxe", Some("  "));
        assert_eq!(obs.description, "Vinda Deluxe");
        assert_eq!(obs.source_url, job.entry.url);
    }

    #[test]
    fn duplicate_registration_rejected() {
        let catalog = ProductCatalog::builtin().unwrap();
        let mut registry = JobRegistry::new();
        let extractor: Arc<dyn SiteExtractor> = Arc::new(ExampleExtractor);
        registry
            .register_entry(&catalog, "coldstorage-paseo", Arc::clone(&extractor))
            .unwrap();
        assert_eq!(
            registry.register_entry(&catalog, "coldstorage-paseo", extractor),
            Err(RegistryError::Duplicate("coldstorage-paseo".into()))
        );
    }
}
