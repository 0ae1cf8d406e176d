use std::path::PathBuf;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub runner: RunnerSettings,
    pub http: HttpSettings,
    pub local_dir: PathBuf,
    pub table: String,
    #[serde(default)]
    pub remote: RemoteSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunnerSettings {
    pub job_timeout_secs: u64,
    pub run_timeout_secs: u64,
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub concurrency: usize,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            job_timeout_secs: 60,
            run_timeout_secs: 900,
            max_retries: 3,
            base_backoff_ms: 2000,
            concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpSettings {
    pub timeout_secs: u64,
    pub accept_invalid_certs: bool,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 15,
            accept_invalid_certs: false,
        }
    }
}

/// Remote store connection; both values are passed through as opaque strings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteSettings {
    pub url: Option<String>,
    pub service_role_key: Option<String>,
}

impl RemoteSettings {
    /// An endpoint is set. Whether it is usable is decided at write time.
    pub fn is_configured(&self) -> bool {
        self.url.as_deref().is_some_and(|u| !u.trim().is_empty())
    }
}

/// Defaults → optional `pricewatch.toml` → `PRICEWATCH__*` env → `SUPABASE_*` env.
pub fn load() -> Result<Settings> {
    let mut settings = layered(Some("pricewatch"), Some("PRICEWATCH"))?;

    let supabase: RemoteSettings = Config::builder()
        .add_source(Environment::with_prefix("SUPABASE"))
        .build()
        .and_then(|c| c.try_deserialize())
        .unwrap_or_default();
    overlay_remote(&mut settings.remote, supabase);

    Ok(settings)
}

/// Built-in defaults, then the settings file named `file` (any extension the
/// `config` crate knows, optional), then variables under `env_prefix`.
fn layered(file: Option<&str>, env_prefix: Option<&str>) -> Result<Settings> {
    let runner = RunnerSettings::default();
    let http = HttpSettings::default();
    let mut builder = Config::builder()
        .set_default("runner.job_timeout_secs", runner.job_timeout_secs as i64)?
        .set_default("runner.run_timeout_secs", runner.run_timeout_secs as i64)?
        .set_default("runner.max_retries", runner.max_retries as i64)?
        .set_default("runner.base_backoff_ms", runner.base_backoff_ms as i64)?
        .set_default("runner.concurrency", runner.concurrency as i64)?
        .set_default("http.timeout_secs", http.timeout_secs as i64)?
        .set_default("http.accept_invalid_certs", http.accept_invalid_certs)?
        .set_default("local_dir", "data/raw")?
        .set_default("table", "tissue_prices")?;
    if let Some(name) = file {
        builder = builder.add_source(File::with_name(name).required(false));
    }
    if let Some(prefix) = env_prefix {
        builder = builder.add_source(
            Environment::with_prefix(prefix)
                .separator("__")
                .try_parsing(true),
        );
    }
    builder
        .build()
        .context("Failed to load settings")?
        .try_deserialize()
        .context("Invalid settings")
}

/// Non-blank values from `over` replace those in `remote`.
fn overlay_remote(remote: &mut RemoteSettings, over: RemoteSettings) {
    if over.is_configured() {
        remote.url = over.url;
    }
    if over.service_role_key.is_some() {
        remote.service_role_key = over.service_role_key;
    }
}
