use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::RunSnapshot;
use crate::error::SinkError;
use crate::models::ProductObservation;
use crate::runner::JobReport;

#[derive(Serialize)]
struct LocalDocument<'a> {
    run_id: &'a str,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    table: &'a str,
    jobs: &'a [JobReport],
    observation_count: usize,
    observations: &'a [ProductObservation],
}

/// A local run snapshot read back from disk.
#[derive(Debug, Deserialize)]
pub struct LocalSnapshot {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub table: String,
    pub jobs: Vec<JobReport>,
    pub observation_count: usize,
    pub observations: Vec<ProductObservation>,
}

/// Writes one JSON document per run under a directory.
#[derive(Debug, Clone)]
pub struct LocalSink {
    dir: PathBuf,
}

impl LocalSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Write the snapshot to `scrape_<run start>.json`, suffixed on collision.
    ///
    /// The document is written to a temporary file first and renamed into
    /// place, so a reader never sees a partial snapshot.
    pub fn write(&self, snapshot: &RunSnapshot) -> Result<PathBuf, SinkError> {
        let doc = LocalDocument {
            run_id: snapshot.run_id,
            started_at: snapshot.started_at,
            finished_at: snapshot.finished_at,
            table: snapshot.table,
            jobs: snapshot.jobs,
            observation_count: snapshot.observations.len(),
            observations: snapshot.observations,
        };
        let body = serde_json::to_vec_pretty(&doc)
            .map_err(|e| SinkError::WriteFailed(format!("serialize snapshot: {}", e)))?;

        fs::create_dir_all(&self.dir).map_err(|e| {
            SinkError::Unavailable(format!("create {}: {}", self.dir.display(), e))
        })?;
        let stamp = snapshot.started_at.format("%Y%m%dT%H%M%SZ").to_string();
        let path = self.free_path(&stamp);
        let tmp = path.with_extension("json.tmp");

        fs::write(&tmp, &body)
            .and_then(|_| fs::rename(&tmp, &path))
            .map_err(|e| {
                let _ = fs::remove_file(&tmp);
                SinkError::WriteFailed(format!("write {}: {}", path.display(), e))
            })?;

        info!(
            path = %path.display(),
            observations = snapshot.observations.len(),
            "Wrote local snapshot"
        );
        Ok(path)
    }

    fn free_path(&self, stamp: &str) -> PathBuf {
        let first = self.dir.join(format!("scrape_{}.json", stamp));
        if !first.exists() {
            return first;
        }
        (1u32..)
            .map(|n| self.dir.join(format!("scrape_{}_{}.json", stamp, n)))
            .find(|p| !p.exists())
            .unwrap_or(first)
    }
}

pub fn read_snapshot(path: &Path) -> Result<LocalSnapshot, SinkError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| SinkError::Unavailable(format!("read {}: {}", path.display(), e)))?;
    serde_json::from_str(&raw)
        .map_err(|e| SinkError::WriteFailed(format!("decode {}: {}", path.display(), e)))
}
