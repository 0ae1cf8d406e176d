//! Persistence of a run's observation batch.
//!
//! The remote store receives one row per observation; the local sink writes a
//! JSON snapshot of the whole run. [`SinkRouter`] decides which to use and
//! falls back to the local snapshot when the remote write fails.

pub mod local;
pub mod postgrest;
pub mod remote;
pub mod router;
pub mod sqlite;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::ProductObservation;
use crate::runner::JobReport;

pub use local::{read_snapshot, LocalSink};
pub use remote::{open_store, remote_timeout, RemoteSink};
pub use router::SinkRouter;

/// Everything a sink needs to know about a finished run.
#[derive(Debug, Clone, Copy)]
pub struct RunSnapshot<'a> {
    pub run_id: &'a str,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub table: &'a str,
    pub jobs: &'a [JobReport],
    pub observations: &'a [ProductObservation],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RemoteOutcome {
    Written { rows: usize, target: String },
    Skipped { reason: String },
    Failed { error: String },
}

/// Result of handing a batch to the sink layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkOutcome {
    pub remote: RemoteOutcome,
    pub local_path: Option<PathBuf>,
    pub local_error: Option<String>,
    pub warnings: Vec<String>,
}

impl SinkOutcome {
    /// The batch reached at least one durable destination.
    pub fn persisted(&self) -> bool {
        matches!(self.remote, RemoteOutcome::Written { .. }) || self.local_path.is_some()
    }
}
