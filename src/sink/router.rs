use tracing::{info, warn};

use super::remote::{open_store, remote_timeout, RemoteSink};
use super::{LocalSink, RemoteOutcome, RunSnapshot, SinkOutcome};
use crate::config::Settings;
use crate::error::SinkError;

enum RemoteState {
    Disabled(String),
    Unavailable(SinkError),
    Ready(RemoteSink),
}

/// Chooses destinations for a run's batch.
///
/// The remote store is used when it is configured and not disabled. The local
/// snapshot is written when forced, or whenever the remote did not take the
/// batch, so a batch is never lost to a remote failure.
pub struct SinkRouter {
    remote: RemoteState,
    local: LocalSink,
    table: String,
    force_local: bool,
}

impl SinkRouter {
    pub fn new(remote: RemoteSink, local: LocalSink, force_local: bool) -> Self {
        let table = remote.table().to_string();
        Self {
            remote: RemoteState::Ready(remote),
            local,
            table,
            force_local,
        }
    }

    /// Local snapshot only; `reason` is reported as the remote skip reason.
    pub fn local_only(local: LocalSink, table: &str, reason: &str) -> Self {
        Self {
            remote: RemoteState::Disabled(reason.to_string()),
            local,
            table: table.to_string(),
            force_local: true,
        }
    }

    pub fn from_settings(settings: &Settings, skip_remote: bool, force_local: bool) -> Self {
        let local = LocalSink::new(&settings.local_dir);
        if skip_remote {
            return Self::local_only(local, &settings.table, "remote writes disabled");
        }
        if !settings.remote.is_configured() {
            return Self::local_only(local, &settings.table, "no remote credentials configured");
        }

        let remote = open_store(&settings.remote, remote_timeout(&settings.http))
            .and_then(|store| RemoteSink::new(store, &settings.table));
        match remote {
            Ok(sink) => Self::new(sink, local, force_local),
            Err(e) => Self {
                remote: RemoteState::Unavailable(e),
                local,
                table: settings.table.clone(),
                force_local,
            },
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Hand the batch over exactly once. Never fails; problems become warnings.
    pub async fn write(&self, snapshot: &RunSnapshot<'_>) -> SinkOutcome {
        let mut warnings = Vec::new();

        let remote = match &self.remote {
            RemoteState::Disabled(reason) => RemoteOutcome::Skipped {
                reason: reason.clone(),
            },
            RemoteState::Unavailable(e) => {
                warnings.push(format!("{}; batch written locally", e));
                RemoteOutcome::Failed {
                    error: e.to_string(),
                }
            }
            RemoteState::Ready(_) if snapshot.observations.is_empty() => RemoteOutcome::Skipped {
                reason: "empty batch".into(),
            },
            RemoteState::Ready(sink) => match sink.write(snapshot.observations).await {
                Ok(rows) => {
                    info!(rows, store = %sink.target(), "Appended batch to remote store");
                    RemoteOutcome::Written {
                        rows,
                        target: sink.target(),
                    }
                }
                Err(e) => {
                    warnings.push(format!(
                        "remote write to {} failed: {}; batch written locally",
                        sink.target(),
                        e
                    ));
                    RemoteOutcome::Failed {
                        error: e.to_string(),
                    }
                }
            },
        };

        let needs_local = self.force_local || !matches!(remote, RemoteOutcome::Written { .. });
        let (local_path, local_error) = if needs_local {
            match self.local.write(snapshot) {
                Ok(path) => (Some(path), None),
                Err(e) => {
                    warnings.push(format!("local snapshot failed: {}", e));
                    (None, Some(e.to_string()))
                }
            }
        } else {
            (None, None)
        };

        for w in &warnings {
            warn!("{}", w);
        }
        SinkOutcome {
            remote,
            local_path,
            local_error,
            warnings,
        }
    }
}
