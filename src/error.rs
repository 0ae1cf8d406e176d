use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("product '{0}' is not defined in the catalog")]
    NotFound(String),
    #[error("product '{0}' is defined more than once")]
    Duplicate(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Every requested id that has no registration, in request order.
    #[error("unknown job(s): {}", .0.join(", "))]
    UnknownJob(Vec<String>),
    #[error("job '{0}' is registered twice")]
    Duplicate(String),
    #[error("job '{job}' cannot be bound: {source}")]
    Catalog {
        job: String,
        #[source]
        source: CatalogError,
    },
}

/// Failure of a single extractor invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    #[error("network error: {0}")]
    Network(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("validation error: {0}")]
    Validation(String),
}

impl ExtractError {
    /// Only network failures are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Network(_) => FailureKind::Network,
            Self::Parse(_) => FailureKind::Parse,
            Self::Validation(_) => FailureKind::Validation,
        }
    }

    pub fn detail(&self) -> &str {
        match self {
            Self::Network(d) | Self::Parse(d) | Self::Validation(d) => d,
        }
    }
}

impl From<reqwest::Error> for ExtractError {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}

/// Why a job ended without observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Network,
    Parse,
    Validation,
    Timeout,
    /// Not launched before the run deadline.
    Deadline,
    /// The job task ended without reporting back.
    Aborted,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Network => "NetworkError",
            Self::Parse => "ParseError",
            Self::Validation => "ValidationError",
            Self::Timeout => "Timeout",
            Self::Deadline => "Deadline",
            Self::Aborted => "Aborted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    /// Preconditions unmet; nothing was written.
    #[error("sink unavailable: {0}")]
    Unavailable(String),
    /// The write was attempted and rolled back or rejected.
    #[error("sink write failed: {0}")]
    WriteFailed(String),
}
