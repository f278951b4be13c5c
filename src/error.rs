use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::fetch::Provider;

/// Low-level failure talking to a provider, before any retry decision.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Other(String),
}

#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("no fetch policy configured for {provider}")]
    NotConfigured { provider: Provider },

    #[error("rate limit for {provider} exceeded (would wait {needed:?}, budget spent {waited:?})")]
    RateLimitExceeded {
        provider: Provider,
        waited: Duration,
        needed: Duration,
    },

    #[error("circuit breaker open for {provider}")]
    CircuitOpen { provider: Provider },

    #[error("fetch from {provider} failed after {attempts} attempt(s): {reason}")]
    FetchFailed {
        provider: Provider,
        attempts: u32,
        status: Option<u16>,
        retryable: bool,
        reason: String,
    },
}

impl FetchError {
    /// Malformed payloads are permanent: re-fetching the same body won't fix them.
    pub fn malformed(provider: Provider, reason: impl Into<String>) -> Self {
        FetchError::FetchFailed {
            provider,
            attempts: 1,
            status: None,
            retryable: false,
            reason: reason.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::FetchFailed { retryable, .. } => *retryable,
            FetchError::RateLimitExceeded { .. } | FetchError::CircuitOpen { .. } => true,
            FetchError::NotConfigured { .. } => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::FetchFailed { status, .. } => *status,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("invalid mention from {provider}: team name is empty")]
    InvalidMention { provider: Provider },
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("alias '{alias}' maps to both '{existing}' and '{conflicting}'")]
    DuplicateAlias {
        alias: String,
        existing: String,
        conflicting: String,
    },

    #[error("team id {0} appears more than once in the registry snapshot")]
    DuplicateTeamId(String),

    #[error("team {0} has an empty canonical name")]
    EmptyCanonicalName(String),

    #[error("failed to read alias registry at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse alias registry: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to load alias registry from database: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("append-only record already exists: {0}")]
    AlreadyRecorded(String),
}

/// Fatal, run-level failures. Per-source and per-record failures never show up
/// here; they are reported inside the run report instead.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("a run is already in progress for dataset '{dataset}'")]
    RunInProgress { dataset: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
