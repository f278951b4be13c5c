//! NCAA basketball ingestion core.
//!
//! Fetches team ratings and betting odds through rate-limited, retrying
//! clients, resolves provider team names against a versioned alias registry,
//! writes idempotent snapshots and decides through validation gates whether
//! the dataset is safe to predict on.

pub mod config;
pub mod error;
pub mod fetch;
pub mod gate;
pub mod names;
pub mod pipeline;
pub mod publish;
pub mod registry;
pub mod resolver;
pub mod sources;
pub mod store;
pub mod writer;

pub use config::Config;
pub use error::{FetchError, RegistryError, ResolveError, RunError, StoreError};
pub use fetch::{FetchClient, Provider};
pub use gate::{Decision, GateConfig, GateEngine, GateVerdict};
pub use pipeline::{IngestionPipeline, PipelineSettings, RunOptions, RunReport};
pub use registry::{AliasRegistry, TeamId};
pub use resolver::{MatchStage, TeamResolver};
pub use store::{IngestStore, MemoryStore, PgStore};
