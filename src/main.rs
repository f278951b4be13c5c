//! NCAA Basketball Ingestion v6.1
//!
//! One-shot runs: fetch ratings and odds, resolve team names, store
//! snapshots, then print the gate verdict. Exits non-zero unless the
//! dataset is safe to predict on.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use uuid::Uuid;

use ncaam_ingest::fetch::{ReqwestTransport, Transport};
use ncaam_ingest::publish::VerdictPublisher;
use ncaam_ingest::{
    AliasRegistry, Config, FetchClient, GateEngine, IngestStore, IngestionPipeline, MemoryStore,
    PgStore, Provider, RunOptions, TeamResolver,
};

#[derive(Parser)]
#[command(name = "ncaam-ingest", version, about = "NCAA basketball ingestion and validation gates")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one ingestion cycle and print the gate verdict
    Run {
        /// Downgrade soft-gate failures to warnings
        #[arg(long)]
        bypass_soft_gates: bool,
        /// Write to an in-memory store instead of Postgres
        #[arg(long)]
        dry_run: bool,
    },
    /// Load the alias registry, check alias uniqueness and print stats
    CheckRegistry,
    /// Resolve team names against the alias registry
    Resolve {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Apply the database schema
    Migrate,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // NO .env file loading - secrets come from the environment or Docker secret files
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ncaam_ingest=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Run {
            bypass_soft_gates,
            dry_run,
        } => run(&config, bypass_soft_gates, dry_run).await,
        Command::CheckRegistry => {
            let registry = load_registry(&config, None).await?;
            println!("{}", serde_json::to_string_pretty(&registry.stats())?);
            info!("Registry {} is consistent", registry.version());
            Ok(ExitCode::SUCCESS)
        }
        Command::Resolve { names } => {
            let registry = Arc::new(load_registry(&config, None).await?);
            let resolver = TeamResolver::new(registry, Uuid::nil());
            for name in &names {
                let (team, stage) = resolver.match_name(name);
                match team {
                    Some(team) => println!("{} -> {} ({})", name, team.canonical_name, stage.as_str()),
                    None => println!("{} -> unresolved", name),
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Migrate => {
            let store = PgStore::connect_with_retry(&config.database_url()?, 5).await?;
            store.migrate().await?;
            info!("Schema applied");
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run(config: &Config, bypass_soft_gates: bool, dry_run: bool) -> Result<ExitCode> {
    info!("NCAA Basketball Ingestion v6.1 (season {})", config.season);

    let (store, registry): (Arc<dyn IngestStore>, AliasRegistry) = if dry_run {
        info!("Dry run: writing to an in-memory store");
        if config.alias_registry_path.is_none() {
            return Err(anyhow!("--dry-run needs ALIAS_REGISTRY_PATH"));
        }
        (Arc::new(MemoryStore::new()), load_registry(config, None).await?)
    } else {
        let pg = PgStore::connect_with_retry(&config.database_url()?, 5).await?;
        let registry = load_registry(config, Some(&pg)).await?;
        (Arc::new(pg), registry)
    };
    info!("Alias registry {} ({} teams)", registry.version(), registry.len());

    let transport: Arc<dyn Transport> =
        Arc::new(ReqwestTransport::new().context("Failed to create HTTP client")?);
    let fetch = FetchClient::new(transport)
        .with_source(Provider::Odds, config.odds_policy())
        .with_source(Provider::Ratings, config.ratings_policy());

    let mut pipeline = IngestionPipeline::new(
        Arc::new(fetch),
        Arc::new(registry),
        store,
        GateEngine::new(config.gate.clone()),
        config.pipeline_settings(),
    )
    .with_odds(config.odds_feed()?)
    .with_ratings(config.ratings_feed());

    if let (Some(url), false) = (&config.redis_url, dry_run) {
        match VerdictPublisher::connect_with_retry(url, 5).await {
            Ok(publisher) => pipeline = pipeline.with_publisher(publisher),
            Err(e) => warn!("Verdict publishing disabled, Redis unavailable: {}", e),
        }
    }

    let report = match pipeline.run(RunOptions { bypass_soft_gates }).await {
        Ok(report) => report,
        Err(e) => {
            error!("Ingestion run failed: {:?}", e);
            return Err(e.into());
        }
    };

    for source in report.failed_sources() {
        warn!(
            "Source {} ({}) failed: {}",
            source.provider,
            source.request,
            source.error.as_deref().unwrap_or("unknown error")
        );
    }
    info!(
        "Run {}: {} mentions, {} games, {} odds rows, {} ratings rows, {} write failures",
        report.run_id,
        report.mentions,
        report.games.attempted(),
        report.odds.attempted(),
        report.ratings.attempted(),
        report.games.failed + report.odds.failed + report.ratings.failed
    );

    println!("{}", serde_json::to_string_pretty(&report.verdict)?);
    if report.verdict.safe_to_predict {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

/// The snapshot file wins over the database tables when both are available.
async fn load_registry(config: &Config, store: Option<&PgStore>) -> Result<AliasRegistry> {
    if let Some(path) = &config.alias_registry_path {
        return AliasRegistry::load_file(path)
            .with_context(|| format!("Failed to load alias registry from {}", path.display()));
    }
    let registry = match store {
        Some(store) => store.load_registry().await?,
        None => {
            let store = PgStore::connect_with_retry(&config.database_url()?, 5).await?;
            store.load_registry().await?
        }
    };
    Ok(registry)
}
