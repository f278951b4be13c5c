//! Persistence for ingested rows, the resolution audit log and gate verdicts.
//!
//! Fact rows are upserted by natural key and report whether anything changed.
//! Resolution records and verdicts are append-only.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use crate::error::StoreError;
use crate::gate::{DatasetView, GateVerdict, ResolutionStats};
use crate::registry::TeamId;
use crate::resolver::ResolutionRecord;
use crate::sources::{MarketQuote, MarketType, Period, TeamRatingRow};

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteOutcome {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GameRecord {
    pub game_id: Uuid,
    pub external_id: String,
    pub home_team_id: TeamId,
    pub away_team_id: TeamId,
    pub commence_time: DateTime<Utc>,
}

impl GameRecord {
    /// Same provider event, same game id, on every run.
    pub fn game_id_for(external_id: &str) -> Uuid {
        Uuid::new_v5(
            &Uuid::NAMESPACE_URL,
            format!("odds-api:{external_id}").as_bytes(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OddsKey {
    pub game_id: Uuid,
    pub bookmaker: String,
    pub market_type: MarketType,
    pub period: Period,
    pub observed_at: DateTime<Utc>,
}

/// Normalized odds snapshot for storage
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OddsSnapshot {
    pub game_id: Uuid,
    pub bookmaker: String,
    pub market_type: MarketType,
    pub period: Period,
    pub observed_at: DateTime<Utc>,
    pub home_line: Option<f64>,
    pub away_line: Option<f64>,
    pub total_line: Option<f64>,
    pub home_price: Option<i32>,
    pub away_price: Option<i32>,
    pub over_price: Option<i32>,
    pub under_price: Option<i32>,
}

impl OddsSnapshot {
    pub fn from_quote(game_id: Uuid, quote: &MarketQuote) -> Self {
        Self {
            game_id,
            bookmaker: quote.bookmaker.clone(),
            market_type: quote.market_type,
            period: quote.period,
            observed_at: quote.observed_at,
            home_line: quote.home_line,
            away_line: quote.away_line,
            total_line: quote.total_line,
            home_price: quote.home_price,
            away_price: quote.away_price,
            over_price: quote.over_price,
            under_price: quote.under_price,
        }
    }

    pub fn key(&self) -> OddsKey {
        OddsKey {
            game_id: self.game_id,
            bookmaker: self.bookmaker.clone(),
            market_type: self.market_type,
            period: self.period,
            observed_at: self.observed_at,
        }
    }

    /// Price fields the market type requires but this row lacks.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let required = match self.market_type {
            MarketType::Spreads => vec![
                ("home_line", self.home_line.is_some()),
                ("away_line", self.away_line.is_some()),
                ("home_price", self.home_price.is_some()),
                ("away_price", self.away_price.is_some()),
            ],
            MarketType::Totals => vec![
                ("total_line", self.total_line.is_some()),
                ("over_price", self.over_price.is_some()),
                ("under_price", self.under_price.is_some()),
            ],
            MarketType::H2h => vec![
                ("home_price", self.home_price.is_some()),
                ("away_price", self.away_price.is_some()),
            ],
        };
        required
            .into_iter()
            .filter(|(_, present)| !present)
            .map(|(name, _)| name)
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.missing_fields().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RatingSnapshot {
    pub team_id: TeamId,
    pub rating_date: NaiveDate,
    pub conference: Option<String>,
    pub rank: Option<i32>,
    pub wins: Option<i32>,
    pub losses: Option<i32>,
    pub adj_o: f64,
    pub adj_d: f64,
    pub tempo: f64,
    pub barthag: Option<f64>,
    pub wab: Option<f64>,
    pub efg: Option<f64>,
    pub efgd: Option<f64>,
    pub tor: Option<f64>,
    pub tord: Option<f64>,
    pub orb: Option<f64>,
    pub drb: Option<f64>,
    pub ftr: Option<f64>,
    pub ftrd: Option<f64>,
}

impl RatingSnapshot {
    pub fn from_row(team_id: TeamId, rating_date: NaiveDate, row: &TeamRatingRow) -> Self {
        Self {
            team_id,
            rating_date,
            conference: row.conference.clone(),
            rank: row.rank,
            wins: row.wins,
            losses: row.losses,
            adj_o: row.adj_o,
            adj_d: row.adj_d,
            tempo: row.tempo,
            barthag: row.barthag,
            wab: row.wab,
            efg: row.efg,
            efgd: row.efgd,
            tor: row.tor,
            tord: row.tord,
            orb: row.orb,
            drb: row.drb,
            ftr: row.ftr,
            ftrd: row.ftrd,
        }
    }
}

/// What the gate needs to see of the stored dataset.
#[derive(Debug, Clone)]
pub struct DatasetScope {
    pub now: DateTime<Utc>,
    /// Games commencing within `[now, now + horizon]` are subjects.
    pub horizon: ChronoDuration,
    /// Ratings dated on or after this count as fresh.
    pub ratings_since: NaiveDate,
    pub resolution_since: DateTime<Utc>,
    /// Odds rows this run wrote.
    pub written_odds: Vec<OddsKey>,
}

/// Proof that this process holds the run lock for a dataset. Dropping it
/// releases the lock too; `release` does so explicitly.
pub enum RunLease {
    Memory(OwnedMutexGuard<()>),
    Postgres(sqlx::Transaction<'static, sqlx::Postgres>),
}

impl RunLease {
    pub async fn release(self) -> Result<(), StoreError> {
        match self {
            RunLease::Memory(guard) => drop(guard),
            RunLease::Postgres(tx) => tx.commit().await?,
        }
        Ok(())
    }
}

#[async_trait]
pub trait IngestStore: Send + Sync {
    /// `None` when another run holds the dataset.
    async fn try_acquire_run_lock(&self, dataset: &str) -> Result<Option<RunLease>, StoreError>;

    async fn upsert_game(&self, game: &GameRecord) -> Result<WriteOutcome, StoreError>;
    async fn upsert_odds(&self, row: &OddsSnapshot) -> Result<WriteOutcome, StoreError>;
    async fn upsert_rating(&self, row: &RatingSnapshot) -> Result<WriteOutcome, StoreError>;

    async fn get_odds(&self, key: &OddsKey) -> Result<Option<OddsSnapshot>, StoreError>;
    async fn get_rating(
        &self,
        team_id: TeamId,
        rating_date: NaiveDate,
    ) -> Result<Option<RatingSnapshot>, StoreError>;

    async fn append_resolutions(&self, records: &[ResolutionRecord]) -> Result<(), StoreError>;
    async fn resolutions_for_run(&self, run_id: Uuid) -> Result<Vec<ResolutionRecord>, StoreError>;
    async fn resolution_stats_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<ResolutionStats, StoreError>;

    /// Fails with `StoreError::AlreadyRecorded` for a second verdict of a run.
    async fn append_verdict(&self, verdict: &GateVerdict) -> Result<(), StoreError>;
    async fn verdict_for_run(&self, run_id: Uuid) -> Result<Option<GateVerdict>, StoreError>;

    async fn dataset_view(&self, scope: &DatasetScope) -> Result<DatasetView, StoreError>;
}
