//! PostgreSQL store (sqlx, runtime-checked queries).
//!
//! Upserts only touch a row when its content differs
//! (`ON CONFLICT ... DO UPDATE ... WHERE ... IS DISTINCT FROM ...`), and
//! `RETURNING (xmax = 0)` tells an insert from an update. No returned row
//! means the stored row already matched.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{info, warn};
use uuid::Uuid;

use super::{
    DatasetScope, GameRecord, IngestStore, OddsKey, OddsSnapshot, RatingSnapshot, RunLease,
    WriteOutcome,
};
use crate::error::{RegistryError, StoreError};
use crate::fetch::Provider;
use crate::gate::{DatasetView, GateVerdict, ResolutionStats, Subject};
use crate::registry::{AliasRegistry, CanonicalTeam, TeamId};
use crate::resolver::{MatchStage, MentionRole, ResolutionRecord};
use crate::sources::{MarketType, Period};

const SCHEMA: &str = include_str!("../../migrations/001_ingestion_core.sql");
const UNIQUE_VIOLATION: &str = "23505";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

fn outcome(inserted: Option<bool>) -> WriteOutcome {
    match inserted {
        Some(true) => WriteOutcome::Inserted,
        Some(false) => WriteOutcome::Updated,
        None => WriteOutcome::Unchanged,
    }
}

fn odds_from_row(row: &PgRow) -> Result<OddsSnapshot, StoreError> {
    let market_type: String = row.try_get("market_type")?;
    let period: String = row.try_get("period")?;
    Ok(OddsSnapshot {
        game_id: row.try_get("game_id")?,
        bookmaker: row.try_get("bookmaker")?,
        market_type: MarketType::parse(&market_type)
            .ok_or_else(|| StoreError::Constraint(format!("unknown market type '{market_type}'")))?,
        period: Period::parse(&period)
            .ok_or_else(|| StoreError::Constraint(format!("unknown period '{period}'")))?,
        observed_at: row.try_get("observed_at")?,
        home_line: row.try_get("home_line")?,
        away_line: row.try_get("away_line")?,
        total_line: row.try_get("total_line")?,
        home_price: row.try_get("home_price")?,
        away_price: row.try_get("away_price")?,
        over_price: row.try_get("over_price")?,
        under_price: row.try_get("under_price")?,
    })
}

fn rating_from_row(row: &PgRow) -> Result<RatingSnapshot, StoreError> {
    Ok(RatingSnapshot {
        team_id: TeamId(row.try_get("team_id")?),
        rating_date: row.try_get("rating_date")?,
        conference: row.try_get("conference")?,
        rank: row.try_get("rank")?,
        wins: row.try_get("wins")?,
        losses: row.try_get("losses")?,
        adj_o: row.try_get("adj_o")?,
        adj_d: row.try_get("adj_d")?,
        tempo: row.try_get("tempo")?,
        barthag: row.try_get("barthag")?,
        wab: row.try_get("wab")?,
        efg: row.try_get("efg")?,
        efgd: row.try_get("efgd")?,
        tor: row.try_get("tor")?,
        tord: row.try_get("tord")?,
        orb: row.try_get("orb")?,
        drb: row.try_get("drb")?,
        ftr: row.try_get("ftr")?,
        ftrd: row.try_get("ftrd")?,
    })
}

fn resolution_from_row(row: &PgRow) -> Result<ResolutionRecord, StoreError> {
    let provider: String = row.try_get("provider")?;
    let role: String = row.try_get("role")?;
    let stage: String = row.try_get("stage")?;
    let team_id: Option<Uuid> = row.try_get("team_id")?;
    Ok(ResolutionRecord {
        run_id: row.try_get("run_id")?,
        mention: row.try_get("mention")?,
        provider: Provider::parse(&provider)
            .ok_or_else(|| StoreError::Constraint(format!("unknown provider '{provider}'")))?,
        role: MentionRole::parse(&role)
            .ok_or_else(|| StoreError::Constraint(format!("unknown mention role '{role}'")))?,
        team_id: team_id.map(TeamId),
        canonical_name: row.try_get("canonical_name")?,
        stage: MatchStage::parse(&stage)
            .ok_or_else(|| StoreError::Constraint(format!("unknown match stage '{stage}'")))?,
        registry_version: row.try_get("registry_version")?,
        observed_at: row.try_get("observed_at")?,
        resolved_at: row.try_get("resolved_at")?,
    })
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect_with_retry(url: &str, max_retries: u32) -> Result<Self, StoreError> {
        let mut attempt = 0;
        loop {
            match PgPoolOptions::new()
                .max_connections(10)
                .acquire_timeout(Duration::from_secs(10))
                .connect(url)
                .await
            {
                Ok(pool) => {
                    info!("Connected to PostgreSQL");
                    return Ok(Self { pool });
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= max_retries {
                        return Err(StoreError::Database(e));
                    }
                    warn!("Database connection attempt {} failed: {}. Retrying...", attempt, e);
                    tokio::time::sleep(Duration::from_secs(2u64.pow(attempt))).await;
                }
            }
        }
    }

    /// Apply the bundled schema. Every statement is idempotent.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| s.lines().any(|l| !l.trim().is_empty() && !l.trim().starts_with("--")));
        let mut applied = 0;
        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
            applied += 1;
        }
        info!("Applied {} schema statements", applied);
        Ok(())
    }

    /// Registry snapshot from `teams` + `team_aliases`.
    pub async fn load_registry(&self) -> Result<AliasRegistry, RegistryError> {
        let rows = sqlx::query(
            r#"
            SELECT t.id, t.canonical_name, ta.alias
            FROM teams t
            LEFT JOIN team_aliases ta ON ta.team_id = t.id
            ORDER BY t.canonical_name, ta.alias
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut teams: Vec<CanonicalTeam> = Vec::new();
        let mut index: HashMap<Uuid, usize> = HashMap::new();
        for row in &rows {
            let id: Uuid = row.try_get("id")?;
            let alias: Option<String> = row.try_get("alias")?;
            let slot = match index.get(&id) {
                Some(slot) => *slot,
                None => {
                    teams.push(CanonicalTeam {
                        id: TeamId(id),
                        canonical_name: row.try_get("canonical_name")?,
                        aliases: Vec::new(),
                        provenance: "database".to_string(),
                    });
                    index.insert(id, teams.len() - 1);
                    teams.len() - 1
                }
            };
            if let Some(alias) = alias {
                teams[slot].aliases.push(alias);
            }
        }

        let (alias_count, latest): (i64, Option<DateTime<Utc>>) =
            sqlx::query_as("SELECT COUNT(*)::BIGINT, MAX(created_at) FROM team_aliases")
                .fetch_one(&self.pool)
                .await?;
        let version = format!(
            "db/{}/{}",
            alias_count,
            latest.map(|t| t.to_rfc3339()).unwrap_or_else(|| "none".to_string())
        );

        AliasRegistry::from_teams(version, teams)
    }

    async fn fresh_rated_teams(&self, since: NaiveDate) -> Result<HashSet<TeamId>, StoreError> {
        let ids: Vec<Uuid> =
            sqlx::query_scalar("SELECT DISTINCT team_id FROM team_ratings WHERE rating_date >= $1")
                .bind(since)
                .fetch_all(&self.pool)
                .await?;
        Ok(ids.into_iter().map(TeamId).collect())
    }
}

#[async_trait]
impl IngestStore for PgStore {
    async fn try_acquire_run_lock(&self, dataset: &str) -> Result<Option<RunLease>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_xact_lock(hashtext($1))")
            .bind(dataset)
            .fetch_one(&mut *tx)
            .await?;
        if locked {
            Ok(Some(RunLease::Postgres(tx)))
        } else {
            tx.rollback().await?;
            Ok(None)
        }
    }

    async fn upsert_game(&self, game: &GameRecord) -> Result<WriteOutcome, StoreError> {
        let inserted: Option<bool> = sqlx::query_scalar(
            r#"
            INSERT INTO games (id, external_id, home_team_id, away_team_id, commence_time)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (external_id) DO UPDATE SET
                home_team_id = EXCLUDED.home_team_id,
                away_team_id = EXCLUDED.away_team_id,
                commence_time = EXCLUDED.commence_time,
                updated_at = NOW()
            WHERE (games.home_team_id, games.away_team_id, games.commence_time)
                IS DISTINCT FROM
                (EXCLUDED.home_team_id, EXCLUDED.away_team_id, EXCLUDED.commence_time)
            RETURNING (xmax = 0)
            "#,
        )
        .bind(game.game_id)
        .bind(&game.external_id)
        .bind(game.home_team_id.0)
        .bind(game.away_team_id.0)
        .bind(game.commence_time)
        .fetch_optional(&self.pool)
        .await?;
        Ok(outcome(inserted))
    }

    async fn upsert_odds(&self, row: &OddsSnapshot) -> Result<WriteOutcome, StoreError> {
        let inserted: Option<bool> = sqlx::query_scalar(
            r#"
            INSERT INTO odds_snapshots (
                game_id, bookmaker, market_type, period, observed_at,
                home_line, away_line, total_line,
                home_price, away_price, over_price, under_price
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (game_id, bookmaker, market_type, period, observed_at) DO UPDATE SET
                home_line = EXCLUDED.home_line,
                away_line = EXCLUDED.away_line,
                total_line = EXCLUDED.total_line,
                home_price = EXCLUDED.home_price,
                away_price = EXCLUDED.away_price,
                over_price = EXCLUDED.over_price,
                under_price = EXCLUDED.under_price
            WHERE (odds_snapshots.home_line, odds_snapshots.away_line, odds_snapshots.total_line,
                   odds_snapshots.home_price, odds_snapshots.away_price,
                   odds_snapshots.over_price, odds_snapshots.under_price)
                IS DISTINCT FROM
                  (EXCLUDED.home_line, EXCLUDED.away_line, EXCLUDED.total_line,
                   EXCLUDED.home_price, EXCLUDED.away_price,
                   EXCLUDED.over_price, EXCLUDED.under_price)
            RETURNING (xmax = 0)
            "#,
        )
        .bind(row.game_id)
        .bind(&row.bookmaker)
        .bind(row.market_type.as_str())
        .bind(row.period.as_str())
        .bind(row.observed_at)
        .bind(row.home_line)
        .bind(row.away_line)
        .bind(row.total_line)
        .bind(row.home_price)
        .bind(row.away_price)
        .bind(row.over_price)
        .bind(row.under_price)
        .fetch_optional(&self.pool)
        .await?;
        Ok(outcome(inserted))
    }

    async fn upsert_rating(&self, row: &RatingSnapshot) -> Result<WriteOutcome, StoreError> {
        let inserted: Option<bool> = sqlx::query_scalar(
            r#"
            INSERT INTO team_ratings (
                team_id, rating_date, conference, rank, wins, losses,
                adj_o, adj_d, tempo, barthag, wab,
                efg, efgd, tor, tord, orb, drb, ftr, ftrd
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            ON CONFLICT (team_id, rating_date) DO UPDATE SET
                conference = EXCLUDED.conference,
                rank = EXCLUDED.rank,
                wins = EXCLUDED.wins,
                losses = EXCLUDED.losses,
                adj_o = EXCLUDED.adj_o,
                adj_d = EXCLUDED.adj_d,
                tempo = EXCLUDED.tempo,
                barthag = EXCLUDED.barthag,
                wab = EXCLUDED.wab,
                efg = EXCLUDED.efg,
                efgd = EXCLUDED.efgd,
                tor = EXCLUDED.tor,
                tord = EXCLUDED.tord,
                orb = EXCLUDED.orb,
                drb = EXCLUDED.drb,
                ftr = EXCLUDED.ftr,
                ftrd = EXCLUDED.ftrd
            WHERE (team_ratings.conference, team_ratings.rank, team_ratings.wins,
                   team_ratings.losses, team_ratings.adj_o, team_ratings.adj_d,
                   team_ratings.tempo, team_ratings.barthag, team_ratings.wab,
                   team_ratings.efg, team_ratings.efgd, team_ratings.tor, team_ratings.tord,
                   team_ratings.orb, team_ratings.drb, team_ratings.ftr, team_ratings.ftrd)
                IS DISTINCT FROM
                  (EXCLUDED.conference, EXCLUDED.rank, EXCLUDED.wins,
                   EXCLUDED.losses, EXCLUDED.adj_o, EXCLUDED.adj_d,
                   EXCLUDED.tempo, EXCLUDED.barthag, EXCLUDED.wab,
                   EXCLUDED.efg, EXCLUDED.efgd, EXCLUDED.tor, EXCLUDED.tord,
                   EXCLUDED.orb, EXCLUDED.drb, EXCLUDED.ftr, EXCLUDED.ftrd)
            RETURNING (xmax = 0)
            "#,
        )
        .bind(row.team_id.0)
        .bind(row.rating_date)
        .bind(&row.conference)
        .bind(row.rank)
        .bind(row.wins)
        .bind(row.losses)
        .bind(row.adj_o)
        .bind(row.adj_d)
        .bind(row.tempo)
        .bind(row.barthag)
        .bind(row.wab)
        .bind(row.efg)
        .bind(row.efgd)
        .bind(row.tor)
        .bind(row.tord)
        .bind(row.orb)
        .bind(row.drb)
        .bind(row.ftr)
        .bind(row.ftrd)
        .fetch_optional(&self.pool)
        .await?;
        Ok(outcome(inserted))
    }

    async fn get_odds(&self, key: &OddsKey) -> Result<Option<OddsSnapshot>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT game_id, bookmaker, market_type, period, observed_at,
                   home_line, away_line, total_line,
                   home_price, away_price, over_price, under_price
            FROM odds_snapshots
            WHERE game_id = $1 AND bookmaker = $2 AND market_type = $3
              AND period = $4 AND observed_at = $5
            "#,
        )
        .bind(key.game_id)
        .bind(&key.bookmaker)
        .bind(key.market_type.as_str())
        .bind(key.period.as_str())
        .bind(key.observed_at)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(odds_from_row).transpose()
    }

    async fn get_rating(
        &self,
        team_id: TeamId,
        rating_date: NaiveDate,
    ) -> Result<Option<RatingSnapshot>, StoreError> {
        let row = sqlx::query("SELECT * FROM team_ratings WHERE team_id = $1 AND rating_date = $2")
            .bind(team_id.0)
            .bind(rating_date)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(rating_from_row).transpose()
    }

    async fn append_resolutions(&self, records: &[ResolutionRecord]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(
                r#"
                INSERT INTO resolution_audit (
                    run_id, mention, provider, role, team_id, canonical_name,
                    stage, registry_version, observed_at, resolved_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(record.run_id)
            .bind(&record.mention)
            .bind(record.provider.as_str())
            .bind(record.role.as_str())
            .bind(record.team_id.map(|t| t.0))
            .bind(&record.canonical_name)
            .bind(record.stage.as_str())
            .bind(&record.registry_version)
            .bind(record.observed_at)
            .bind(record.resolved_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        info!("Stored {} resolution records", records.len());
        Ok(())
    }

    async fn resolutions_for_run(&self, run_id: Uuid) -> Result<Vec<ResolutionRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM resolution_audit WHERE run_id = $1 ORDER BY id")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(resolution_from_row).collect()
    }

    async fn resolution_stats_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<ResolutionStats, StoreError> {
        let (total, resolved): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*)::BIGINT, COUNT(team_id)::BIGINT FROM resolution_audit WHERE resolved_at >= $1",
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(ResolutionStats {
            total: total.max(0) as u64,
            resolved: resolved.max(0) as u64,
        })
    }

    async fn append_verdict(&self, verdict: &GateVerdict) -> Result<(), StoreError> {
        let body = serde_json::to_string(verdict)?;
        let result = sqlx::query(
            r#"
            INSERT INTO gate_verdicts (run_id, evaluated_at, decision, safe_to_predict, bypass_granted, body)
            VALUES ($1, $2, $3, $4, $5, $6::jsonb)
            "#,
        )
        .bind(verdict.run_id)
        .bind(verdict.evaluated_at)
        .bind(verdict.decision.as_str())
        .bind(verdict.safe_to_predict)
        .bind(verdict.bypass_granted)
        .bind(body)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db))
                if db.code().as_deref() == Some(UNIQUE_VIOLATION) =>
            {
                Err(StoreError::AlreadyRecorded(format!(
                    "verdict for run {}",
                    verdict.run_id
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn verdict_for_run(&self, run_id: Uuid) -> Result<Option<GateVerdict>, StoreError> {
        let body: Option<String> =
            sqlx::query_scalar("SELECT body::text FROM gate_verdicts WHERE run_id = $1")
                .bind(run_id)
                .fetch_optional(&self.pool)
                .await?;
        body.map(|b| serde_json::from_str(&b).map_err(StoreError::from))
            .transpose()
    }

    async fn dataset_view(&self, scope: &DatasetScope) -> Result<DatasetView, StoreError> {
        let until = scope.now + scope.horizon;
        let games = sqlx::query(
            r#"
            SELECT id, external_id, home_team_id, away_team_id, commence_time
            FROM games
            WHERE commence_time >= $1 AND commence_time <= $2
            ORDER BY commence_time, external_id
            "#,
        )
        .bind(scope.now)
        .bind(until)
        .fetch_all(&self.pool)
        .await?;

        let mut subjects = Vec::with_capacity(games.len());
        for row in &games {
            subjects.push(Subject {
                game_id: row.try_get("id")?,
                external_id: row.try_get("external_id")?,
                commence_time: row.try_get("commence_time")?,
                home_team_id: TeamId(row.try_get("home_team_id")?),
                away_team_id: TeamId(row.try_get("away_team_id")?),
                latest_odds: BTreeMap::new(),
                has_complete_full_game_odds: false,
            });
        }
        let game_ids: Vec<Uuid> = subjects.iter().map(|s| s.game_id).collect();

        if !game_ids.is_empty() {
            let latest: Vec<(Uuid, String, DateTime<Utc>)> = sqlx::query_as(
                r#"
                SELECT game_id, period, MAX(observed_at)
                FROM odds_snapshots
                WHERE game_id = ANY($1)
                GROUP BY game_id, period
                "#,
            )
            .bind(game_ids.clone())
            .fetch_all(&self.pool)
            .await?;

            // Mirrors OddsSnapshot::missing_fields
            let complete: Vec<Uuid> = sqlx::query_scalar(
                r#"
                SELECT DISTINCT game_id
                FROM odds_snapshots
                WHERE game_id = ANY($1)
                  AND period = 'full'
                  AND (
                    (market_type = 'spreads' AND home_line IS NOT NULL AND away_line IS NOT NULL
                        AND home_price IS NOT NULL AND away_price IS NOT NULL)
                    OR (market_type = 'totals' AND total_line IS NOT NULL
                        AND over_price IS NOT NULL AND under_price IS NOT NULL)
                    OR (market_type = 'h2h' AND home_price IS NOT NULL AND away_price IS NOT NULL)
                  )
                "#,
            )
            .bind(game_ids)
            .fetch_all(&self.pool)
            .await?;

            let by_game: HashMap<Uuid, usize> = subjects
                .iter()
                .enumerate()
                .map(|(i, s)| (s.game_id, i))
                .collect();
            for (game_id, period, observed_at) in latest {
                let (Some(slot), Some(period)) = (by_game.get(&game_id), Period::parse(&period))
                else {
                    continue;
                };
                subjects[*slot].latest_odds.insert(period, observed_at);
            }
            for game_id in complete {
                if let Some(slot) = by_game.get(&game_id) {
                    subjects[*slot].has_complete_full_game_odds = true;
                }
            }
        }

        let mut written_odds = Vec::with_capacity(scope.written_odds.len());
        for key in &scope.written_odds {
            if let Some(row) = self.get_odds(key).await? {
                written_odds.push(row);
            }
        }

        Ok(DatasetView {
            subjects,
            rated_teams: self.fresh_rated_teams(scope.ratings_since).await?,
            written_odds,
            resolution: self.resolution_stats_since(scope.resolution_since).await?,
        })
    }
}
