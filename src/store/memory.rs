//! In-process store for dry runs and tests. Mirrors the Postgres schema's
//! keys and constraints closely enough that the pipeline behaves the same.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use super::{
    DatasetScope, GameRecord, IngestStore, OddsKey, OddsSnapshot, RatingSnapshot, RunLease,
    WriteOutcome,
};
use crate::error::StoreError;
use crate::gate::{DatasetView, GateVerdict, ResolutionStats, Subject};
use crate::registry::TeamId;
use crate::resolver::ResolutionRecord;
use crate::sources::Period;

#[derive(Default)]
pub struct MemoryStore {
    games: RwLock<HashMap<String, GameRecord>>,
    odds: RwLock<HashMap<OddsKey, OddsSnapshot>>,
    ratings: RwLock<HashMap<(TeamId, NaiveDate), RatingSnapshot>>,
    resolutions: RwLock<Vec<ResolutionRecord>>,
    verdicts: RwLock<Vec<GateVerdict>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

fn upsert<K, V>(map: &mut HashMap<K, V>, key: K, value: &V) -> WriteOutcome
where
    K: std::hash::Hash + Eq,
    V: Clone + PartialEq,
{
    match map.get_mut(&key) {
        Some(existing) if existing == value => WriteOutcome::Unchanged,
        Some(existing) => {
            *existing = value.clone();
            WriteOutcome::Updated
        }
        None => {
            map.insert(key, value.clone());
            WriteOutcome::Inserted
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn game_count(&self) -> usize {
        self.games.read().await.len()
    }

    pub async fn odds_count(&self) -> usize {
        self.odds.read().await.len()
    }

    pub async fn rating_count(&self) -> usize {
        self.ratings.read().await.len()
    }

    pub async fn resolution_count(&self) -> usize {
        self.resolutions.read().await.len()
    }

    /// Seed a game directly; handy for gate scenarios.
    pub async fn insert_game(&self, game: GameRecord) {
        self.games.write().await.insert(game.external_id.clone(), game);
    }
}

#[async_trait]
impl IngestStore for MemoryStore {
    async fn try_acquire_run_lock(&self, dataset: &str) -> Result<Option<RunLease>, StoreError> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(dataset.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        Ok(lock.try_lock_owned().ok().map(RunLease::Memory))
    }

    async fn upsert_game(&self, game: &GameRecord) -> Result<WriteOutcome, StoreError> {
        if game.home_team_id == game.away_team_id {
            return Err(StoreError::Constraint(format!(
                "game {} has the same home and away team",
                game.external_id
            )));
        }
        let mut games = self.games.write().await;
        Ok(upsert(&mut games, game.external_id.clone(), game))
    }

    async fn upsert_odds(&self, row: &OddsSnapshot) -> Result<WriteOutcome, StoreError> {
        let known_game = self
            .games
            .read()
            .await
            .values()
            .any(|g| g.game_id == row.game_id);
        if !known_game {
            return Err(StoreError::Constraint(format!(
                "odds row references unknown game {}",
                row.game_id
            )));
        }
        let mut odds = self.odds.write().await;
        Ok(upsert(&mut odds, row.key(), row))
    }

    async fn upsert_rating(&self, row: &RatingSnapshot) -> Result<WriteOutcome, StoreError> {
        let mut ratings = self.ratings.write().await;
        Ok(upsert(&mut ratings, (row.team_id, row.rating_date), row))
    }

    async fn get_odds(&self, key: &OddsKey) -> Result<Option<OddsSnapshot>, StoreError> {
        Ok(self.odds.read().await.get(key).cloned())
    }

    async fn get_rating(
        &self,
        team_id: TeamId,
        rating_date: NaiveDate,
    ) -> Result<Option<RatingSnapshot>, StoreError> {
        Ok(self.ratings.read().await.get(&(team_id, rating_date)).cloned())
    }

    async fn append_resolutions(&self, records: &[ResolutionRecord]) -> Result<(), StoreError> {
        self.resolutions.write().await.extend_from_slice(records);
        Ok(())
    }

    async fn resolutions_for_run(&self, run_id: Uuid) -> Result<Vec<ResolutionRecord>, StoreError> {
        Ok(self
            .resolutions
            .read()
            .await
            .iter()
            .filter(|r| r.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn resolution_stats_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<ResolutionStats, StoreError> {
        let resolutions = self.resolutions.read().await;
        let window = resolutions.iter().filter(|r| r.resolved_at >= since);
        let mut stats = ResolutionStats::default();
        for record in window {
            stats.total += 1;
            if record.is_resolved() {
                stats.resolved += 1;
            }
        }
        Ok(stats)
    }

    async fn append_verdict(&self, verdict: &GateVerdict) -> Result<(), StoreError> {
        let mut verdicts = self.verdicts.write().await;
        if verdicts.iter().any(|v| v.run_id == verdict.run_id) {
            return Err(StoreError::AlreadyRecorded(format!(
                "verdict for run {}",
                verdict.run_id
            )));
        }
        verdicts.push(verdict.clone());
        Ok(())
    }

    async fn verdict_for_run(&self, run_id: Uuid) -> Result<Option<GateVerdict>, StoreError> {
        Ok(self
            .verdicts
            .read()
            .await
            .iter()
            .find(|v| v.run_id == run_id)
            .cloned())
    }

    async fn dataset_view(&self, scope: &DatasetScope) -> Result<DatasetView, StoreError> {
        let until = scope.now + scope.horizon;
        let games = self.games.read().await;
        let odds = self.odds.read().await;

        let mut subjects = Vec::new();
        for game in games
            .values()
            .filter(|g| g.commence_time >= scope.now && g.commence_time <= until)
        {
            let mut latest_odds: BTreeMap<Period, DateTime<Utc>> = BTreeMap::new();
            let mut complete_full = false;
            for row in odds.values().filter(|r| r.game_id == game.game_id) {
                latest_odds
                    .entry(row.period)
                    .and_modify(|t| *t = (*t).max(row.observed_at))
                    .or_insert(row.observed_at);
                if row.period == Period::Full && row.is_complete() {
                    complete_full = true;
                }
            }
            subjects.push(Subject {
                game_id: game.game_id,
                external_id: game.external_id.clone(),
                commence_time: game.commence_time,
                home_team_id: game.home_team_id,
                away_team_id: game.away_team_id,
                latest_odds,
                has_complete_full_game_odds: complete_full,
            });
        }
        subjects.sort_by(|a, b| {
            a.commence_time
                .cmp(&b.commence_time)
                .then_with(|| a.external_id.cmp(&b.external_id))
        });

        let rated_teams: HashSet<TeamId> = self
            .ratings
            .read()
            .await
            .keys()
            .filter(|(_, date)| *date >= scope.ratings_since)
            .map(|(team, _)| *team)
            .collect();

        let written_odds = scope
            .written_odds
            .iter()
            .filter_map(|key| odds.get(key).cloned())
            .collect();

        drop(odds);
        drop(games);
        let resolution = self.resolution_stats_since(scope.resolution_since).await?;

        Ok(DatasetView {
            subjects,
            rated_teams,
            written_odds,
            resolution,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::Provider;
    use crate::gate::{Decision, GateConfig, GateEngine, GateStatus, RunContext};
    use crate::resolver::{MatchStage, MentionRole};
    use crate::sources::MarketType;
    use chrono::Duration as ChronoDuration;
    use tokio_test::{assert_err, assert_ok};

    fn game() -> GameRecord {
        GameRecord {
            game_id: GameRecord::game_id_for("evt-1"),
            external_id: "evt-1".into(),
            home_team_id: TeamId(Uuid::from_u128(1)),
            away_team_id: TeamId(Uuid::from_u128(2)),
            commence_time: Utc::now(),
        }
    }

    fn odds_row(price: i32) -> OddsSnapshot {
        OddsSnapshot {
            game_id: GameRecord::game_id_for("evt-1"),
            bookmaker: "pinnacle".into(),
            market_type: MarketType::H2h,
            period: Period::Full,
            observed_at: DateTime::<Utc>::from_timestamp(1_790_000_000, 0).unwrap(),
            home_line: None,
            away_line: None,
            total_line: None,
            home_price: Some(price),
            away_price: Some(-price),
            over_price: None,
            under_price: None,
        }
    }

    #[tokio::test]
    async fn upsert_reports_what_changed() {
        let store = MemoryStore::new();
        assert_eq!(store.upsert_game(&game()).await.unwrap(), WriteOutcome::Inserted);
        assert_eq!(store.upsert_game(&game()).await.unwrap(), WriteOutcome::Unchanged);

        assert_eq!(store.upsert_odds(&odds_row(120)).await.unwrap(), WriteOutcome::Inserted);
        assert_eq!(store.upsert_odds(&odds_row(120)).await.unwrap(), WriteOutcome::Unchanged);
        assert_eq!(store.upsert_odds(&odds_row(125)).await.unwrap(), WriteOutcome::Updated);
        assert_eq!(store.odds_count().await, 1);
    }

    #[tokio::test]
    async fn odds_need_a_known_game() {
        let store = MemoryStore::new();
        assert_err!(store.upsert_odds(&odds_row(120)).await);
    }

    #[tokio::test]
    async fn run_lock_is_exclusive_per_dataset() {
        let store = MemoryStore::new();
        let lease = assert_ok!(store.try_acquire_run_lock("ncaam").await).unwrap();
        assert!(store.try_acquire_run_lock("ncaam").await.unwrap().is_none());
        assert!(store.try_acquire_run_lock("ncaaf").await.unwrap().is_some());

        lease.release().await.unwrap();
        assert!(store.try_acquire_run_lock("ncaam").await.unwrap().is_some());
    }

    fn rating_on(team: u128, rating_date: NaiveDate) -> RatingSnapshot {
        RatingSnapshot {
            team_id: TeamId(Uuid::from_u128(team)),
            rating_date,
            conference: None,
            rank: None,
            wins: None,
            losses: None,
            adj_o: 110.0,
            adj_d: 100.0,
            tempo: 68.0,
            barthag: None,
            wab: None,
            efg: None,
            efgd: None,
            tor: None,
            tord: None,
            orb: None,
            drb: None,
            ftr: None,
            ftrd: None,
        }
    }

    fn audit(resolved: bool, resolved_at: DateTime<Utc>) -> ResolutionRecord {
        ResolutionRecord {
            run_id: Uuid::from_u128(3),
            mention: "Duke Blue Devils".into(),
            provider: Provider::Odds,
            role: MentionRole::AwayTeam,
            team_id: resolved.then(|| TeamId(Uuid::from_u128(2))),
            canonical_name: resolved.then(|| "Duke".to_string()),
            stage: if resolved { MatchStage::Aggressive } else { MatchStage::None },
            registry_version: "test/1".into(),
            observed_at: resolved_at,
            resolved_at,
        }
    }

    #[tokio::test]
    async fn resolution_window_starts_at_its_boundary() {
        let store = MemoryStore::new();
        let since = DateTime::<Utc>::from_timestamp(1_790_000_000, 0).unwrap();
        let records = vec![
            audit(false, since - ChronoDuration::seconds(1)),
            audit(false, since),
            audit(true, since + ChronoDuration::hours(1)),
            audit(true, since + ChronoDuration::days(3)),
        ];
        assert_ok!(store.append_resolutions(&records).await);

        let stats = assert_ok!(store.resolution_stats_since(since).await);
        assert_eq!(stats, ResolutionStats { total: 3, resolved: 2 });
    }

    #[tokio::test]
    async fn ratings_older_than_the_window_do_not_cover_a_team() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let upcoming = GameRecord {
            commence_time: now + ChronoDuration::hours(4),
            ..game()
        };
        assert_ok!(store.upsert_game(&upcoming).await);
        let since = now.date_naive() - ChronoDuration::days(1);
        assert_ok!(store.upsert_rating(&rating_on(1, since - ChronoDuration::days(1))).await);
        assert_ok!(store.upsert_rating(&rating_on(2, since)).await);

        let scope = DatasetScope {
            now,
            horizon: ChronoDuration::hours(36),
            ratings_since: since,
            resolution_since: now - ChronoDuration::days(7),
            written_odds: vec![],
        };
        let view = assert_ok!(store.dataset_view(&scope).await);
        assert_eq!(view.subjects.len(), 1);
        assert!(!view.rated_teams.contains(&TeamId(Uuid::from_u128(1))));
        assert!(view.rated_teams.contains(&TeamId(Uuid::from_u128(2))));

        let verdict = GateEngine::new(GateConfig::default()).evaluate(&RunContext {
            run_id: Uuid::new_v4(),
            evaluated_at: now,
            bypass_soft_gates: false,
            view,
            quality_rules: vec![],
        });
        assert_eq!(verdict.metrics.ratings_coverage_pct, Some(50.0));
        assert_eq!(
            verdict.gate("ratings_coverage").map(|g| g.status),
            Some(GateStatus::Failed)
        );
        assert_eq!(verdict.decision, Decision::Degrade);
    }
}
