//! One ingestion run: lock, fetch, resolve, write, barrier, gate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use governor::clock::DefaultClock;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{FetchError, RunError};
use crate::fetch::clock::SleepClock;
use crate::fetch::{FetchClient, FetchRequest, Payload, Provider, QuotaStatus};
use crate::gate::{quality, GateEngine, GateVerdict, RunContext};
use crate::publish::VerdictPublisher;
use crate::registry::{AliasRegistry, TeamId};
use crate::resolver::{MatchStage, MentionRole, RawEntityMention, ResolutionRecord, TeamResolver};
use crate::sources::odds::{extract_quotes, parse_event, parse_events};
use crate::sources::ratings::parse_ratings;
use crate::sources::{OddsApiEvent, OddsFeed, Period, RatingsFeed, TeamRatingRow};
use crate::store::{DatasetScope, GameRecord, IngestStore, OddsSnapshot, RatingSnapshot};
use crate::writer::{IngestionWriter, WriteStats};

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Run-lock key; one run per dataset at a time.
    pub dataset: String,
    pub max_concurrent_fetches: usize,
    pub max_concurrent_writes: usize,
    pub fetch_partial_periods: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            dataset: "ncaam".to_string(),
            max_concurrent_fetches: 4,
            max_concurrent_writes: 8,
            fetch_partial_periods: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub bypass_soft_gates: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub provider: Provider,
    pub request: String,
    pub ok: bool,
    pub attempts: Option<u32>,
    pub retryable: Option<bool>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StageCounts {
    pub exact: usize,
    pub normalized: usize,
    pub aggressive: usize,
    pub none: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub dataset: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceReport>,
    pub quota: Vec<(Provider, QuotaStatus)>,
    pub mentions: usize,
    pub resolution_records: usize,
    pub stages: StageCounts,
    /// Events without a usable team name or start time.
    pub invalid_events: usize,
    pub unresolved_events: Vec<String>,
    pub same_team_events: Vec<String>,
    /// Markets dropped for lacking any `last_update`.
    pub undated_quotes: usize,
    pub games: WriteStats,
    pub odds: WriteStats,
    pub ratings: WriteStats,
    pub verdict: GateVerdict,
}

impl RunReport {
    pub fn failed_sources(&self) -> impl Iterator<Item = &SourceReport> {
        self.sources.iter().filter(|s| !s.ok)
    }
}

#[derive(Debug, Clone)]
enum JobKind {
    Ratings,
    OddsFull,
    OddsPeriod { event_id: String },
}

#[derive(Debug, Clone)]
struct FetchJob {
    index: usize,
    kind: JobKind,
    provider: Provider,
    request: FetchRequest,
}

type FetchOutcome = (FetchJob, Result<Payload, FetchError>);

/// Longest window the run will compute with; keeps date arithmetic in range.
const MAX_WINDOW_DAYS: i64 = 3650;

fn to_chrono(d: Duration) -> ChronoDuration {
    let max = ChronoDuration::days(MAX_WINDOW_DAYS);
    ChronoDuration::from_std(d).map_or(max, |d| d.min(max))
}

fn source_report(job: &FetchJob, result: &Result<Payload, FetchError>) -> SourceReport {
    match result {
        Ok(payload) => SourceReport {
            provider: job.provider,
            request: job.request.label.clone(),
            ok: true,
            attempts: Some(payload.attempts),
            retryable: None,
            error: None,
        },
        Err(e) => failed_report(job, e),
    }
}

fn failed_report(job: &FetchJob, e: &FetchError) -> SourceReport {
    let attempts = match e {
        FetchError::FetchFailed { attempts, .. } => Some(*attempts),
        _ => None,
    };
    SourceReport {
        provider: job.provider,
        request: job.request.label.clone(),
        ok: false,
        attempts,
        retryable: Some(e.is_retryable()),
        error: Some(e.to_string()),
    }
}

/// Odds events that can become games, plus their half-game siblings.
struct OddsBatch {
    events: Vec<OddsApiEvent>,
    fetched_at: DateTime<Utc>,
    partials: HashMap<String, Vec<OddsApiEvent>>,
}

pub struct IngestionPipeline<C: SleepClock = DefaultClock> {
    fetch: Arc<FetchClient<C>>,
    odds: Option<OddsFeed>,
    ratings: Option<RatingsFeed>,
    registry: Arc<AliasRegistry>,
    store: Arc<dyn IngestStore>,
    gate: GateEngine,
    publisher: Option<VerdictPublisher>,
    settings: PipelineSettings,
}

impl<C: SleepClock> IngestionPipeline<C> {
    pub fn new(
        fetch: Arc<FetchClient<C>>,
        registry: Arc<AliasRegistry>,
        store: Arc<dyn IngestStore>,
        gate: GateEngine,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            fetch,
            odds: None,
            ratings: None,
            registry,
            store,
            gate,
            publisher: None,
            settings,
        }
    }

    pub fn with_odds(mut self, feed: OddsFeed) -> Self {
        self.odds = Some(feed);
        self
    }

    pub fn with_ratings(mut self, feed: RatingsFeed) -> Self {
        self.ratings = Some(feed);
        self
    }

    pub fn with_publisher(mut self, publisher: VerdictPublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub async fn run(&self, options: RunOptions) -> Result<RunReport, RunError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let dataset = self.settings.dataset.clone();

        let lease = self
            .store
            .try_acquire_run_lock(&dataset)
            .await?
            .ok_or_else(|| RunError::RunInProgress {
                dataset: dataset.clone(),
            })?;
        info!(run_id = %run_id, dataset = %dataset, "Starting ingestion run");

        // Fetch
        let mut sources = Vec::new();
        let mut jobs = Vec::new();
        if let Some(feed) = &self.ratings {
            jobs.push((JobKind::Ratings, Provider::Ratings, feed.request()));
        }
        if let Some(feed) = &self.odds {
            jobs.push((JobKind::OddsFull, Provider::Odds, feed.full_game_request()));
        }
        let mut ratings_payload = None;
        let mut odds_payload = None;
        for (job, result) in self.fetch_all(jobs).await {
            sources.push(source_report(&job, &result));
            match (job.kind, result) {
                (JobKind::Ratings, Ok(payload)) => ratings_payload = Some(payload),
                (JobKind::OddsFull, Ok(payload)) => odds_payload = Some(payload),
                (_, Err(e)) => warn!(provider = %job.provider, "Source fetch failed: {}", e),
                _ => {}
            }
        }

        let rating_rows: Vec<TeamRatingRow> = match ratings_payload.as_ref().map(parse_ratings) {
            Some(Ok(rows)) => rows,
            Some(Err(e)) => {
                warn!("Ratings payload rejected: {}", e);
                mark_failed(&mut sources, Provider::Ratings, &e);
                Vec::new()
            }
            None => Vec::new(),
        };

        let mut invalid_events = 0usize;
        let mut odds = OddsBatch {
            events: Vec::new(),
            fetched_at: started_at,
            partials: HashMap::new(),
        };
        if let Some(payload) = &odds_payload {
            match parse_events(payload) {
                Ok(events) => {
                    info!("Fetched {} events from The Odds API", events.len());
                    odds.fetched_at = payload.fetched_at;
                    for event in events {
                        if event.home_team.trim().is_empty()
                            || event.away_team.trim().is_empty()
                            || event.commence_time.is_none()
                        {
                            warn!("Skipping odds event '{}' without teams or start time", event.id);
                            invalid_events += 1;
                            continue;
                        }
                        odds.events.push(event);
                    }
                }
                Err(e) => {
                    warn!("Odds payload rejected: {}", e);
                    mark_failed(&mut sources, Provider::Odds, &e);
                }
            }
        }

        if self.settings.fetch_partial_periods && !odds.events.is_empty() {
            self.fetch_partials(&mut odds, &mut sources, started_at).await;
        }

        // Resolve
        let mut mentions = Vec::with_capacity(rating_rows.len() + odds.events.len() * 2);
        for row in &rating_rows {
            mentions.push(RawEntityMention::new(
                row.team.clone(),
                Provider::Ratings,
                MentionRole::RatingsRow,
                ratings_payload.as_ref().map_or(started_at, |p| p.fetched_at),
            ));
        }
        for event in &odds.events {
            mentions.push(RawEntityMention::new(
                event.home_team.clone(),
                Provider::Odds,
                MentionRole::HomeTeam,
                odds.fetched_at,
            ));
            mentions.push(RawEntityMention::new(
                event.away_team.clone(),
                Provider::Odds,
                MentionRole::AwayTeam,
                odds.fetched_at,
            ));
        }

        let resolver = TeamResolver::new(self.registry.clone(), run_id);
        let resolved: Vec<Option<ResolutionRecord>> = resolver
            .resolve_all(&mentions)
            .into_iter()
            .map(|r| match r {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("{}", e);
                    None
                }
            })
            .collect();
        let team_of = |idx: usize| -> Option<TeamId> {
            resolved.get(idx).and_then(|r| r.as_ref()).and_then(|r| r.team_id)
        };

        let mut stages = StageCounts::default();
        for record in resolved.iter().flatten() {
            match record.stage {
                MatchStage::Exact => stages.exact += 1,
                MatchStage::Normalized => stages.normalized += 1,
                MatchStage::Aggressive => stages.aggressive += 1,
                MatchStage::None => stages.none += 1,
            }
        }

        // Build rows
        let rating_date = started_at.date_naive();
        let rating_snapshots: Vec<RatingSnapshot> = rating_rows
            .iter()
            .enumerate()
            .filter_map(|(i, row)| team_of(i).map(|team| RatingSnapshot::from_row(team, rating_date, row)))
            .collect();

        let offset = rating_rows.len();
        let mut games = Vec::new();
        let mut odds_snapshots = Vec::new();
        let mut unresolved_events = Vec::new();
        let mut same_team_events = Vec::new();
        let mut undated_quotes = 0usize;
        for (i, event) in odds.events.iter().enumerate() {
            let (Some(home), Some(away)) = (team_of(offset + 2 * i), team_of(offset + 2 * i + 1))
            else {
                unresolved_events.push(event.id.clone());
                continue;
            };
            if home == away {
                warn!(
                    "Home and away teams resolved to same team ID: {} (home: '{}', away: '{}')",
                    home, event.home_team, event.away_team
                );
                same_team_events.push(event.id.clone());
                continue;
            }
            let Some(commence_time) = event.commence_time else {
                continue;
            };

            let game_id = GameRecord::game_id_for(&event.id);
            games.push(GameRecord {
                game_id,
                external_id: event.id.clone(),
                home_team_id: home,
                away_team_id: away,
                commence_time,
            });
            let partials = odds.partials.get(&event.id).into_iter().flatten();
            for source in std::iter::once(event).chain(partials) {
                let extracted = extract_quotes(source);
                undated_quotes += extracted.undated;
                odds_snapshots.extend(
                    extracted
                        .quotes
                        .iter()
                        .map(|q| OddsSnapshot::from_quote(game_id, q)),
                );
            }
        }
        if !unresolved_events.is_empty() {
            warn!("{} odds events skipped with unresolved teams", unresolved_events.len());
        }
        if undated_quotes > 0 {
            warn!("{} odds markets skipped without last_update", undated_quotes);
        }

        let quality_rules = vec![
            quality::spread_range(&odds_snapshots),
            quality::total_range(&odds_snapshots),
            quality::rating_range(&rating_snapshots),
            quality::distinct_teams(odds.events.len(), &same_team_events),
        ];

        // Write
        let writer = IngestionWriter::new(self.store.clone(), self.settings.max_concurrent_writes);
        let games_written = writer.write(games).await;
        let (odds_written, ratings_written) =
            tokio::join!(writer.write(odds_snapshots), writer.write(rating_snapshots));

        let records: Vec<ResolutionRecord> = resolved.into_iter().flatten().collect();
        self.store.append_resolutions(&records).await?;

        // Barrier: every write above has completed.
        let config = self.gate.config();
        let evaluated_at = Utc::now();
        let scope = DatasetScope {
            now: evaluated_at,
            horizon: to_chrono(config.scope_horizon),
            ratings_since: rating_date
                - ChronoDuration::days(i64::from(config.ratings_max_age_days).min(MAX_WINDOW_DAYS)),
            resolution_since: evaluated_at - to_chrono(config.resolution_lookback),
            written_odds: odds_written.written,
        };
        let view = self.store.dataset_view(&scope).await?;
        let verdict = self.gate.evaluate(&RunContext {
            run_id,
            evaluated_at,
            bypass_soft_gates: options.bypass_soft_gates,
            view,
            quality_rules,
        });
        self.store.append_verdict(&verdict).await?;

        if let Some(publisher) = &self.publisher {
            if let Err(e) = publisher.publish(&verdict).await {
                warn!("Failed to publish verdict: {:?}", e);
            }
        }

        if let Err(e) = lease.release().await {
            warn!("Failed to release run lock for {}: {}", dataset, e);
        }

        let mut quota = Vec::new();
        for provider in [Provider::Ratings, Provider::Odds] {
            if let Some(status) = self.fetch.quota(provider).await {
                quota.push((provider, status));
            }
        }

        let report = RunReport {
            run_id,
            dataset,
            started_at,
            finished_at: Utc::now(),
            sources,
            quota,
            mentions: mentions.len(),
            resolution_records: records.len(),
            stages,
            invalid_events,
            unresolved_events,
            same_team_events,
            undated_quotes,
            games: games_written.stats,
            odds: odds_written.stats,
            ratings: ratings_written.stats,
            verdict,
        };
        info!(
            run_id = %run_id,
            decision = report.verdict.decision.as_str(),
            failed_sources = report.failed_sources().count(),
            "Ingestion run finished"
        );
        Ok(report)
    }

    async fn fetch_partials(
        &self,
        odds: &mut OddsBatch,
        sources: &mut Vec<SourceReport>,
        now: DateTime<Utc>,
    ) {
        let Some(feed) = &self.odds else {
            return;
        };
        let until = now + to_chrono(self.gate.config().scope_horizon);
        let mut jobs = Vec::new();
        for event in &odds.events {
            let in_scope = event
                .commence_time
                .is_some_and(|t| t >= now && t <= until);
            if !in_scope {
                continue;
            }
            for period in [Period::FirstHalf, Period::SecondHalf] {
                if let Some(request) = feed.period_request(&event.id, period) {
                    jobs.push((
                        JobKind::OddsPeriod {
                            event_id: event.id.clone(),
                        },
                        Provider::Odds,
                        request,
                    ));
                }
            }
        }

        let requested = jobs.len();
        let mut received = 0usize;
        for (job, result) in self.fetch_all(jobs).await {
            let JobKind::OddsPeriod { event_id } = &job.kind else {
                continue;
            };
            match result.and_then(|payload| parse_event(&payload)) {
                Ok(event) => {
                    received += 1;
                    if !event.bookmakers.is_empty() {
                        odds.partials
                            .entry(event_id.clone())
                            .or_default()
                            .push(event);
                    }
                }
                Err(e) => {
                    warn!("Failed to fetch period odds for event {}: {}", event_id, e);
                    sources.push(failed_report(&job, &e));
                }
            }
        }
        info!("Fetched period odds for {}/{} requests", received, requested);
    }

    /// Runs fetch jobs on the bounded pool. Results come back in job order.
    async fn fetch_all(&self, jobs: Vec<(JobKind, Provider, FetchRequest)>) -> Vec<FetchOutcome> {
        let permits = Arc::new(Semaphore::new(self.settings.max_concurrent_fetches.max(1)));
        let mut set = JoinSet::new();
        for (index, (kind, provider, request)) in jobs.into_iter().enumerate() {
            let job = FetchJob {
                index,
                kind,
                provider,
                request,
            };
            let client = self.fetch.clone();
            let permits = permits.clone();
            set.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let result = client.fetch(job.provider, &job.request).await;
                (job, result)
            });
        }

        let mut done = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => done.push(outcome),
                Err(e) => error!("Fetch task failed to complete: {}", e),
            }
        }
        done.sort_by_key(|(job, _)| job.index);
        done
    }
}

/// A payload that downloaded fine but could not be decoded.
fn mark_failed(sources: &mut [SourceReport], provider: Provider, e: &FetchError) {
    for report in sources.iter_mut().filter(|s| s.provider == provider && s.ok) {
        report.ok = false;
        report.retryable = Some(e.is_retryable());
        report.error = Some(e.to_string());
    }
}
