#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{json, Value};

use ncaam_ingest::error::TransportError;
use ncaam_ingest::fetch::backoff::RetryPolicy;
use ncaam_ingest::fetch::breaker::BreakerPolicy;
use ncaam_ingest::fetch::limiter::RateLimit;
use ncaam_ingest::fetch::{FetchRequest, HttpResponse, SourcePolicy, Transport};
use ncaam_ingest::registry::CanonicalTeam;
use ncaam_ingest::sources::{OddsFeed, RatingsFeed};
use ncaam_ingest::{
    AliasRegistry, FetchClient, GateConfig, GateEngine, IngestionPipeline, MemoryStore,
    PipelineSettings, Provider, TeamId,
};

pub const ODDS_BASE: &str = "https://odds.test/v4";
pub const RATINGS_BASE: &str = "https://ratings.test";
pub const SPORT_KEY: &str = "basketball_ncaab";

/// Answers by URL fragment; anything unrouted is a 404.
pub struct RoutedTransport {
    routes: Mutex<Vec<(String, HttpResponse)>>,
    calls: Mutex<Vec<String>>,
}

impl RoutedTransport {
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn route(self, fragment: &str, response: HttpResponse) -> Self {
        self.routes
            .lock()
            .unwrap()
            .push((fragment.to_string(), response));
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for RoutedTransport {
    async fn get(&self, request: &FetchRequest) -> Result<HttpResponse, TransportError> {
        self.calls.lock().unwrap().push(request.url.clone());
        let routes = self.routes.lock().unwrap();
        Ok(routes
            .iter()
            .find(|(fragment, _)| request.url.contains(fragment.as_str()))
            .map(|(_, response)| response.clone())
            .unwrap_or_else(|| HttpResponse::new(404, "not found")))
    }
}

fn team(canonical: &str, aliases: &[&str]) -> CanonicalTeam {
    CanonicalTeam {
        id: TeamId::from_canonical_name(canonical),
        canonical_name: canonical.to_string(),
        aliases: aliases.iter().map(|a| a.to_string()).collect(),
        provenance: "test".to_string(),
    }
}

pub fn registry() -> AliasRegistry {
    AliasRegistry::from_teams(
        "test/1",
        vec![
            team("Ohio State", &["Ohio St.", "Ohio St"]),
            team("Duke", &["Duke Blue Devils"]),
            team("San José State", &["San Jose St."]),
            team("Miami (FL)", &["Miami FL"]),
            team("Miami (OH)", &["Miami OH"]),
            team("Saint Mary's", &["St. Mary's"]),
        ],
    )
    .unwrap()
}

pub fn team_id(canonical: &str) -> TeamId {
    TeamId::from_canonical_name(canonical)
}

pub fn policy() -> SourcePolicy {
    SourcePolicy {
        rate: RateLimit {
            capacity: 100,
            refill_per_minute: 6000,
            max_wait: Duration::from_secs(5),
        },
        retry: RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        },
        breaker: BreakerPolicy::default(),
        low_quota_threshold: 50,
    }
}

pub fn settings(fetch_partial_periods: bool) -> PipelineSettings {
    PipelineSettings {
        dataset: "ncaam".to_string(),
        max_concurrent_fetches: 4,
        max_concurrent_writes: 4,
        fetch_partial_periods,
    }
}

pub fn pipeline(
    transport: Arc<RoutedTransport>,
    store: Arc<MemoryStore>,
    settings: PipelineSettings,
) -> IngestionPipeline {
    let fetch = FetchClient::new(transport)
        .with_source(Provider::Odds, policy())
        .with_source(Provider::Ratings, policy());
    IngestionPipeline::new(
        Arc::new(fetch),
        Arc::new(registry()),
        store,
        GateEngine::new(GateConfig::default()),
        settings,
    )
    .with_odds(OddsFeed::new(ODDS_BASE, SPORT_KEY, "test-key"))
    .with_ratings(RatingsFeed::new(RATINGS_BASE, 2027))
}

pub fn minutes_ago(n: i64) -> DateTime<Utc> {
    Utc::now() - ChronoDuration::minutes(n)
}

pub fn hours_ahead(n: i64) -> DateTime<Utc> {
    Utc::now() + ChronoDuration::hours(n)
}

pub fn full_game_markets(home: &str, away: &str, updated: DateTime<Utc>) -> Value {
    json!([
        {
            "key": "spreads",
            "last_update": updated.to_rfc3339(),
            "outcomes": [
                {"name": home, "price": -110, "point": -3.5},
                {"name": away, "price": -110, "point": 3.5}
            ]
        },
        {
            "key": "totals",
            "last_update": updated.to_rfc3339(),
            "outcomes": [
                {"name": "Over", "price": -110, "point": 141.5},
                {"name": "Under", "price": -110, "point": 141.5}
            ]
        },
        {
            "key": "h2h",
            "last_update": updated.to_rfc3339(),
            "outcomes": [
                {"name": home, "price": -160},
                {"name": away, "price": 140}
            ]
        }
    ])
}

pub fn event(
    id: &str,
    home: &str,
    away: &str,
    commence: DateTime<Utc>,
    markets: Value,
) -> Value {
    json!({
        "id": id,
        "sport_key": SPORT_KEY,
        "commence_time": commence.to_rfc3339(),
        "home_team": home,
        "away_team": away,
        "bookmakers": [
            {"key": "draftkings", "title": "DraftKings", "markets": markets}
        ]
    })
}

pub fn ratings_row(team: &str, adj_o: f64, adj_d: f64, tempo: f64) -> Value {
    let mut row = vec![json!(0.0); 46];
    row[0] = json!(1);
    row[1] = json!(team);
    row[2] = json!("B10");
    row[3] = json!("20-5");
    row[4] = json!(adj_o);
    row[6] = json!(adj_d);
    row[44] = json!(tempo);
    row[45] = json!(2.5);
    Value::Array(row)
}

pub fn ok(body: Value) -> HttpResponse {
    HttpResponse::new(200, body.to_string())
        .with_header("x-requests-remaining", "480")
        .with_header("x-requests-used", "20")
}
