//! The Odds API: request builders, payload structs and market extraction.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FetchError;
use crate::fetch::{FetchRequest, Payload, Provider};

/// The Odds API event structure
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct OddsApiEvent {
    pub id: String,
    pub sport_key: String,
    pub commence_time: Option<DateTime<Utc>>,
    pub home_team: String,
    pub away_team: String,
    pub bookmakers: Vec<Bookmaker>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Bookmaker {
    pub key: String,
    pub title: String,
    pub last_update: Option<DateTime<Utc>>,
    pub markets: Vec<Market>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Market {
    pub key: String,
    pub last_update: Option<DateTime<Utc>>,
    pub outcomes: Vec<Outcome>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Outcome {
    pub name: String,
    pub price: Option<i32>,
    pub point: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketType {
    Spreads,
    Totals,
    H2h,
}

impl MarketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketType::Spreads => "spreads",
            MarketType::Totals => "totals",
            MarketType::H2h => "h2h",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "spreads" => Some(MarketType::Spreads),
            "totals" => Some(MarketType::Totals),
            "h2h" => Some(MarketType::H2h),
            _ => None,
        }
    }
}

impl fmt::Display for MarketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Period {
    #[serde(rename = "full")]
    Full,
    #[serde(rename = "1h")]
    FirstHalf,
    #[serde(rename = "2h")]
    SecondHalf,
}

impl Period {
    pub const ALL: [Period; 3] = [Period::Full, Period::FirstHalf, Period::SecondHalf];

    pub fn as_str(&self) -> &'static str {
        match self {
            Period::Full => "full",
            Period::FirstHalf => "1h",
            Period::SecondHalf => "2h",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "full" => Some(Period::Full),
            "1h" => Some(Period::FirstHalf),
            "2h" => Some(Period::SecondHalf),
            _ => None,
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn parse_market_key(key: &str) -> Option<(MarketType, Period)> {
    let parsed = match key {
        "spreads" => (MarketType::Spreads, Period::Full),
        "totals" => (MarketType::Totals, Period::Full),
        "h2h" => (MarketType::H2h, Period::Full),
        "spreads_h1" => (MarketType::Spreads, Period::FirstHalf),
        "totals_h1" => (MarketType::Totals, Period::FirstHalf),
        "h2h_h1" => (MarketType::H2h, Period::FirstHalf),
        "spreads_h2" => (MarketType::Spreads, Period::SecondHalf),
        "totals_h2" => (MarketType::Totals, Period::SecondHalf),
        "h2h_h2" => (MarketType::H2h, Period::SecondHalf),
        _ => return None,
    };
    Some(parsed)
}

/// One bookmaker's prices for one market of one event.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketQuote {
    pub bookmaker: String,
    pub market_type: MarketType,
    pub period: Period,
    /// Market `last_update`, else bookmaker `last_update`.
    pub observed_at: DateTime<Utc>,
    pub home_line: Option<f64>,
    pub away_line: Option<f64>,
    pub total_line: Option<f64>,
    pub home_price: Option<i32>,
    pub away_price: Option<i32>,
    pub over_price: Option<i32>,
    pub under_price: Option<i32>,
}

/// Recognised markets of one event.
#[derive(Debug, Clone, Default)]
pub struct EventQuotes {
    pub quotes: Vec<MarketQuote>,
    /// Markets dropped because neither they nor their bookmaker carried
    /// `last_update`. `observed_at` is part of the odds key and must come
    /// from the payload.
    pub undated: usize,
}

/// Extract every recognised market of an event. Unknown market keys and
/// markets without outcomes are skipped.
pub fn extract_quotes(event: &OddsApiEvent) -> EventQuotes {
    let mut quotes = Vec::new();
    let mut undated = 0;
    for bookmaker in &event.bookmakers {
        for market in &bookmaker.markets {
            let Some((market_type, period)) = parse_market_key(&market.key) else {
                continue;
            };
            if market.outcomes.is_empty() {
                continue;
            }
            let Some(observed_at) = market.last_update.or(bookmaker.last_update) else {
                undated += 1;
                continue;
            };

            let mut quote = MarketQuote {
                bookmaker: bookmaker.key.clone(),
                market_type,
                period,
                observed_at,
                home_line: None,
                away_line: None,
                total_line: None,
                home_price: None,
                away_price: None,
                over_price: None,
                under_price: None,
            };

            for outcome in &market.outcomes {
                match market_type {
                    MarketType::Spreads => {
                        if outcome.name == event.home_team {
                            quote.home_line = outcome.point;
                            quote.home_price = outcome.price;
                        } else {
                            quote.away_line = outcome.point;
                            quote.away_price = outcome.price;
                        }
                    }
                    MarketType::Totals => {
                        if outcome.name == "Over" {
                            quote.total_line = outcome.point;
                            quote.over_price = outcome.price;
                        } else if outcome.name == "Under" {
                            quote.total_line = quote.total_line.or(outcome.point);
                            quote.under_price = outcome.price;
                        }
                    }
                    MarketType::H2h => {
                        if outcome.name == event.home_team {
                            quote.home_price = outcome.price;
                        } else {
                            quote.away_price = outcome.price;
                        }
                    }
                }
            }

            quotes.push(quote);
        }
    }
    EventQuotes { quotes, undated }
}

/// Request builder for The Odds API v4.
#[derive(Debug, Clone)]
pub struct OddsFeed {
    pub base_url: String,
    pub sport_key: String,
    pub api_key: String,
}

impl OddsFeed {
    pub fn new(
        base_url: impl Into<String>,
        sport_key: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            sport_key: sport_key.into(),
            api_key: api_key.into(),
        }
    }

    /// Full-game markets for every upcoming event. Bookmakers are not
    /// restricted here, otherwise many events lack spreads/totals.
    pub fn full_game_request(&self) -> FetchRequest {
        FetchRequest::new(format!("{}/sports/{}/odds", self.base_url, self.sport_key))
            .query("apiKey", self.api_key.as_str())
            .query("regions", "us")
            .query("markets", "spreads,totals,h2h")
            .query("oddsFormat", "american")
            .query("dateFormat", "iso")
            .label(format!("odds:{}:full", self.sport_key))
    }

    /// Half-game markets for one event. `None` for the full game.
    pub fn period_request(&self, event_id: &str, period: Period) -> Option<FetchRequest> {
        let (markets, bookmakers) = match period {
            Period::Full => return None,
            // Bovada has the best NCAAB 1H coverage
            Period::FirstHalf => ("spreads_h1,totals_h1,h2h_h1", "bovada,pinnacle,circa,bookmaker"),
            Period::SecondHalf => ("spreads_h2,totals_h2,h2h_h2", "draftkings,fanduel,pinnacle,bovada"),
        };
        let request = FetchRequest::new(format!(
            "{}/sports/{}/events/{}/odds",
            self.base_url, self.sport_key, event_id
        ))
        .query("apiKey", self.api_key.as_str())
        .query("regions", "us")
        .query("markets", markets)
        .query("bookmakers", bookmakers)
        .query("oddsFormat", "american")
        .query("dateFormat", "iso")
        .label(format!("odds:{}:{}:{}", self.sport_key, event_id, period));
        Some(request)
    }
}

pub fn parse_events(payload: &Payload) -> Result<Vec<OddsApiEvent>, FetchError> {
    serde_json::from_str(&payload.body).map_err(|e| {
        FetchError::malformed(Provider::Odds, format!("failed to parse events: {e}"))
    })
}

pub fn parse_event(payload: &Payload) -> Result<OddsApiEvent, FetchError> {
    serde_json::from_str(&payload.body).map_err(|e| {
        FetchError::malformed(Provider::Odds, format!("failed to parse event odds: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const EVENT: &str = r#"{
        "id": "evt-1",
        "sport_key": "basketball_ncaab",
        "commence_time": "2026-11-04T00:00:00Z",
        "home_team": "Duke Blue Devils",
        "away_team": "Kansas Jayhawks",
        "bookmakers": [{
            "key": "pinnacle",
            "title": "Pinnacle",
            "last_update": "2026-11-03T18:00:00Z",
            "markets": [
                {"key": "spreads", "last_update": "2026-11-03T18:05:00Z", "outcomes": [
                    {"name": "Duke Blue Devils", "price": -110, "point": -3.5},
                    {"name": "Kansas Jayhawks", "price": -110, "point": 3.5}
                ]},
                {"key": "totals", "outcomes": [
                    {"name": "Over", "price": -108, "point": 148.5},
                    {"name": "Under", "price": -112, "point": 148.5}
                ]},
                {"key": "h2h", "outcomes": []},
                {"key": "player_points", "outcomes": [{"name": "x", "price": 100}]}
            ]
        }]
    }"#;

    #[test]
    fn extracts_known_markets_only() {
        let event: OddsApiEvent = serde_json::from_str(EVENT).unwrap();
        let EventQuotes { quotes, undated } = extract_quotes(&event);

        assert_eq!(undated, 0);
        assert_eq!(quotes.len(), 2);
        let spread = &quotes[0];
        assert_eq!(spread.market_type, MarketType::Spreads);
        assert_eq!(spread.home_line, Some(-3.5));
        assert_eq!(spread.away_price, Some(-110));
        assert_eq!(
            spread.observed_at,
            Utc.with_ymd_and_hms(2026, 11, 3, 18, 5, 0).unwrap()
        );

        let total = &quotes[1];
        assert_eq!(total.total_line, Some(148.5));
        assert_eq!(total.under_price, Some(-112));
        // falls back to the bookmaker timestamp
        assert_eq!(
            total.observed_at,
            Utc.with_ymd_and_hms(2026, 11, 3, 18, 0, 0).unwrap()
        );
    }

    #[test]
    fn markets_without_any_timestamp_are_dropped() {
        let mut event: OddsApiEvent = serde_json::from_str(EVENT).unwrap();
        event.bookmakers[0].last_update = None;

        let first = extract_quotes(&event);
        assert_eq!(first.quotes.len(), 1);
        assert_eq!(first.quotes[0].market_type, MarketType::Spreads);
        assert_eq!(first.undated, 1);

        // Same payload later: same keys
        let again = extract_quotes(&event);
        assert_eq!(
            again.quotes[0].observed_at,
            first.quotes[0].observed_at
        );
    }

    #[test]
    fn market_keys_map_to_periods() {
        assert_eq!(
            parse_market_key("totals_h1"),
            Some((MarketType::Totals, Period::FirstHalf))
        );
        assert_eq!(
            parse_market_key("h2h_h2"),
            Some((MarketType::H2h, Period::SecondHalf))
        );
        assert_eq!(parse_market_key("alternate_spreads"), None);
    }

    #[test]
    fn period_requests_target_event_endpoint() {
        let feed = OddsFeed::new("https://api.the-odds-api.com/v4/", "basketball_ncaab", "k");
        assert!(feed.period_request("evt-1", Period::Full).is_none());

        let request = feed.period_request("evt-1", Period::FirstHalf).unwrap();
        assert_eq!(
            request.url,
            "https://api.the-odds-api.com/v4/sports/basketball_ncaab/events/evt-1/odds"
        );
        assert!(request
            .query
            .contains(&("markets".to_string(), "spreads_h1,totals_h1,h2h_h1".to_string())));
        assert_eq!(request.label, "odds:basketball_ncaab:evt-1:1h");
    }
}
