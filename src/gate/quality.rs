//! Plausibility rules over the rows of a run. They only add warnings to the
//! verdict; the decision comes from the gates.

use serde::{Deserialize, Serialize};

use crate::sources::{MarketType, Period};
use crate::store::{OddsSnapshot, RatingSnapshot};

const MAX_ABS_SPREAD: f64 = 50.0;
const MIN_TOTAL: f64 = 80.0;
const MAX_TOTAL: f64 = 250.0;
const RATING_BOUNDS: (f64, f64) = (0.0, 200.0);
const MAX_EXAMPLES: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityRuleResult {
    pub rule: String,
    pub passed: bool,
    pub checked: usize,
    pub violations: usize,
    pub examples: Vec<String>,
}

impl QualityRuleResult {
    fn from_violations(rule: &str, checked: usize, violations: Vec<String>) -> Self {
        Self {
            rule: rule.to_string(),
            passed: violations.is_empty(),
            checked,
            violations: violations.len(),
            examples: violations.into_iter().take(MAX_EXAMPLES).collect(),
        }
    }
}

pub fn spread_range(rows: &[OddsSnapshot]) -> QualityRuleResult {
    let spreads: Vec<&OddsSnapshot> = rows
        .iter()
        .filter(|r| r.market_type == MarketType::Spreads)
        .collect();
    let violations = spreads
        .iter()
        .filter(|r| {
            [r.home_line, r.away_line]
                .into_iter()
                .flatten()
                .any(|line| line.abs() > MAX_ABS_SPREAD)
        })
        .map(|r| format!("{} {} {} {:?}", r.game_id, r.bookmaker, r.period, r.home_line))
        .collect();
    QualityRuleResult::from_violations("spread_range", spreads.len(), violations)
}

/// Full-game totals only; half totals sit well below the full-game band.
pub fn total_range(rows: &[OddsSnapshot]) -> QualityRuleResult {
    let totals: Vec<&OddsSnapshot> = rows
        .iter()
        .filter(|r| r.market_type == MarketType::Totals && r.period == Period::Full)
        .collect();
    let violations = totals
        .iter()
        .filter(|r| {
            r.total_line
                .is_some_and(|t| !(MIN_TOTAL..=MAX_TOTAL).contains(&t))
        })
        .map(|r| format!("{} {} {:?}", r.game_id, r.bookmaker, r.total_line))
        .collect();
    QualityRuleResult::from_violations("total_range", totals.len(), violations)
}

pub fn rating_range(rows: &[RatingSnapshot]) -> QualityRuleResult {
    let (lo, hi) = RATING_BOUNDS;
    let violations = rows
        .iter()
        .filter(|r| {
            [r.adj_o, r.adj_d, r.tempo]
                .iter()
                .any(|v| !v.is_finite() || *v < lo || *v > hi)
        })
        .map(|r| format!("{} adj_o={} adj_d={} tempo={}", r.team_id, r.adj_o, r.adj_d, r.tempo))
        .collect();
    QualityRuleResult::from_violations("rating_range", rows.len(), violations)
}

/// `same_team_events` are provider events whose two sides resolved to one team.
pub fn distinct_teams(events_checked: usize, same_team_events: &[String]) -> QualityRuleResult {
    QualityRuleResult::from_violations("distinct_teams", events_checked, same_team_events.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn odds(market_type: MarketType, period: Period, line: f64) -> OddsSnapshot {
        OddsSnapshot {
            game_id: Uuid::nil(),
            bookmaker: "fanduel".into(),
            market_type,
            period,
            observed_at: Utc::now(),
            home_line: Some(line),
            away_line: Some(-line),
            total_line: Some(line),
            home_price: Some(-110),
            away_price: Some(-110),
            over_price: Some(-110),
            under_price: Some(-110),
        }
    }

    #[test]
    fn flags_implausible_spreads() {
        let rows = vec![
            odds(MarketType::Spreads, Period::Full, -7.5),
            odds(MarketType::Spreads, Period::Full, 65.0),
        ];
        let result = spread_range(&rows);
        assert!(!result.passed);
        assert_eq!((result.checked, result.violations), (2, 1));
    }

    #[test]
    fn half_game_totals_are_not_checked() {
        let rows = vec![
            odds(MarketType::Totals, Period::FirstHalf, 68.5),
            odds(MarketType::Totals, Period::Full, 141.0),
        ];
        let result = total_range(&rows);
        assert!(result.passed);
        assert_eq!(result.checked, 1);
    }

    #[test]
    fn distinct_teams_reports_each_event() {
        let result = distinct_teams(10, &["evt-3".to_string()]);
        assert!(!result.passed);
        assert_eq!(result.examples, vec!["evt-3".to_string()]);
    }
}
