//! Pre-prediction validation gates.
//!
//! Hard gates (odds freshness per period, pricing completeness) block the
//! run. Soft gates (ratings coverage, odds coverage, resolution success)
//! degrade it unless the operator bypasses them. Every gate is evaluated and
//! recorded on every run.

pub mod quality;

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::registry::TeamId;
use crate::sources::Period;
use crate::store::OddsSnapshot;
pub use quality::QualityRuleResult;

#[derive(Debug, Clone, PartialEq)]
pub struct GateConfig {
    pub odds_max_age_full: Duration,
    pub odds_max_age_1h: Duration,
    pub odds_max_age_2h: Duration,
    pub min_ratings_coverage_pct: f64,
    pub min_odds_coverage_pct: f64,
    pub min_resolution_rate_pct: f64,
    pub resolution_lookback: Duration,
    pub ratings_max_age_days: u32,
    pub scope_horizon: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            odds_max_age_full: Duration::from_secs(45 * 60),
            odds_max_age_1h: Duration::from_secs(30 * 60),
            odds_max_age_2h: Duration::from_secs(30 * 60),
            min_ratings_coverage_pct: 85.0,
            min_odds_coverage_pct: 80.0,
            min_resolution_rate_pct: 95.0,
            resolution_lookback: Duration::from_secs(7 * 24 * 3600),
            ratings_max_age_days: 1,
            scope_horizon: Duration::from_secs(36 * 3600),
        }
    }
}

impl GateConfig {
    pub fn odds_max_age(&self, period: Period) -> Duration {
        match period {
            Period::Full => self.odds_max_age_full,
            Period::FirstHalf => self.odds_max_age_1h,
            Period::SecondHalf => self.odds_max_age_2h,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Pass,
    Degrade,
    Block,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Pass => "PASS",
            Decision::Degrade => "DEGRADE",
            Decision::Block => "BLOCK",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateKind {
    Hard,
    Soft,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateStatus {
    Passed,
    Failed,
    /// Failed, but the operator bypassed soft gates for this run.
    Waived,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateOutcome {
    pub name: String,
    pub kind: GateKind,
    pub status: GateStatus,
    /// `None` when nothing was there to measure.
    pub observed: Option<f64>,
    pub threshold: f64,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GateMetrics {
    pub subjects: usize,
    pub max_odds_age_minutes: BTreeMap<Period, f64>,
    pub odds_rows_written: usize,
    pub pricing_completeness_pct: Option<f64>,
    pub ratings_coverage_pct: Option<f64>,
    pub odds_coverage_pct: Option<f64>,
    pub resolution_success_pct: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateVerdict {
    pub run_id: Uuid,
    pub evaluated_at: DateTime<Utc>,
    pub decision: Decision,
    pub safe_to_predict: bool,
    pub bypass_requested: bool,
    /// Bypass actually turned a soft failure into a pass.
    pub bypass_granted: bool,
    pub metrics: GateMetrics,
    pub gates: Vec<GateOutcome>,
    pub quality_rules: Vec<QualityRuleResult>,
    pub warnings: Vec<String>,
}

impl GateVerdict {
    pub fn gate(&self, name: &str) -> Option<&GateOutcome> {
        self.gates.iter().find(|g| g.name == name)
    }
}

/// An in-scope game as the gate sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct Subject {
    pub game_id: Uuid,
    pub external_id: String,
    pub commence_time: DateTime<Utc>,
    pub home_team_id: TeamId,
    pub away_team_id: TeamId,
    /// Newest odds `observed_at` per period.
    pub latest_odds: BTreeMap<Period, DateTime<Utc>>,
    pub has_complete_full_game_odds: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionStats {
    pub total: u64,
    pub resolved: u64,
}

#[derive(Debug, Clone, Default)]
pub struct DatasetView {
    pub subjects: Vec<Subject>,
    /// Teams with a rating no older than the freshness window.
    pub rated_teams: HashSet<TeamId>,
    pub written_odds: Vec<OddsSnapshot>,
    pub resolution: ResolutionStats,
}

#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub evaluated_at: DateTime<Utc>,
    pub bypass_soft_gates: bool,
    pub view: DatasetView,
    pub quality_rules: Vec<QualityRuleResult>,
}

fn pct(part: usize, whole: usize) -> f64 {
    part as f64 * 100.0 / whole as f64
}

fn minutes(d: Duration) -> f64 {
    d.as_secs_f64() / 60.0
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub struct GateEngine {
    config: GateConfig,
}

impl GateEngine {
    pub fn new(config: GateConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn evaluate(&self, ctx: &RunContext) -> GateVerdict {
        let view = &ctx.view;
        let mut warnings = Vec::new();
        let mut metrics = GateMetrics {
            subjects: view.subjects.len(),
            odds_rows_written: view.written_odds.len(),
            ..GateMetrics::default()
        };
        let mut gates = Vec::new();

        if view.subjects.is_empty() {
            warnings.push("no in-scope games; coverage and freshness gates pass vacuously".to_string());
        }

        // Hard gates
        for period in Period::ALL {
            gates.push(self.odds_freshness(ctx, period, &mut metrics));
        }
        gates.push(self.pricing_completeness(view, &mut metrics, &mut warnings));

        // Soft gates
        gates.push(self.ratings_coverage(view, &mut metrics));
        gates.push(self.odds_coverage(view, &mut metrics));
        gates.push(self.resolution_success(view, &mut metrics, &mut warnings));

        let hard_failed = gates
            .iter()
            .any(|g| g.kind == GateKind::Hard && g.status == GateStatus::Failed);
        let soft_failed = gates
            .iter()
            .any(|g| g.kind == GateKind::Soft && g.status == GateStatus::Failed);

        let mut bypass_granted = false;
        let decision = if hard_failed {
            Decision::Block
        } else if soft_failed && ctx.bypass_soft_gates {
            for gate in gates.iter_mut().filter(|g| g.status == GateStatus::Failed) {
                gate.status = GateStatus::Waived;
                warnings.push(format!("soft gate '{}' bypassed: {}", gate.name, gate.detail));
            }
            bypass_granted = true;
            Decision::Pass
        } else if soft_failed {
            Decision::Degrade
        } else {
            Decision::Pass
        };

        for gate in gates.iter().filter(|g| g.status == GateStatus::Failed) {
            warn!(gate = %gate.name, kind = ?gate.kind, "Gate failed: {}", gate.detail);
        }
        for rule in ctx.quality_rules.iter().filter(|r| !r.passed) {
            warnings.push(format!(
                "quality rule '{}' found {} violation(s)",
                rule.rule, rule.violations
            ));
        }

        info!(
            run_id = %ctx.run_id,
            decision = decision.as_str(),
            bypass = bypass_granted,
            "Validation gates evaluated"
        );

        GateVerdict {
            run_id: ctx.run_id,
            evaluated_at: ctx.evaluated_at,
            decision,
            safe_to_predict: decision == Decision::Pass,
            bypass_requested: ctx.bypass_soft_gates,
            bypass_granted,
            metrics,
            gates,
            quality_rules: ctx.quality_rules.clone(),
            warnings,
        }
    }

    fn odds_freshness(
        &self,
        ctx: &RunContext,
        period: Period,
        metrics: &mut GateMetrics,
    ) -> GateOutcome {
        let max_age = self.config.odds_max_age(period);
        let mut oldest: Option<Duration> = None;
        let mut stale = Vec::new();

        for subject in &ctx.view.subjects {
            let Some(newest) = subject.latest_odds.get(&period) else {
                continue;
            };
            // Rows stamped in the future count as brand new
            let age = (ctx.evaluated_at - *newest).to_std().unwrap_or(Duration::ZERO);
            if age >= max_age {
                stale.push(subject.external_id.clone());
            }
            oldest = Some(oldest.map_or(age, |o| o.max(age)));
        }

        let observed = oldest.map(|age| round2(minutes(age)));
        if let Some(minutes) = observed {
            metrics.max_odds_age_minutes.insert(period, minutes);
        }

        let (status, detail) = if stale.is_empty() {
            let detail = match observed {
                Some(m) => format!("newest {period} odds at most {m} min old"),
                None => format!("no {period} odds for in-scope games"),
            };
            (GateStatus::Passed, detail)
        } else {
            (
                GateStatus::Failed,
                format!(
                    "{} game(s) with {period} odds older than {} min: {}",
                    stale.len(),
                    minutes(max_age),
                    stale.join(", ")
                ),
            )
        };

        GateOutcome {
            name: format!("odds_freshness_{period}"),
            kind: GateKind::Hard,
            status,
            observed,
            threshold: minutes(max_age),
            detail,
        }
    }

    fn pricing_completeness(
        &self,
        view: &DatasetView,
        metrics: &mut GateMetrics,
        warnings: &mut Vec<String>,
    ) -> GateOutcome {
        let total = view.written_odds.len();
        let incomplete: Vec<&OddsSnapshot> =
            view.written_odds.iter().filter(|row| !row.is_complete()).collect();

        if total == 0 {
            warnings.push("no odds rows written this run; pricing completeness passes vacuously".to_string());
            return GateOutcome {
                name: "pricing_completeness".to_string(),
                kind: GateKind::Hard,
                status: GateStatus::Passed,
                observed: None,
                threshold: 100.0,
                detail: "no odds rows written".to_string(),
            };
        }

        let observed = round2(pct(total - incomplete.len(), total));
        metrics.pricing_completeness_pct = Some(observed);

        let (status, detail) = match incomplete.first() {
            None => (GateStatus::Passed, format!("all {total} odds rows fully priced")),
            Some(first) => (
                GateStatus::Failed,
                format!(
                    "{} of {total} odds rows missing prices (e.g. {} {} {} missing {})",
                    incomplete.len(),
                    first.bookmaker,
                    first.market_type,
                    first.period,
                    first.missing_fields().join("/")
                ),
            ),
        };

        GateOutcome {
            name: "pricing_completeness".to_string(),
            kind: GateKind::Hard,
            status,
            observed: Some(observed),
            threshold: 100.0,
            detail,
        }
    }

    /// Compares the unrounded rate; rounding is for display only.
    fn soft_gate(name: &str, measured: Option<f64>, threshold: f64, what: &str) -> GateOutcome {
        let observed = measured.map(round2);
        let (status, detail) = match (measured, observed) {
            (Some(value), Some(shown)) if value >= threshold => (
                GateStatus::Passed,
                format!("{what} {shown}% meets {threshold}%"),
            ),
            (Some(_), Some(shown)) => (
                GateStatus::Failed,
                format!("{what} {shown}% below {threshold}%"),
            ),
            _ => (GateStatus::Passed, format!("nothing to measure for {what}")),
        };
        GateOutcome {
            name: name.to_string(),
            kind: GateKind::Soft,
            status,
            observed,
            threshold,
            detail,
        }
    }

    fn ratings_coverage(&self, view: &DatasetView, metrics: &mut GateMetrics) -> GateOutcome {
        let teams: HashSet<TeamId> = view
            .subjects
            .iter()
            .flat_map(|s| [s.home_team_id, s.away_team_id])
            .collect();
        let measured = if teams.is_empty() {
            None
        } else {
            let covered = teams.iter().filter(|t| view.rated_teams.contains(t)).count();
            Some(pct(covered, teams.len()))
        };
        metrics.ratings_coverage_pct = measured.map(round2);
        Self::soft_gate(
            "ratings_coverage",
            measured,
            self.config.min_ratings_coverage_pct,
            "ratings coverage",
        )
    }

    fn odds_coverage(&self, view: &DatasetView, metrics: &mut GateMetrics) -> GateOutcome {
        let measured = if view.subjects.is_empty() {
            None
        } else {
            let covered = view
                .subjects
                .iter()
                .filter(|s| s.has_complete_full_game_odds)
                .count();
            Some(pct(covered, view.subjects.len()))
        };
        metrics.odds_coverage_pct = measured.map(round2);
        Self::soft_gate(
            "odds_coverage",
            measured,
            self.config.min_odds_coverage_pct,
            "full-game odds coverage",
        )
    }

    fn resolution_success(
        &self,
        view: &DatasetView,
        metrics: &mut GateMetrics,
        warnings: &mut Vec<String>,
    ) -> GateOutcome {
        let stats = view.resolution;
        let measured = if stats.total == 0 {
            warnings.push("no resolution history in lookback window; resolution gate passes vacuously".to_string());
            None
        } else {
            Some(stats.resolved as f64 * 100.0 / stats.total as f64)
        };
        metrics.resolution_success_pct = measured.map(round2);
        Self::soft_gate(
            "resolution_success",
            measured,
            self.config.min_resolution_rate_pct,
            "team resolution success",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::MarketType;
    use chrono::Duration as ChronoDuration;

    fn team(n: u128) -> TeamId {
        TeamId(Uuid::from_u128(n))
    }

    fn subject(n: u128, now: DateTime<Utc>, odds_age_min: Option<i64>) -> Subject {
        let mut latest_odds = BTreeMap::new();
        if let Some(age) = odds_age_min {
            latest_odds.insert(Period::Full, now - ChronoDuration::minutes(age));
        }
        Subject {
            game_id: Uuid::from_u128(n),
            external_id: format!("evt-{n}"),
            commence_time: now + ChronoDuration::hours(3),
            home_team_id: team(n * 2),
            away_team_id: team(n * 2 + 1),
            latest_odds,
            has_complete_full_game_odds: odds_age_min.is_some(),
        }
    }

    fn context(view: DatasetView, now: DateTime<Utc>) -> RunContext {
        RunContext {
            run_id: Uuid::new_v4(),
            evaluated_at: now,
            bypass_soft_gates: false,
            view,
            quality_rules: vec![],
        }
    }

    fn all_rated(subjects: &[Subject]) -> HashSet<TeamId> {
        subjects
            .iter()
            .flat_map(|s| [s.home_team_id, s.away_team_id])
            .collect()
    }

    #[test]
    fn empty_dataset_passes_with_warnings() {
        let now = Utc::now();
        let verdict = GateEngine::new(GateConfig::default()).evaluate(&context(DatasetView::default(), now));
        assert_eq!(verdict.decision, Decision::Pass);
        assert!(verdict.safe_to_predict);
        assert_eq!(verdict.gates.len(), 7);
        assert!(verdict.warnings.len() >= 3);
    }

    #[test]
    fn odds_exactly_at_max_age_are_stale() {
        let now = Utc::now();
        let subjects = vec![subject(1, now, Some(45))];
        let view = DatasetView {
            rated_teams: all_rated(&subjects),
            subjects,
            written_odds: vec![],
            resolution: ResolutionStats { total: 2, resolved: 2 },
        };
        let verdict = GateEngine::new(GateConfig::default()).evaluate(&context(view, now));
        assert_eq!(verdict.decision, Decision::Block);
        assert_eq!(
            verdict.gate("odds_freshness_full").map(|g| g.status),
            Some(GateStatus::Failed)
        );
    }

    #[test]
    fn rate_just_under_minimum_fails_even_when_it_rounds_up() {
        let now = Utc::now();
        let subjects = vec![subject(1, now, Some(5))];
        let view = DatasetView {
            rated_teams: all_rated(&subjects),
            subjects,
            written_odds: vec![],
            resolution: ResolutionStats { total: 40_000, resolved: 37_999 },
        };
        let verdict = GateEngine::new(GateConfig::default()).evaluate(&context(view, now));

        let gate = verdict.gate("resolution_success").unwrap();
        assert_eq!(gate.status, GateStatus::Failed);
        assert_eq!(gate.observed, Some(95.0));
        assert_eq!(verdict.metrics.resolution_success_pct, Some(95.0));
        assert_eq!(verdict.decision, Decision::Degrade);
    }

    #[test]
    fn bypass_does_not_lift_a_block() {
        let now = Utc::now();
        let subjects = vec![subject(1, now, Some(90)), subject(2, now, None)];
        let view = DatasetView {
            rated_teams: HashSet::new(),
            subjects,
            written_odds: vec![],
            resolution: ResolutionStats { total: 4, resolved: 4 },
        };
        let mut ctx = context(view, now);
        ctx.bypass_soft_gates = true;
        let verdict = GateEngine::new(GateConfig::default()).evaluate(&ctx);

        assert_eq!(verdict.decision, Decision::Block);
        assert!(!verdict.bypass_granted);
        assert_eq!(
            verdict.gate("ratings_coverage").map(|g| g.status),
            Some(GateStatus::Failed)
        );
    }

    #[test]
    fn incomplete_written_row_blocks() {
        let now = Utc::now();
        let row = OddsSnapshot {
            game_id: Uuid::from_u128(1),
            bookmaker: "bovada".into(),
            market_type: MarketType::H2h,
            period: Period::Full,
            observed_at: now,
            home_line: None,
            away_line: None,
            total_line: None,
            home_price: Some(-150),
            away_price: None,
            over_price: None,
            under_price: None,
        };
        let view = DatasetView {
            written_odds: vec![row],
            ..DatasetView::default()
        };
        let verdict = GateEngine::new(GateConfig::default()).evaluate(&context(view, now));
        let gate = verdict.gate("pricing_completeness").unwrap();
        assert_eq!(gate.status, GateStatus::Failed);
        assert_eq!(gate.observed, Some(0.0));
        assert_eq!(verdict.decision, Decision::Block);
    }
}
