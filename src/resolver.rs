//! Team-name resolution with an audit record per mention.
//!
//! Stages run in order and stop at the first hit:
//! exact alias, normalized alias, canonical name without the trailing word.
//! A miss is an outcome (`MatchStage::None`), not an error.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::ResolveError;
use crate::fetch::Provider;
use crate::names::{exact_key, normalized_key, without_last_word};
use crate::registry::{AliasRegistry, CanonicalTeam, TeamId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStage {
    Exact,
    Normalized,
    Aggressive,
    None,
}

impl MatchStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStage::Exact => "exact",
            MatchStage::Normalized => "normalized",
            MatchStage::Aggressive => "aggressive",
            MatchStage::None => "none",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "exact" => Some(MatchStage::Exact),
            "normalized" => Some(MatchStage::Normalized),
            "aggressive" => Some(MatchStage::Aggressive),
            "none" => Some(MatchStage::None),
            _ => None,
        }
    }
}

impl fmt::Display for MatchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where in the payload a mention came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MentionRole {
    HomeTeam,
    AwayTeam,
    RatingsRow,
}

impl MentionRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MentionRole::HomeTeam => "home_team",
            MentionRole::AwayTeam => "away_team",
            MentionRole::RatingsRow => "ratings_row",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "home_team" => Some(MentionRole::HomeTeam),
            "away_team" => Some(MentionRole::AwayTeam),
            "ratings_row" => Some(MentionRole::RatingsRow),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEntityMention {
    pub text: String,
    pub provider: Provider,
    pub role: MentionRole,
    pub observed_at: DateTime<Utc>,
}

impl RawEntityMention {
    pub fn new(
        text: impl Into<String>,
        provider: Provider,
        role: MentionRole,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            text: text.into(),
            provider,
            role,
            observed_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionRecord {
    pub run_id: Uuid,
    pub mention: String,
    pub provider: Provider,
    pub role: MentionRole,
    pub team_id: Option<TeamId>,
    pub canonical_name: Option<String>,
    pub stage: MatchStage,
    pub registry_version: String,
    pub observed_at: DateTime<Utc>,
    pub resolved_at: DateTime<Utc>,
}

impl ResolutionRecord {
    pub fn is_resolved(&self) -> bool {
        self.team_id.is_some()
    }
}

#[derive(Clone)]
pub struct TeamResolver {
    registry: Arc<AliasRegistry>,
    run_id: Uuid,
}

impl TeamResolver {
    pub fn new(registry: Arc<AliasRegistry>, run_id: Uuid) -> Self {
        Self { registry, run_id }
    }

    pub fn registry(&self) -> &AliasRegistry {
        &self.registry
    }

    /// Matching only: no record, no timestamps.
    pub fn match_name(&self, name: &str) -> (Option<&CanonicalTeam>, MatchStage) {
        if let Some(team) = self.registry.by_exact(&exact_key(name)) {
            return (Some(team), MatchStage::Exact);
        }

        let normalized = normalized_key(name);
        if let Some(team) = self.registry.by_normalized(&normalized) {
            return (Some(team), MatchStage::Normalized);
        }

        if let Some(trimmed) = without_last_word(&normalized) {
            if let Some(team) = self.registry.by_canonical(&trimmed) {
                return (Some(team), MatchStage::Aggressive);
            }
        }

        (None, MatchStage::None)
    }

    pub fn resolve(&self, mention: &RawEntityMention) -> Result<ResolutionRecord, ResolveError> {
        if mention.text.trim().is_empty() {
            return Err(ResolveError::InvalidMention {
                provider: mention.provider,
            });
        }

        let (team, stage) = self.match_name(&mention.text);
        if team.is_none() {
            debug!(
                provider = %mention.provider,
                role = mention.role.as_str(),
                "Unresolved team name '{}'",
                mention.text
            );
        }

        Ok(ResolutionRecord {
            run_id: self.run_id,
            mention: mention.text.clone(),
            provider: mention.provider,
            role: mention.role,
            team_id: team.map(|t| t.id),
            canonical_name: team.map(|t| t.canonical_name.clone()),
            stage,
            registry_version: self.registry.version().to_string(),
            observed_at: mention.observed_at,
            resolved_at: Utc::now(),
        })
    }

    /// Resolve a batch on the rayon pool. Output order follows input order.
    pub fn resolve_all(
        &self,
        mentions: &[RawEntityMention],
    ) -> Vec<Result<ResolutionRecord, ResolveError>> {
        mentions.par_iter().map(|m| self.resolve(m)).collect()
    }
}
