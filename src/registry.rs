//! Versioned, immutable snapshot of canonical teams and their aliases.
//!
//! A snapshot is loaded once per run (from a JSON file or the `teams` and
//! `team_aliases` tables) and shared read-only behind an `Arc`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::RegistryError;
use crate::names::{exact_key, normalized_key};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TeamId(pub Uuid);

impl TeamId {
    /// Stable id for a team that only exists as a canonical name.
    pub fn from_canonical_name(name: &str) -> Self {
        let seed = format!("ncaam-team:{}", exact_key(name));
        TeamId(Uuid::new_v5(&Uuid::NAMESPACE_OID, seed.as_bytes()))
    }
}

impl fmt::Display for TeamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalTeam {
    pub id: TeamId,
    pub canonical_name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub provenance: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyEntry {
    Unique(TeamId),
    Ambiguous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub teams: usize,
    pub aliases: usize,
    pub ambiguous_normalized_keys: usize,
}

#[derive(Debug, Deserialize)]
struct TeamEntry {
    #[serde(default)]
    id: Option<TeamId>,
    canonical_name: String,
    #[serde(default)]
    aliases: Vec<String>,
    #[serde(default)]
    provenance: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RegistryFile {
    Snapshot {
        version: String,
        teams: Vec<TeamEntry>,
    },
    AliasMap(BTreeMap<String, String>),
}

#[derive(Debug)]
pub struct AliasRegistry {
    version: String,
    teams: HashMap<TeamId, CanonicalTeam>,
    exact: HashMap<String, TeamId>,
    normalized: HashMap<String, KeyEntry>,
    canonical: HashMap<String, KeyEntry>,
    alias_count: usize,
}

fn insert_normalized(map: &mut HashMap<String, KeyEntry>, key: String, id: TeamId) {
    if key.is_empty() {
        return;
    }
    map.entry(key)
        .and_modify(|entry| {
            if *entry != KeyEntry::Unique(id) {
                *entry = KeyEntry::Ambiguous;
            }
        })
        .or_insert(KeyEntry::Unique(id));
}

impl AliasRegistry {
    /// Build a snapshot, rejecting any alias claimed by two different teams.
    pub fn from_teams(
        version: impl Into<String>,
        teams: Vec<CanonicalTeam>,
    ) -> Result<Self, RegistryError> {
        let mut registry = AliasRegistry {
            version: version.into(),
            teams: HashMap::with_capacity(teams.len()),
            exact: HashMap::new(),
            normalized: HashMap::new(),
            canonical: HashMap::new(),
            alias_count: 0,
        };

        for team in teams {
            if team.canonical_name.trim().is_empty() {
                return Err(RegistryError::EmptyCanonicalName(team.id.to_string()));
            }
            if registry.teams.contains_key(&team.id) {
                return Err(RegistryError::DuplicateTeamId(team.id.to_string()));
            }

            let names = std::iter::once(&team.canonical_name).chain(team.aliases.iter());
            for name in names {
                let key = exact_key(name);
                if key.is_empty() {
                    continue;
                }
                match registry.exact.get(&key) {
                    Some(existing) if *existing == team.id => continue,
                    Some(existing) => {
                        let existing_name = registry
                            .teams
                            .get(existing)
                            .map(|t| t.canonical_name.clone())
                            .unwrap_or_else(|| existing.to_string());
                        return Err(RegistryError::DuplicateAlias {
                            alias: name.clone(),
                            existing: existing_name,
                            conflicting: team.canonical_name.clone(),
                        });
                    }
                    None => {
                        registry.exact.insert(key, team.id);
                        registry.alias_count += 1;
                        insert_normalized(&mut registry.normalized, normalized_key(name), team.id);
                    }
                }
            }
            insert_normalized(
                &mut registry.canonical,
                normalized_key(&team.canonical_name),
                team.id,
            );

            registry.teams.insert(team.id, team);
        }

        let stats = registry.stats();
        if stats.ambiguous_normalized_keys > 0 {
            for (key, entry) in &registry.normalized {
                if *entry == KeyEntry::Ambiguous {
                    warn!("Normalized alias '{}' is shared by several teams; it will never match", key);
                }
            }
        }
        info!(
            version = %registry.version,
            teams = stats.teams,
            aliases = stats.aliases,
            ambiguous = stats.ambiguous_normalized_keys,
            "Alias registry loaded"
        );
        Ok(registry)
    }

    /// Flat `{alias: canonical_name}` map. Team ids are derived from the
    /// canonical name; the version is a digest of the pairs.
    pub fn from_alias_map(map: BTreeMap<String, String>) -> Result<Self, RegistryError> {
        let mut digest = String::new();
        for (alias, canonical) in &map {
            digest.push_str(alias);
            digest.push('\u{1f}');
            digest.push_str(canonical);
            digest.push('\u{1e}');
        }
        let version = format!(
            "alias-map/{}",
            Uuid::new_v5(&Uuid::NAMESPACE_OID, digest.as_bytes())
        );

        let mut grouped: BTreeMap<String, CanonicalTeam> = BTreeMap::new();
        for (alias, canonical) in map {
            let canonical = canonical.trim().to_string();
            let team = grouped
                .entry(exact_key(&canonical))
                .or_insert_with(|| CanonicalTeam {
                    id: TeamId::from_canonical_name(&canonical),
                    canonical_name: canonical.clone(),
                    aliases: Vec::new(),
                    provenance: "alias-map".to_string(),
                });
            team.aliases.push(alias);
        }
        Self::from_teams(version, grouped.into_values().collect())
    }

    pub fn from_json(raw: &str) -> Result<Self, RegistryError> {
        match serde_json::from_str::<RegistryFile>(raw)? {
            RegistryFile::Snapshot { version, teams } => {
                let teams = teams
                    .into_iter()
                    .map(|entry| CanonicalTeam {
                        id: entry
                            .id
                            .unwrap_or_else(|| TeamId::from_canonical_name(&entry.canonical_name)),
                        canonical_name: entry.canonical_name,
                        aliases: entry.aliases,
                        provenance: entry.provenance.unwrap_or_else(|| "snapshot".to_string()),
                    })
                    .collect();
                Self::from_teams(version, teams)
            }
            RegistryFile::AliasMap(map) => Self::from_alias_map(map),
        }
    }

    pub fn load_file(path: &Path) -> Result<Self, RegistryError> {
        let raw = std::fs::read_to_string(path).map_err(|source| RegistryError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn len(&self) -> usize {
        self.teams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.teams.is_empty()
    }

    pub fn team(&self, id: TeamId) -> Option<&CanonicalTeam> {
        self.teams.get(&id)
    }

    pub fn teams(&self) -> impl Iterator<Item = &CanonicalTeam> {
        self.teams.values()
    }

    /// Lookup by an `exact_key`.
    pub fn by_exact(&self, key: &str) -> Option<&CanonicalTeam> {
        self.exact.get(key).and_then(|id| self.teams.get(id))
    }

    /// Lookup by a `normalized_key` across all aliases. Ambiguous keys miss.
    pub fn by_normalized(&self, key: &str) -> Option<&CanonicalTeam> {
        match self.normalized.get(key)? {
            KeyEntry::Unique(id) => self.teams.get(id),
            KeyEntry::Ambiguous => None,
        }
    }

    /// Lookup by a `normalized_key` against canonical names only.
    pub fn by_canonical(&self, key: &str) -> Option<&CanonicalTeam> {
        match self.canonical.get(key)? {
            KeyEntry::Unique(id) => self.teams.get(id),
            KeyEntry::Ambiguous => None,
        }
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            teams: self.teams.len(),
            aliases: self.alias_count,
            ambiguous_normalized_keys: self
                .normalized
                .values()
                .filter(|entry| **entry == KeyEntry::Ambiguous)
                .count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn team(name: &str, aliases: &[&str]) -> CanonicalTeam {
        CanonicalTeam {
            id: TeamId::from_canonical_name(name),
            canonical_name: name.to_string(),
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
            provenance: "test".to_string(),
        }
    }

    fn alias_map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(a, c)| (a.to_string(), c.to_string()))
            .collect()
    }

    #[test]
    fn alias_map_version_follows_content() {
        let duke = alias_map(&[("Blue Devils", "Duke"), ("Jayhawks", "Kansas")]);
        let version = |map: &BTreeMap<String, String>| {
            AliasRegistry::from_alias_map(map.clone()).unwrap().version().to_string()
        };

        let first = version(&duke);
        assert!(first.starts_with("alias-map/"));
        assert_eq!(first, version(&duke));

        // Same team count, different aliases
        let renamed = alias_map(&[("Dukies", "Duke"), ("Jayhawks", "Kansas")]);
        assert_ne!(first, version(&renamed));
        let moved = alias_map(&[("Blue Devils", "Kansas"), ("Jayhawks", "Duke")]);
        assert_ne!(first, version(&moved));
    }

    #[test]
    fn canonical_name_counts_as_alias() {
        let registry =
            AliasRegistry::from_teams("v1", vec![team("Duke", &["Duke Blue Devils"])]).unwrap();
        assert!(registry.by_exact("duke").is_some());
        assert!(registry.by_exact("duke blue devils").is_some());
        assert_eq!(registry.stats().aliases, 2);
    }

    #[test]
    fn duplicate_alias_across_teams_is_rejected() {
        let err = AliasRegistry::from_teams(
            "v1",
            vec![team("Miami (FL)", &["Miami"]), team("Miami (OH)", &["MIAMI"])],
        )
        .unwrap_err();
        match err {
            RegistryError::DuplicateAlias {
                existing,
                conflicting,
                ..
            } => {
                assert_eq!(existing, "Miami (FL)");
                assert_eq!(conflicting, "Miami (OH)");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn repeated_alias_within_one_team_is_fine() {
        let registry =
            AliasRegistry::from_teams("v1", vec![team("Duke", &["duke", "DUKE "])]).unwrap();
        assert_eq!(registry.stats().aliases, 1);
    }

    #[test]
    fn colliding_normalized_keys_are_ambiguous() {
        let registry = AliasRegistry::from_teams(
            "v1",
            vec![team("Miami (FL)", &[]), team("Miami (OH)", &[])],
        )
        .unwrap();
        assert!(registry.by_normalized("miami").is_none());
        assert!(registry.by_canonical("miami").is_none());
        assert_eq!(registry.stats().ambiguous_normalized_keys, 1);
    }

    #[test]
    fn duplicate_team_id_is_rejected() {
        let err = AliasRegistry::from_teams("v1", vec![team("Duke", &[]), team("Duke", &[])])
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateTeamId(_)));
    }

    #[test]
    fn loads_versioned_snapshot() {
        let raw = r#"{
            "version": "2026-10-01",
            "teams": [
                {"canonical_name": "Ohio State", "aliases": ["Ohio St."]},
                {"canonical_name": "Kansas"}
            ]
        }"#;
        let registry = AliasRegistry::from_json(raw).unwrap();
        assert_eq!(registry.version(), "2026-10-01");
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.by_exact("ohio st.").map(|t| t.canonical_name.as_str()),
            Some("Ohio State")
        );
    }

    #[test]
    fn loads_flat_alias_map() {
        let raw = r#"{"UConn": "Connecticut", "Connecticut Huskies": "Connecticut", "Zags": "Gonzaga"}"#;
        let registry = AliasRegistry::from_json(raw).unwrap();
        assert!(registry.version().starts_with("alias-map/"));
        assert_eq!(registry.len(), 2);
        let uconn = registry.by_exact("uconn").unwrap();
        assert_eq!(uconn.id, TeamId::from_canonical_name("Connecticut"));
        assert_eq!(uconn.provenance, "alias-map");
    }
}
