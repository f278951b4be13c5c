//! Batch writer: one upsert per natural key, bounded concurrency, per-row
//! failures counted instead of aborting the batch.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::StoreError;
use crate::registry::TeamId;
use crate::store::{GameRecord, IngestStore, OddsKey, OddsSnapshot, RatingSnapshot, WriteOutcome};

/// A row with a natural key the store can upsert.
#[async_trait]
pub trait Upsertable: Send + Sync + 'static {
    type Key: Hash + Eq + Clone + Debug + Send + Sync;

    const KIND: &'static str;

    fn natural_key(&self) -> Self::Key;

    async fn upsert(&self, store: &dyn IngestStore) -> Result<WriteOutcome, StoreError>;
}

#[async_trait]
impl Upsertable for GameRecord {
    type Key = String;
    const KIND: &'static str = "game";

    fn natural_key(&self) -> String {
        self.external_id.clone()
    }

    async fn upsert(&self, store: &dyn IngestStore) -> Result<WriteOutcome, StoreError> {
        store.upsert_game(self).await
    }
}

#[async_trait]
impl Upsertable for OddsSnapshot {
    type Key = OddsKey;
    const KIND: &'static str = "odds";

    fn natural_key(&self) -> OddsKey {
        self.key()
    }

    async fn upsert(&self, store: &dyn IngestStore) -> Result<WriteOutcome, StoreError> {
        store.upsert_odds(self).await
    }
}

#[async_trait]
impl Upsertable for RatingSnapshot {
    type Key = (TeamId, chrono::NaiveDate);
    const KIND: &'static str = "rating";

    fn natural_key(&self) -> Self::Key {
        (self.team_id, self.rating_date)
    }

    async fn upsert(&self, store: &dyn IngestStore) -> Result<WriteOutcome, StoreError> {
        store.upsert_rating(self).await
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WriteStats {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
    /// Rows dropped because a later row in the batch had the same key.
    pub duplicates: usize,
    pub failures: Vec<String>,
}

impl WriteStats {
    pub fn attempted(&self) -> usize {
        self.inserted + self.updated + self.unchanged + self.failed
    }

    pub fn merge(&mut self, other: WriteStats) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.failed += other.failed;
        self.duplicates += other.duplicates;
        self.failures.extend(other.failures);
    }
}

#[derive(Debug)]
pub struct WriteResult<K> {
    pub stats: WriteStats,
    /// Keys whose upsert succeeded, whatever the outcome.
    pub written: Vec<K>,
}

#[derive(Clone)]
pub struct IngestionWriter {
    store: Arc<dyn IngestStore>,
    max_concurrent: usize,
}

impl IngestionWriter {
    pub fn new(store: Arc<dyn IngestStore>, max_concurrent: usize) -> Self {
        Self {
            store,
            max_concurrent: max_concurrent.max(1),
        }
    }

    pub async fn write<T: Upsertable>(&self, rows: Vec<T>) -> WriteResult<T::Key> {
        let total = rows.len();
        let mut order = Vec::with_capacity(total);
        let mut latest: HashMap<T::Key, T> = HashMap::with_capacity(total);
        for row in rows {
            let key = row.natural_key();
            if latest.insert(key.clone(), row).is_none() {
                order.push(key);
            }
        }

        let mut stats = WriteStats {
            duplicates: total - order.len(),
            ..WriteStats::default()
        };
        let batch: Vec<(T::Key, T)> = order
            .into_iter()
            .filter_map(|key| latest.remove(&key).map(|row| (key, row)))
            .collect();

        let store = self.store.as_ref();
        let results: Vec<(T::Key, Result<WriteOutcome, StoreError>)> = stream::iter(batch)
            .map(|(key, row)| async move {
                let result = row.upsert(store).await;
                (key, result)
            })
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;

        let mut written = Vec::with_capacity(results.len());
        for (key, result) in results {
            match result {
                Ok(outcome) => {
                    match outcome {
                        WriteOutcome::Inserted => stats.inserted += 1,
                        WriteOutcome::Updated => stats.updated += 1,
                        WriteOutcome::Unchanged => stats.unchanged += 1,
                    }
                    written.push(key);
                }
                Err(e) => {
                    warn!("Failed to write {} row {:?}: {}", T::KIND, key, e);
                    stats.failed += 1;
                    stats.failures.push(format!("{} {:?}: {}", T::KIND, key, e));
                }
            }
        }

        info!(
            kind = T::KIND,
            inserted = stats.inserted,
            updated = stats.updated,
            unchanged = stats.unchanged,
            failed = stats.failed,
            "Stored {} rows",
            stats.attempted() - stats.failed
        );
        WriteResult { stats, written }
    }
}
