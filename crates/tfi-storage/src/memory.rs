use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tfi_core::{EntityKind, FeedRecord, ReferenceKind};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{FeedStore, StoreError};

/// In-process store with the same insert-or-skip semantics as the SQL store.
///
/// Used for dry runs and as the pipeline's test double; it can be told to
/// reject chunks containing a given key or to fail a seed query.
#[derive(Debug, Default)]
pub struct MemoryFeedStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: HashMap<EntityKind, Vec<FeedRecord>>,
    unique: HashMap<EntityKind, HashSet<(Uuid, Vec<String>)>>,
    rejected_keys: HashMap<EntityKind, HashSet<String>>,
    failing_seeds: HashSet<ReferenceKind>,
    insert_calls: usize,
}

impl MemoryFeedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Any chunk of `kind` holding a row whose first unique-key field equals
    /// `key` fails as a whole.
    pub async fn reject_chunks_with(&self, kind: EntityKind, key: impl Into<String>) {
        let mut state = self.state.lock().await;
        state.rejected_keys.entry(kind).or_default().insert(key.into());
    }

    pub async fn fail_seed(&self, kind: ReferenceKind) {
        self.state.lock().await.failing_seeds.insert(kind);
    }

    pub async fn rows(&self, kind: EntityKind) -> Vec<FeedRecord> {
        let state = self.state.lock().await;
        state.rows.get(&kind).cloned().unwrap_or_default()
    }

    pub async fn count(&self, kind: EntityKind) -> usize {
        let state = self.state.lock().await;
        state.rows.get(&kind).map(Vec::len).unwrap_or(0)
    }

    pub async fn total_rows(&self) -> usize {
        let state = self.state.lock().await;
        state.rows.values().map(Vec::len).sum()
    }

    pub async fn insert_calls(&self) -> usize {
        self.state.lock().await.insert_calls
    }
}

#[async_trait]
impl FeedStore for MemoryFeedStore {
    async fn known_keys(
        &self,
        kind: ReferenceKind,
        project_id: Uuid,
    ) -> Result<HashSet<String>, StoreError> {
        let state = self.state.lock().await;
        if state.failing_seeds.contains(&kind) {
            return Err(StoreError::Rejected(format!(
                "seed query for {kind} keys failed"
            )));
        }

        let mut keys = HashSet::new();
        for provider in kind.providers() {
            let Some(provision) = provider.spec().provides else {
                continue;
            };
            let rows = state.rows.get(&provider).into_iter().flatten();
            keys.extend(
                rows.filter(|r| r.project_id == project_id)
                    .filter_map(|r| r.key(provision.field)),
            );
        }
        Ok(keys)
    }

    async fn insert_ignore_duplicates(
        &self,
        kind: EntityKind,
        records: &[FeedRecord],
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        state.insert_calls += 1;

        let spec = kind.spec();
        if let Some(rejected) = state.rejected_keys.get(&kind) {
            let lead = spec.unique_key[0];
            if let Some(hit) = records
                .iter()
                .filter_map(|r| r.key(lead))
                .find(|k| rejected.contains(k))
            {
                return Err(StoreError::Rejected(format!(
                    "constraint violation on {} row {lead}={hit}",
                    spec.table
                )));
            }
        }

        let MemoryState { rows, unique, .. } = &mut *state;
        let seen = unique.entry(kind).or_default();
        let table = rows.entry(kind).or_default();
        let mut inserted = 0;
        for record in records {
            if let Some(key) = record.composite_key(spec.unique_key) {
                if !seen.insert((record.project_id, key)) {
                    continue;
                }
            }
            table.push(record.clone());
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn purge_project(&self, project_id: Uuid) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut removed = 0;
        for table in state.rows.values_mut() {
            let before = table.len();
            table.retain(|r| r.project_id != project_id);
            removed += (before - table.len()) as u64;
        }
        for keys in state.unique.values_mut() {
            keys.retain(|(project, _)| *project != project_id);
        }
        Ok(removed)
    }
}
