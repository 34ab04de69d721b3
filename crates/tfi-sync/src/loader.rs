use std::collections::HashMap;

use futures::stream::{self, StreamExt};
use tfi_core::{EntityKind, FeedRecord, ReferenceKind};
use tfi_storage::FeedStore;

use crate::config::HierarchyStrategy;
use crate::report::RunLog;
use crate::tracker::ReferenceTracker;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOutcome {
    /// Rows the store actually wrote.
    pub accepted: u64,
    pub failed_chunks: usize,
    /// Rows discarded by deduplication because their natural key was empty.
    pub keyless_dropped: usize,
    /// Self-referencing rows whose parent never became known.
    pub unresolved: usize,
}

impl LoadOutcome {
    fn absorb(&mut self, other: LoadOutcome) {
        self.accepted += other.accepted;
        self.failed_chunks += other.failed_chunks;
        self.keyless_dropped += other.keyless_dropped;
        self.unresolved += other.unresolved;
    }
}

/// Keeps one record per natural key, the last one in input order, at the
/// position of the first. Records without the key are dropped.
pub(crate) fn dedup_chunk(
    natural_key: Option<&str>,
    chunk: Vec<FeedRecord>,
) -> (Vec<FeedRecord>, usize) {
    let Some(field) = natural_key else {
        return (chunk, 0);
    };

    let mut kept: Vec<FeedRecord> = Vec::with_capacity(chunk.len());
    let mut index: HashMap<String, usize> = HashMap::with_capacity(chunk.len());
    let mut keyless = 0;
    for record in chunk {
        match record.key(field) {
            None => keyless += 1,
            Some(key) => match index.get(&key) {
                Some(&at) => kept[at] = record,
                None => {
                    index.insert(key, kept.len());
                    kept.push(record);
                }
            },
        }
    }
    (kept, keyless)
}

/// Splits batches into fixed-size chunks and submits each as one
/// insert-ignore-duplicates call.
pub struct ChunkedLoader<'a> {
    store: &'a dyn FeedStore,
    chunk_size: usize,
    concurrency: usize,
}

impl<'a> ChunkedLoader<'a> {
    pub fn new(store: &'a dyn FeedStore, chunk_size: usize, concurrency: usize) -> Self {
        Self {
            store,
            chunk_size: chunk_size.max(1),
            concurrency: concurrency.max(1),
        }
    }

    /// A failed chunk is logged and skipped. Keys of a chunk reach the
    /// tracker only after the store acknowledged that chunk.
    pub async fn load(
        &self,
        kind: EntityKind,
        records: Vec<FeedRecord>,
        tracker: &mut ReferenceTracker,
        log: &mut RunLog,
    ) -> LoadOutcome {
        let spec = kind.spec();
        let mut outcome = LoadOutcome::default();

        let mut chunks = Vec::new();
        let mut rows = records.into_iter().peekable();
        while rows.peek().is_some() {
            let chunk: Vec<_> = rows.by_ref().take(self.chunk_size).collect();
            let (chunk, keyless) = dedup_chunk(spec.natural_key, chunk);
            outcome.keyless_dropped += keyless;
            if !chunk.is_empty() {
                chunks.push(chunk);
            }
        }
        if outcome.keyless_dropped > 0 {
            log.warn(format!(
                "{}: {} rows without {} discarded",
                spec.table,
                outcome.keyless_dropped,
                spec.natural_key.unwrap_or("a key")
            ));
        }

        let total = chunks.len();
        let store = self.store;
        let mut results = stream::iter(chunks.into_iter().enumerate())
            .map(move |(index, chunk)| async move {
                let result = store.insert_ignore_duplicates(kind, &chunk).await;
                (index, chunk, result)
            })
            .buffer_unordered(self.concurrency);

        while let Some((index, chunk, result)) = results.next().await {
            match result {
                Ok(inserted) => {
                    outcome.accepted += inserted;
                    if let Some(provision) = spec.provides {
                        tracker.extend(
                            provision.kind,
                            chunk.iter().filter_map(|r| r.key(provision.field)),
                        );
                    }
                    tracing::debug!(
                        table = spec.table,
                        chunk = index + 1,
                        rows = chunk.len(),
                        inserted,
                        "chunk stored"
                    );
                }
                Err(err) => {
                    outcome.failed_chunks += 1;
                    log.error(format!(
                        "{}: chunk {}/{} ({} rows) rejected: {err}",
                        spec.table,
                        index + 1,
                        total,
                        chunk.len()
                    ));
                }
            }
        }

        outcome
    }

    /// Loads a self-referencing table so that parents are stored before
    /// their children.
    pub async fn load_hierarchy(
        &self,
        kind: EntityKind,
        records: Vec<FeedRecord>,
        strategy: HierarchyStrategy,
        tracker: &mut ReferenceTracker,
        log: &mut RunLog,
    ) -> LoadOutcome {
        let spec = kind.spec();
        let Some(parent_field) = spec.parent_key else {
            return self.load(kind, records, tracker, log).await;
        };

        let (roots, children): (Vec<_>, Vec<_>) = records
            .into_iter()
            .partition(|r| r.key(parent_field).is_none());

        let mut outcome = self.load(kind, roots, tracker, log).await;

        let key_space = spec.provides.map(|p| p.kind);
        match (strategy, key_space) {
            (HierarchyStrategy::Topological, Some(key_space)) => {
                outcome.absorb(
                    self.load_by_rounds(kind, parent_field, key_space, children, tracker, log)
                        .await,
                );
            }
            _ => {
                log.info(format!(
                    "{}: submitting {} child rows after {} roots",
                    spec.table,
                    children.len(),
                    outcome.accepted
                ));
                outcome.absorb(self.load(kind, children, tracker, log).await);
            }
        }
        outcome
    }

    async fn load_by_rounds(
        &self,
        kind: EntityKind,
        parent_field: &str,
        key_space: ReferenceKind,
        mut pending: Vec<FeedRecord>,
        tracker: &mut ReferenceTracker,
        log: &mut RunLog,
    ) -> LoadOutcome {
        let table = kind.table_name();
        let mut outcome = LoadOutcome::default();
        let mut depth = 1;

        while !pending.is_empty() {
            let (ready, waiting): (Vec<_>, Vec<_>) = pending.into_iter().partition(|r| {
                r.key(parent_field)
                    .is_some_and(|parent| tracker.contains(key_space, &parent))
            });
            pending = waiting;
            if ready.is_empty() {
                break;
            }
            tracing::debug!(table, depth, rows = ready.len(), "loading hierarchy level");
            outcome.absorb(self.load(kind, ready, tracker, log).await);
            depth += 1;
        }

        if !pending.is_empty() {
            outcome.unresolved = pending.len();
            log.warn(format!(
                "{table}: {} rows dropped, {parent_field} never became known",
                pending.len()
            ));
        }
        outcome
    }
}
