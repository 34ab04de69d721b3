use std::collections::{HashMap, HashSet};

use tfi_core::{EntityKind, FeedRecord, ReferenceKind};
use tfi_storage::FeedStore;
use uuid::Uuid;

use crate::report::RunLog;

/// Natural keys known to exist for the current project, per key space.
/// Seeded once from the store, then only grows during a run.
#[derive(Debug, Clone, Default)]
pub struct ReferenceTracker {
    known: HashMap<ReferenceKind, HashSet<String>>,
}

impl ReferenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// One seed query per key space. A failed query leaves that key space
    /// empty and logs a warning.
    pub async fn load(store: &dyn FeedStore, project_id: Uuid, log: &mut RunLog) -> Self {
        let mut tracker = Self::new();
        for kind in ReferenceKind::ALL {
            match store.known_keys(kind, project_id).await {
                Ok(keys) => {
                    tracing::debug!(%kind, keys = keys.len(), "seeded reference keys");
                    tracker.known.insert(kind, keys);
                }
                Err(err) => {
                    log.warn(format!(
                        "could not seed existing {kind} keys, starting empty: {err}"
                    ));
                    tracker.known.insert(kind, HashSet::new());
                }
            }
        }
        tracker
    }

    pub fn contains(&self, kind: ReferenceKind, key: &str) -> bool {
        self.known.get(&kind).is_some_and(|keys| keys.contains(key))
    }

    pub fn extend(&mut self, kind: ReferenceKind, keys: impl IntoIterator<Item = String>) {
        self.known.entry(kind).or_default().extend(keys);
    }

    pub fn len(&self, kind: ReferenceKind) -> usize {
        self.known.get(&kind).map(HashSet::len).unwrap_or(0)
    }

    pub fn keys(&self, kind: ReferenceKind) -> HashSet<String> {
        self.known.get(&kind).cloned().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct FilterOutcome {
    pub kept: Vec<FeedRecord>,
    pub dropped: usize,
}

/// Keeps the records whose every declared foreign key is already known.
/// Null or empty references count as unknown. Siblings in the same batch
/// never satisfy each other.
pub fn filter_dependencies(
    kind: EntityKind,
    records: Vec<FeedRecord>,
    tracker: &ReferenceTracker,
) -> FilterOutcome {
    let foreign_keys = kind.spec().foreign_keys;
    if foreign_keys.is_empty() {
        return FilterOutcome {
            kept: records,
            dropped: 0,
        };
    }

    let total = records.len();
    let kept: Vec<_> = records
        .into_iter()
        .filter(|record| {
            foreign_keys.iter().all(|fk| {
                record
                    .key(fk.field)
                    .is_some_and(|key| tracker.contains(fk.references, &key))
            })
        })
        .collect();
    let dropped = total - kept.len();
    FilterOutcome { kept, dropped }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tfi_core::{RunScope, Value};
    use tfi_storage::MemoryFeedStore;

    fn trip(scope: &RunScope, id: &str, route: &str, service: Option<&str>) -> FeedRecord {
        let record = FeedRecord::new(scope)
            .with_field("trip_id", Value::Text(id.into()))
            .with_field("route_id", Value::Text(route.into()));
        match service {
            Some(s) => record.with_field("service_id", Value::Text(s.into())),
            None => record.with_field("service_id", Value::Null),
        }
    }

    #[test]
    fn every_foreign_key_must_be_known() {
        let scope = RunScope::new(Uuid::new_v4(), Uuid::new_v4());
        let mut tracker = ReferenceTracker::new();
        tracker.extend(ReferenceKind::Route, ["R1".to_string()]);
        tracker.extend(ReferenceKind::Service, ["WK".to_string()]);

        let outcome = filter_dependencies(
            EntityKind::Trip,
            vec![
                trip(&scope, "T1", "R1", Some("WK")),
                trip(&scope, "T2", "R2", Some("WK")),
                trip(&scope, "T3", "R1", Some("SAT")),
                trip(&scope, "T4", "R1", None),
            ],
            &tracker,
        );

        assert_eq!(outcome.dropped, 3);
        assert_eq!(outcome.kept.len(), 1);
        assert_eq!(outcome.kept[0].key("trip_id").as_deref(), Some("T1"));
        for record in &outcome.kept {
            assert!(tracker.contains(ReferenceKind::Route, &record.key("route_id").unwrap()));
            assert!(tracker.contains(ReferenceKind::Service, &record.key("service_id").unwrap()));
        }
    }

    #[test]
    fn kinds_without_foreign_keys_pass_through() {
        let scope = RunScope::new(Uuid::new_v4(), Uuid::new_v4());
        let rows = vec![
            FeedRecord::new(&scope).with_field("service_id", Value::Text("UNSEEN".into())),
            FeedRecord::new(&scope).with_field("shape_id", Value::Text("SH1".into())),
        ];
        let tracker = ReferenceTracker::new();

        let dates = filter_dependencies(EntityKind::CalendarDate, rows.clone(), &tracker);
        assert_eq!((dates.kept.len(), dates.dropped), (2, 0));
        let shapes = filter_dependencies(EntityKind::Shape, rows, &tracker);
        assert_eq!((shapes.kept.len(), shapes.dropped), (2, 0));
    }

    #[tokio::test]
    async fn seed_failure_degrades_to_empty_set() {
        let store = MemoryFeedStore::new();
        let scope = RunScope::new(Uuid::new_v4(), Uuid::new_v4());
        let agency = FeedRecord::new(&scope).with_field("agency_id", Value::Text("A1".into()));
        let stop = FeedRecord::new(&scope).with_field("stop_id", Value::Text("S1".into()));
        store.insert_ignore_duplicates(EntityKind::Agency, &[agency]).await.unwrap();
        store.insert_ignore_duplicates(EntityKind::Stop, &[stop]).await.unwrap();
        store.fail_seed(ReferenceKind::Stop).await;

        let mut log = RunLog::new();
        let tracker = ReferenceTracker::load(&store, scope.project_id, &mut log).await;

        assert!(tracker.contains(ReferenceKind::Agency, "A1"));
        assert_eq!(tracker.len(ReferenceKind::Stop), 0);
        assert!(log.contains("could not seed existing stop keys"));
    }
}
