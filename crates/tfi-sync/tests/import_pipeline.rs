use std::io::{Cursor, Write};
use std::path::PathBuf;
use std::sync::Arc;

use tfi_core::{EntityKind, ImportPlan, ReferenceKind, RunScope};
use tfi_storage::{FeedStore, MemoryFeedStore};
use tfi_sync::{HierarchyStrategy, ImportConfig, ImportError, ImportPipeline, TableStatus};
use uuid::Uuid;
use zip::write::SimpleFileOptions;

fn zip_feed(entries: &[(&str, String)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();
    for (name, body) in entries {
        writer.start_file(*name, options).expect("start entry");
        writer.write_all(body.as_bytes()).expect("write entry");
    }
    writer.finish().expect("finish zip").into_inner()
}

fn sample_feed_zip() -> Vec<u8> {
    let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/sample-feed");
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(&dir).expect("fixture dir") {
        let path = entry.expect("fixture entry").path();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        entries.push((name, std::fs::read_to_string(&path).expect("fixture file")));
    }
    let borrowed: Vec<(&str, String)> = entries
        .iter()
        .map(|(name, body)| (name.as_str(), body.clone()))
        .collect();
    zip_feed(&borrowed)
}

fn scope() -> RunScope {
    RunScope::new(Uuid::new_v4(), Uuid::new_v4())
}

fn config(chunk_size: usize) -> ImportConfig {
    ImportConfig {
        chunk_size,
        ..ImportConfig::default()
    }
}

fn pipeline(store: &Arc<MemoryFeedStore>, config: ImportConfig) -> ImportPipeline {
    ImportPipeline::new(store.clone(), config).expect("plan derives")
}

/// Agency A1, route R1 on weekday service WK, `stops` stops, one trip per
/// stop and `stops` stop times per trip.
fn dense_feed(stops: usize) -> Vec<(&'static str, String)> {
    let mut stop_rows = String::from("stop_id,stop_name\n");
    let mut trip_rows = String::from("route_id,service_id,trip_id\n");
    let mut stop_time_rows = String::from("trip_id,stop_id,stop_sequence,arrival_time\n");
    for i in 0..stops {
        stop_rows.push_str(&format!("S{i},Stop {i}\n"));
        trip_rows.push_str(&format!("R1,WK,T{i}\n"));
        for seq in 0..stops {
            stop_time_rows.push_str(&format!("T{i},S{seq},{seq},08:{:02}:00\n", seq % 60));
        }
    }
    vec![
        ("agency.txt", "agency_id,agency_name\nA1,Metro\n".to_string()),
        ("stops.txt", stop_rows),
        ("routes.txt", "route_id,agency_id,route_type\nR1,A1,3\n".to_string()),
        (
            "calendar.txt",
            "service_id,monday,sunday,start_date,end_date\nWK,1,0,20260101,20261231\n".to_string(),
        ),
        ("trips.txt", trip_rows),
        ("stop_times.txt", stop_time_rows),
    ]
}

#[tokio::test]
async fn agency_stops_routes_scenario() {
    let store = Arc::new(MemoryFeedStore::new());
    let bytes = zip_feed(&[
        ("agency.txt", "agency_id,agency_name\nA1,Metro\n".to_string()),
        (
            "stops.txt",
            "stop_id,stop_name,parent_station\nST2,Platform,ST1\nST1,Station,\n".to_string(),
        ),
        (
            "routes.txt",
            "route_id,agency_id,route_short_name\nR1,A1,1\nR2,A2,2\n".to_string(),
        ),
    ]);
    let plan = ImportPlan::from_order(vec![EntityKind::Agency, EntityKind::Stop, EntityKind::Route]);

    let summary = pipeline(&store, config(500))
        .with_plan(plan)
        .run(scope(), &bytes)
        .await
        .expect("archive readable");

    assert_eq!(summary.loaded_tables, vec!["agency", "stops", "routes"]);
    assert!(summary.failed_tables.is_empty());
    assert_eq!(summary.accepted(EntityKind::Agency), 1);
    assert_eq!(summary.accepted(EntityKind::Stop), 2);
    let routes = summary.table("routes").unwrap();
    assert_eq!((routes.rows_accepted, routes.dependency_dropped), (1, 1));
    assert!(summary.log.contains("routes: 1 rows dropped for unknown references"));

    // Parent first, then the child, in separate submissions.
    let stops: Vec<_> = store
        .rows(EntityKind::Stop)
        .await
        .iter()
        .filter_map(|r| r.key("stop_id"))
        .collect();
    assert_eq!(stops, vec!["ST1", "ST2"]);
}

#[tokio::test]
async fn sample_feed_imports_with_expected_counts() {
    let store = Arc::new(MemoryFeedStore::new());
    let summary = pipeline(&store, config(500))
        .run(scope(), &sample_feed_zip())
        .await
        .expect("archive readable");

    assert_eq!(
        summary.loaded_tables,
        vec![
            "agency",
            "stops",
            "routes",
            "calendar",
            "calendar_dates",
            "trips",
            "stop_times",
            "shapes"
        ]
    );
    let counts: Vec<_> = summary
        .tables
        .iter()
        .map(|t| (t.table.as_str(), t.rows_accepted, t.dependency_dropped))
        .collect();
    assert_eq!(
        counts,
        vec![
            ("agency", 1, 0),
            ("stops", 4, 0),
            ("routes", 1, 1),
            ("calendar", 1, 0),
            ("calendar_dates", 2, 0),
            ("trips", 2, 2),
            ("stop_times", 4, 2),
            ("shapes", 3, 0),
        ]
    );
    assert!(summary.log.contains("ignoring archive entry feed_info.txt"));
    assert_eq!(store.total_rows().await, 18);
}

#[tokio::test]
async fn missing_optional_table_is_skipped() {
    let store = Arc::new(MemoryFeedStore::new());
    let feed = dense_feed(3);
    let summary = pipeline(&store, config(500))
        .run(scope(), &zip_feed(&feed))
        .await
        .expect("archive readable");

    let shapes = summary.table("shapes").unwrap();
    assert_eq!(shapes.status, TableStatus::Skipped);
    assert_eq!(summary.skipped_tables, vec!["calendar_dates", "shapes"]);
    assert!(summary.failed_tables.is_empty());
    assert_eq!(summary.loaded_tables.len(), 6);
}

#[tokio::test]
async fn rerunning_the_same_feed_adds_nothing() {
    let store = Arc::new(MemoryFeedStore::new());
    let scope = scope();
    let bytes = sample_feed_zip();
    let pipeline = pipeline(&store, config(500));

    let first = pipeline.run(scope, &bytes).await.expect("first run");
    let after_first = store.total_rows().await;
    let second = pipeline.run(scope, &bytes).await.expect("second run");

    assert_eq!(store.total_rows().await, after_first);
    assert_eq!(second.total_accepted(), 0);
    assert_eq!(second.loaded_tables, first.loaded_tables);
    // Seeded keys keep dependents of the second run from being filtered.
    assert_eq!(second.table("trips").unwrap().dependency_dropped, 2);
}

#[tokio::test]
async fn chunk_size_does_not_change_the_outcome() {
    let feed = dense_feed(50);
    let bytes = zip_feed(&feed);

    let mut results = Vec::new();
    for chunk_size in [1000, 2500] {
        let store = Arc::new(MemoryFeedStore::new());
        let scope = scope();
        let summary = pipeline(&store, config(chunk_size))
            .run(scope, &bytes)
            .await
            .expect("archive readable");
        let trips = store
            .known_keys(ReferenceKind::Trip, scope.project_id)
            .await
            .unwrap();
        let stops = store
            .known_keys(ReferenceKind::Stop, scope.project_id)
            .await
            .unwrap();
        results.push((summary.accepted(EntityKind::StopTime), trips, stops));
    }

    assert_eq!(results[0].0, 2500);
    assert_eq!(results[0], results[1]);
}

#[tokio::test]
async fn concurrent_chunks_match_sequential_chunks() {
    let bytes = zip_feed(&dense_feed(20));

    let sequential = Arc::new(MemoryFeedStore::new());
    let a = pipeline(&sequential, config(7))
        .run(scope(), &bytes)
        .await
        .expect("sequential run");

    let concurrent = Arc::new(MemoryFeedStore::new());
    let b = pipeline(
        &concurrent,
        ImportConfig {
            chunk_size: 7,
            chunk_concurrency: 4,
            ..ImportConfig::default()
        },
    )
    .run(scope(), &bytes)
    .await
    .expect("concurrent run");

    assert_eq!(a.accepted(EntityKind::StopTime), 400);
    assert_eq!(a.total_accepted(), b.total_accepted());
    assert_eq!(sequential.total_rows().await, concurrent.total_rows().await);
}

#[tokio::test]
async fn trips_before_routes_accept_nothing() {
    let store = Arc::new(MemoryFeedStore::new());
    let plan = ImportPlan::from_order(vec![
        EntityKind::Agency,
        EntityKind::Calendar,
        EntityKind::Trip,
        EntityKind::Route,
    ]);
    let summary = pipeline(&store, config(500))
        .with_plan(plan)
        .run(scope(), &zip_feed(&dense_feed(5)))
        .await
        .expect("archive readable");

    let trips = summary.table("trips").unwrap();
    assert_eq!(trips.status, TableStatus::Loaded);
    assert_eq!((trips.rows_accepted, trips.dependency_dropped), (0, 5));
    assert_eq!(summary.accepted(EntityKind::Route), 1);
}

#[tokio::test]
async fn malformed_table_fails_and_the_run_continues() {
    let store = Arc::new(MemoryFeedStore::new());
    let mut feed = dense_feed(3);
    for (name, body) in feed.iter_mut() {
        if *name == "routes.txt" {
            *body = "route_id,agency_id,route_type\nR1,A1\n".to_string();
        }
    }
    let summary = pipeline(&store, config(500))
        .run(scope(), &zip_feed(&feed))
        .await
        .expect("archive readable");

    assert_eq!(summary.failed_tables, vec!["routes"]);
    let routes = summary.table("routes").unwrap();
    assert!(routes.error.as_deref().unwrap().contains("malformed table routes"));
    assert_eq!(summary.table("stops").unwrap().status, TableStatus::Loaded);
    // No routes were stored, so every trip is filtered.
    assert_eq!(summary.accepted(EntityKind::Trip), 0);
    assert_eq!(summary.table("stop_times").unwrap().status, TableStatus::Loaded);
}

#[tokio::test]
async fn corrupt_archive_is_a_run_error() {
    let store = Arc::new(MemoryFeedStore::new());
    let result = pipeline(&store, config(500))
        .run(scope(), b"this is not an archive")
        .await;
    assert!(matches!(result, Err(ImportError::ArchiveCorrupt(_))));
}

#[tokio::test]
async fn rejected_chunk_does_not_stop_the_table() {
    let store = Arc::new(MemoryFeedStore::new());
    store.reject_chunks_with(EntityKind::Stop, "S3").await;

    let summary = pipeline(&store, config(2))
        .run(scope(), &zip_feed(&dense_feed(6)))
        .await
        .expect("archive readable");

    let stops = summary.table("stops").unwrap();
    assert_eq!(stops.status, TableStatus::Loaded);
    assert_eq!((stops.rows_accepted, stops.failed_chunks), (4, 1));
    // Stop times pointing at the rejected stops are filtered later on.
    let stop_times = summary.table("stop_times").unwrap();
    assert_eq!(stop_times.dependency_dropped, 12);
    assert!(summary.failed_tables.is_empty());
}

#[tokio::test]
async fn existing_rows_satisfy_references() {
    let store = Arc::new(MemoryFeedStore::new());
    let scope = scope();
    pipeline(&store, config(500))
        .run(scope, &zip_feed(&[("agency.txt", "agency_id\nA1\n".to_string())]))
        .await
        .expect("first archive");

    let summary = pipeline(&store, config(500))
        .run(
            scope,
            &zip_feed(&[("routes.txt", "route_id,agency_id\nR1,A1\nR2,A9\n".to_string())]),
        )
        .await
        .expect("second archive");

    assert!(summary.failed_tables.contains(&"agency".to_string()));
    assert_eq!(summary.accepted(EntityKind::Route), 1);
}

#[tokio::test]
async fn failed_seed_query_only_warns() {
    let store = Arc::new(MemoryFeedStore::new());
    let scope = scope();
    pipeline(&store, config(500))
        .run(scope, &zip_feed(&[("agency.txt", "agency_id\nA1\n".to_string())]))
        .await
        .expect("first archive");
    store.fail_seed(ReferenceKind::Agency).await;

    let summary = pipeline(&store, config(500))
        .run(
            scope,
            &zip_feed(&[("routes.txt", "route_id,agency_id\nR1,A1\n".to_string())]),
        )
        .await
        .expect("second archive");

    assert!(summary.log.contains("could not seed existing agency keys"));
    let routes = summary.table("routes").unwrap();
    assert_eq!(routes.status, TableStatus::Loaded);
    assert_eq!((routes.rows_accepted, routes.dependency_dropped), (0, 1));
}

#[tokio::test]
async fn two_pass_hierarchy_keeps_orphans() {
    let feed = [(
        "stops.txt",
        "stop_id,parent_station\nP1,GONE\nS1,\n".to_string(),
    )];
    let bytes = zip_feed(&feed);

    let topo_store = Arc::new(MemoryFeedStore::new());
    let topo = pipeline(&topo_store, config(500))
        .run(scope(), &bytes)
        .await
        .expect("topological run");
    assert_eq!(topo.table("stops").unwrap().dependency_dropped, 1);

    let two_pass_store = Arc::new(MemoryFeedStore::new());
    let two_pass = pipeline(
        &two_pass_store,
        ImportConfig {
            hierarchy: HierarchyStrategy::TwoPass,
            ..ImportConfig::default()
        },
    )
    .run(scope(), &bytes)
    .await
    .expect("two-pass run");
    assert_eq!(two_pass.accepted(EntityKind::Stop), 2);
}

#[tokio::test]
async fn summary_serializes_for_reporting() {
    let store = Arc::new(MemoryFeedStore::new());
    let summary = pipeline(&store, config(500))
        .run(scope(), &sample_feed_zip())
        .await
        .expect("archive readable");

    let json = serde_json::to_value(&summary).expect("serialize summary");
    assert_eq!(json["loaded_tables"][0], "agency");
    assert_eq!(json["tables"][1]["status"], "loaded");
    assert_eq!(json["tables"][1]["rows_accepted"], 4);
    assert!(json["log"]["lines"].as_array().unwrap().len() > 8);
}
