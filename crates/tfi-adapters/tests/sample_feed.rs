use std::path::PathBuf;

use tfi_adapters::{parse_table, FeedArchive, RecordNormalizer};
use tfi_core::{EntityKind, RunScope, Value};
use uuid::Uuid;

fn sample_feed_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/sample-feed")
}

#[test]
fn sample_feed_tables_parse_and_normalize() {
    let archive = FeedArchive::from_dir(sample_feed_dir()).expect("load sample feed");
    for kind in EntityKind::ALL {
        assert!(archive.entry(kind.file_name()).is_some(), "{kind} missing");
    }
    assert!(archive.entry("feed_info.txt").is_some());

    let normalizer = RecordNormalizer::new(RunScope::new(Uuid::new_v4(), Uuid::new_v4()));
    let stops = archive.entry("stops.txt").expect("stops");
    let rows = parse_table("stops", stops)
        .expect("stops header")
        .collect::<Result<Vec<_>, _>>()
        .expect("stops rows");
    assert_eq!(rows.len(), 4);

    let station = normalizer.normalize(Some(EntityKind::Stop), rows[0].clone());
    assert_eq!(station.record.get("stop_id"), &Value::Text("STN".into()));
    assert_eq!(station.record.get("stop_lat"), &Value::Float(50.0833));
    assert_eq!(station.record.get("parent_station"), &Value::Null);

    let routes = archive.entry("routes.txt").expect("routes");
    let first_route = parse_table("routes", routes)
        .expect("routes header")
        .next()
        .expect("one route")
        .expect("valid route");
    assert_eq!(first_route["route_long_name"], "Central - Museum, via Old Town");
}

#[test]
fn directory_loading_skips_subdirectories() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("agency.txt"), "agency_id\nA1\n").expect("write agency");
    std::fs::create_dir(dir.path().join("extras")).expect("mkdir");
    std::fs::write(dir.path().join("extras/notes.txt"), "ignored").expect("write nested");

    let archive = FeedArchive::from_dir(dir.path()).expect("load dir");
    assert_eq!(archive.names().collect::<Vec<_>>(), vec!["agency.txt"]);
}
