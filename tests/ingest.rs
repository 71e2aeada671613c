use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use rusqlite::Connection;

use match_history::bulk_load::{LoadError, insert_history};
use match_history::export_tree::MatchExport;
use match_history::history_extract::{HistoryRow, MetricKind};
use match_history::ingest::{ingest_files, ingest_match};
use match_history::schema::{Migrator, open_db, open_in_memory};

fn fixture_path(name: &str) -> PathBuf {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("tests");
    path.push("fixtures");
    path.push(name);
    path
}

fn scratch_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("match_history_it_{}", std::process::id()));
    fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir.join(name)
}

fn migrated_memory(name: &str) -> Connection {
    let mut conn = open_in_memory().expect("in-memory db");
    Migrator::new(scratch_path(&format!("{name}.snapshot.sqlite")))
        .apply(&mut conn)
        .expect("migration should apply");
    conn
}

fn small_match() -> MatchExport {
    MatchExport::from_path(&fixture_path("match_small.json")).expect("fixture should parse")
}

fn dump(conn: &Connection, kind: MetricKind) -> Vec<(i64, i64, Option<String>, i64)> {
    let sub = kind
        .sub_key_column()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "NULL".to_string());
    let sql = format!(
        "SELECT player_id, turn_number, {sub}, {} FROM {} ORDER BY 1, 2, 3",
        kind.value_column(),
        kind.table()
    );
    let mut stmt = conn.prepare(&sql).unwrap();
    stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))
        .unwrap()
        .map(|r| r.unwrap())
        .collect()
}

#[test]
fn ingest_loads_every_family() {
    let mut conn = migrated_memory("loads");
    let summary = ingest_match(&mut conn, &small_match()).expect("ingest should succeed");
    assert_eq!(summary.external_id, "game-001");
    assert_eq!(summary.players, 2);
    assert!(!summary.replaced);
    assert_eq!(summary.rows_inserted(), 37);
    assert_eq!(summary.inserted[&MetricKind::Yield], 12);
    assert_eq!(summary.inserted[&MetricKind::ReligionOpinion], 1);
}

#[test]
fn reingest_replaces_with_identical_rows() {
    let mut conn = migrated_memory("reingest");
    let export = small_match();
    ingest_match(&mut conn, &export).expect("first ingest");
    let before = MetricKind::ALL
        .iter()
        .map(|k| dump(&conn, *k))
        .collect::<Vec<_>>();

    let second = ingest_match(&mut conn, &export).expect("second ingest");
    assert!(second.replaced);
    let after = MetricKind::ALL
        .iter()
        .map(|k| dump(&conn, *k))
        .collect::<Vec<_>>();
    assert_eq!(before, after);

    let matches: i64 = conn
        .query_row("SELECT COUNT(*) FROM matches", [], |r| r.get(0))
        .unwrap();
    assert_eq!(matches, 1);
}

#[test]
fn duplicate_rows_for_loaded_match_are_rejected() {
    let mut conn = migrated_memory("dupes");
    let summary = ingest_match(&mut conn, &small_match()).expect("ingest");
    let again = vec![HistoryRow {
        player_id: 1,
        turn_number: 2,
        value: 1,
        sub_key: None,
    }];
    let err = insert_history(&conn, summary.match_id, MetricKind::Points, &again).unwrap_err();
    assert!(matches!(err, LoadError::DuplicateKey { .. }));
}

#[test]
fn failed_ingest_leaves_no_partial_rows() {
    let mut conn = migrated_memory("partial");
    ingest_match(&mut conn, &small_match()).expect("baseline ingest");

    // Two human players sharing an ID: the second player insert fails.
    let raw = fs::read_to_string(fixture_path("match_small.json")).unwrap();
    let broken = raw
        .replace("\"game-001\"", "\"game-002\"")
        .replace("\"ID\": \"1\"", "\"ID\": \"0\"");
    let mut export = MatchExport::unparsed("broken");
    export.parse_json(&broken).expect("still valid json");

    assert!(ingest_match(&mut conn, &export).is_err());
    let matches: Vec<String> = conn
        .prepare("SELECT external_id FROM matches")
        .unwrap()
        .query_map([], |r| r.get(0))
        .unwrap()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(matches, vec!["game-001".to_string()]);
    let players: i64 = conn
        .query_row("SELECT COUNT(*) FROM players", [], |r| r.get(0))
        .unwrap();
    assert_eq!(players, 2);
}

#[test]
fn batch_ingest_reports_each_match() {
    let db_path = scratch_path("batch.sqlite");
    let _ = fs::remove_file(&db_path);
    {
        let mut conn = open_db(&db_path).expect("open db");
        Migrator::for_database(&db_path)
            .apply(&mut conn)
            .expect("migrate");
    }

    let raw = fs::read_to_string(fixture_path("match_small.json")).unwrap();
    let second = scratch_path("game-003.json");
    fs::write(&second, raw.replace("\"game-001\"", "\"game-003\"")).unwrap();
    let corrupt = scratch_path("corrupt.json");
    fs::write(&corrupt, "{\"tag\": \"Root\", \"children\": [").unwrap();

    let paths = vec![fixture_path("match_small.json"), second, corrupt.clone()];
    let report = ingest_files(&db_path, &paths, 2, Duration::from_secs(10)).expect("pool builds");
    assert_eq!(report.succeeded.len(), 2);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].source, corrupt.display().to_string());

    let conn = open_db(&db_path).expect("reopen");
    let points: i64 = conn
        .query_row("SELECT COUNT(*) FROM points_history", [], |r| r.get(0))
        .unwrap();
    assert_eq!(points, 16);
}
