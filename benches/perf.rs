use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;

use match_history::export_tree::{MatchExport, Node};
use match_history::history_extract::extract_all;
use match_history::identity::{count_people, normalize_name, resolve_identity};
use match_history::ingest::ingest_match;
use match_history::schema::{Migrator, open_in_memory};

const TURNS: i64 = 150;
const PLAYERS: i64 = 6;
const YIELDS: &[&str] = &[
    "YIELD_FOOD",
    "YIELD_IRON",
    "YIELD_STONE",
    "YIELD_WOOD",
    "YIELD_CIVICS",
    "YIELD_TRAINING",
    "YIELD_SCIENCE",
    "YIELD_MONEY",
];
const FAMILIES: &[&str] = &["FAMILY_SARGID", "FAMILY_BARCID", "FAMILY_MAGONID"];

fn series(tag: &str, offset: i64, cap: Option<i64>) -> Node {
    let mut node = Node::new(tag);
    for turn in 1..=TURNS {
        let raw = turn * 3 + offset;
        let value = cap.map_or(raw, |c| raw % (c + 1));
        node.children
            .push(Node::new(format!("T{turn}")).with_text(value.to_string()));
    }
    node
}

fn nested(tag: &str, keys: &[&str], cap: Option<i64>) -> Node {
    let mut node = Node::new(tag);
    for (idx, key) in keys.iter().enumerate() {
        node.children.push(series(key, idx as i64, cap));
    }
    node
}

fn large_export() -> MatchExport {
    let mut root = Node::new("Root").with_attr("GameId", "bench");
    for id in 0..PLAYERS {
        root.children.push(
            Node::new("Player")
                .with_attr("ID", id.to_string())
                .with_attr("Name", format!("Player {id}"))
                .with_attr("AIControlledToTurn", "0")
                .with_child(series("PointsHistory", id, None))
                .with_child(series("MilitaryPowerHistory", id, None))
                .with_child(series("LegitimacyHistory", id, Some(100)))
                .with_child(nested("YieldRateHistory", YIELDS, None))
                .with_child(nested("FamilyOpinionHistory", FAMILIES, Some(100))),
        );
    }
    MatchExport::from_tree("bench", root).expect("valid root")
}

fn bench_extract_all(c: &mut Criterion) {
    let export = large_export();
    c.bench_function("extract_all", |b| {
        b.iter(|| {
            let history = extract_all(black_box(&export)).unwrap();
            black_box(history.total());
        })
    });
}

fn bench_ingest_match(c: &mut Criterion) {
    let export = large_export();
    let mut conn = open_in_memory().unwrap();
    let snapshot = std::env::temp_dir().join("match_history_bench_snapshot.sqlite");
    Migrator::new(snapshot).apply(&mut conn).unwrap();
    c.bench_function("ingest_match_replace", |b| {
        b.iter(|| {
            let summary = ingest_match(&mut conn, black_box(&export)).unwrap();
            black_box(summary.rows_inserted());
        })
    });
}

fn bench_identity_grouping(c: &mut Criterion) {
    let names = (0..2_000)
        .map(|idx| format!("Player-{} ", idx % 300))
        .collect::<Vec<_>>();
    c.bench_function("identity_grouping", |b| {
        b.iter(|| {
            let identities = names
                .iter()
                .map(|n| {
                    let normalized = normalize_name(n);
                    resolve_identity(None, n, Some(&normalized))
                })
                .collect::<Vec<_>>();
            black_box(count_people(&identities).unique_people);
        })
    });
}

criterion_group!(
    benches,
    bench_extract_all,
    bench_ingest_match,
    bench_identity_grouping
);
criterion_main!(benches);
