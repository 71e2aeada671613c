use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use rayon::prelude::*;
use rusqlite::{Connection, TransactionBehavior};
use serde::Serialize;

use crate::bulk_load::{
    delete_match, insert_history, insert_match, insert_players, participant_links,
    restore_participant_links,
};
use crate::export_tree::MatchExport;
use crate::history_extract::{MetricKind, extract_all, extract_match, extract_players};
use crate::schema::open_db_with_timeout;

#[derive(Debug, Clone, Serialize)]
pub struct MatchIngestSummary {
    pub external_id: String,
    pub match_id: i64,
    pub players: usize,
    pub replaced: bool,
    pub links_kept: usize,
    pub inserted: BTreeMap<MetricKind, usize>,
    pub skipped: usize,
}

impl MatchIngestSummary {
    pub fn rows_inserted(&self) -> usize {
        self.inserted.values().sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedMatch {
    pub source: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub succeeded: Vec<MatchIngestSummary>,
    pub failed: Vec<FailedMatch>,
}

/// Replaces one match's rows inside a single transaction.
///
/// Any previous ingest of the same external id is deleted first, so a
/// replay of an unchanged export yields the same rows. Participant links
/// on the old players are carried over. Nothing is written if any step
/// fails.
pub fn ingest_match(conn: &mut Connection, export: &MatchExport) -> Result<MatchIngestSummary> {
    let record = extract_match(export)?;
    let players = extract_players(export)?;
    let history = extract_all(export)?;

    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .context("begin match transaction")?;
    let links = participant_links(&tx, &record.external_id)?;
    let replaced = delete_match(&tx, &record.external_id)?;
    let match_id = insert_match(&tx, &record)?;
    let player_count = insert_players(&tx, match_id, &players)?;
    let links_kept = restore_participant_links(&tx, match_id, &links)?;

    let mut inserted = BTreeMap::new();
    let mut skipped = 0usize;
    for (kind, rows) in &history.rows {
        let summary = insert_history(&tx, match_id, *kind, rows)
            .with_context(|| format!("load {} for match {}", kind.table(), record.external_id))?;
        inserted.insert(*kind, summary.inserted);
        skipped += summary.skipped;
    }
    tx.commit().context("commit match transaction")?;

    let summary = MatchIngestSummary {
        external_id: record.external_id,
        match_id,
        players: player_count,
        replaced,
        links_kept,
        inserted,
        skipped,
    };
    log::info!(
        "ingested match {} ({} players, {} rows, {} skipped{})",
        summary.external_id,
        summary.players,
        summary.rows_inserted(),
        summary.skipped,
        if summary.replaced { ", replaced" } else { "" }
    );
    Ok(summary)
}

pub fn ingest_path(conn: &mut Connection, path: &Path) -> Result<MatchIngestSummary> {
    let export = MatchExport::from_path(path)?;
    ingest_match(conn, &export)
}

/// Results are reported per match; one bad export never stops the rest.
pub fn ingest_files(
    db_path: &Path,
    paths: &[PathBuf],
    workers: usize,
    busy_timeout: Duration,
) -> Result<IngestReport> {
    if paths.is_empty() {
        return Ok(IngestReport::default());
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .build()
        .context("build ingest worker pool")?;

    let outcomes: Vec<(String, Result<MatchIngestSummary>)> = pool.install(|| {
        paths
            .par_iter()
            .map_init(
                || open_db_with_timeout(db_path, busy_timeout),
                |conn, path| {
                    let source = path.display().to_string();
                    let result = match conn {
                        Ok(conn) => ingest_path(conn, path),
                        Err(err) => Err(anyhow!("open database: {err:#}")),
                    };
                    (source, result)
                },
            )
            .collect()
    });

    let mut report = IngestReport::default();
    for (source, result) in outcomes {
        match result {
            Ok(summary) => report.succeeded.push(summary),
            Err(err) => {
                log::warn!("ingest of {source} failed: {err:#}");
                report.failed.push(FailedMatch {
                    source,
                    error: format!("{err:#}"),
                });
            }
        }
    }
    Ok(report)
}
