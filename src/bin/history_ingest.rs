use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};

use match_history::config::{Config, flag_value, positional_args};
use match_history::ingest::ingest_files;
use match_history::overrides::{apply_participant_overrides, load_participant_overrides};
use match_history::schema;

const VALUE_FLAGS: &[&str] = &["--db", "--workers", "--overrides"];

fn main() -> Result<()> {
    env_logger::init();
    let config = Config::from_env();
    let args = std::env::args().skip(1).collect::<Vec<_>>();

    let db_path = flag_value(&args, "--db")
        .map(PathBuf::from)
        .or_else(|| config.db_path.clone())
        .context("unable to resolve sqlite path")?;
    let workers = flag_value(&args, "--workers")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(config.workers);
    let paths = positional_args(&args, VALUE_FLAGS)
        .into_iter()
        .map(PathBuf::from)
        .collect::<Vec<_>>();
    if paths.is_empty() {
        return Err(anyhow!(
            "usage: history_ingest [--db PATH] [--workers N] [--overrides FILE] EXPORT.json..."
        ));
    }

    let mut conn = schema::open_db_with_timeout(&db_path, config.busy_timeout)?;
    let report = schema::verify(&conn)?;
    if !report.is_complete() {
        return Err(anyhow!(
            "schema at {} is not migrated; run history_migrate apply first",
            db_path.display()
        ));
    }

    let summary = ingest_files(&db_path, &paths, workers, config.busy_timeout)?;

    println!("Ingest complete");
    println!("DB: {}", db_path.display());
    println!("Matches: {}/{}", summary.succeeded.len(), paths.len());
    for item in &summary.succeeded {
        println!(
            "match {}: players={} rows={} skipped={}{}",
            item.external_id,
            item.players,
            item.rows_inserted(),
            item.skipped,
            if item.replaced { " (replaced)" } else { "" }
        );
    }
    if !summary.failed.is_empty() {
        println!("  errors: {}", summary.failed.len());
        for failed in &summary.failed {
            println!("   - {}: {}", failed.source, failed.error);
        }
    }

    if let Some(path) = flag_value(&args, "--overrides") {
        let overrides = load_participant_overrides(&PathBuf::from(path))?;
        let applied = apply_participant_overrides(&mut conn, &overrides)?;
        println!(
            "Overrides: participants={} linked={} unmatched={}",
            applied.participants_upserted, applied.players_linked, applied.links_unmatched
        );
    }

    if !summary.failed.is_empty() {
        std::process::exit(2);
    }
    Ok(())
}
