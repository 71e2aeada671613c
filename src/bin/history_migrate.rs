use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};

use match_history::config::{Config, flag_value, positional_args};
use match_history::schema::{self, MigrationOutcome, Migrator};

const USAGE: &str = "usage: history_migrate <apply|rollback|verify> [--db PATH] [--snapshot PATH]";

fn main() -> Result<()> {
    env_logger::init();
    let config = Config::from_env();
    let args = std::env::args().skip(1).collect::<Vec<_>>();

    let command = positional_args(&args, &["--db", "--snapshot"])
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!(USAGE))?;
    let db_path = flag_value(&args, "--db")
        .map(PathBuf::from)
        .or_else(|| config.db_path.clone())
        .context("unable to resolve sqlite path")?;
    let migrator = Migrator::new(
        flag_value(&args, "--snapshot")
            .map(PathBuf::from)
            .unwrap_or_else(|| config.snapshot_path_for(&db_path)),
    );
    let mut conn = schema::open_db_with_timeout(&db_path, config.busy_timeout)?;

    match command.as_str() {
        "apply" => match migrator.apply(&mut conn)? {
            MigrationOutcome::UpToDate { version } => {
                println!("Schema already at v{version}: {}", db_path.display());
            }
            MigrationOutcome::Applied { from, to, steps } => {
                println!("Migrated {} from v{from} to v{to}", db_path.display());
                for step in steps {
                    println!("  applied {step}");
                }
                println!("Snapshot: {}", migrator.snapshot_path().display());
            }
        },
        "rollback" => {
            migrator.rollback(&mut conn)?;
            println!(
                "Restored {} from {}",
                db_path.display(),
                migrator.snapshot_path().display()
            );
        }
        "verify" => {
            let report = schema::verify(&conn)?;
            println!("DB: {}", db_path.display());
            println!("Schema version: v{}", report.version);
            for table in &report.missing_tables {
                println!("  missing table: {table}");
            }
            for (table, column) in &report.missing_columns {
                println!("  missing column: {table}.{column}");
            }
            if !report.is_complete() {
                return Err(anyhow!(
                    "schema incomplete: {} tables, {} columns missing",
                    report.missing_tables.len(),
                    report.missing_columns.len()
                ));
            }
            println!("Schema complete");
        }
        other => return Err(anyhow!("unknown command {other:?}\n{USAGE}")),
    }
    Ok(())
}
