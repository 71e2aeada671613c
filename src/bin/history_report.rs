use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;

use match_history::analytics;
use match_history::config::{Config, flag_value, positional_args};
use match_history::history_extract::MetricKind;
use match_history::schema;
use match_history::validate::validate;

const USAGE: &str = "usage: history_report <people|nations|milestone|match|validate> [--db PATH] \
[--metric KIND] [--threshold N] [--sub-key KEY] [--match ID]";
const VALUE_FLAGS: &[&str] = &["--db", "--metric", "--threshold", "--sub-key", "--match"];

fn main() -> Result<()> {
    env_logger::init();
    let config = Config::from_env();
    let args = std::env::args().skip(1).collect::<Vec<_>>();

    let command = positional_args(&args, VALUE_FLAGS)
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!(USAGE))?;
    let db_path = flag_value(&args, "--db")
        .map(PathBuf::from)
        .or_else(|| config.db_path.clone())
        .context("unable to resolve sqlite path")?;
    let conn = schema::open_db_with_timeout(&db_path, config.busy_timeout)?;

    let metric = || -> Result<MetricKind> {
        let raw = flag_value(&args, "--metric").unwrap_or_else(|| "points".to_string());
        MetricKind::parse(&raw).ok_or_else(|| anyhow!("unknown metric {raw:?}"))
    };

    match command.as_str() {
        "people" => print_json(&analytics::person_totals(&conn)?),
        "nations" => print_json(&analytics::unique_people_by_nation(&conn)?),
        "milestone" => {
            let threshold = flag_value(&args, "--threshold")
                .context("--threshold is required")?
                .parse::<i64>()
                .context("--threshold must be an integer")?;
            let sub_key = flag_value(&args, "--sub-key");
            print_json(&analytics::milestone_timing(
                &conn,
                metric()?,
                threshold,
                sub_key.as_deref(),
            )?)
        }
        "match" => {
            let id = flag_value(&args, "--match").context("--match is required")?;
            print_json(&analytics::match_history(&conn, &id, metric()?)?)
        }
        "validate" => {
            let report = validate(&conn);
            print_json(&report)?;
            if !report.is_clean() {
                std::process::exit(1);
            }
            Ok(())
        }
        other => Err(anyhow!("unknown report {other:?}\n{USAGE}")),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("serialize report")?;
    println!("{json}");
    Ok(())
}
