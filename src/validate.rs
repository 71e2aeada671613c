use anyhow::{Context, Result};
use rusqlite::Connection;
use serde::Serialize;

use crate::analytics::load_player_instances;
use crate::history_extract::MetricKind;
use crate::identity::GroupingKey;

const MAX_LISTED_TURNS: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "finding", rename_all = "snake_case")]
pub enum Finding {
    OrphanedRows {
        table: String,
        rows: i64,
    },
    OutOfRange {
        table: String,
        rows: i64,
    },
    DuplicateNaturalKeys {
        table: String,
        keys: i64,
    },
    TurnGap {
        table: String,
        match_id: i64,
        player_id: i64,
        sub_key: Option<String>,
        missing_count: usize,
        missing_turns: Vec<i64>,
    },
    UnresolvedIdentities {
        players: usize,
    },
    CheckFailed {
        check: String,
        error: String,
    },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DataQualityReport {
    pub findings: Vec<Finding>,
}

impl DataQualityReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    fn record(&mut self, check: &str, result: Result<Vec<Finding>>) {
        match result {
            Ok(found) => self.findings.extend(found),
            Err(err) => self.findings.push(Finding::CheckFailed {
                check: check.to_string(),
                error: format!("{err:#}"),
            }),
        }
    }
}

pub fn validate(conn: &Connection) -> DataQualityReport {
    let mut report = DataQualityReport::default();
    report.record("orphaned players", orphaned_players(conn));
    for kind in MetricKind::ALL {
        let table = kind.table();
        report.record(&format!("{table} orphans"), orphaned_history(conn, kind));
        report.record(&format!("{table} ranges"), out_of_range(conn, kind));
        report.record(&format!("{table} duplicates"), duplicate_keys(conn, kind));
        report.record(&format!("{table} turn coverage"), turn_gaps(conn, kind));
    }
    report.record("identities", unresolved_identities(conn));
    if !report.is_clean() {
        log::warn!("data quality: {} findings", report.findings.len());
    }
    report
}

fn count(conn: &Connection, sql: &str) -> Result<i64> {
    conn.query_row(sql, [], |row| row.get::<_, i64>(0))
        .with_context(|| format!("run check query: {sql}"))
}

fn orphaned_players(conn: &Connection) -> Result<Vec<Finding>> {
    let rows = count(
        conn,
        "SELECT COUNT(*) FROM players p
         WHERE NOT EXISTS (SELECT 1 FROM matches m WHERE m.match_id = p.match_id)",
    )?;
    Ok(nonzero(rows, |rows| Finding::OrphanedRows {
        table: "players".to_string(),
        rows,
    }))
}

fn orphaned_history(conn: &Connection, kind: MetricKind) -> Result<Vec<Finding>> {
    let table = kind.table();
    let rows = count(
        conn,
        &format!(
            "SELECT COUNT(*) FROM {table} h
             WHERE NOT EXISTS (
                 SELECT 1 FROM players p
                 WHERE p.match_id = h.match_id AND p.player_id = h.player_id
             )"
        ),
    )?;
    Ok(nonzero(rows, |rows| Finding::OrphanedRows {
        table: table.to_string(),
        rows,
    }))
}

fn out_of_range(conn: &Connection, kind: MetricKind) -> Result<Vec<Finding>> {
    let table = kind.table();
    let value_check = kind
        .value_range()
        .map(|r| {
            format!(
                " OR {col} < {} OR {col} > {}",
                r.start(),
                r.end(),
                col = kind.value_column()
            )
        })
        .unwrap_or_default();
    let rows = count(
        conn,
        &format!("SELECT COUNT(*) FROM {table} WHERE turn_number < 0{value_check}"),
    )?;
    Ok(nonzero(rows, |rows| Finding::OutOfRange {
        table: table.to_string(),
        rows,
    }))
}

fn natural_key_columns(kind: MetricKind) -> String {
    match kind.sub_key_column() {
        Some(sub) => format!("match_id, player_id, turn_number, {sub}"),
        None => "match_id, player_id, turn_number".to_string(),
    }
}

fn duplicate_keys(conn: &Connection, kind: MetricKind) -> Result<Vec<Finding>> {
    let table = kind.table();
    let keys = count(
        conn,
        &format!(
            "SELECT COUNT(*) FROM (
                 SELECT 1 FROM {table} GROUP BY {} HAVING COUNT(*) > 1
             )",
            natural_key_columns(kind)
        ),
    )?;
    Ok(nonzero(keys, |keys| Finding::DuplicateNaturalKeys {
        table: table.to_string(),
        keys,
    }))
}

fn turn_gaps(conn: &Connection, kind: MetricKind) -> Result<Vec<Finding>> {
    let table = kind.table();
    let sub = kind
        .sub_key_column()
        .map(str::to_string)
        .unwrap_or_else(|| "NULL".to_string());
    let sql = format!(
        "SELECT DISTINCT match_id, player_id, {sub}, turn_number FROM {table}
         ORDER BY match_id, player_id, 3, turn_number"
    );
    let mut stmt = conn.prepare(&sql).context("prepare turn coverage query")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })
        .context("query turn coverage")?;

    let mut findings = Vec::new();
    let mut current: Option<(i64, i64, Option<String>)> = None;
    let mut last_turn = 0i64;
    let mut missing = Vec::new();
    let mut flush = |series: Option<(i64, i64, Option<String>)>, missing: &mut Vec<i64>| {
        if let Some((match_id, player_id, sub_key)) = series
            && !missing.is_empty()
        {
            let missing_count = missing.len();
            missing.truncate(MAX_LISTED_TURNS);
            findings.push(Finding::TurnGap {
                table: table.to_string(),
                match_id,
                player_id,
                sub_key,
                missing_count,
                missing_turns: std::mem::take(missing),
            });
        }
        missing.clear();
    };

    for row in rows {
        let (match_id, player_id, sub_key, turn) = row.context("decode turn row")?;
        let series = (match_id, player_id, sub_key);
        if current.as_ref() != Some(&series) {
            flush(current.take(), &mut missing);
            current = Some(series);
        } else {
            missing.extend(last_turn + 1..turn);
        }
        last_turn = turn;
    }
    flush(current, &mut missing);
    Ok(findings)
}

fn unresolved_identities(conn: &Connection) -> Result<Vec<Finding>> {
    let players = load_player_instances(conn, None)?
        .iter()
        .filter(|inst| inst.identity().grouping_key == GroupingKey::Unresolved)
        .count();
    Ok(if players > 0 {
        vec![Finding::UnresolvedIdentities { players }]
    } else {
        Vec::new()
    })
}

fn nonzero(n: i64, finding: impl FnOnce(i64) -> Finding) -> Vec<Finding> {
    if n > 0 { vec![finding(n)] } else { Vec::new() }
}
