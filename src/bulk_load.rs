use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use thiserror::Error;

use crate::history_extract::{HistoryRow, MatchRecord, MetricKind, PlayerRecord};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error(
        "duplicate {table} key (match {match_id}, player {player_id}, turn {turn_number}, sub-key {})",
        .sub_key.as_deref().unwrap_or("-")
    )]
    DuplicateKey {
        table: &'static str,
        match_id: i64,
        player_id: i64,
        turn_number: i64,
        sub_key: Option<String>,
    },
    #[error("{table} insert failed")]
    Sqlite {
        table: &'static str,
        #[source]
        source: rusqlite::Error,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InsertSummary {
    pub inserted: usize,
    pub skipped: usize,
}

/// Why a row can never be stored, independent of what is already stored.
pub fn validate_row(kind: MetricKind, row: &HistoryRow) -> Result<(), &'static str> {
    if row.player_id <= 0 {
        return Err("player_id must be positive");
    }
    if row.turn_number < 0 {
        return Err("turn_number must be non-negative");
    }
    match (kind.is_nested(), row.sub_key.as_deref()) {
        (true, None) => return Err("missing sub-key"),
        (true, Some(key)) if key.trim().is_empty() => return Err("empty sub-key"),
        (false, Some(_)) => return Err("unexpected sub-key"),
        _ => {}
    }
    if !kind.accepts(row.value) {
        return Err("value outside valid range");
    }
    Ok(())
}

fn insert_sql(kind: MetricKind) -> String {
    let table = kind.table();
    let value_col = kind.value_column();
    match kind.sub_key_column() {
        Some(sub) => format!(
            "INSERT INTO {table} (match_id, player_id, turn_number, {sub}, {value_col}) VALUES (?1, ?2, ?3, ?4, ?5)"
        ),
        None => format!(
            "INSERT INTO {table} (match_id, player_id, turn_number, {value_col}) VALUES (?1, ?2, ?3, ?4)"
        ),
    }
}

/// Validates every row, then inserts the valid ones for one match.
///
/// Invalid rows are skipped with a warning. A natural-key collision stops
/// the batch and comes back as [`LoadError::DuplicateKey`]; the caller owns
/// the transaction and decides whether to clear the match and retry.
pub fn insert_history(
    conn: &Connection,
    match_id: i64,
    kind: MetricKind,
    rows: &[HistoryRow],
) -> Result<InsertSummary, LoadError> {
    if rows.is_empty() {
        return Ok(InsertSummary::default());
    }
    let table = kind.table();

    let mut batch = Vec::with_capacity(rows.len());
    let mut skipped = 0usize;
    for row in rows {
        match validate_row(kind, row) {
            Ok(()) => batch.push(row),
            Err(reason) => {
                skipped += 1;
                log::warn!(
                    "{table}: skipping match {match_id} player {} turn {}: {reason}",
                    row.player_id,
                    row.turn_number
                );
            }
        }
    }

    let sql = insert_sql(kind);
    let mut stmt = conn
        .prepare_cached(&sql)
        .map_err(|source| LoadError::Sqlite { table, source })?;
    let mut inserted = 0usize;
    for row in batch {
        let result = if kind.is_nested() {
            stmt.execute(params![
                match_id,
                row.player_id,
                row.turn_number,
                row.sub_key,
                row.value
            ])
        } else {
            stmt.execute(params![match_id, row.player_id, row.turn_number, row.value])
        };
        match result {
            Ok(_) => inserted += 1,
            Err(err) if is_unique_violation(&err) => {
                return Err(LoadError::DuplicateKey {
                    table,
                    match_id,
                    player_id: row.player_id,
                    turn_number: row.turn_number,
                    sub_key: row.sub_key.clone(),
                });
            }
            Err(source) => return Err(LoadError::Sqlite { table, source }),
        }
    }
    Ok(InsertSummary { inserted, skipped })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => {
            e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
        }
        _ => false,
    }
}

pub fn insert_match(conn: &Connection, record: &MatchRecord) -> Result<i64> {
    conn.execute(
        "INSERT INTO matches (external_id, game_name, total_turns, winner_player_id, ingested_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            record.external_id,
            record.game_name,
            record.total_turns,
            record.winner_player_id,
            Utc::now().to_rfc3339(),
        ],
    )
    .with_context(|| format!("insert match {}", record.external_id))?;
    Ok(conn.last_insert_rowid())
}

pub fn insert_players(conn: &Connection, match_id: i64, players: &[PlayerRecord]) -> Result<usize> {
    let mut stmt = conn
        .prepare_cached(
            "INSERT INTO players (match_id, player_id, player_name, player_name_normalized, nation)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .context("prepare player insert")?;
    for p in players {
        stmt.execute(params![
            match_id,
            p.player_id,
            p.player_name.as_deref().unwrap_or(""),
            p.player_name_normalized,
            p.nation
        ])
        .with_context(|| format!("insert player {} of match {match_id}", p.player_id))?;
    }
    Ok(players.len())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerLink {
    pub player_id: i64,
    pub player_name_normalized: Option<String>,
    pub participant_id: i64,
}

pub fn participant_links(conn: &Connection, external_id: &str) -> Result<Vec<PlayerLink>> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT p.player_id, p.player_name_normalized, p.participant_id
             FROM players p
             JOIN matches m ON m.match_id = p.match_id
             WHERE m.external_id = ?1 AND p.participant_id IS NOT NULL
             ORDER BY p.player_id",
        )
        .context("prepare participant link query")?;
    let rows = stmt
        .query_map(params![external_id], |row| {
            Ok(PlayerLink {
                player_id: row.get(0)?,
                player_name_normalized: row.get(1)?,
                participant_id: row.get(2)?,
            })
        })
        .with_context(|| format!("query participant links of match {external_id}"))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("decode participant link")?);
    }
    Ok(out)
}

/// Puts links back on freshly inserted players.
///
/// A link only returns to the same player id under the same normalized
/// name; a renamed or missing player loses it.
pub fn restore_participant_links(conn: &Connection, match_id: i64, links: &[PlayerLink]) -> Result<usize> {
    let mut stmt = conn
        .prepare_cached(
            "UPDATE players SET participant_id = ?3
             WHERE match_id = ?1 AND player_id = ?2 AND player_name_normalized IS ?4",
        )
        .context("prepare participant link restore")?;
    let mut restored = 0usize;
    for link in links {
        let changed = stmt
            .execute(params![
                match_id,
                link.player_id,
                link.participant_id,
                link.player_name_normalized
            ])
            .with_context(|| format!("restore link of player {}", link.player_id))?;
        if changed == 0 {
            log::warn!(
                "match {match_id}: player {} no longer matches its participant {} link; dropped",
                link.player_id,
                link.participant_id
            );
        }
        restored += changed;
    }
    Ok(restored)
}

pub fn find_match_id(conn: &Connection, external_id: &str) -> Result<Option<i64>> {
    conn.query_row(
        "SELECT match_id FROM matches WHERE external_id = ?1",
        params![external_id],
        |row| row.get::<_, i64>(0),
    )
    .optional()
    .context("look up match by external id")
}

/// Removes one match and everything hanging off it. Returns whether it existed.
///
/// Children are deleted explicitly so the result does not depend on the
/// connection having `foreign_keys` switched on.
pub fn delete_match(conn: &Connection, external_id: &str) -> Result<bool> {
    let Some(match_id) = find_match_id(conn, external_id)? else {
        return Ok(false);
    };
    for kind in MetricKind::ALL {
        conn.execute(
            &format!("DELETE FROM {} WHERE match_id = ?1", kind.table()),
            params![match_id],
        )
        .with_context(|| format!("clear {} for match {external_id}", kind.table()))?;
    }
    conn.execute("DELETE FROM players WHERE match_id = ?1", params![match_id])
        .with_context(|| format!("clear players for match {external_id}"))?;
    conn.execute("DELETE FROM matches WHERE match_id = ?1", params![match_id])
        .with_context(|| format!("delete match {external_id}"))?;
    Ok(true)
}
