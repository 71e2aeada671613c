use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result, bail};
use rusqlite::types::Value;
use rusqlite::{Connection, params, params_from_iter};
use serde::Serialize;

use crate::history_extract::MetricKind;
use crate::identity::{
    GroupingKey, ParticipantLink, PeopleCount, ResolvedIdentity, count_people, resolve_identity,
};

const UNKNOWN_NATION: &str = "(unknown)";

#[derive(Debug, Clone)]
pub struct PlayerInstanceRow {
    pub match_id: i64,
    pub match_external_id: String,
    pub player_id: i64,
    pub player_name: String,
    pub player_name_normalized: Option<String>,
    pub nation: Option<String>,
    pub participant_id: Option<i64>,
    pub participant_name: Option<String>,
    pub won: bool,
    pub final_points: Option<i64>,
}

impl PlayerInstanceRow {
    pub fn identity(&self) -> ResolvedIdentity {
        let link = self.participant_id.map(|participant_id| ParticipantLink {
            participant_id,
            display_name: self.participant_name.as_deref().unwrap_or(""),
        });
        resolve_identity(
            link,
            &self.player_name,
            self.player_name_normalized.as_deref(),
        )
    }
}

pub fn load_player_instances(
    conn: &Connection,
    match_external_id: Option<&str>,
) -> Result<Vec<PlayerInstanceRow>> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT
                m.match_id, m.external_id, p.player_id, p.player_name,
                p.player_name_normalized, p.nation, p.participant_id,
                pt.display_name, m.winner_player_id,
                (SELECT ph.points FROM points_history ph
                 WHERE ph.match_id = p.match_id AND ph.player_id = p.player_id
                 ORDER BY ph.turn_number DESC LIMIT 1)
            FROM players p
            JOIN matches m ON m.match_id = p.match_id
            LEFT JOIN participants pt ON pt.participant_id = p.participant_id
            WHERE ?1 IS NULL OR m.external_id = ?1
            ORDER BY m.match_id ASC, p.player_id ASC
            "#,
        )
        .context("prepare player instance query")?;
    let rows = stmt
        .query_map(params![match_external_id], |row| {
            let player_id = row.get::<_, i64>(2)?;
            let winner = row.get::<_, Option<i64>>(8)?;
            Ok(PlayerInstanceRow {
                match_id: row.get(0)?,
                match_external_id: row.get(1)?,
                player_id,
                player_name: row.get(3)?,
                player_name_normalized: row.get(4)?,
                nation: row.get(5)?,
                participant_id: row.get(6)?,
                participant_name: row.get(7)?,
                won: winner == Some(player_id),
                final_points: row.get(9)?,
            })
        })
        .context("query player instances")?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("decode player instance")?);
    }
    Ok(out)
}

#[derive(Debug, Clone, Serialize)]
pub struct PersonTotals {
    pub display_name: String,
    pub grouping_key: GroupingKey,
    pub participant_id: Option<i64>,
    pub is_unlinked: bool,
    pub matches_played: usize,
    pub wins: usize,
    pub best_final_points: Option<i64>,
    pub total_final_points: i64,
}

pub fn person_totals(conn: &Connection) -> Result<Vec<PersonTotals>> {
    let instances = load_player_instances(conn, None)?;
    let mut by_key: BTreeMap<GroupingKey, PersonTotals> = BTreeMap::new();
    for inst in &instances {
        let identity = inst.identity();
        let entry = by_key
            .entry(identity.grouping_key.clone())
            .or_insert_with(|| PersonTotals {
                display_name: identity.display_name.clone(),
                grouping_key: identity.grouping_key.clone(),
                participant_id: identity.participant_id,
                is_unlinked: identity.is_unlinked,
                matches_played: 0,
                wins: 0,
                best_final_points: None,
                total_final_points: 0,
            });
        entry.matches_played += 1;
        if inst.won {
            entry.wins += 1;
        }
        if let Some(points) = inst.final_points {
            entry.total_final_points += points;
            entry.best_final_points = Some(entry.best_final_points.map_or(points, |b| b.max(points)));
        }
    }
    let mut out = by_key.into_values().collect::<Vec<_>>();
    out.sort_by(|a, b| {
        b.wins
            .cmp(&a.wins)
            .then(b.matches_played.cmp(&a.matches_played))
            .then(a.display_name.cmp(&b.display_name))
    });
    Ok(out)
}

#[derive(Debug, Clone, Serialize)]
pub struct NationPeople {
    pub nation: String,
    pub player_instances: usize,
    #[serde(flatten)]
    pub people: PeopleCount,
}

pub fn unique_people_by_nation(conn: &Connection) -> Result<Vec<NationPeople>> {
    let instances = load_player_instances(conn, None)?;
    let mut by_nation: BTreeMap<String, Vec<ResolvedIdentity>> = BTreeMap::new();
    for inst in &instances {
        let nation = inst
            .nation
            .clone()
            .unwrap_or_else(|| UNKNOWN_NATION.to_string());
        by_nation.entry(nation).or_default().push(inst.identity());
    }
    Ok(by_nation
        .into_iter()
        .map(|(nation, identities)| NationPeople {
            nation,
            player_instances: identities.len(),
            people: count_people(&identities),
        })
        .collect())
}

/// When a milestone happened. Never guessed: absent evidence stays unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnEstimate {
    Known(i64),
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct MilestoneTiming {
    pub display_name: String,
    pub grouping_key: GroupingKey,
    pub is_unlinked: bool,
    pub matches_reached: usize,
    pub matches_unknown: usize,
    pub average_turn: Option<f64>,
}

/// First turn each player's series reached `threshold`.
///
/// For nested kinds, `sub_key` picks one sub-series (a yield type, family or
/// religion). Without it the earliest crossing of any sub-series counts.
pub fn milestone_turns(
    conn: &Connection,
    kind: MetricKind,
    threshold: i64,
    sub_key: Option<&str>,
) -> Result<HashMap<(i64, i64), TurnEstimate>> {
    let mut binds = vec![Value::Integer(threshold)];
    let sub_filter = match (kind.sub_key_column(), sub_key) {
        (Some(column), Some(key)) => {
            binds.push(Value::Text(key.to_string()));
            format!(" AND {column} = ?2")
        }
        (None, Some(key)) => bail!("{} has no sub-series to select {key:?} from", kind.table()),
        (_, None) => String::new(),
    };
    let sql = format!(
        "SELECT match_id, player_id, MIN(turn_number) FROM {} WHERE {} >= ?1{sub_filter} GROUP BY match_id, player_id",
        kind.table(),
        kind.value_column()
    );
    let mut stmt = conn.prepare(&sql).context("prepare milestone query")?;
    let rows = stmt
        .query_map(params_from_iter(binds.iter()), |row| {
            Ok(((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?), row.get::<_, i64>(2)?))
        })
        .context("query milestone turns")?;
    let mut out = HashMap::new();
    for row in rows {
        let (key, turn) = row.context("decode milestone row")?;
        out.insert(key, TurnEstimate::Known(turn));
    }
    Ok(out)
}

pub fn milestone_timing(
    conn: &Connection,
    kind: MetricKind,
    threshold: i64,
    sub_key: Option<&str>,
) -> Result<Vec<MilestoneTiming>> {
    let reached = milestone_turns(conn, kind, threshold, sub_key)?;
    let instances = load_player_instances(conn, None)?;
    let mut by_key: BTreeMap<GroupingKey, (MilestoneTiming, i64)> = BTreeMap::new();
    for inst in &instances {
        let identity = inst.identity();
        let estimate = reached
            .get(&(inst.match_id, inst.player_id))
            .copied()
            .unwrap_or(TurnEstimate::Unknown);
        let (timing, turn_sum) = by_key
            .entry(identity.grouping_key.clone())
            .or_insert_with(|| {
                (
                    MilestoneTiming {
                        display_name: identity.display_name.clone(),
                        grouping_key: identity.grouping_key.clone(),
                        is_unlinked: identity.is_unlinked,
                        matches_reached: 0,
                        matches_unknown: 0,
                        average_turn: None,
                    },
                    0,
                )
            });
        match estimate {
            TurnEstimate::Known(turn) => {
                timing.matches_reached += 1;
                *turn_sum += turn;
            }
            TurnEstimate::Unknown => timing.matches_unknown += 1,
        }
    }
    Ok(by_key
        .into_values()
        .map(|(mut timing, turn_sum)| {
            if timing.matches_reached > 0 {
                timing.average_turn = Some(turn_sum as f64 / timing.matches_reached as f64);
            }
            timing
        })
        .collect())
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchHistoryRow {
    pub display_name: String,
    pub grouping_key: GroupingKey,
    pub participant_id: Option<i64>,
    pub is_unlinked: bool,
    pub player_id: i64,
    pub turn_number: i64,
    pub sub_key: Option<String>,
    pub value: i64,
}

pub fn match_history(
    conn: &Connection,
    match_external_id: &str,
    kind: MetricKind,
) -> Result<Vec<MatchHistoryRow>> {
    let identities = load_player_instances(conn, Some(match_external_id))?
        .into_iter()
        .map(|inst| (inst.player_id, inst.identity()))
        .collect::<HashMap<_, _>>();

    let sub_key = kind
        .sub_key_column()
        .map(|c| format!("h.{c}"))
        .unwrap_or_else(|| "NULL".to_string());
    let sql = format!(
        "SELECT h.player_id, h.turn_number, {sub_key}, h.{value} FROM {table} h
         JOIN matches m ON m.match_id = h.match_id
         WHERE m.external_id = ?1
         ORDER BY h.player_id ASC, h.turn_number ASC, 3 ASC",
        value = kind.value_column(),
        table = kind.table(),
    );
    let mut stmt = conn.prepare(&sql).context("prepare match history query")?;
    let rows = stmt
        .query_map(params![match_external_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })
        .context("query match history")?;

    let mut out = Vec::new();
    for row in rows {
        let (player_id, turn_number, sub_key, value) = row.context("decode history row")?;
        let Some(identity) = identities.get(&player_id) else {
            log::warn!("{match_external_id}: history row for unknown player {player_id}");
            continue;
        };
        out.push(MatchHistoryRow {
            display_name: identity.display_name.clone(),
            grouping_key: identity.grouping_key.clone(),
            participant_id: identity.participant_id,
            is_unlinked: identity.is_unlinked,
            player_id,
            turn_number,
            sub_key,
            value,
        });
    }
    Ok(out)
}
