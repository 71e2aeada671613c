use std::collections::BTreeMap;
use std::ops::RangeInclusive;

use serde::Serialize;

use crate::export_tree::{ExtractError, MatchExport, Node};
use crate::identity::normalize_name;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Points,
    Yield,
    Military,
    Legitimacy,
    FamilyOpinion,
    ReligionOpinion,
}

impl MetricKind {
    pub const ALL: [MetricKind; 6] = [
        MetricKind::Points,
        MetricKind::Yield,
        MetricKind::Military,
        MetricKind::Legitimacy,
        MetricKind::FamilyOpinion,
        MetricKind::ReligionOpinion,
    ];

    pub fn root_tag(self) -> &'static str {
        match self {
            MetricKind::Points => "PointsHistory",
            MetricKind::Yield => "YieldRateHistory",
            MetricKind::Military => "MilitaryPowerHistory",
            MetricKind::Legitimacy => "LegitimacyHistory",
            MetricKind::FamilyOpinion => "FamilyOpinionHistory",
            MetricKind::ReligionOpinion => "ReligionOpinionHistory",
        }
    }

    /// Named levels between the series root and the turn-tagged leaves.
    pub fn nesting_depth(self) -> usize {
        match self {
            MetricKind::Points | MetricKind::Military | MetricKind::Legitimacy => 0,
            MetricKind::Yield | MetricKind::FamilyOpinion | MetricKind::ReligionOpinion => 1,
        }
    }

    pub fn is_nested(self) -> bool {
        self.nesting_depth() > 0
    }

    pub fn value_range(self) -> Option<RangeInclusive<i64>> {
        match self {
            MetricKind::Legitimacy | MetricKind::FamilyOpinion | MetricKind::ReligionOpinion => {
                Some(0..=100)
            }
            MetricKind::Points | MetricKind::Yield | MetricKind::Military => None,
        }
    }

    pub fn accepts(self, value: i64) -> bool {
        self.value_range().is_none_or(|r| r.contains(&value))
    }

    pub fn table(self) -> &'static str {
        match self {
            MetricKind::Points => "points_history",
            MetricKind::Yield => "yield_history",
            MetricKind::Military => "military_history",
            MetricKind::Legitimacy => "legitimacy_history",
            MetricKind::FamilyOpinion => "family_opinion_history",
            MetricKind::ReligionOpinion => "religion_opinion_history",
        }
    }

    pub fn value_column(self) -> &'static str {
        match self {
            MetricKind::Points => "points",
            MetricKind::Yield => "amount",
            MetricKind::Military => "military_power",
            MetricKind::Legitimacy => "legitimacy",
            MetricKind::FamilyOpinion | MetricKind::ReligionOpinion => "opinion",
        }
    }

    pub fn sub_key_column(self) -> Option<&'static str> {
        match self {
            MetricKind::Yield => Some("yield_type"),
            MetricKind::FamilyOpinion => Some("family_name"),
            MetricKind::ReligionOpinion => Some("religion_name"),
            MetricKind::Points | MetricKind::Military | MetricKind::Legitimacy => None,
        }
    }

    pub fn parse(raw: &str) -> Option<MetricKind> {
        let key = raw.trim().to_ascii_lowercase().replace('-', "_");
        MetricKind::ALL
            .into_iter()
            .find(|k| k.table() == key || k.table().trim_end_matches("_history") == key)
    }
}

/// One flattened sample. `player_id` is already the internal id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryRow {
    pub player_id: i64,
    pub turn_number: i64,
    pub value: i64,
    pub sub_key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MatchHistory {
    pub rows: BTreeMap<MetricKind, Vec<HistoryRow>>,
}

impl MatchHistory {
    pub fn get(&self, kind: MetricKind) -> &[HistoryRow] {
        self.rows.get(&kind).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn total(&self) -> usize {
        self.rows.values().map(Vec::len).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchRecord {
    pub external_id: String,
    pub game_name: Option<String>,
    pub total_turns: Option<i64>,
    pub winner_player_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlayerRecord {
    pub player_id: i64,
    pub player_name: Option<String>,
    pub player_name_normalized: Option<String>,
    pub nation: Option<String>,
}

/// Exports number players from zero; storage numbers them from one.
pub fn internal_player_id(external_id: i64) -> Option<i64> {
    if external_id < 0 {
        return None;
    }
    external_id.checked_add(1)
}

fn player_id_of(player: &Node) -> Option<i64> {
    internal_player_id(player.attr("ID")?.trim().parse::<i64>().ok()?)
}

/// `T42` -> 42. Anything else is not a turn tag.
pub fn parse_turn_tag(tag: &str) -> Option<i64> {
    let digits = tag.strip_prefix('T')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<i64>().ok()
}

fn parse_leaf(node: &Node) -> Option<i64> {
    node.text()?.parse::<i64>().ok()
}

pub fn extract_history(export: &MatchExport, kind: MetricKind) -> Result<Vec<HistoryRow>, ExtractError> {
    let players = export.human_players()?;
    let mut out = Vec::new();
    for player in players {
        let Some(player_id) = player_id_of(player) else {
            log::warn!(
                "{}: skipping player without a usable ID attribute",
                export.label()
            );
            continue;
        };
        let Some(series) = player.child(kind.root_tag()) else {
            continue;
        };
        walk_series(series, kind, kind.nesting_depth(), None, player_id, &mut out);
    }
    Ok(out)
}

fn walk_series(
    node: &Node,
    kind: MetricKind,
    depth: usize,
    sub_key: Option<&str>,
    player_id: i64,
    out: &mut Vec<HistoryRow>,
) {
    if depth > 0 {
        for child in &node.children {
            if child.tag.is_empty() || parse_turn_tag(&child.tag).is_some() {
                log::debug!(
                    "{}: unexpected <{}> where a named series was expected",
                    kind.root_tag(),
                    child.tag
                );
                continue;
            }
            walk_series(child, kind, depth - 1, Some(child.tag.as_str()), player_id, out);
        }
        return;
    }

    for child in &node.children {
        let Some(turn_number) = parse_turn_tag(&child.tag) else {
            log::debug!("{}: skipping non-turn tag <{}>", kind.root_tag(), child.tag);
            continue;
        };
        let Some(value) = parse_leaf(child) else {
            continue;
        };
        if !kind.accepts(value) {
            log::debug!(
                "{}: turn {turn_number} value {value} outside valid range",
                kind.root_tag()
            );
            continue;
        }
        out.push(HistoryRow {
            player_id,
            turn_number,
            value,
            sub_key: sub_key.map(|s| s.to_string()),
        });
    }
}

pub fn extract_points(export: &MatchExport) -> Result<Vec<HistoryRow>, ExtractError> {
    extract_history(export, MetricKind::Points)
}

pub fn extract_yields(export: &MatchExport) -> Result<Vec<HistoryRow>, ExtractError> {
    extract_history(export, MetricKind::Yield)
}

pub fn extract_military(export: &MatchExport) -> Result<Vec<HistoryRow>, ExtractError> {
    extract_history(export, MetricKind::Military)
}

pub fn extract_legitimacy(export: &MatchExport) -> Result<Vec<HistoryRow>, ExtractError> {
    extract_history(export, MetricKind::Legitimacy)
}

pub fn extract_family_opinions(export: &MatchExport) -> Result<Vec<HistoryRow>, ExtractError> {
    extract_history(export, MetricKind::FamilyOpinion)
}

pub fn extract_religion_opinions(export: &MatchExport) -> Result<Vec<HistoryRow>, ExtractError> {
    extract_history(export, MetricKind::ReligionOpinion)
}

pub fn extract_all(export: &MatchExport) -> Result<MatchHistory, ExtractError> {
    let mut history = MatchHistory::default();
    for kind in MetricKind::ALL {
        history.rows.insert(kind, extract_history(export, kind)?);
    }
    Ok(history)
}

pub fn extract_match(export: &MatchExport) -> Result<MatchRecord, ExtractError> {
    let root = export.root()?;
    let external_id = root
        .attr("GameId")
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(export.label())
        .to_string();
    let game = root.child("Game");
    let total_turns = game
        .and_then(|g| g.child_text("Turn"))
        .and_then(|t| t.parse::<i64>().ok())
        .filter(|t| *t >= 0);
    let winner_player_id = game
        .and_then(|g| g.child_text("WinnerPlayer"))
        .and_then(|t| t.parse::<i64>().ok())
        .and_then(internal_player_id);
    Ok(MatchRecord {
        external_id,
        game_name: root.attr("GameName").map(|s| s.trim().to_string()),
        total_turns,
        winner_player_id,
    })
}

pub fn extract_players(export: &MatchExport) -> Result<Vec<PlayerRecord>, ExtractError> {
    let mut out = Vec::new();
    for player in export.human_players()? {
        let Some(player_id) = player_id_of(player) else {
            log::warn!(
                "{}: skipping player without a usable ID attribute",
                export.label()
            );
            continue;
        };
        let player_name = player
            .attr("Name")
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());
        let player_name_normalized = player_name
            .as_deref()
            .map(normalize_name)
            .filter(|n| !n.is_empty());
        if player_name_normalized.is_none() {
            log::warn!(
                "{}: player {player_id} has no usable Name; identity stays unresolved",
                export.label()
            );
        }
        out.push(PlayerRecord {
            player_id,
            player_name_normalized,
            player_name,
            nation: player.child_text("Nation").map(|s| s.to_string()),
        });
    }
    Ok(out)
}
