use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};

use crate::identity::normalize_name;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub participant_id: i64,
    pub display_name: String,
    #[serde(default)]
    pub external_ref: Option<String>,
}

/// Hand-maintained assertion that a player in one match is a participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantLinkOverride {
    #[serde(rename = "match")]
    pub match_external_id: String,
    pub player_name: String,
    pub participant_id: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantOverrides {
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub links: Vec<ParticipantLinkOverride>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OverrideSummary {
    pub participants_upserted: usize,
    pub players_linked: usize,
    pub links_unmatched: usize,
}

pub fn parse_participant_overrides(raw: &str) -> Result<ParticipantOverrides> {
    serde_json::from_str(raw.trim()).context("invalid participant override json")
}

pub fn load_participant_overrides(path: &Path) -> Result<ParticipantOverrides> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read participant overrides {}", path.display()))?;
    parse_participant_overrides(&raw)
}

/// Links match players by normalized name so spelling and case drift
/// between the override file and the export does not matter.
pub fn apply_participant_overrides(
    conn: &mut Connection,
    overrides: &ParticipantOverrides,
) -> Result<OverrideSummary> {
    let tx = conn.transaction().context("begin override transaction")?;
    let mut summary = OverrideSummary::default();
    {
        let mut upsert = tx
            .prepare_cached(
                "INSERT INTO participants (participant_id, display_name, external_ref)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(participant_id) DO UPDATE SET
                    display_name = excluded.display_name,
                    external_ref = excluded.external_ref",
            )
            .context("prepare participant upsert")?;
        for p in &overrides.participants {
            upsert
                .execute(params![p.participant_id, p.display_name, p.external_ref])
                .with_context(|| format!("upsert participant {}", p.participant_id))?;
            summary.participants_upserted += 1;
        }

        let mut link = tx
            .prepare_cached(
                "UPDATE players SET participant_id = ?1
                 WHERE player_name_normalized = ?2
                   AND match_id = (SELECT match_id FROM matches WHERE external_id = ?3)",
            )
            .context("prepare participant link")?;
        for l in &overrides.links {
            let changed = link
                .execute(params![
                    l.participant_id,
                    normalize_name(&l.player_name),
                    l.match_external_id
                ])
                .with_context(|| {
                    format!(
                        "link {} in match {} to participant {}",
                        l.player_name, l.match_external_id, l.participant_id
                    )
                })?;
            if changed == 0 {
                log::warn!(
                    "override link {} / {} matched no player",
                    l.match_external_id,
                    l.player_name
                );
                summary.links_unmatched += 1;
            }
            summary.players_linked += changed;
        }
    }
    tx.commit().context("commit participant overrides")?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_override_file_shape() {
        let raw = r#"{
            "participants": [{"participant_id": 10, "display_name": "Anarkos"}],
            "links": [{"match": "g1", "player_name": "anarkos", "participant_id": 10}]
        }"#;
        let parsed = parse_participant_overrides(raw).unwrap();
        assert_eq!(parsed.participants[0].external_ref, None);
        assert_eq!(parsed.links[0].match_external_id, "g1");
    }

    #[test]
    fn empty_object_is_valid() {
        let parsed = parse_participant_overrides("{}").unwrap();
        assert_eq!(parsed, ParticipantOverrides::default());
    }
}
