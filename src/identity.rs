use std::collections::BTreeSet;
use std::fmt;

use serde::{Serialize, Serializer};

const PARTICIPANT_PREFIX: &str = "participant:";
const NAME_PREFIX: &str = "name:";
pub const UNRESOLVED_KEY: &str = "unresolved";
const UNKNOWN_DISPLAY_NAME: &str = "(unknown)";

/// Key under which player instances are aggregated as one person.
///
/// Linked and name-derived keys live in separate namespaces, so a player
/// called "42" never aliases onto participant 42.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GroupingKey {
    Participant(i64),
    Name(String),
    Unresolved,
}

impl fmt::Display for GroupingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupingKey::Participant(id) => write!(f, "{PARTICIPANT_PREFIX}{id}"),
            GroupingKey::Name(name) => write!(f, "{NAME_PREFIX}{name}"),
            GroupingKey::Unresolved => f.write_str(UNRESOLVED_KEY),
        }
    }
}

impl Serialize for GroupingKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedIdentity {
    pub display_name: String,
    pub grouping_key: GroupingKey,
    pub participant_id: Option<i64>,
    pub is_unlinked: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ParticipantLink<'a> {
    pub participant_id: i64,
    pub display_name: &'a str,
}

/// Lowercase, alphanumerics only. `"Anar-Kos "` and `"anarkos"` collapse.
pub fn normalize_name(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// The one place a player instance becomes a cross-match identity.
///
/// Every aggregate groups by the returned `grouping_key`; none re-derive it.
pub fn resolve_identity(
    participant: Option<ParticipantLink<'_>>,
    player_name: &str,
    normalized_name: Option<&str>,
) -> ResolvedIdentity {
    let own_name = player_name.trim();
    if let Some(link) = participant {
        let canonical = link.display_name.trim();
        let display_name = if !canonical.is_empty() {
            canonical
        } else if !own_name.is_empty() {
            own_name
        } else {
            UNKNOWN_DISPLAY_NAME
        };
        return ResolvedIdentity {
            display_name: display_name.to_string(),
            grouping_key: GroupingKey::Participant(link.participant_id),
            participant_id: Some(link.participant_id),
            is_unlinked: false,
        };
    }

    let normalized = normalized_name
        .map(normalize_name)
        .filter(|n| !n.is_empty())
        .or_else(|| Some(normalize_name(own_name)).filter(|n| !n.is_empty()));
    let grouping_key = match normalized {
        Some(name) => GroupingKey::Name(name),
        None => GroupingKey::Unresolved,
    };
    ResolvedIdentity {
        display_name: if own_name.is_empty() {
            UNKNOWN_DISPLAY_NAME.to_string()
        } else {
            own_name.to_string()
        },
        grouping_key,
        participant_id: None,
        is_unlinked: true,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PeopleCount {
    pub unique_people: usize,
    pub linked: usize,
    pub unlinked: usize,
}

/// Unique people are distinct grouping keys, never distinct names.
pub fn count_people<'a>(identities: impl IntoIterator<Item = &'a ResolvedIdentity>) -> PeopleCount {
    let mut linked = BTreeSet::new();
    let mut unlinked = BTreeSet::new();
    for identity in identities {
        if identity.is_unlinked {
            unlinked.insert(&identity.grouping_key);
        } else {
            linked.insert(&identity.grouping_key);
        }
    }
    PeopleCount {
        unique_people: linked.len() + unlinked.len(),
        linked: linked.len(),
        unlinked: unlinked.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(id: i64, name: &str) -> Option<ParticipantLink<'_>> {
        Some(ParticipantLink {
            participant_id: id,
            display_name: name,
        })
    }

    #[test]
    fn linked_instance_uses_canonical_name() {
        let id = resolve_identity(link(7, "Anarkos"), "anarkos_alt", Some("anarkosalt"));
        assert_eq!(id.display_name, "Anarkos");
        assert_eq!(id.grouping_key, GroupingKey::Participant(7));
        assert!(!id.is_unlinked);
    }

    #[test]
    fn unlinked_instances_with_same_normalized_name_group_together() {
        let a = resolve_identity(None, "Anarkos", Some("anarkos"));
        let b = resolve_identity(None, "ANARKOS!", Some("anarkos"));
        let linked = resolve_identity(link(1, "Someone"), "anarkos", Some("anarkos"));
        assert_eq!(a.grouping_key, b.grouping_key);
        assert_ne!(a.grouping_key, linked.grouping_key);
        assert!(a.is_unlinked && b.is_unlinked);
        assert_eq!(a.display_name, "Anarkos");
    }

    #[test]
    fn numeric_names_never_alias_participant_ids() {
        let by_name = resolve_identity(None, "42", Some("42"));
        let by_id = resolve_identity(link(42, "Real"), "x", None);
        assert_ne!(by_name.grouping_key.to_string(), by_id.grouping_key.to_string());
        assert_eq!(by_name.grouping_key.to_string(), "name:42");
        assert_eq!(by_id.grouping_key.to_string(), "participant:42");
    }

    #[test]
    fn missing_normalized_name_falls_back_then_marks_unresolved() {
        let derived = resolve_identity(None, "Mister X", None);
        assert_eq!(derived.grouping_key, GroupingKey::Name("misterx".to_string()));

        let unresolved = resolve_identity(None, "  ", None);
        assert_eq!(unresolved.grouping_key, GroupingKey::Unresolved);
        assert_eq!(unresolved.display_name, "(unknown)");
        assert!(unresolved.is_unlinked);
    }

    #[test]
    fn count_people_matches_distinct_keys() {
        let ids = vec![
            resolve_identity(link(1, "A"), "a", Some("a")),
            resolve_identity(link(1, "A"), "a2", Some("a2")),
            resolve_identity(None, "Bee", Some("bee")),
            resolve_identity(None, "bee", None),
            resolve_identity(None, "Cee", Some("cee")),
        ];
        let count = count_people(&ids);
        let distinct = ids
            .iter()
            .map(|i| i.grouping_key.clone())
            .collect::<BTreeSet<_>>()
            .len();
        assert_eq!(count.unique_people, 3);
        assert_eq!(count.linked + count.unlinked, distinct);
        assert_eq!(count.linked, 1);
        assert_eq!(count.unlinked, 2);
    }

    #[test]
    fn normalize_strips_punctuation_and_case() {
        assert_eq!(normalize_name(" Anar-Kos "), "anarkos");
        assert_eq!(normalize_name("__"), "");
    }
}
