use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tag names carry data in this format: turn numbers (`T12`), yield types
/// (`YIELD_FOOD`) and family or religion names all appear as tags rather
/// than values, so callers iterate children and match on `tag`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub tag: String,
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub children: Vec<Node>,
}

impl Node {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Self::default()
        }
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(name.into(), value.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_child(mut self, child: Node) -> Self {
        self.children.push(child);
        self
    }

    pub fn child(&self, tag: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.tag == tag)
    }

    pub fn children_named<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.children.iter().filter(move |c| c.tag == tag)
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(|s| s.as_str())
    }

    /// Trimmed text content, `None` when absent or blank.
    pub fn text(&self) -> Option<&str> {
        self.text
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn child_text(&self, tag: &str) -> Option<&str> {
        self.child(tag).and_then(Node::text)
    }
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("match export {0} has not been parsed yet")]
    NotParsed(String),
    #[error("match export {label} has no root element {expected}")]
    UnexpectedRoot { label: String, expected: String },
    #[error("invalid export tree json")]
    InvalidJson(#[from] serde_json::Error),
    #[error("read export {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub const ROOT_TAG: &str = "Root";
pub const PLAYER_TAG: &str = "Player";

#[derive(Debug, Clone)]
pub struct MatchExport {
    label: String,
    root: Option<Node>,
}

impl MatchExport {
    /// An export that still needs [`MatchExport::parse_json`] before use.
    pub fn unparsed(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            root: None,
        }
    }

    pub fn from_tree(label: impl Into<String>, root: Node) -> Result<Self, ExtractError> {
        let mut export = Self::unparsed(label);
        export.set_root(root)?;
        Ok(export)
    }

    pub fn from_path(path: &Path) -> Result<Self, ExtractError> {
        let raw = fs::read_to_string(path).map_err(|source| ExtractError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let label = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("export")
            .to_string();
        let mut export = Self::unparsed(label);
        export.parse_json(&raw)?;
        Ok(export)
    }

    pub fn parse_json(&mut self, raw: &str) -> Result<(), ExtractError> {
        let root = serde_json::from_str::<Node>(raw.trim())?;
        self.set_root(root)
    }

    fn set_root(&mut self, root: Node) -> Result<(), ExtractError> {
        if root.tag != ROOT_TAG {
            return Err(ExtractError::UnexpectedRoot {
                label: self.label.clone(),
                expected: ROOT_TAG.to_string(),
            });
        }
        self.root = Some(root);
        Ok(())
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_parsed(&self) -> bool {
        self.root.is_some()
    }

    pub fn root(&self) -> Result<&Node, ExtractError> {
        self.root
            .as_ref()
            .ok_or_else(|| ExtractError::NotParsed(self.label.clone()))
    }

    /// Player sub-trees that were never handed to the AI.
    pub fn human_players(&self) -> Result<Vec<&Node>, ExtractError> {
        let root = self.root()?;
        Ok(root
            .children_named(PLAYER_TAG)
            .filter(|p| is_human(p))
            .collect())
    }
}

fn is_human(player: &Node) -> bool {
    player
        .attr("AIControlledToTurn")
        .and_then(|v| v.trim().parse::<i64>().ok())
        == Some(0)
}
