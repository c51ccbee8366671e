use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::key::StateKey;
use crate::node::{TreeIndex, TreeNode};

pub const SNAPSHOT_VERSION: &str = "1.0";
pub const DATA_VERSION: &str = "1.0";

/// One state on the recorded active path, leaf first (§4.11/§6.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub key: String,
    #[serde(rename = "encodedStateData", default, skip_serializing_if = "Option::is_none")]
    pub encoded_state_data: Option<serde_json::Value>,
    #[serde(rename = "dataVersion")]
    pub data_version: String,
}

/// Wire format produced by `saveTo` and consumed by `loadFrom`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEnvelope {
    pub version: String,
    pub states: Vec<SnapshotEntry>,
}

impl SnapshotEnvelope {
    pub fn to_json(&self) -> EngineResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(source: &str) -> EngineResult<Self> {
        Ok(serde_json::from_str(source)?)
    }
}

/// Resolves every recorded key against `tree` by name and checks the recorded
/// chain is exactly the target leaf's actual ancestry (§4.11 step 4). Names
/// are matched uniquely: a tree where two states share a name (a plain key
/// and a data-typed key of the same name, or a programmer error) is rejected
/// rather than guessed at.
pub(crate) fn resolve_and_validate(tree: &TreeIndex, states: &[SnapshotEntry]) -> EngineResult<Vec<TreeNode>> {
    if states.is_empty() {
        return Err(EngineError::MismatchedActivePath(
            "snapshot has no active states".into(),
        ));
    }

    let nodes = states
        .iter()
        .map(|entry| find_by_name(tree, &entry.key))
        .collect::<EngineResult<Vec<_>>>()?;

    let leaf = &nodes[0];
    let actual: Vec<StateKey> = leaf.self_and_ancestors().map(|n| n.key.clone()).collect();
    let recorded: Vec<StateKey> = nodes.iter().map(|n| n.key.clone()).collect();
    if actual != recorded {
        return Err(EngineError::MismatchedActivePath(format!(
            "recorded chain {:?} does not match the tree's ancestry {:?} for leaf {:?}",
            recorded, actual, leaf.key
        )));
    }
    Ok(nodes)
}

fn find_by_name(tree: &TreeIndex, name: &str) -> EngineResult<TreeNode> {
    let mut matches = tree.root.self_and_descendants().filter(|n| n.key.name() == name);
    let first = matches.next().ok_or_else(|| EngineError::UnknownState(name.to_string()))?;
    if matches.next().is_some() {
        return Err(EngineError::UnknownState(format!(
            "{name:?} is ambiguous: more than one state shares this name"
        )));
    }
    Ok(first)
}
