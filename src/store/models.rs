use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "raptor_node_kind", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Leaf,
    Summary,
    Root,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeKind::Leaf => "leaf",
            NodeKind::Summary => "summary",
            NodeKind::Root => "root",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for NodeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "leaf" => Ok(NodeKind::Leaf),
            "summary" => Ok(NodeKind::Summary),
            "root" => Ok(NodeKind::Root),
            other => Err(format!("unknown node kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "embedding_owner_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingOwnerType {
    Chunk,
    TreeNode,
}

/// A chunk handed in as leaf material: an externally assigned id plus its text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkItem {
    pub id: String,
    pub text: String,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Tree {
    pub tree_id: String,
    pub doc_id: String,
    pub dataset_id: String,
    pub params: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeNode {
    pub node_id: String,
    pub tree_id: String,
    pub level: i32,
    pub kind: NodeKind,
    pub text: String,
    pub meta: serde_json::Value,
}

/// Composite-keyed (parent_id, child_id); a node may appear as a child of more than one
/// parent under soft clustering, so this is modeled as an adjacency relation rather than a
/// child-list field on `TreeNode` (§9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeEdge {
    pub parent_id: String,
    pub child_id: String,
}

/// Composite-keyed (node_id, chunk_id); `rank` is the contiguous first-seen order of chunk_id
/// within the node's deduplicated transitive chunk set (§8 link aggregation invariant).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeChunkLink {
    pub node_id: String,
    pub chunk_id: String,
    pub rank: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRow {
    pub id: String,
    pub dataset_id: String,
    pub owner_type: EmbeddingOwnerType,
    pub owner_id: String,
    pub model: String,
    pub dim: i32,
    pub vector: Vec<f32>,
    pub meta: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn node_kind_round_trips_through_its_string_form() {
        for kind in [NodeKind::Leaf, NodeKind::Summary, NodeKind::Root] {
            let s = kind.to_string();
            assert_eq!(NodeKind::from_str(&s).unwrap(), kind);
        }
    }
}
