use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::utils::error::{ErrorContext, RaptorError};

use super::models::{EmbeddingRow, NodeChunkLink, Tree, TreeEdge, TreeNode};
use super::traits::TreeStore;

#[derive(Default, Clone)]
struct State {
    trees: HashMap<String, Tree>,
    nodes: HashMap<String, TreeNode>,
    edges: HashSet<(String, String)>,
    links: HashMap<(String, String), i32>,
    embeddings: HashMap<String, EmbeddingRow>,
}

/// In-memory `TreeStore` used by the end-to-end scenario tests (§8 S1-S6) and by anything
/// that needs a `TreeStore` without a database. `persist_level` mutates a private clone of
/// the state and only swaps it in on full success, which is what gives it the same
/// all-or-nothing guarantee the Postgres transaction provides.
pub struct InMemoryTreeStore {
    state: Mutex<State>,
    fail_injection: Mutex<Option<FailInjection>>,
}

#[derive(Clone)]
struct FailInjection {
    tree_id: String,
    level: i32,
}

impl InMemoryTreeStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            fail_injection: Mutex::new(None),
        }
    }

    /// Test-only hook for S6: the next `persist_level` call whose embeddings carry
    /// `meta.tree_id == tree_id` and `meta.level == level` fails before committing.
    /// Pass `"*"` for `tree_id` to match any tree (useful when the caller doesn't control
    /// id generation, e.g. `RaptorBuilder`).
    pub fn fail_next_embeddings_upsert(&self, tree_id: impl Into<String>, level: i32) {
        *self.fail_injection.lock().unwrap() = Some(FailInjection {
            tree_id: tree_id.into(),
            level,
        });
    }
}

impl Default for InMemoryTreeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TreeStore for InMemoryTreeStore {
    async fn create_tree(
        &self,
        doc_id: &str,
        dataset_id: &str,
        params: serde_json::Value,
    ) -> Result<String, RaptorError> {
        let tree_id = format!("tree::{:06x}", rand::random::<u32>() & 0xFFFFFF);
        let mut state = self.state.lock().unwrap();
        state.trees.insert(
            tree_id.clone(),
            Tree {
                tree_id: tree_id.clone(),
                doc_id: doc_id.to_string(),
                dataset_id: dataset_id.to_string(),
                params,
                created_at: Utc::now(),
            },
        );
        Ok(tree_id)
    }

    async fn add_nodes(&self, _tree_id: &str, nodes: Vec<TreeNode>) -> Result<(), RaptorError> {
        let mut state = self.state.lock().unwrap();
        for node in nodes {
            state.nodes.insert(node.node_id.clone(), node);
        }
        Ok(())
    }

    async fn add_edges(&self, _tree_id: &str, edges: Vec<TreeEdge>) -> Result<(), RaptorError> {
        let mut state = self.state.lock().unwrap();
        for edge in edges {
            state.edges.insert((edge.parent_id, edge.child_id));
        }
        Ok(())
    }

    async fn link_node_chunks(&self, links: Vec<NodeChunkLink>) -> Result<(), RaptorError> {
        let mut state = self.state.lock().unwrap();
        for link in links {
            state.links.insert((link.node_id, link.chunk_id), link.rank);
        }
        Ok(())
    }

    async fn bulk_upsert_embeddings(&self, rows: Vec<EmbeddingRow>) -> Result<(), RaptorError> {
        let mut state = self.state.lock().unwrap();
        for row in rows {
            state.embeddings.insert(row.id.clone(), row);
        }
        Ok(())
    }

    async fn delete_by_dataset(&self, dataset_id: &str) -> Result<Vec<String>, RaptorError> {
        let mut state = self.state.lock().unwrap();
        let tree_ids: Vec<String> = state
            .trees
            .values()
            .filter(|t| t.dataset_id == dataset_id)
            .map(|t| t.tree_id.clone())
            .collect();

        state.trees.retain(|_, t| t.dataset_id != dataset_id);
        state.nodes.retain(|_, n| !tree_ids.contains(&n.tree_id));
        let remaining_nodes: HashSet<String> = state.nodes.keys().cloned().collect();
        state
            .edges
            .retain(|(p, c)| remaining_nodes.contains(p) && remaining_nodes.contains(c));
        state
            .links
            .retain(|(n, _), _| remaining_nodes.contains(n));

        Ok(tree_ids)
    }

    async fn persist_level(
        &self,
        tree_id: &str,
        nodes: Vec<TreeNode>,
        edges: Vec<TreeEdge>,
        links: Vec<NodeChunkLink>,
        embeddings: Vec<EmbeddingRow>,
    ) -> Result<(), RaptorError> {
        if let Some(injection) = self.fail_injection.lock().unwrap().take() {
            let matches = embeddings.iter().any(|row| {
                let tree_id_matches = injection.tree_id == "*"
                    || row.meta.get("tree_id").and_then(|v| v.as_str()) == Some(injection.tree_id.as_str());
                tree_id_matches
                    && row.meta.get("level").and_then(|v| v.as_i64()) == Some(injection.level as i64)
            });
            if matches {
                return Err(RaptorError::persistence(
                    "injected failure on bulk_upsert_embeddings",
                    ErrorContext::new().with("tree_id", tree_id),
                    None,
                ));
            }
        }

        let mut staged = self.state.lock().unwrap().clone();
        for node in nodes {
            staged.nodes.insert(node.node_id.clone(), node);
        }
        for edge in edges {
            staged.edges.insert((edge.parent_id, edge.child_id));
        }
        for link in links {
            staged.links.insert((link.node_id, link.chunk_id), link.rank);
        }
        for row in embeddings {
            staged.embeddings.insert(row.id.clone(), row);
        }

        *self.state.lock().unwrap() = staged;
        Ok(())
    }

    async fn get_tree(&self, tree_id: &str) -> Result<Option<Tree>, RaptorError> {
        Ok(self.state.lock().unwrap().trees.get(tree_id).cloned())
    }

    async fn get_nodes(&self, tree_id: &str) -> Result<Vec<TreeNode>, RaptorError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .nodes
            .values()
            .filter(|n| n.tree_id == tree_id)
            .cloned()
            .collect())
    }

    async fn get_edges(&self, tree_id: &str) -> Result<Vec<TreeEdge>, RaptorError> {
        let state = self.state.lock().unwrap();
        let node_ids: HashSet<String> = state
            .nodes
            .values()
            .filter(|n| n.tree_id == tree_id)
            .map(|n| n.node_id.clone())
            .collect();
        Ok(state
            .edges
            .iter()
            .filter(|(p, _)| node_ids.contains(p))
            .map(|(parent_id, child_id)| TreeEdge {
                parent_id: parent_id.clone(),
                child_id: child_id.clone(),
            })
            .collect())
    }

    async fn get_links_for_node(&self, node_id: &str) -> Result<Vec<NodeChunkLink>, RaptorError> {
        let state = self.state.lock().unwrap();
        let mut links: Vec<NodeChunkLink> = state
            .links
            .iter()
            .filter(|((n, _), _)| n == node_id)
            .map(|((n, c), rank)| NodeChunkLink {
                node_id: n.clone(),
                chunk_id: c.clone(),
                rank: *rank,
            })
            .collect();
        links.sort_by_key(|l| l.rank);
        Ok(links)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::{EmbeddingOwnerType, NodeKind};

    #[tokio::test]
    async fn persist_level_rolls_back_on_injected_failure() {
        let store = InMemoryTreeStore::new();
        let tree_id = store
            .create_tree("doc-1", "dataset-1", serde_json::json!({}))
            .await
            .unwrap();

        store.fail_next_embeddings_upsert(tree_id.clone(), 2);

        let nodes = vec![TreeNode {
            node_id: "n1".to_string(),
            tree_id: tree_id.clone(),
            level: 2,
            kind: NodeKind::Summary,
            text: "summary".to_string(),
            meta: serde_json::json!({}),
        }];
        let embeddings = vec![EmbeddingRow {
            id: "tree_node::n1".to_string(),
            dataset_id: "dataset-1".to_string(),
            owner_type: EmbeddingOwnerType::TreeNode,
            owner_id: "n1".to_string(),
            model: "test".to_string(),
            dim: 4,
            vector: vec![0.0; 4],
            meta: serde_json::json!({"tree_id": tree_id, "level": 2}),
        }];

        let result = store
            .persist_level(&tree_id, nodes, vec![], vec![], embeddings)
            .await;
        assert!(result.is_err());

        let persisted_nodes = store.get_nodes(&tree_id).await.unwrap();
        assert!(persisted_nodes.is_empty(), "failed level must leave no nodes behind");
    }

    #[tokio::test]
    async fn delete_by_dataset_cascades_through_nodes_edges_links() {
        let store = InMemoryTreeStore::new();
        let tree_id = store
            .create_tree("doc-1", "dataset-1", serde_json::json!({}))
            .await
            .unwrap();
        store
            .add_nodes(
                &tree_id,
                vec![TreeNode {
                    node_id: "leaf-1".to_string(),
                    tree_id: tree_id.clone(),
                    level: 0,
                    kind: NodeKind::Leaf,
                    text: "hello".to_string(),
                    meta: serde_json::json!({}),
                }],
            )
            .await
            .unwrap();
        store
            .link_node_chunks(vec![NodeChunkLink {
                node_id: "leaf-1".to_string(),
                chunk_id: "chunk-1".to_string(),
                rank: 0,
            }])
            .await
            .unwrap();

        let deleted = store.delete_by_dataset("dataset-1").await.unwrap();
        assert_eq!(deleted, vec![tree_id.clone()]);
        assert!(store.get_nodes(&tree_id).await.unwrap().is_empty());
        assert!(store.get_links_for_node("leaf-1").await.unwrap().is_empty());
    }
}
