use async_trait::async_trait;

use crate::utils::error::RaptorError;

use super::models::{EmbeddingRow, NodeChunkLink, Tree, TreeEdge, TreeNode};

/// Atomic level-scoped persistence (§4.5). Implementations own how "atomic" is achieved
/// (a DB transaction for `PostgresTreeStore`, a single lock for the in-memory test double);
/// callers only rely on `persist_level` either fully applying or leaving no trace.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TreeStore: Send + Sync {
    async fn create_tree(
        &self,
        doc_id: &str,
        dataset_id: &str,
        params: serde_json::Value,
    ) -> Result<String, RaptorError>;

    async fn add_nodes(&self, tree_id: &str, nodes: Vec<TreeNode>) -> Result<(), RaptorError>;

    async fn add_edges(&self, tree_id: &str, edges: Vec<TreeEdge>) -> Result<(), RaptorError>;

    async fn link_node_chunks(&self, links: Vec<NodeChunkLink>) -> Result<(), RaptorError>;

    async fn bulk_upsert_embeddings(&self, rows: Vec<EmbeddingRow>) -> Result<(), RaptorError>;

    async fn delete_by_dataset(&self, dataset_id: &str) -> Result<Vec<String>, RaptorError>;

    /// One unit of work for a whole tree level: nodes, edges, links and embeddings are
    /// written together, or none of them are, on failure. The leaf level passes empty
    /// `edges`/`embeddings`.
    async fn persist_level(
        &self,
        tree_id: &str,
        nodes: Vec<TreeNode>,
        edges: Vec<TreeEdge>,
        links: Vec<NodeChunkLink>,
        embeddings: Vec<EmbeddingRow>,
    ) -> Result<(), RaptorError>;

    async fn get_tree(&self, tree_id: &str) -> Result<Option<Tree>, RaptorError>;
    async fn get_nodes(&self, tree_id: &str) -> Result<Vec<TreeNode>, RaptorError>;
    async fn get_edges(&self, tree_id: &str) -> Result<Vec<TreeEdge>, RaptorError>;
    async fn get_links_for_node(&self, node_id: &str) -> Result<Vec<NodeChunkLink>, RaptorError>;
}
