use async_trait::async_trait;
use pgvector::Vector;
use sqlx::PgPool;
use tracing::instrument;

use crate::utils::error::{ErrorContext, RaptorError};

use super::models::{EmbeddingRow, NodeChunkLink, Tree, TreeEdge, TreeNode};
use super::pool::DbPool;
use super::traits::TreeStore;

/// `sqlx` + `pgvector` backed store over the `trees` / `tree_nodes` / `tree_edges` /
/// `tree_node_chunks` / `embeddings` tables (schema grounded on the
/// `ac396bbf4fbd_add_tree_and_models_relative_with_raptor` / `56cd2b49dff3_add_kind_enum_to_tree_nodes`
/// migrations: string ids, JSONB `params`/`meta`, an HNSW cosine index on `embeddings.v`).
pub struct PostgresTreeStore {
    pool: PgPool,
}

impl PostgresTreeStore {
    pub fn new(db: &DbPool) -> Self {
        Self {
            pool: db.get_pool().clone(),
        }
    }

    async fn add_nodes_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        tree_id: &str,
        nodes: &[TreeNode],
    ) -> Result<(), sqlx::Error> {
        for node in nodes {
            sqlx::query(
                "INSERT INTO tree_nodes (node_id, tree_id, level, kind, text, meta)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (node_id) DO UPDATE SET
                     level = EXCLUDED.level,
                     kind = EXCLUDED.kind,
                     text = EXCLUDED.text,
                     meta = EXCLUDED.meta",
            )
            .bind(&node.node_id)
            .bind(tree_id)
            .bind(node.level)
            .bind(node.kind)
            .bind(&node.text)
            .bind(&node.meta)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    async fn add_edges_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        edges: &[TreeEdge],
    ) -> Result<(), sqlx::Error> {
        for edge in edges {
            sqlx::query(
                "INSERT INTO tree_edges (parent_id, child_id) VALUES ($1, $2)
                 ON CONFLICT (parent_id, child_id) DO NOTHING",
            )
            .bind(&edge.parent_id)
            .bind(&edge.child_id)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    async fn link_node_chunks_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        links: &[NodeChunkLink],
    ) -> Result<(), sqlx::Error> {
        for link in links {
            sqlx::query(
                "INSERT INTO tree_node_chunks (node_id, chunk_id, rank) VALUES ($1, $2, $3)
                 ON CONFLICT (node_id, chunk_id) DO UPDATE SET rank = EXCLUDED.rank",
            )
            .bind(&link.node_id)
            .bind(&link.chunk_id)
            .bind(link.rank)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    async fn bulk_upsert_embeddings_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        rows: &[EmbeddingRow],
    ) -> Result<(), sqlx::Error> {
        for row in rows {
            let vector = Vector::from(row.vector.clone());
            sqlx::query(
                "INSERT INTO embeddings (id, dataset_id, owner_type, owner_id, model, dim, v, meta)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 ON CONFLICT (id) DO UPDATE SET
                     dataset_id = EXCLUDED.dataset_id,
                     owner_type = EXCLUDED.owner_type,
                     owner_id = EXCLUDED.owner_id,
                     model = EXCLUDED.model,
                     dim = EXCLUDED.dim,
                     v = EXCLUDED.v,
                     meta = EXCLUDED.meta",
            )
            .bind(&row.id)
            .bind(&row.dataset_id)
            .bind(row.owner_type)
            .bind(&row.owner_id)
            .bind(&row.model)
            .bind(row.dim)
            .bind(vector)
            .bind(&row.meta)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl TreeStore for PostgresTreeStore {
    #[instrument(skip(self, params))]
    async fn create_tree(
        &self,
        doc_id: &str,
        dataset_id: &str,
        params: serde_json::Value,
    ) -> Result<String, RaptorError> {
        let tree_id = format!("tree::{}", uuid_like_suffix());
        sqlx::query(
            "INSERT INTO trees (tree_id, doc_id, dataset_id, params) VALUES ($1, $2, $3, $4)",
        )
        .bind(&tree_id)
        .bind(doc_id)
        .bind(dataset_id)
        .bind(params)
        .execute(&self.pool)
        .await?;
        Ok(tree_id)
    }

    async fn add_nodes(&self, tree_id: &str, nodes: Vec<TreeNode>) -> Result<(), RaptorError> {
        let mut tx = self.pool.begin().await?;
        Self::add_nodes_tx(&mut tx, tree_id, &nodes).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn add_edges(&self, _tree_id: &str, edges: Vec<TreeEdge>) -> Result<(), RaptorError> {
        let mut tx = self.pool.begin().await?;
        Self::add_edges_tx(&mut tx, &edges).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn link_node_chunks(&self, links: Vec<NodeChunkLink>) -> Result<(), RaptorError> {
        let mut tx = self.pool.begin().await?;
        Self::link_node_chunks_tx(&mut tx, &links).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn bulk_upsert_embeddings(&self, rows: Vec<EmbeddingRow>) -> Result<(), RaptorError> {
        let mut tx = self.pool.begin().await?;
        Self::bulk_upsert_embeddings_tx(&mut tx, &rows).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete_by_dataset(&self, dataset_id: &str) -> Result<Vec<String>, RaptorError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT tree_id FROM trees WHERE dataset_id = $1")
            .bind(dataset_id)
            .fetch_all(&self.pool)
            .await?;
        sqlx::query("DELETE FROM trees WHERE dataset_id = $1")
            .bind(dataset_id)
            .execute(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    #[instrument(skip(self, nodes, edges, links, embeddings))]
    async fn persist_level(
        &self,
        tree_id: &str,
        nodes: Vec<TreeNode>,
        edges: Vec<TreeEdge>,
        links: Vec<NodeChunkLink>,
        embeddings: Vec<EmbeddingRow>,
    ) -> Result<(), RaptorError> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            RaptorError::persistence(
                "failed to open level transaction",
                ErrorContext::new().with("tree_id", tree_id),
                Some(e.into()),
            )
        })?;

        let result: Result<(), sqlx::Error> = async {
            Self::add_nodes_tx(&mut tx, tree_id, &nodes).await?;
            Self::add_edges_tx(&mut tx, &edges).await?;
            Self::link_node_chunks_tx(&mut tx, &links).await?;
            Self::bulk_upsert_embeddings_tx(&mut tx, &embeddings).await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                tx.commit().await?;
                Ok(())
            }
            Err(e) => {
                tx.rollback().await.ok();
                Err(RaptorError::persistence(
                    "level transaction failed, rolled back",
                    ErrorContext::new().with("tree_id", tree_id),
                    Some(e.into()),
                ))
            }
        }
    }

    async fn get_tree(&self, tree_id: &str) -> Result<Option<Tree>, RaptorError> {
        let tree = sqlx::query_as::<_, Tree>(
            "SELECT tree_id, doc_id, dataset_id, params, created_at FROM trees WHERE tree_id = $1",
        )
        .bind(tree_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(tree)
    }

    async fn get_nodes(&self, tree_id: &str) -> Result<Vec<TreeNode>, RaptorError> {
        let rows: Vec<(String, String, i32, String, String, serde_json::Value)> = sqlx::query_as(
            "SELECT node_id, tree_id, level, kind::text, text, meta FROM tree_nodes WHERE tree_id = $1",
        )
        .bind(tree_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(node_id, tid, level, kind, text, meta)| {
                Ok(TreeNode {
                    node_id,
                    tree_id: tid,
                    level,
                    kind: kind.parse().map_err(|e: String| {
                        RaptorError::persistence("bad node kind in store", ErrorContext::new(), Some(anyhow::anyhow!(e)))
                    })?,
                    text,
                    meta,
                })
            })
            .collect()
    }

    async fn get_edges(&self, tree_id: &str) -> Result<Vec<TreeEdge>, RaptorError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT e.parent_id, e.child_id FROM tree_edges e
             JOIN tree_nodes n ON n.node_id = e.parent_id
             WHERE n.tree_id = $1",
        )
        .bind(tree_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(parent_id, child_id)| TreeEdge { parent_id, child_id })
            .collect())
    }

    async fn get_links_for_node(&self, node_id: &str) -> Result<Vec<NodeChunkLink>, RaptorError> {
        let rows: Vec<(String, String, i32)> = sqlx::query_as(
            "SELECT node_id, chunk_id, rank FROM tree_node_chunks WHERE node_id = $1 ORDER BY rank",
        )
        .bind(node_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(node_id, chunk_id, rank)| NodeChunkLink { node_id, chunk_id, rank })
            .collect())
    }
}

fn uuid_like_suffix() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..12)
        .map(|_| std::char::from_digit(rng.gen_range(0..16), 16).unwrap())
        .collect()
}
