use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use tokio::sync::Semaphore;
use tracing::{info, instrument};

use crate::cluster::GmmRaptorClusterer;
use crate::config::{BuilderConfig, EmbeddingConfig, SummarizerConfig};
use crate::embedding::EmbeddingClient;
use crate::store::{ChunkItem, EmbeddingOwnerType, EmbeddingRow, NodeChunkLink, NodeKind, TreeEdge, TreeNode, TreeStore};
use crate::summarize::Summarizer;
use crate::utils::error::{ErrorContext, RaptorError};
use crate::utils::metrics::{Metrics, Timer};

use super::pacer::Pacer;

/// Orchestrates one full tree build: leaf level, then cluster/summarize/embed/persist
/// rounds until a single root remains (§4.6). Grounded on
/// `RaptorBuildService.build_from_memory_pairs`; constructed once per build with injected
/// collaborators, the same shape as the teacher's `Worker`.
pub struct RaptorBuilder {
    embedder: Arc<EmbeddingClient>,
    clusterer: GmmRaptorClusterer,
    summarizer: Arc<Summarizer>,
    store: Arc<dyn TreeStore>,
    pacer: Pacer,
    llm_semaphore: Semaphore,
    min_k: usize,
    max_k: usize,
    max_tokens: u32,
    model_name: String,
    dim: i32,
    metrics: Metrics,
}

impl RaptorBuilder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        embedder: Arc<EmbeddingClient>,
        clusterer: GmmRaptorClusterer,
        summarizer: Arc<Summarizer>,
        store: Arc<dyn TreeStore>,
        embedding_config: &EmbeddingConfig,
        summarizer_config: &SummarizerConfig,
        builder_config: &BuilderConfig,
        min_k: usize,
        max_k: usize,
        metrics: Metrics,
    ) -> Self {
        Self {
            embedder,
            clusterer,
            summarizer,
            store,
            pacer: Pacer::new(builder_config.rpm_limit),
            llm_semaphore: Semaphore::new(summarizer_config.llm_concurrency.max(1)),
            min_k,
            max_k,
            max_tokens: summarizer_config.max_tokens,
            model_name: embedding_config.model.clone(),
            dim: embedding_config.dimension as i32,
            metrics,
        }
    }

    #[instrument(skip(self, chunk_items, vectors), fields(n = chunk_items.len()))]
    pub async fn build_from_memory_pairs(
        &self,
        doc_id: &str,
        dataset_id: &str,
        chunk_items: Vec<ChunkItem>,
        vectors: Vec<Vec<f32>>,
        params: serde_json::Value,
    ) -> Result<String, RaptorError> {
        if chunk_items.is_empty() {
            return Err(RaptorError::validation(
                "chunk_items must not be empty",
                ErrorContext::new().with("doc_id", doc_id),
            ));
        }
        if chunk_items.len() != vectors.len() {
            return Err(RaptorError::validation(
                "chunk_items and vectors must have the same length",
                ErrorContext::new()
                    .with("chunks", chunk_items.len())
                    .with("vectors", vectors.len()),
            ));
        }

        let timer = Timer::new();
        let result = self.build_inner(doc_id, dataset_id, chunk_items, vectors, params).await;
        self.metrics.add_build_time(timer.elapsed());
        match &result {
            Ok(_) => self.metrics.increment_trees_built(),
            Err(_) => self.metrics.increment_trees_failed(),
        }
        result
    }

    async fn build_inner(
        &self,
        doc_id: &str,
        dataset_id: &str,
        chunk_items: Vec<ChunkItem>,
        vectors: Vec<Vec<f32>>,
        params: serde_json::Value,
    ) -> Result<String, RaptorError> {
        let tree_id = self.store.create_tree(doc_id, dataset_id, params).await?;
        info!(%tree_id, doc_id, dataset_id, "create_tree");

        let (mut current_ids, mut node2chunks) = self.prepare_leaves(&tree_id, &chunk_items).await?;
        let mut current_vecs = vectors;
        let mut current_texts: Vec<String> = chunk_items.into_iter().map(|c| c.text).collect();

        let mut level = 0i32;
        while current_ids.len() > 1 {
            let groups = self.clusterer.fit_predict(&current_vecs, self.min_k, self.max_k);
            info!(
                level = level + 1,
                clusters = groups.len(),
                sizes = ?groups.iter().map(|g| g.len()).collect::<Vec<_>>(),
                "clustered level"
            );

            let group_members: Vec<(Vec<String>, Vec<String>)> = groups
                .iter()
                .map(|idxs| {
                    let ids: Vec<String> = idxs.iter().map(|&i| current_ids[i].clone()).collect();
                    let texts: Vec<String> = idxs.iter().map(|&i| current_texts[i].clone()).collect();
                    (ids, texts)
                })
                .collect();

            let summaries = self.summarize_groups(&group_members).await?;

            self.pacer.wait_turn().await;
            let vecs = self.embedder.embed_docs(summaries.clone()).await?;

            let (new_ids, new_vecs, new_texts) = self
                .persist_level(&tree_id, dataset_id, &group_members, &summaries, &vecs, &mut node2chunks, level)
                .await?;

            current_ids = new_ids;
            current_vecs = new_vecs;
            current_texts = new_texts;
            level += 1;
            self.metrics.add_levels_processed(1);
        }

        info!(%tree_id, levels = level, "build complete");
        Ok(tree_id)
    }

    async fn prepare_leaves(
        &self,
        tree_id: &str,
        chunk_items: &[ChunkItem],
    ) -> Result<(Vec<String>, HashMap<String, Vec<String>>), RaptorError> {
        let single_leaf_is_root = chunk_items.len() == 1;
        let mut leaf_ids = Vec::with_capacity(chunk_items.len());
        let mut node2chunks = HashMap::new();
        let mut node_rows = Vec::with_capacity(chunk_items.len());
        let mut link_rows = Vec::with_capacity(chunk_items.len());

        for (i, item) in chunk_items.iter().enumerate() {
            let leaf_id = format!("{tree_id}::leaf::{i:06}");
            let (kind, meta) = if single_leaf_is_root {
                (NodeKind::Root, serde_json::json!({"is_root": true, "chunk_id": item.id}))
            } else {
                (NodeKind::Leaf, serde_json::json!({"chunk_id": item.id}))
            };

            node_rows.push(TreeNode {
                node_id: leaf_id.clone(),
                tree_id: tree_id.to_string(),
                level: 0,
                kind,
                text: item.text.clone(),
                meta,
            });
            link_rows.push(NodeChunkLink {
                node_id: leaf_id.clone(),
                chunk_id: item.id.clone(),
                rank: 0,
            });
            node2chunks.insert(leaf_id.clone(), vec![item.id.clone()]);
            leaf_ids.push(leaf_id);
        }

        self.store
            .persist_level(tree_id, node_rows, Vec::new(), link_rows, Vec::new())
            .await?;

        Ok((leaf_ids, node2chunks))
    }

    async fn summarize_groups(
        &self,
        groups: &[(Vec<String>, Vec<String>)],
    ) -> Result<Vec<String>, RaptorError> {
        self.metrics.add_summarize_calls(groups.len() as u64);
        let tasks = groups.iter().map(|(_, texts)| async move {
            let _permit = self
                .llm_semaphore
                .acquire()
                .await
                .expect("llm semaphore never closes");
            self.summarizer.summarize_cluster(texts, self.max_tokens).await
        });
        futures::future::try_join_all(tasks).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn persist_level(
        &self,
        tree_id: &str,
        dataset_id: &str,
        group_members: &[(Vec<String>, Vec<String>)],
        summaries: &[String],
        vecs: &[Vec<f32>],
        node2chunks: &mut HashMap<String, Vec<String>>,
        level: i32,
    ) -> Result<(Vec<String>, Vec<Vec<f32>>, Vec<String>), RaptorError> {
        let mut node_rows = Vec::with_capacity(group_members.len());
        let mut edge_rows = Vec::new();
        let mut link_rows = Vec::new();
        let mut emb_rows = Vec::with_capacity(group_members.len());
        let mut node_ids = Vec::with_capacity(group_members.len());

        for (gi, ((member_ids, _), summary)) in group_members.iter().zip(summaries.iter()).enumerate() {
            let node_id = format!("{tree_id}::L{}::{}::{}", level + 1, gi, random_suffix(6));
            node_ids.push(node_id.clone());

            node_rows.push(TreeNode {
                node_id: node_id.clone(),
                tree_id: tree_id.to_string(),
                level: level + 1,
                kind: NodeKind::Summary,
                text: summary.clone(),
                meta: serde_json::json!({}),
            });

            for child_id in member_ids {
                edge_rows.push(TreeEdge {
                    parent_id: node_id.clone(),
                    child_id: child_id.clone(),
                });
            }

            let agg_chunk_ids = aggregate_chunks(member_ids, node2chunks);
            for (rank, chunk_id) in agg_chunk_ids.iter().enumerate() {
                link_rows.push(NodeChunkLink {
                    node_id: node_id.clone(),
                    chunk_id: chunk_id.clone(),
                    rank: rank as i32,
                });
            }
            node2chunks.insert(node_id.clone(), agg_chunk_ids);

            emb_rows.push(EmbeddingRow {
                id: format!("tree_node::{node_id}"),
                dataset_id: dataset_id.to_string(),
                owner_type: EmbeddingOwnerType::TreeNode,
                owner_id: node_id.clone(),
                model: self.model_name.clone(),
                dim: self.dim,
                vector: vecs[gi].clone(),
                meta: serde_json::json!({"tree_id": tree_id, "level": level + 1}),
            });
        }

        if node_ids.len() == 1 {
            node_rows[0].kind = NodeKind::Root;
            let meta = node_rows[0].meta.as_object_mut().expect("object literal");
            meta.insert("is_root".to_string(), serde_json::Value::Bool(true));
            info!(node_id = %node_ids[0], level = level + 1, "identified root node");
        }

        self.store
            .persist_level(tree_id, node_rows, edge_rows, link_rows, emb_rows)
            .await?;

        Ok((node_ids, vecs.to_vec(), summaries.to_vec()))
    }
}

fn aggregate_chunks(member_ids: &[String], node2chunks: &HashMap<String, Vec<String>>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut agg = Vec::new();
    for mid in member_ids {
        if let Some(chunks) = node2chunks.get(mid) {
            for cid in chunks {
                if seen.insert(cid.clone()) {
                    agg.push(cid.clone());
                }
            }
        }
    }
    agg
}

fn random_suffix(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| std::char::from_digit(rng.gen_range(0..16), 16).unwrap())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::GmmRaptorClusterer;
    use crate::config::ClusteringConfig;
    use crate::embedding::provider::{EmbeddingProvider, MockEmbeddingProvider};
    use crate::store::InMemoryTreeStore;
    use crate::summarize::llm::MockChatLLM;

    fn embedding_config() -> EmbeddingConfig {
        EmbeddingConfig {
            model: "voyage-context-3".to_string(),
            dimension: 4,
            dtype: "float".to_string(),
            rpm_limit: 100,
            tpm_limit: 1_000_000,
            per_request_token_budget: 9_500,
            per_slot_max_concurrent: 2,
            max_retries: 3,
        }
    }

    fn summarizer_config() -> SummarizerConfig {
        SummarizerConfig {
            model: "gpt-4o-mini".to_string(),
            llm_concurrency: 3,
            max_tokens: 512,
        }
    }

    fn builder_config() -> BuilderConfig {
        BuilderConfig { rpm_limit: 6000 }
    }

    fn clustering_config() -> ClusteringConfig {
        ClusteringConfig {
            min_k: 2,
            max_k: 50,
            reduction_dim: 2,
            threshold: 0.1,
            metric: "cosine".to_string(),
            random_state: 224,
        }
    }

    fn mock_embedder(dim: usize, meter_budget: usize) -> Arc<EmbeddingClient> {
        let mut provider = MockEmbeddingProvider::new();
        provider
            .expect_contextualized_embed()
            .returning(move |inputs, _input_type| {
                Ok(inputs
                    .iter()
                    .map(|group| group.iter().map(|_| vec![0.1f32; dim]).collect())
                    .collect())
            });
        let providers: Vec<Arc<dyn EmbeddingProvider>> = vec![Arc::new(provider)];
        let meter = Arc::new(crate::embedding::TiktokenMeter);
        let mut config = embedding_config();
        config.per_request_token_budget = meter_budget;
        Arc::new(EmbeddingClient::new(
            providers,
            &config,
            meter,
            crate::utils::metrics::Metrics::new(),
        ))
    }

    fn builder_with(llm_text: &'static str) -> RaptorBuilder {
        let embedder = mock_embedder(4, 9_500);
        let clusterer = GmmRaptorClusterer::new(&clustering_config());
        let mut llm = MockChatLLM::new();
        llm.expect_summarize()
            .returning(move |_prompt, _max_tokens, _temp| Ok(llm_text.to_string()));
        let summarizer = Arc::new(Summarizer::new(Arc::new(llm)));
        let store: Arc<dyn TreeStore> = Arc::new(InMemoryTreeStore::new());

        RaptorBuilder::new(
            embedder,
            clusterer,
            summarizer,
            store,
            &embedding_config(),
            &summarizer_config(),
            &builder_config(),
            2,
            50,
            Metrics::new(),
        )
    }

    #[tokio::test]
    async fn single_chunk_becomes_a_one_node_root_tree() {
        let builder = builder_with("ignored");
        let chunk = ChunkItem {
            id: "c1".to_string(),
            text: "hello world".to_string(),
        };
        let tree_id = builder
            .build_from_memory_pairs("doc-1", "dataset-1", vec![chunk], vec![vec![0.0; 4]], serde_json::json!({}))
            .await
            .unwrap();

        let nodes = builder.store.get_nodes(&tree_id).await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].kind, NodeKind::Root);
        assert_eq!(nodes[0].level, 0);

        let links = builder.store.get_links_for_node(&nodes[0].node_id).await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].chunk_id, "c1");
        assert_eq!(links[0].rank, 0);
    }

    #[tokio::test]
    async fn two_chunks_force_a_binary_merge_into_one_root() {
        let builder = builder_with("merged summary");
        let chunks = vec![
            ChunkItem { id: "c1".to_string(), text: "t1".to_string() },
            ChunkItem { id: "c2".to_string(), text: "t2".to_string() },
        ];
        let vectors = vec![vec![1.0, 0.0, 0.0, 0.0], vec![0.0, 1.0, 0.0, 0.0]];

        let tree_id = builder
            .build_from_memory_pairs("doc-1", "dataset-1", chunks, vectors, serde_json::json!({}))
            .await
            .unwrap();

        let nodes = builder.store.get_nodes(&tree_id).await.unwrap();
        let leaves: Vec<_> = nodes.iter().filter(|n| n.level == 0).collect();
        let roots: Vec<_> = nodes.iter().filter(|n| n.kind == NodeKind::Root).collect();
        assert_eq!(leaves.len(), 2);
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].level, 1);
        assert_eq!(roots[0].text, "merged summary");

        let edges = builder.store.get_edges(&tree_id).await.unwrap();
        assert_eq!(edges.len(), 2);

        let root_links = builder.store.get_links_for_node(&roots[0].node_id).await.unwrap();
        let mut chunk_ids: Vec<_> = root_links.iter().map(|l| l.chunk_id.clone()).collect();
        chunk_ids.sort();
        assert_eq!(chunk_ids, vec!["c1".to_string(), "c2".to_string()]);
    }

    #[tokio::test]
    async fn empty_chunk_list_is_rejected() {
        let builder = builder_with("ignored");
        let result = builder
            .build_from_memory_pairs("doc-1", "dataset-1", vec![], vec![], serde_json::json!({}))
            .await;
        assert!(matches!(result, Err(RaptorError::Validation { .. })));
    }

    #[tokio::test]
    async fn mismatched_chunk_and_vector_lengths_are_rejected() {
        let builder = builder_with("ignored");
        let chunks = vec![ChunkItem { id: "c1".to_string(), text: "t1".to_string() }];
        let result = builder
            .build_from_memory_pairs("doc-1", "dataset-1", chunks, vec![], serde_json::json!({}))
            .await;
        assert!(matches!(result, Err(RaptorError::Validation { .. })));
    }

    #[tokio::test]
    async fn transactional_rollback_leaves_no_partial_level_behind() {
        let embedder = mock_embedder(4, 9_500);
        let clusterer = GmmRaptorClusterer::new(&clustering_config());
        let mut llm = MockChatLLM::new();
        llm.expect_summarize().returning(|_, _, _| Ok("summary".to_string()));
        let summarizer = Arc::new(Summarizer::new(Arc::new(llm)));
        let in_memory = Arc::new(InMemoryTreeStore::new());
        let store: Arc<dyn TreeStore> = in_memory.clone();

        let builder = RaptorBuilder::new(
            embedder,
            clusterer,
            summarizer,
            store,
            &embedding_config(),
            &summarizer_config(),
            &builder_config(),
            2,
            50,
            Metrics::new(),
        );

        let chunks = vec![
            ChunkItem { id: "c1".to_string(), text: "t1".to_string() },
            ChunkItem { id: "c2".to_string(), text: "t2".to_string() },
        ];
        let vectors = vec![vec![1.0, 0.0, 0.0, 0.0], vec![0.0, 1.0, 0.0, 0.0]];

        // A two-chunk build only ever reaches level 1 before terminating, so a wildcard
        // tree_id hook still targets the right persist_level call.
        in_memory.fail_next_embeddings_upsert("*", 1);

        let result = builder
            .build_from_memory_pairs("doc-1", "dataset-1", chunks, vectors, serde_json::json!({}))
            .await;

        assert!(result.is_err(), "builder must propagate a failed level persist");
    }
}
