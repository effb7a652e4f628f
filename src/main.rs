use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use raptor_tree_builder::builder::RaptorBuilder;
use raptor_tree_builder::cluster::GmmRaptorClusterer;
use raptor_tree_builder::config::Settings;
use raptor_tree_builder::embedding::{EmbeddingClient, EmbeddingProvider, HttpEmbeddingProvider, TiktokenMeter};
use raptor_tree_builder::store::{ChunkItem, DbPool, PostgresTreeStore, TreeStore};
use raptor_tree_builder::summarize::{make_llm, Summarizer};
use raptor_tree_builder::utils::metrics::Metrics;

#[derive(serde::Deserialize)]
struct FixtureDocument {
    doc_id: String,
    dataset_id: String,
    chunks: Vec<ChunkItem>,
    vectors: Vec<Vec<f32>>,
    #[serde(default)]
    params: serde_json::Value,
}

#[tokio::main]
async fn main() -> Result<()> {
    raptor_tree_builder::utils::logger::init_logger()?;
    info!("starting raptor build");

    let settings = Settings::load()?;
    info!("configuration loaded");

    let fixture_path = std::env::args()
        .nth(1)
        .context("usage: raptor <fixture.json>")?;
    let fixture_raw = std::fs::read_to_string(&fixture_path)
        .with_context(|| format!("failed to read fixture at {fixture_path}"))?;
    let fixture: FixtureDocument = serde_json::from_str(&fixture_raw)
        .with_context(|| format!("failed to parse fixture at {fixture_path}"))?;

    let db_pool = DbPool::new(&settings.database).await?;
    info!("database connection established");
    let store: Arc<dyn TreeStore> = Arc::new(PostgresTreeStore::new(&db_pool));

    let voyage_keys = collect_voyage_keys()?;
    let providers: Vec<Arc<dyn EmbeddingProvider>> = voyage_keys
        .into_iter()
        .map(|key| {
            let provider: Arc<dyn EmbeddingProvider> = Arc::new(HttpEmbeddingProvider::new(
                "https://api.voyageai.com".to_string(),
                key,
                settings.embedding.model.clone(),
                settings.embedding.dimension,
            ));
            provider
        })
        .collect();
    let metrics = Metrics::new();
    let meter = Arc::new(TiktokenMeter);
    let embedder = Arc::new(EmbeddingClient::new(
        providers,
        &settings.embedding,
        meter,
        metrics.clone(),
    ));

    let openai_key = std::env::var("OPENAI_API_KEY").ok();
    let gemini_key = std::env::var("GEMINI_API_KEY").ok();
    let llm = make_llm(&settings.summarizer.model, openai_key, gemini_key)?;
    let summarizer = Arc::new(Summarizer::new(Arc::from(llm)));

    let clusterer = GmmRaptorClusterer::new(&settings.clustering);

    let builder = RaptorBuilder::new(
        embedder,
        clusterer,
        summarizer,
        store,
        &settings.embedding,
        &settings.summarizer,
        &settings.builder,
        settings.clustering.min_k,
        settings.clustering.max_k,
        metrics.clone(),
    );

    let tree_id = builder
        .build_from_memory_pairs(
            &fixture.doc_id,
            &fixture.dataset_id,
            fixture.chunks,
            fixture.vectors,
            fixture.params,
        )
        .await?;

    info!(%tree_id, "build finished");
    println!("tree_id={tree_id}");
    metrics.print_summary();

    Ok(())
}

/// Collects Voyage AI API keys the way the original client does: a required base key
/// from `VOYAGEAI_KEY`, plus any `VOYAGEAI_KEY_<N>` variables sorted by `N` ascending.
fn collect_voyage_keys() -> Result<Vec<String>> {
    let base = std::env::var("VOYAGEAI_KEY").context("VOYAGEAI_KEY must be set")?;

    let mut numbered: BTreeMap<u32, String> = BTreeMap::new();
    for (name, value) in std::env::vars() {
        if let Some(suffix) = name.strip_prefix("VOYAGEAI_KEY_") {
            if let Ok(n) = suffix.parse::<u32>() {
                numbered.insert(n, value);
            }
        }
    }

    let mut keys = vec![base];
    keys.extend(numbered.into_values());
    Ok(keys)
}
