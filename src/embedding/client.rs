use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::warn;

use crate::config::EmbeddingConfig;
use crate::rate_limit::RateLimiter;
use crate::utils::error::{ErrorContext, RaptorError};
use crate::utils::metrics::Metrics;

use super::provider::{is_transient_error, EmbeddingProvider, InputType};
use super::token_meter::TokenMeter;

const MAX_BACKOFF: Duration = Duration::from_secs(8);
const BATCH_ITEM_CAP: usize = 1000;

struct Slot {
    provider: Arc<dyn EmbeddingProvider>,
    limiter: RateLimiter,
    concurrency: Semaphore,
}

/// Dispatches embedding work across one or more API-key slots, each with its own
/// RateLimiter and concurrency cap, in round-robin order (§4.2).
pub struct EmbeddingClient {
    slots: Vec<Slot>,
    meter: Arc<dyn TokenMeter>,
    per_request_token_budget: usize,
    max_retries: u32,
    next_slot: AtomicUsize,
    metrics: Metrics,
}

impl EmbeddingClient {
    pub fn new(
        providers: Vec<Arc<dyn EmbeddingProvider>>,
        config: &EmbeddingConfig,
        meter: Arc<dyn TokenMeter>,
        metrics: Metrics,
    ) -> Self {
        let slots = providers
            .into_iter()
            .map(|provider| Slot {
                provider,
                limiter: RateLimiter::new(config.rpm_limit, config.tpm_limit),
                concurrency: Semaphore::new(config.per_slot_max_concurrent),
            })
            .collect();

        Self {
            slots,
            meter,
            per_request_token_budget: config.per_request_token_budget,
            max_retries: config.max_retries,
            next_slot: AtomicUsize::new(0),
            metrics,
        }
    }

    fn slot_count(&self) -> usize {
        self.slots.len()
    }

    fn next_slot_index(&self) -> usize {
        self.next_slot.fetch_add(1, Ordering::Relaxed) % self.slot_count().max(1)
    }

    /// Greedily packs chunks into groups bounded by the per-request token budget.
    /// Oversized single chunks become their own group rather than being split.
    pub fn pack_groups_by_tpm(&self, chunks: &[String]) -> Vec<Vec<String>> {
        let lens = self.meter.token_lengths(chunks);
        let mut groups: Vec<Vec<String>> = Vec::new();
        let mut current: Vec<String> = Vec::new();
        let mut used = 0usize;

        for (chunk, &n) in chunks.iter().zip(lens.iter()) {
            if n > self.per_request_token_budget {
                if !current.is_empty() {
                    groups.push(std::mem::take(&mut current));
                    used = 0;
                }
                groups.push(vec![chunk.clone()]);
                continue;
            }
            if used + n > self.per_request_token_budget && !current.is_empty() {
                groups.push(std::mem::take(&mut current));
                used = 0;
            }
            current.push(chunk.clone());
            used += n;
        }
        if !current.is_empty() {
            groups.push(current);
        }
        groups
    }

    async fn call_with_retry(
        &self,
        slot_idx: usize,
        inputs: Vec<Vec<String>>,
        input_type: InputType,
    ) -> Result<Vec<Vec<Vec<f32>>>, RaptorError> {
        let slot = &self.slots[slot_idx];
        let tokens: usize = inputs.iter().flatten().map(|t| self.meter.count(t)).sum();

        let _permit = slot
            .concurrency
            .acquire()
            .await
            .expect("slot semaphore is never closed");
        slot.limiter.acquire(tokens as u32).await;

        let mut attempt = 0u32;
        loop {
            self.metrics.add_embed_calls(1);
            match slot.provider.contextualized_embed(inputs.clone(), input_type).await {
                Ok(result) => return Ok(result),
                Err(err) if attempt < self.max_retries && is_transient_error(&err) => {
                    attempt += 1;
                    self.metrics.add_provider_retries(1);
                    let backoff = Duration::from_millis(250u64 * 2u64.pow(attempt)).min(MAX_BACKOFF);
                    warn!(attempt, ?backoff, slot = slot_idx, "embedding call failed, retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Embeds a document's chunks, dispatching packed groups across slots in parallel when
    /// more than one slot and more than one group are available; otherwise a single call.
    pub async fn embed_doc_fulltext(
        &self,
        chunks: Vec<String>,
    ) -> Result<(Vec<Vec<f32>>, Vec<String>), RaptorError> {
        if chunks.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }
        let groups = self.pack_groups_by_tpm(&chunks);

        if self.slot_count() <= 1 || groups.len() == 1 {
            let result = self.call_with_retry(0, groups.clone(), InputType::Document).await?;
            let embeddings = result.into_iter().flatten().collect();
            let flat_chunks = groups.into_iter().flatten().collect();
            return Ok((embeddings, flat_chunks));
        }

        // Groups are dispatched concurrently via borrowed futures (no 'static task spawn
        // needed, since every call only needs &self) and re-sorted by index before
        // concatenation so output order always matches input order regardless of which
        // slot finishes first.
        let futures = groups.iter().enumerate().map(|(idx, group)| {
            let slot_idx = self.next_slot_index();
            let inputs = vec![group.clone()];
            async move {
                let embedded = self.call_with_retry(slot_idx, inputs, InputType::Document).await?;
                Ok::<_, RaptorError>((idx, embedded.into_iter().next().unwrap_or_default()))
            }
        });
        let results = futures::future::try_join_all(futures).await?;

        let mut ordered: Vec<Option<Vec<Vec<f32>>>> = vec![None; groups.len()];
        for (idx, vectors) in results {
            ordered[idx] = Some(vectors);
        }

        let mut all_embeddings = Vec::new();
        let mut all_chunks = Vec::new();
        for (vectors, group) in ordered.into_iter().zip(groups.into_iter()) {
            all_embeddings.extend(vectors.expect("every group index was dispatched"));
            all_chunks.extend(group);
        }
        Ok((all_embeddings, all_chunks))
    }

    /// Embeds queries on slot 0, each query isolated in its own single-element group so
    /// queries do not share contextual information with one another.
    pub async fn embed_queries(&self, queries: Vec<String>) -> Result<Vec<Vec<f32>>, RaptorError> {
        if queries.is_empty() {
            return Ok(Vec::new());
        }
        let inputs: Vec<Vec<String>> = queries.into_iter().map(|q| vec![q]).collect();
        let result = self.call_with_retry(0, inputs, InputType::Query).await?;
        Ok(result.into_iter().flatten().collect())
    }

    /// Embeds a flat list of summary texts on slot 0, greedily batched by both the token
    /// budget and a 1000-item cap, one call per batch, vectors returned in input order.
    pub async fn embed_docs(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, RaptorError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let lens = self.meter.token_lengths(&texts);
        let mut batches: Vec<Vec<String>> = Vec::new();
        let mut current: Vec<String> = Vec::new();
        let mut used = 0usize;

        for (text, &n) in texts.iter().zip(lens.iter()) {
            let would_overflow_tokens = used + n > self.per_request_token_budget;
            let would_overflow_count = current.len() >= BATCH_ITEM_CAP;
            if !current.is_empty() && (would_overflow_tokens || would_overflow_count) {
                batches.push(std::mem::take(&mut current));
                used = 0;
            }
            current.push(text.clone());
            used += n;
        }
        if !current.is_empty() {
            batches.push(current);
        }

        let mut out = Vec::with_capacity(texts.len());
        for batch in batches {
            let inputs: Vec<Vec<String>> = batch.into_iter().map(|t| vec![t]).collect();
            let result = self.call_with_retry(0, inputs, InputType::Document).await?;
            out.extend(result.into_iter().flatten());
        }
        Ok(out)
    }
}

pub fn empty_slots_error() -> RaptorError {
    RaptorError::validation(
        "EmbeddingClient requires at least one provider slot",
        ErrorContext::new(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::provider::MockEmbeddingProvider;
    use crate::embedding::token_meter::TiktokenMeter;

    fn test_config() -> EmbeddingConfig {
        EmbeddingConfig {
            model: "test-model".to_string(),
            dimension: 4,
            dtype: "float".to_string(),
            rpm_limit: 1_000,
            tpm_limit: 1_000_000,
            per_request_token_budget: 10,
            per_slot_max_concurrent: 2,
            max_retries: 3,
        }
    }

    #[test]
    fn pack_groups_by_tpm_flushes_on_budget() {
        let mut mock = MockEmbeddingProvider::new();
        mock.expect_contextualized_embed().never();
        let client = EmbeddingClient::new(
            vec![Arc::new(mock)],
            &test_config(),
            Arc::new(TiktokenMeter),
            Metrics::new(),
        );

        let chunks: Vec<String> = vec![
            "one two three four five".to_string(),
            "six seven eight".to_string(),
            "nine".to_string(),
        ];
        let groups = client.pack_groups_by_tpm(&chunks);
        assert!(!groups.is_empty());
        let flat: Vec<String> = groups.into_iter().flatten().collect();
        assert_eq!(flat, chunks);
    }

    #[test]
    fn pack_groups_by_tpm_isolates_oversized_chunk() {
        let mut mock = MockEmbeddingProvider::new();
        mock.expect_contextualized_embed().never();
        let mut config = test_config();
        config.per_request_token_budget = 2;
        let client = EmbeddingClient::new(
            vec![Arc::new(mock)],
            &config,
            Arc::new(TiktokenMeter),
            Metrics::new(),
        );

        let chunks = vec![
            "a".to_string(),
            "this sentence has many more than two tokens in it".to_string(),
            "b".to_string(),
        ];
        let groups = client.pack_groups_by_tpm(&chunks);
        assert!(groups
            .iter()
            .any(|g| g.len() == 1 && g[0].contains("many more")));
    }

    #[tokio::test]
    async fn embed_queries_wraps_each_query_in_its_own_group() {
        let mut mock = MockEmbeddingProvider::new();
        mock.expect_contextualized_embed()
            .withf(|inputs, input_type| {
                inputs.len() == 2
                    && inputs.iter().all(|g| g.len() == 1)
                    && *input_type == InputType::Query
            })
            .returning(|inputs, _| Ok(inputs.into_iter().map(|g| vec![vec![0.0; 4]; g.len()]).collect()));

        let client = EmbeddingClient::new(
            vec![Arc::new(mock)],
            &test_config(),
            Arc::new(TiktokenMeter),
            Metrics::new(),
        );

        let result = client
            .embed_queries(vec!["alpha".to_string(), "beta".to_string()])
            .await
            .unwrap();
        assert_eq!(result.len(), 2);
    }

    #[tokio::test]
    async fn embed_doc_fulltext_reassembles_multi_slot_order() {
        let mut slot0 = MockEmbeddingProvider::new();
        slot0
            .expect_contextualized_embed()
            .returning(|inputs, _| Ok(inputs.into_iter().map(|g| vec![vec![1.0]; g.len()]).collect()));
        let mut slot1 = MockEmbeddingProvider::new();
        slot1
            .expect_contextualized_embed()
            .returning(|inputs, _| Ok(inputs.into_iter().map(|g| vec![vec![2.0]; g.len()]).collect()));

        let mut config = test_config();
        config.per_request_token_budget = 1;
        let client = EmbeddingClient::new(
            vec![Arc::new(slot0), Arc::new(slot1)],
            &config,
            Arc::new(TiktokenMeter),
            Metrics::new(),
        );

        let chunks = vec!["one".to_string(), "two".to_string(), "three".to_string()];
        let (embeddings, flat_chunks) = client.embed_doc_fulltext(chunks.clone()).await.unwrap();
        assert_eq!(embeddings.len(), chunks.len());
        assert_eq!(flat_chunks, chunks);
    }
}
