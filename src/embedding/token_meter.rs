use once_cell::sync::Lazy;
use tiktoken_rs::CoreBPE;

/// Local stand-in for the provider's own tokenizer.
///
/// The adapter this was grounded on (`embedder_adapter.py`) counts tokens by round-tripping
/// through the embedding API itself (`vo.count_tokens`). That is a real network call per batch
/// decision, which would make packing latency-bound on the same service it's trying to shield
/// with rate limiting. `cl100k_base` is not bit-identical to the provider's tokenizer, so lengths
/// are an approximation; packing stays correct because groups are flushed *before* the budget is
/// exceeded, never after, so an undercount only ever produces smaller-than-necessary groups.
static BPE: Lazy<CoreBPE> =
    Lazy::new(|| tiktoken_rs::cl100k_base().expect("cl100k_base vocab is bundled"));

pub trait TokenMeter: Send + Sync {
    fn count(&self, text: &str) -> usize;

    fn token_lengths(&self, texts: &[String]) -> Vec<usize> {
        texts.iter().map(|t| self.count(t)).collect()
    }

    fn count_total(&self, texts: &[String]) -> usize {
        self.token_lengths(texts).iter().sum()
    }
}

#[derive(Clone, Copy, Default)]
pub struct TiktokenMeter;

impl TokenMeter for TiktokenMeter {
    fn count(&self, text: &str) -> usize {
        BPE.encode_ordinary(text).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_is_nonzero_for_nonempty_text() {
        let meter = TiktokenMeter;
        assert!(meter.count("hello world") > 0);
        assert_eq!(meter.count(""), 0);
    }

    #[test]
    fn count_total_sums_lengths() {
        let meter = TiktokenMeter;
        let texts = vec!["one".to_string(), "two three".to_string()];
        let lens = meter.token_lengths(&texts);
        assert_eq!(lens.len(), 2);
        assert_eq!(meter.count_total(&texts), lens.iter().sum::<usize>());
    }
}
