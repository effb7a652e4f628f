use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::utils::error::{ErrorContext, RaptorError};

use super::llm::ChatLLM;

const MAX_DOCS_IN_PROMPT: usize = 64;
const MAX_ATTEMPTS: u32 = 6;
const BACKOFF_MIN_SECS: f64 = 1.0;
const BACKOFF_MAX_SECS: f64 = 20.0;

pub struct Summarizer {
    llm: Arc<dyn ChatLLM>,
}

impl Summarizer {
    pub fn new(llm: Arc<dyn ChatLLM>) -> Self {
        Self { llm }
    }

    /// Summarizes a cluster's member texts into the fixed section template (§4.4), retrying
    /// transient provider failures with jittered exponential backoff. Fails with `EmptyOutput`
    /// if the provider returns nothing but blank text after every attempt.
    pub async fn summarize_cluster(&self, texts: &[String], max_tokens: u32) -> Result<String, RaptorError> {
        let prompt = build_prompt(texts);

        let mut attempt = 0u32;
        loop {
            match self.llm.summarize(prompt.clone(), max_tokens, 0.2).await {
                Ok(text) => {
                    let cleaned = strip_summary_prefix(&text);
                    if cleaned.trim().is_empty() {
                        return Err(RaptorError::EmptyOutput {
                            context: ErrorContext::new().with("attempt", attempt + 1),
                        });
                    }
                    return Ok(cleaned);
                }
                Err(err) if attempt + 1 < MAX_ATTEMPTS && is_transient(&err) => {
                    attempt += 1;
                    let backoff = jittered_backoff(attempt);
                    warn!(attempt, ?backoff, "summarize call failed, retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn is_transient(err: &RaptorError) -> bool {
    match err {
        RaptorError::Http(e) => e.is_timeout() || e.is_connect(),
        RaptorError::Summarization { context, .. } => context
            .get("transient")
            .map(|v| v == "true")
            .unwrap_or(false),
        _ => false,
    }
}

fn jittered_backoff(attempt: u32) -> Duration {
    let exp = BACKOFF_MIN_SECS * 2f64.powi(attempt as i32 - 1);
    let cap = exp.min(BACKOFF_MAX_SECS).max(BACKOFF_MIN_SECS);
    let secs = rand::thread_rng().gen_range(BACKOFF_MIN_SECS..=cap);
    Duration::from_secs_f64(secs)
}

fn strip_summary_prefix(text: &str) -> String {
    let trimmed = text.trim_start();
    let lower = trimmed.to_lowercase();
    if let Some(rest) = lower.strip_prefix("summary:") {
        let offset = trimmed.len() - rest.len();
        trimmed[offset..].trim_start().to_string()
    } else {
        trimmed.to_string()
    }
}

fn build_prompt(texts: &[String]) -> String {
    let enumerated: String = texts
        .iter()
        .take(MAX_DOCS_IN_PROMPT)
        .enumerate()
        .map(|(i, t)| format!("[#{}] {}", i + 1, t))
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "Summarize the docs below. Output EXACTLY these sections:\n\
         Summary: 3-4 sentences.\n\
         Key facts: 3-6 bullets.\n\
         Entities: comma list.\n\
         Topics: 3-6 tags.\n\
         Evidence: [#i,...]\n\
         Uncertainties: bullets or \"None\".\n\
         Rules: Use only <docs>; keep entities/numbers/dates; note contradictions; if unsure say \"unknown\".\n\
         <docs>\n{enumerated}\n</docs>\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::summarize::llm::MockChatLLM;

    #[test]
    fn build_prompt_truncates_to_64_and_enumerates() {
        let texts: Vec<String> = (0..100).map(|i| format!("doc {i}")).collect();
        let prompt = build_prompt(&texts);
        assert!(prompt.contains("[#1] doc 0"));
        assert!(prompt.contains("[#64] doc 63"));
        assert!(!prompt.contains("[#65]"));
    }

    #[test]
    fn strip_summary_prefix_removes_leading_token_case_insensitively() {
        assert_eq!(strip_summary_prefix("Summary: the cat sat."), "the cat sat.");
        assert_eq!(strip_summary_prefix("SUMMARY:   spaced"), "spaced");
        assert_eq!(strip_summary_prefix("no prefix here"), "no prefix here");
    }

    #[tokio::test]
    async fn summarize_cluster_fails_with_empty_output_after_blank_response() {
        let mut mock = MockChatLLM::new();
        mock.expect_summarize().returning(|_, _, _| Ok("   ".to_string()));
        let summarizer = Summarizer::new(Arc::new(mock));

        let result = summarizer
            .summarize_cluster(&["some text".to_string()], 256)
            .await;
        assert!(matches!(result, Err(RaptorError::EmptyOutput { .. })));
    }

    #[tokio::test]
    async fn summarize_cluster_returns_cleaned_text_on_success() {
        let mut mock = MockChatLLM::new();
        mock.expect_summarize()
            .returning(|_, _, _| Ok("Summary: it worked.".to_string()));
        let summarizer = Summarizer::new(Arc::new(mock));

        let result = summarizer
            .summarize_cluster(&["some text".to_string()], 256)
            .await
            .unwrap();
        assert_eq!(result, "it worked.");
    }
}
