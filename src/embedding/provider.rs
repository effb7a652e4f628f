use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::utils::error::{ErrorContext, RaptorError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputType {
    Document,
    Query,
}

impl InputType {
    fn as_str(self) -> &'static str {
        match self {
            InputType::Document => "document",
            InputType::Query => "query",
        }
    }
}

/// One call to the provider's contextualized-embed endpoint.
///
/// `inputs` is a list of groups; every group is embedded with shared context, and each group
/// yields exactly one embedding per element, which is why callers that want independent vectors
/// (queries) wrap every element in its own single-item group.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn contextualized_embed(
        &self,
        inputs: Vec<Vec<String>>,
        input_type: InputType,
    ) -> Result<Vec<Vec<Vec<f32>>>, RaptorError>;
}

#[derive(Debug, Serialize)]
struct ContextualizedEmbedRequest<'a> {
    inputs: &'a [Vec<String>],
    model: &'a str,
    input_type: &'a str,
    output_dimension: usize,
    output_dtype: &'a str,
}

#[derive(Debug, Deserialize)]
struct ContextualizedEmbedResponse {
    results: Vec<ContextualizedEmbedResult>,
}

#[derive(Debug, Deserialize)]
struct ContextualizedEmbedResult {
    embeddings: Vec<Vec<f32>>,
}

/// HTTP client for a contextualized-embed-style provider (one inputs-group per call item,
/// each yielding one embedding per element of the group).
pub struct HttpEmbeddingProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    output_dimension: usize,
    output_dtype: String,
}

impl HttpEmbeddingProvider {
    pub fn new(base_url: String, api_key: String, model: String, output_dimension: usize) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url,
            api_key,
            model,
            output_dimension,
            output_dtype: "float".to_string(),
        }
    }

    pub fn with_output_dtype(mut self, dtype: impl Into<String>) -> Self {
        self.output_dtype = dtype.into();
        self
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn contextualized_embed(
        &self,
        inputs: Vec<Vec<String>>,
        input_type: InputType,
    ) -> Result<Vec<Vec<Vec<f32>>>, RaptorError> {
        let body = ContextualizedEmbedRequest {
            inputs: &inputs,
            model: &self.model,
            input_type: input_type.as_str(),
            output_dimension: self.output_dimension,
            output_dtype: &self.output_dtype,
        };

        let url = format!("{}/v1/contextualizedembeddings", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let ctx = ErrorContext::new()
                .with("status", status.as_u16())
                .with("transient", is_transient_status(status));
            return Err(RaptorError::embedding(
                format!("contextualized-embed request failed: {text}"),
                ctx,
                None,
            ));
        }

        let parsed: ContextualizedEmbedResponse = response.json().await?;
        if parsed.results.len() != inputs.len() {
            return Err(RaptorError::embedding(
                format!(
                    "provider returned {} results for {} input groups",
                    parsed.results.len(),
                    inputs.len()
                ),
                ErrorContext::new(),
                None,
            ));
        }

        Ok(parsed.results.into_iter().map(|r| r.embeddings).collect())
    }
}

/// Classifies whether a failed call is worth retrying with backoff (rate limit, transient
/// connection hiccup, 5xx) versus a permanent failure (auth, malformed request) that should
/// propagate immediately.
pub fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

pub fn is_transient_error(err: &RaptorError) -> bool {
    match err {
        RaptorError::Http(e) => e.is_timeout() || e.is_connect(),
        RaptorError::Embedding { context, .. } => context
            .get("transient")
            .map(|v| v == "true")
            .unwrap_or(false),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_type_serializes_to_provider_strings() {
        assert_eq!(InputType::Document.as_str(), "document");
        assert_eq!(InputType::Query.as_str(), "query");
    }

    #[test]
    fn transient_status_covers_rate_limit_and_5xx() {
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_transient_status(StatusCode::BAD_GATEWAY));
        assert!(!is_transient_status(StatusCode::UNAUTHORIZED));
        assert!(!is_transient_status(StatusCode::BAD_REQUEST));
    }
}
