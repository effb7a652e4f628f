use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::utils::error::{ErrorContext, RaptorError};

/// Capability a summarizer depends on: one text-completion call. Polymorphic over providers
/// (§4.4, §9) so the orchestrator never depends on a concrete LLM client.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatLLM: Send + Sync {
    async fn summarize(&self, prompt: String, max_tokens: u32, temperature: f32) -> Result<String, RaptorError>;
}

#[derive(Debug, Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    input: &'a str,
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    output_text: String,
}

pub struct OpenAiChatLLM {
    client: Client,
    model: String,
    api_key: String,
}

impl OpenAiChatLLM {
    pub fn new(model: String, api_key: String) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .unwrap_or_else(|_| Client::new()),
            model,
            api_key,
        }
    }
}

#[async_trait]
impl ChatLLM for OpenAiChatLLM {
    async fn summarize(&self, prompt: String, max_tokens: u32, temperature: f32) -> Result<String, RaptorError> {
        let body = OpenAiRequest {
            model: &self.model,
            input: &prompt,
            temperature,
            max_output_tokens: max_tokens,
        };

        let response = self
            .client
            .post("https://api.openai.com/v1/responses")
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let ctx = ErrorContext::new()
                .with("status", status.as_u16())
                .with("transient", status.as_u16() == 429 || status.is_server_error());
            return Err(RaptorError::summarization(
                format!("openai summarize request failed: {text}"),
                ctx,
                None,
            ));
        }

        let parsed: OpenAiResponse = response.json().await?;
        Ok(parsed.output_text)
    }
}

#[derive(Debug, Serialize)]
struct GeminiGenerationConfig {
    temperature: f32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
    #[serde(rename = "responseMimeType")]
    response_mime_type: &'static str,
}

#[derive(Debug, Serialize)]
struct GeminiPart<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct GeminiContent<'a> {
    parts: Vec<GeminiPart<'a>>,
}

#[derive(Debug, Serialize)]
struct GeminiRequest<'a> {
    contents: Vec<GeminiContent<'a>>,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: GeminiResponseContent,
}

#[derive(Debug, Deserialize)]
struct GeminiResponseContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponsePart {
    #[serde(default)]
    text: String,
}

pub struct GeminiChatLLM {
    client: Client,
    model: String,
    api_key: String,
}

impl GeminiChatLLM {
    pub fn new(model: String, api_key: String) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .unwrap_or_else(|_| Client::new()),
            model,
            api_key,
        }
    }
}

#[async_trait]
impl ChatLLM for GeminiChatLLM {
    async fn summarize(&self, prompt: String, max_tokens: u32, temperature: f32) -> Result<String, RaptorError> {
        let body = GeminiRequest {
            contents: vec![GeminiContent {
                parts: vec![GeminiPart { text: &prompt }],
            }],
            generation_config: GeminiGenerationConfig {
                temperature,
                max_output_tokens: max_tokens,
                response_mime_type: "text/plain",
            },
        };

        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.model, self.api_key
        );
        let response = self.client.post(&url).json(&body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let ctx = ErrorContext::new()
                .with("status", status.as_u16())
                .with("transient", status.as_u16() == 429 || status.is_server_error());
            return Err(RaptorError::summarization(
                format!("gemini generateContent request failed: {text}"),
                ctx,
                None,
            ));
        }

        let parsed: GeminiResponse = response.json().await?;
        let text = parsed
            .candidates
            .into_iter()
            .next()
            .map(|c| {
                c.content
                    .parts
                    .into_iter()
                    .map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();

        Ok(text)
    }
}

/// Dispatches on the model id prefix, mirroring the provider's own `make_llm` convention:
/// `gpt-`/`o` prefixes route to OpenAI, `gemini` routes to Gemini.
pub fn make_llm(model_id: &str, openai_api_key: Option<String>, gemini_api_key: Option<String>) -> Result<Box<dyn ChatLLM>, RaptorError> {
    let mid = model_id.to_lowercase();
    if mid.starts_with("gpt-") || mid.starts_with('o') {
        let key = openai_api_key.ok_or_else(|| {
            RaptorError::validation("OPENAI_API_KEY is required for this model", ErrorContext::new())
        })?;
        return Ok(Box::new(OpenAiChatLLM::new(model_id.to_string(), key)));
    }
    if mid.starts_with("gemini") {
        let key = gemini_api_key.ok_or_else(|| {
            RaptorError::validation("GEMINI_API_KEY is required for this model", ErrorContext::new())
        })?;
        return Ok(Box::new(GeminiChatLLM::new(model_id.to_string(), key)));
    }
    Err(RaptorError::validation(
        format!("unsupported model id: {model_id}"),
        ErrorContext::new(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn make_llm_rejects_unknown_prefix() {
        let result = make_llm("mistral-large", None, None);
        assert!(result.is_err());
    }

    #[test]
    fn make_llm_requires_api_key_for_known_prefix() {
        let result = make_llm("gpt-4.1", None, None);
        assert!(result.is_err());
    }
}
