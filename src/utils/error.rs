use std::collections::BTreeMap;

use thiserror::Error;

/// Structured context attached to a `RaptorError` (doc_id, dataset_id, level, ...).
///
/// Kept as a flat string map rather than a dedicated struct so adapters can attach
/// whatever context they have on hand without growing this type for every field.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext(BTreeMap<String, String>);

impl ErrorContext {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.0.insert(key.into(), value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|s| s.as_str())
    }
}

impl std::fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(k, v)| format!("{k}={v}")).collect();
        write!(f, "{}", parts.join(" "))
    }
}

#[derive(Error, Debug)]
pub enum RaptorError {
    #[error("validation error: {message} [{context}]")]
    Validation {
        message: String,
        context: ErrorContext,
    },

    #[error("embedding generation failed: {message} [{context}]")]
    Embedding {
        message: String,
        context: ErrorContext,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("summarization failed: {message} [{context}]")]
    Summarization {
        message: String,
        context: ErrorContext,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("summarizer returned empty output [{context}]")]
    EmptyOutput { context: ErrorContext },

    #[error("persistence error: {message} [{context}]")]
    Persistence {
        message: String,
        context: ErrorContext,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl RaptorError {
    /// Short machine-readable code, suitable for surfacing to callers alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            RaptorError::Validation { .. } => "VALIDATION_FAILED",
            RaptorError::Embedding { .. } => "EMBEDDING_GENERATION_FAILED",
            RaptorError::Summarization { .. } => "SUMMARIZATION_FAILED",
            RaptorError::EmptyOutput { .. } => "SUMMARIZATION_EMPTY_OUTPUT",
            RaptorError::Persistence { .. } => "PERSISTENCE_FAILED",
            RaptorError::Database(_) => "PERSISTENCE_FAILED",
            RaptorError::Http(_) => "PROVIDER_HTTP_FAILED",
            RaptorError::Config(_) => "CONFIG_INVALID",
        }
    }

    /// Structured context, when the variant carries one.
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            RaptorError::Validation { context, .. }
            | RaptorError::Embedding { context, .. }
            | RaptorError::Summarization { context, .. }
            | RaptorError::EmptyOutput { context }
            | RaptorError::Persistence { context, .. } => Some(context),
            RaptorError::Database(_) | RaptorError::Http(_) | RaptorError::Config(_) => None,
        }
    }

    pub fn validation(message: impl Into<String>, context: ErrorContext) -> Self {
        RaptorError::Validation {
            message: message.into(),
            context,
        }
    }

    pub fn embedding(
        message: impl Into<String>,
        context: ErrorContext,
        source: Option<anyhow::Error>,
    ) -> Self {
        RaptorError::Embedding {
            message: message.into(),
            context,
            source,
        }
    }

    pub fn summarization(
        message: impl Into<String>,
        context: ErrorContext,
        source: Option<anyhow::Error>,
    ) -> Self {
        RaptorError::Summarization {
            message: message.into(),
            context,
            source,
        }
    }

    pub fn persistence(
        message: impl Into<String>,
        context: ErrorContext,
        source: Option<anyhow::Error>,
    ) -> Self {
        RaptorError::Persistence {
            message: message.into(),
            context,
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, RaptorError>;
