use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    pub database: DatabaseConfig,
    pub embedding: EmbeddingConfig,
    pub summarizer: SummarizerConfig,
    pub clustering: ClusteringConfig,
    pub builder: BuilderConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_max_size: u32,
    pub pool_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmbeddingConfig {
    /// Model name passed through to the contextualized-embed provider.
    pub model: String,
    pub dimension: usize,
    #[serde(default = "default_dtype")]
    pub dtype: String,
    #[serde(default = "default_rpm_limit")]
    pub rpm_limit: u32,
    #[serde(default = "default_tpm_limit")]
    pub tpm_limit: u32,
    #[serde(default = "default_token_budget")]
    pub per_request_token_budget: usize,
    #[serde(default = "default_slot_concurrency")]
    pub per_slot_max_concurrent: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SummarizerConfig {
    /// Model id; the prefix picks a ChatLLM implementation (see `summarize::llm::make_llm`).
    pub model: String,
    #[serde(default = "default_llm_concurrency")]
    pub llm_concurrency: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ClusteringConfig {
    #[serde(default = "default_min_k")]
    pub min_k: usize,
    #[serde(default = "default_max_k")]
    pub max_k: usize,
    #[serde(default = "default_reduction_dim")]
    pub reduction_dim: usize,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_metric")]
    pub metric: String,
    #[serde(default = "default_random_state")]
    pub random_state: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BuilderConfig {
    /// Pacer RPM, independent of any per-slot `RateLimiter`: smooths the aggregate
    /// batch-embedding cadence across a whole tree build.
    #[serde(default = "default_rpm_limit")]
    pub rpm_limit: u32,
}

fn default_dtype() -> String {
    "float".to_string()
}
fn default_rpm_limit() -> u32 {
    3
}
fn default_tpm_limit() -> u32 {
    10_000
}
fn default_token_budget() -> usize {
    9_500
}
fn default_slot_concurrency() -> usize {
    2
}
fn default_max_retries() -> u32 {
    3
}
fn default_llm_concurrency() -> usize {
    3
}
fn default_max_tokens() -> u32 {
    4_048
}
fn default_min_k() -> usize {
    2
}
fn default_max_k() -> usize {
    50
}
fn default_reduction_dim() -> usize {
    10
}
fn default_threshold() -> f64 {
    0.1
}
fn default_metric() -> String {
    "cosine".to_string()
}
fn default_random_state() -> u64 {
    224
}
impl Settings {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .add_source(File::with_name("config/settings").required(false))
            // Override with environment variables (prefix: APP)
            // Example: APP_DATABASE__URL=postgres://...
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        settings.validate()?;

        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.clustering.min_k == 0 {
            anyhow::bail!("clustering.min_k must be >= 1");
        }
        if self.clustering.min_k > self.clustering.max_k {
            anyhow::bail!(
                "clustering.min_k ({}) must be <= clustering.max_k ({})",
                self.clustering.min_k,
                self.clustering.max_k
            );
        }
        if !(0.0..1.0).contains(&self.clustering.threshold) {
            anyhow::bail!(
                "clustering.threshold must be in [0, 1), got {}",
                self.clustering.threshold
            );
        }
        if self.embedding.rpm_limit == 0 {
            anyhow::bail!("embedding.rpm_limit must be >= 1");
        }
        if self.embedding.dimension == 0 {
            anyhow::bail!("embedding.dimension must be >= 1");
        }

        Ok(())
    }
}
