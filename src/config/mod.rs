pub mod settings;

pub use settings::{
    BuilderConfig, ClusteringConfig, DatabaseConfig, EmbeddingConfig, Settings, SummarizerConfig,
};
