pub mod builder;
pub mod cluster;
pub mod config;
pub mod embedding;
pub mod rate_limit;
pub mod store;
pub mod summarize;
pub mod utils;

pub use builder::RaptorBuilder;
pub use config::Settings;
pub use utils::error::{RaptorError, Result};
