pub mod client;
pub mod provider;
pub mod token_meter;

pub use client::EmbeddingClient;
pub use provider::{EmbeddingProvider, HttpEmbeddingProvider, InputType};
pub use token_meter::{TiktokenMeter, TokenMeter};
