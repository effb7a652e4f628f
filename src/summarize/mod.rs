pub mod llm;
pub mod summarizer;

pub use llm::{make_llm, ChatLLM, GeminiChatLLM, OpenAiChatLLM};
pub use summarizer::Summarizer;
