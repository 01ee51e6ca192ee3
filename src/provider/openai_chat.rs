//! OpenAI Chat Completions and the compatible backends (OpenRouter, Cerebras, Qwen,
//! self-hosted servers).

mod error;
mod provider;
mod request;
mod response;
mod stream;
mod types;

pub use provider::{LineParserFactory, OpenAiChatProvider};
pub use stream::OpenAiLineParser;
