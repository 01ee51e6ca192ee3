//! Google Gemini `generateContent`, over the public API or CloudCode.

mod error;
mod provider;
mod request;
mod response;
mod stream;
mod types;

pub use provider::GoogleGeminiProvider;
pub use stream::GeminiLineParser;
