//! Client-side access to several LLM backends behind one request/response model.
//!
//! Each [`Provider`] owns its credentials (an API key pool, OAuth credentials, or
//! both), a rate-limit tracker fed from response headers, and an HTTP transport.
//! OpenAI, OpenRouter, Cerebras, Qwen and other Chat Completions servers share one
//! translator; Anthropic Messages and Google Gemini have their own.
//!
//! ```no_run
//! use llm_relay::config::{ProviderConfig, ProviderType, build_client_from_configs};
//! use llm_relay::http::reqwest::default_dyn_transport;
//! use llm_relay::types::ChatRequest;
//!
//! # async fn run() -> Result<(), llm_relay::LLMError> {
//! let configs = [ProviderConfig::new(ProviderType::OpenAi, "openai").with_api_key("sk-...")];
//! let client = build_client_from_configs(&configs, default_dyn_transport()?)?;
//! let response = client
//!     .chat("openai", ChatRequest::from_prompt("Hi").with_model("gpt-4o"))
//!     .await?;
//! println!("{}", response.content());
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod provider;
pub mod ratelimit;
pub mod stream;
pub mod types;

pub use client::{LLMClient, LLMClientBuilder};
pub use config::{AuthConfig, AuthMethod, ProviderConfig, ProviderType};
pub use error::{ApiError, ErrorKind, LLMError};
pub use provider::{DynProvider, ModelCatalog, Provider, ProviderMetrics};
pub use stream::{ChunkStream, LineParser};
pub use types::*;
