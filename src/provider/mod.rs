use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthStatus;
use crate::config::{AuthConfig, ProviderConfig, ProviderType};
use crate::error::LLMError;
use crate::ratelimit::RateLimitTracker;
use crate::stream::ChunkStream;
use crate::types::{ChatRequest, ChatResponse, ModelInfo, ToolFormat};

pub mod anthropic_messages;
pub(crate) mod dispatch;
pub mod google_gemini;
pub mod openai_chat;
pub(crate) mod retry;

/// The operations every backend exposes.
///
/// Implementations own their credentials, rate-limit state and transport; nothing is
/// shared between two provider instances.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Handle the provider was configured under. Fixed for the provider's lifetime.
    fn name(&self) -> &str;

    fn provider_type(&self) -> ProviderType;

    fn description(&self) -> String;

    /// Models offered by the backend, from the attached catalog when there is one.
    async fn models(&self) -> Result<Vec<ModelInfo>, LLMError>;

    fn default_model(&self) -> String;

    /// Sends a request and waits for the complete response.
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LLMError>;

    /// Opens a streaming response.
    ///
    /// Failures before the stream is open are returned directly; later failures arrive
    /// through the stream.
    async fn stream_chat(&self, request: ChatRequest) -> Result<ChunkStream, LLMError>;

    /// Runs a tool hosted by the backend. Unsupported unless a provider overrides it.
    async fn invoke_server_tool(
        &self,
        _cancel: &CancellationToken,
        _name: &str,
        _params: Value,
    ) -> Result<Value, LLMError> {
        Err(LLMError::UnsupportedFeature {
            feature: "server tools",
        })
    }

    /// Replaces the credentials for the method named in `config`.
    async fn authenticate(&self, config: AuthConfig) -> Result<(), LLMError>;

    async fn is_authenticated(&self) -> bool;

    /// Drops every credential.
    async fn logout(&self);

    /// Applies `config` on top of the current one. Omitted fields keep their values.
    async fn configure(&self, config: ProviderConfig) -> Result<(), LLMError>;

    fn supports_streaming(&self) -> bool;

    fn supports_tool_calling(&self) -> bool;

    fn supports_responses_api(&self) -> bool;

    fn tool_format(&self) -> ToolFormat;

    async fn refresh_all_oauth_tokens(&self, cancel: &CancellationToken) -> Result<(), LLMError>;

    fn metrics(&self) -> ProviderMetrics;

    async fn auth_status(&self) -> AuthStatus;

    fn rate_limits(&self) -> &RateLimitTracker;
}

/// Thread-safe provider handle.
pub type DynProvider = Arc<dyn Provider>;

/// Source of model listings, e.g. a cache filled at start-up.
#[async_trait]
pub trait ModelCatalog: Send + Sync {
    async fn models(&self, provider: ProviderType) -> Result<Vec<ModelInfo>, LLMError>;
}

/// Counters kept by each provider since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProviderMetrics {
    pub requests: u64,
    pub successes: u64,
    pub errors: u64,
    pub tokens_used: u64,
    pub last_latency_ms: u64,
}
