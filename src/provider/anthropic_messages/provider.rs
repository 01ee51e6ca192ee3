use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::auth::{AuthFacade, AuthStatus, Credential};
use crate::config::{AuthConfig, ProviderConfig, ProviderType};
use crate::error::LLMError;
use crate::http::{DynHttpTransport, HttpRequest, json_request};
use crate::provider::dispatch::{ProviderCore, body_text, try_parse};
use crate::provider::{ModelCatalog, Provider, ProviderMetrics};
use crate::ratelimit::RateLimitTracker;
use crate::stream::ChunkStream;
use crate::types::{ChatRequest, ChatResponse, ModelInfo, ToolFormat};

use super::error::parse_anthropic_error;
use super::request::build_anthropic_body;
use super::response::map_response;
use super::stream::AnthropicLineParser;
use super::types::AnthropicMessageResponse;

const LABEL: &str = "anthropic_messages";

/// Anthropic Messages provider. Accepts API keys (`x-api-key`) and Claude OAuth
/// credentials (bearer token plus the OAuth beta header).
pub struct AnthropicMessagesProvider {
    core: ProviderCore,
}

impl AnthropicMessagesProvider {
    /// Builds the provider from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`LLMError::InvalidConfig`] when `config` is not an Anthropic config or has
    /// an empty name.
    pub fn from_config(config: ProviderConfig, transport: DynHttpTransport) -> Result<Self, LLMError> {
        if config.provider_type != ProviderType::Anthropic {
            return Err(LLMError::InvalidConfig {
                field: "provider_type".to_string(),
                reason: format!("expected anthropic, got {}", config.provider_type),
            });
        }
        Ok(Self {
            core: ProviderCore::new(config, transport, LABEL, parse_anthropic_error)?,
        })
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn ModelCatalog>) -> Self {
        self.core.set_catalog(catalog);
        self
    }

    /// Credential stores behind this provider, e.g. to inspect key health.
    pub fn auth(&self) -> &AuthFacade {
        self.core.auth()
    }

    pub(crate) fn endpoint(&self) -> String {
        let config = self.core.config();
        let base = config.base_url().trim_end_matches('/');
        if base.ends_with("/v1") {
            format!("{base}/messages")
        } else {
            format!("{base}/v1/messages")
        }
    }

    fn build_headers(stream: bool) -> HashMap<String, String> {
        let accept = if stream { "text/event-stream" } else { "application/json" };
        HashMap::from([("Accept".to_string(), accept.to_string())])
    }

    fn build_request_body(&self, request: &ChatRequest, model: &str, stream: bool) -> Result<Value, LLMError> {
        if !request.tools.is_empty() && !self.supports_tool_calling() {
            return Err(LLMError::UnsupportedFeature {
                feature: "tool calling",
            });
        }
        build_anthropic_body(request, model, stream, self.core.config().max_tokens)
    }

    async fn send_chat(&self, request: ChatRequest) -> Result<ChatResponse, LLMError> {
        let cancel = request.token();
        let model = self.core.resolve_model(&request);
        let body = self.build_request_body(&request, &model, false)?;
        self.core.gate(&cancel, &model, request.estimated_tokens()).await?;

        let url = self.endpoint();
        let build = |_: &Credential| -> Result<HttpRequest, LLMError> {
            json_request(url.clone(), Self::build_headers(false), &body)
        };
        let response = self.core.send(&cancel, &model, build).await?;
        let text = body_text(response, LABEL)?;
        let parsed: AnthropicMessageResponse = try_parse(&text, LABEL)?;
        map_response(parsed, self.core.name(), &model)
    }

    async fn open_chat_stream(&self, request: ChatRequest) -> Result<ChunkStream, LLMError> {
        if !self.supports_streaming() {
            return Err(LLMError::UnsupportedFeature { feature: "streaming" });
        }
        let cancel = request.token();
        let model = self.core.resolve_model(&request);
        let body = self.build_request_body(&request, &model, true)?;
        self.core.gate(&cancel, &model, request.estimated_tokens()).await?;

        let url = self.endpoint();
        let build = |_: &Credential| -> Result<HttpRequest, LLMError> {
            json_request(url.clone(), Self::build_headers(true), &body)
        };
        let response = self.core.open_stream(&cancel, &model, build).await?;
        Ok(ChunkStream::sse(
            response.body,
            Box::new(AnthropicLineParser::new()),
            &cancel,
            LABEL,
        ))
    }
}

#[async_trait]
impl Provider for AnthropicMessagesProvider {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Anthropic
    }

    fn description(&self) -> String {
        format!("Anthropic Messages at {}", self.core.config().base_url())
    }

    async fn models(&self) -> Result<Vec<ModelInfo>, LLMError> {
        self.core.models().await
    }

    fn default_model(&self) -> String {
        self.core.default_model()
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LLMError> {
        self.core
            .track(self.send_chat(request), |response: &ChatResponse| {
                response.usage.map(|usage| usage.total_tokens)
            })
            .await
    }

    async fn stream_chat(&self, request: ChatRequest) -> Result<ChunkStream, LLMError> {
        self.core.track(self.open_chat_stream(request), |_| None).await
    }

    async fn authenticate(&self, config: AuthConfig) -> Result<(), LLMError> {
        self.core.authenticate(config).await
    }

    async fn is_authenticated(&self) -> bool {
        self.core.auth().is_authenticated().await
    }

    async fn logout(&self) {
        self.core.logout().await;
    }

    async fn configure(&self, config: ProviderConfig) -> Result<(), LLMError> {
        self.core.configure(config).await
    }

    fn supports_streaming(&self) -> bool {
        self.core.capability(|config| config.supports_streaming, true)
    }

    fn supports_tool_calling(&self) -> bool {
        self.core.capability(|config| config.supports_tool_calling, true)
    }

    fn supports_responses_api(&self) -> bool {
        self.core.capability(|config| config.supports_responses_api, false)
    }

    fn tool_format(&self) -> ToolFormat {
        ToolFormat::Anthropic
    }

    async fn refresh_all_oauth_tokens(&self, cancel: &CancellationToken) -> Result<(), LLMError> {
        self.core.refresh_all(cancel).await
    }

    fn metrics(&self) -> ProviderMetrics {
        self.core.metrics()
    }

    async fn auth_status(&self) -> AuthStatus {
        self.core.auth_status().await
    }

    fn rate_limits(&self) -> &RateLimitTracker {
        self.core.tracker()
    }
}

impl std::fmt::Debug for AnthropicMessagesProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicMessagesProvider")
            .field("core", &self.core)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::reqwest::default_dyn_transport;

    #[test]
    fn endpoint_appends_version_once() {
        let config = ProviderConfig::new(ProviderType::Anthropic, "a").with_api_key("k");
        let provider = AnthropicMessagesProvider::from_config(config.clone(), default_dyn_transport().unwrap()).unwrap();
        assert_eq!(provider.endpoint(), "https://api.anthropic.com/v1/messages");

        let provider = AnthropicMessagesProvider::from_config(
            config.with_base_url("https://proxy.example.com/v1/"),
            default_dyn_transport().unwrap(),
        )
        .unwrap();
        assert_eq!(provider.endpoint(), "https://proxy.example.com/v1/messages");
    }

    #[test]
    fn capabilities_follow_config() {
        let mut config = ProviderConfig::new(ProviderType::Anthropic, "a").with_api_key("k");
        config.supports_tool_calling = Some(false);
        let provider = AnthropicMessagesProvider::from_config(config, default_dyn_transport().unwrap()).unwrap();
        assert!(!provider.supports_tool_calling());
        assert!(provider.supports_streaming());
        assert!(!provider.supports_responses_api());
        assert_eq!(provider.tool_format(), ToolFormat::Anthropic);
    }
}
