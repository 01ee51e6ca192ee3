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
use crate::stream::{ChunkStream, LineParser};
use crate::types::{ChatRequest, ChatResponse, ModelInfo, ToolFormat};

use super::error::parse_openai_error;
use super::request::{BodyOptions, build_openai_body};
use super::response::map_response;
use super::stream::OpenAiLineParser;
use super::types::OpenAiChatResponse;

const LABEL: &str = "openai_chat";

/// Builds a fresh line parser for every stream.
pub type LineParserFactory = Arc<dyn Fn() -> Box<dyn LineParser> + Send + Sync>;

/// Chat Completions provider for OpenAI and every backend speaking the same wire
/// format: OpenRouter, Cerebras, Qwen and generic compatible servers.
pub struct OpenAiChatProvider {
    core: ProviderCore,
    line_parser: LineParserFactory,
}

impl OpenAiChatProvider {
    /// Builds the provider from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`LLMError::InvalidConfig`] for a non OpenAI-family provider type, an
    /// empty name, or OAuth credentials on a backend without a refresh protocol.
    pub fn from_config(config: ProviderConfig, transport: DynHttpTransport) -> Result<Self, LLMError> {
        if !config.provider_type.is_openai_family() {
            return Err(LLMError::InvalidConfig {
                field: "provider_type".to_string(),
                reason: format!("{} does not speak chat completions", config.provider_type),
            });
        }
        Ok(Self {
            core: ProviderCore::new(config, transport, LABEL, parse_openai_error)?,
            line_parser: Arc::new(|| -> Box<dyn LineParser> { Box::new(OpenAiLineParser::new()) }),
        })
    }

    /// Replaces the SSE line parser, for compatible servers with their own chunk shape.
    pub fn with_line_parser(mut self, factory: LineParserFactory) -> Self {
        self.line_parser = factory;
        self
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
        chat_completions_url(self.core.config().base_url())
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
        let config = self.core.config();
        let options = BodyOptions {
            max_tokens: config.max_tokens,
            include_stream_usage: config.provider_type == ProviderType::OpenAi,
        };
        build_openai_body(request, model, stream, options)
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
        let parsed: OpenAiChatResponse = try_parse(&text, LABEL)?;
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
        Ok(ChunkStream::sse(response.body, (self.line_parser)(), &cancel, LABEL))
    }
}

/// `{base}/chat/completions`, inserting `/v1` unless the base already names a version.
pub(crate) fn chat_completions_url(base: &str) -> String {
    let base = base.trim_end_matches('/');
    let versioned = url::Url::parse(base).is_ok_and(|url| {
        url.path_segments().is_some_and(|mut segments| {
            segments.any(|segment| {
                segment.len() > 1
                    && segment.starts_with('v')
                    && segment[1..].chars().next().is_some_and(|c| c.is_ascii_digit())
            })
        })
    });
    if versioned {
        format!("{base}/chat/completions")
    } else {
        format!("{base}/v1/chat/completions")
    }
}

#[async_trait]
impl Provider for OpenAiChatProvider {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn provider_type(&self) -> ProviderType {
        self.core.provider_type()
    }

    fn description(&self) -> String {
        format!(
            "{} chat completions at {}",
            self.core.provider_type(),
            self.core.config().base_url()
        )
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
        ToolFormat::OpenAi
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

impl std::fmt::Debug for OpenAiChatProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiChatProvider")
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}
