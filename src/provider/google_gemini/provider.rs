use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::auth::{AuthFacade, AuthMode, AuthStatus, Credential};
use crate::config::{AuthConfig, ProviderConfig, ProviderType};
use crate::error::LLMError;
use crate::http::{DynHttpTransport, HttpRequest, json_request};
use crate::provider::dispatch::{ProviderCore, body_text};
use crate::provider::{ModelCatalog, Provider, ProviderMetrics};
use crate::ratelimit::RateLimitTracker;
use crate::stream::ChunkStream;
use crate::types::{ChatRequest, ChatResponse, ModelInfo, ToolFormat};

use super::error::parse_gemini_error;
use super::request::build_gemini_body;
use super::response::{decode_response, map_response};
use super::stream::GeminiLineParser;

const LABEL: &str = "google_gemini";
pub(crate) const CLOUDCODE_BASE_URL: &str = "https://cloudcode-pa.googleapis.com";

/// Google Gemini provider.
///
/// API keys go to the public Generative Language API. OAuth credentials together with a
/// `project_id` setting go to the CloudCode endpoint, which wraps the same body as
/// `{model, project, request}`. Calls are paced by a client-side token bucket because
/// Gemini publishes no quota headers.
pub struct GoogleGeminiProvider {
    core: ProviderCore,
}

/// Where one attempt is sent, decided per credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Route {
    Public { base: String },
    CloudCode { base: String, project: String },
}

impl Route {
    pub(crate) fn url(&self, model: &str, stream: bool) -> String {
        let method = if stream {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        match self {
            Route::Public { base } => {
                let base = base.trim_end_matches('/');
                let versioned = base.ends_with("/v1beta") || base.ends_with("/v1");
                let prefix = if versioned { "" } else { "/v1beta" };
                format!("{base}{prefix}/models/{model}:{method}")
            }
            Route::CloudCode { base, .. } => {
                format!("{}/v1internal:{method}", base.trim_end_matches('/'))
            }
        }
    }

    pub(crate) fn wrap(&self, model: &str, body: &Value) -> Value {
        match self {
            Route::Public { .. } => body.clone(),
            Route::CloudCode { project, .. } => json!({
                "model": model,
                "project": project,
                "request": body
            }),
        }
    }
}

impl GoogleGeminiProvider {
    /// Builds the provider from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`LLMError::InvalidConfig`] when `config` is not a Gemini config or has an
    /// empty name.
    pub fn from_config(config: ProviderConfig, transport: DynHttpTransport) -> Result<Self, LLMError> {
        if config.provider_type != ProviderType::Gemini {
            return Err(LLMError::InvalidConfig {
                field: "provider_type".to_string(),
                reason: format!("expected gemini, got {}", config.provider_type),
            });
        }
        Ok(Self {
            core: ProviderCore::new(config, transport, LABEL, parse_gemini_error)?,
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

    pub(crate) fn route(config: &ProviderConfig, credential: &Credential) -> Route {
        if credential.mode() == AuthMode::OAuth {
            if let Some(project) = config.setting_str("project_id") {
                let base = config
                    .setting_str("cloudcode_base_url")
                    .unwrap_or_else(|| CLOUDCODE_BASE_URL.to_string());
                return Route::CloudCode { base, project };
            }
        }
        Route::Public {
            base: config.base_url().to_string(),
        }
    }

    fn build_headers(stream: bool) -> HashMap<String, String> {
        let accept = if stream { "text/event-stream" } else { "application/json" };
        HashMap::from([("Accept".to_string(), accept.to_string())])
    }

    fn build_request_body(&self, request: &ChatRequest) -> Result<Value, LLMError> {
        if !request.tools.is_empty() && !self.supports_tool_calling() {
            return Err(LLMError::UnsupportedFeature {
                feature: "tool calling",
            });
        }
        build_gemini_body(request, self.core.config().max_tokens)
    }

    fn resolve_model(&self, request: &ChatRequest) -> String {
        let model = self.core.resolve_model(request);
        model.strip_prefix("models/").map(str::to_string).unwrap_or(model)
    }

    async fn send_chat(&self, request: ChatRequest) -> Result<ChatResponse, LLMError> {
        let cancel = request.token();
        let model = self.resolve_model(&request);
        let body = self.build_request_body(&request)?;
        self.core.gate(&cancel, &model, request.estimated_tokens()).await?;

        let config = self.core.config();
        let build = |credential: &Credential| -> Result<HttpRequest, LLMError> {
            let route = Self::route(&config, credential);
            json_request(
                route.url(&model, false),
                Self::build_headers(false),
                &route.wrap(&model, &body),
            )
        };
        let response = self.core.send(&cancel, &model, build).await?;
        let text = body_text(response, LABEL)?;
        let parsed = decode_response(&text).map_err(|err| {
            LLMError::provider(LABEL, format!("failed to parse response: {err}"))
        })?;
        map_response(parsed, self.core.name(), &model)
    }

    async fn open_chat_stream(&self, request: ChatRequest) -> Result<ChunkStream, LLMError> {
        if !self.supports_streaming() {
            return Err(LLMError::UnsupportedFeature { feature: "streaming" });
        }
        let cancel = request.token();
        let model = self.resolve_model(&request);
        let body = self.build_request_body(&request)?;
        self.core.gate(&cancel, &model, request.estimated_tokens()).await?;

        let config = self.core.config();
        let build = |credential: &Credential| -> Result<HttpRequest, LLMError> {
            let route = Self::route(&config, credential);
            json_request(
                route.url(&model, true),
                Self::build_headers(true),
                &route.wrap(&model, &body),
            )
        };
        let response = self.core.open_stream(&cancel, &model, build).await?;
        Ok(ChunkStream::sse(
            response.body,
            Box::new(GeminiLineParser::new()),
            &cancel,
            LABEL,
        ))
    }
}

#[async_trait]
impl Provider for GoogleGeminiProvider {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Gemini
    }

    fn description(&self) -> String {
        format!("Google Gemini at {}", self.core.config().base_url())
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
        ToolFormat::Gemini
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

impl std::fmt::Debug for GoogleGeminiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoogleGeminiProvider")
            .field("core", &self.core)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::OAuthCredential;

    #[test]
    fn public_urls() {
        let route = Route::Public {
            base: "https://generativelanguage.googleapis.com".into(),
        };
        assert_eq!(
            route.url("gemini-2.5-flash", false),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash:generateContent"
        );
        assert_eq!(
            route.url("gemini-2.5-flash", true),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash:streamGenerateContent?alt=sse"
        );
        let route = Route::Public {
            base: "http://localhost:9000/v1beta/".into(),
        };
        assert_eq!(
            route.url("m", false),
            "http://localhost:9000/v1beta/models/m:generateContent"
        );
    }

    #[test]
    fn oauth_with_project_goes_to_cloudcode() {
        let config = ProviderConfig::new(ProviderType::Gemini, "g").with_setting("project_id", "proj-1");
        let oauth = Credential::OAuth(OAuthCredential::new("c1"));
        let route = GoogleGeminiProvider::route(&config, &oauth);
        assert_eq!(
            route,
            Route::CloudCode {
                base: CLOUDCODE_BASE_URL.into(),
                project: "proj-1".into()
            }
        );
        assert_eq!(
            route.url("gemini-2.5-pro", true),
            "https://cloudcode-pa.googleapis.com/v1internal:streamGenerateContent?alt=sse"
        );
        let wrapped = route.wrap("gemini-2.5-pro", &json!({"contents": []}));
        assert_eq!(
            wrapped,
            json!({"model": "gemini-2.5-pro", "project": "proj-1", "request": {"contents": []}})
        );

        let key = Credential::ApiKey("k".into());
        assert!(matches!(GoogleGeminiProvider::route(&config, &key), Route::Public { .. }));
        let no_project = ProviderConfig::new(ProviderType::Gemini, "g");
        assert!(matches!(GoogleGeminiProvider::route(&no_project, &oauth), Route::Public { .. }));
    }
}
