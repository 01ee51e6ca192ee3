use std::collections::HashMap;

use tokio_util::sync::CancellationToken;

use crate::error::LLMError;
use crate::provider::{DynProvider, ProviderMetrics};
use crate::stream::ChunkStream;
use crate::types::{ChatRequest, ChatResponse};

/// Registry of configured providers, addressed by handle.
pub struct LLMClient {
    providers: HashMap<String, DynProvider>,
}

impl LLMClient {
    pub fn builder() -> LLMClientBuilder {
        LLMClientBuilder {
            providers: HashMap::new(),
        }
    }

    /// Sends `request` to the provider registered under `handle`.
    pub async fn chat(&self, handle: &str, request: ChatRequest) -> Result<ChatResponse, LLMError> {
        let provider = self.get_provider(handle)?;
        provider.chat(request).await
    }

    /// Opens a stream on the provider registered under `handle`.
    pub async fn stream_chat(&self, handle: &str, request: ChatRequest) -> Result<ChunkStream, LLMError> {
        let provider = self.get_provider(handle)?;
        provider.stream_chat(request).await
    }

    /// Registered handles, sorted.
    pub fn handles(&self) -> Vec<String> {
        let mut handles: Vec<String> = self.providers.keys().cloned().collect();
        handles.sort();
        handles
    }

    pub fn provider(&self, handle: &str) -> Option<DynProvider> {
        self.providers.get(handle).cloned()
    }

    /// Handles whose provider currently accepts tool definitions.
    pub fn handles_supporting_tools(&self) -> Vec<String> {
        self.filter_handles(|provider| provider.supports_tool_calling())
    }

    pub fn handles_supporting_stream(&self) -> Vec<String> {
        self.filter_handles(|provider| provider.supports_streaming())
    }

    /// Metrics snapshot for every handle.
    pub fn metrics(&self) -> HashMap<String, ProviderMetrics> {
        self.providers
            .iter()
            .map(|(handle, provider)| (handle.clone(), provider.metrics()))
            .collect()
    }

    /// Refreshes OAuth tokens on every provider, collecting the failures.
    ///
    /// # Errors
    ///
    /// Returns [`LLMError::Aggregate`] with one entry per provider that failed.
    pub async fn refresh_all_oauth_tokens(&self, cancel: &CancellationToken) -> Result<(), LLMError> {
        let mut errors = Vec::new();
        for handle in self.handles() {
            if let Some(provider) = self.providers.get(&handle) {
                if let Err(err) = provider.refresh_all_oauth_tokens(cancel).await {
                    tracing::warn!(handle = %handle, error = %err, "oauth refresh failed");
                    errors.push(err);
                }
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(LLMError::Aggregate { errors })
        }
    }

    fn filter_handles(&self, keep: impl Fn(&DynProvider) -> bool) -> Vec<String> {
        let mut handles: Vec<String> = self
            .providers
            .iter()
            .filter(|(_, provider)| keep(provider))
            .map(|(handle, _)| handle.clone())
            .collect();
        handles.sort();
        handles
    }

    fn get_provider(&self, handle: &str) -> Result<DynProvider, LLMError> {
        self.providers
            .get(handle)
            .cloned()
            .ok_or_else(|| LLMError::Validation {
                message: format!("unknown provider handle: {handle}"),
            })
    }
}

impl std::fmt::Debug for LLMClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LLMClient")
            .field("handles", &self.handles())
            .finish()
    }
}

pub struct LLMClientBuilder {
    providers: HashMap<String, DynProvider>,
}

impl LLMClientBuilder {
    /// Registers `provider` under `handle`, replacing any earlier registration.
    pub fn register_handle<S: Into<String>>(mut self, handle: S, provider: DynProvider) -> Self {
        self.providers.insert(handle.into(), provider);
        self
    }

    pub fn contains(&self, handle: &str) -> bool {
        self.providers.contains_key(handle)
    }

    pub fn build(self) -> LLMClient {
        LLMClient {
            providers: self.providers,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::auth::{AuthMode, AuthStatus};
    use crate::config::{AuthConfig, ProviderConfig, ProviderType};
    use crate::provider::Provider;
    use crate::ratelimit::RateLimitTracker;
    use crate::types::{Message, ModelInfo, ToolFormat};

    struct DummyProvider {
        name: &'static str,
        streaming: bool,
        tools: bool,
        refresh_fails: bool,
        calls: AtomicU64,
        tracker: RateLimitTracker,
    }

    impl DummyProvider {
        fn new(name: &'static str, streaming: bool, tools: bool) -> Self {
            Self {
                name,
                streaming,
                tools,
                refresh_fails: false,
                calls: AtomicU64::new(0),
                tracker: RateLimitTracker::new(ProviderType::OpenAiCompatible),
            }
        }
    }

    #[async_trait]
    impl Provider for DummyProvider {
        fn name(&self) -> &str {
            self.name
        }

        fn provider_type(&self) -> ProviderType {
            ProviderType::OpenAiCompatible
        }

        fn description(&self) -> String {
            "dummy".to_string()
        }

        async fn models(&self) -> Result<Vec<ModelInfo>, LLMError> {
            Ok(Vec::new())
        }

        fn default_model(&self) -> String {
            "dummy-model".to_string()
        }

        async fn chat(&self, _request: ChatRequest) -> Result<ChatResponse, LLMError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ChatResponse {
                id: None,
                model: "dummy-model".to_string(),
                message: Message::assistant(format!("from {}", self.name)),
                finish_reason: Some("stop".to_string()),
                usage: None,
                provider: self.name.to_string(),
            })
        }

        async fn stream_chat(&self, _request: ChatRequest) -> Result<ChunkStream, LLMError> {
            Err(LLMError::UnsupportedFeature { feature: "streaming" })
        }

        async fn authenticate(&self, _config: AuthConfig) -> Result<(), LLMError> {
            Ok(())
        }

        async fn is_authenticated(&self) -> bool {
            true
        }

        async fn logout(&self) {}

        async fn configure(&self, _config: ProviderConfig) -> Result<(), LLMError> {
            Ok(())
        }

        fn supports_streaming(&self) -> bool {
            self.streaming
        }

        fn supports_tool_calling(&self) -> bool {
            self.tools
        }

        fn supports_responses_api(&self) -> bool {
            false
        }

        fn tool_format(&self) -> ToolFormat {
            ToolFormat::OpenAi
        }

        async fn refresh_all_oauth_tokens(&self, _cancel: &CancellationToken) -> Result<(), LLMError> {
            if self.refresh_fails {
                Err(LLMError::validation(format!("{} refresh failed", self.name)))
            } else {
                Ok(())
            }
        }

        fn metrics(&self) -> ProviderMetrics {
            ProviderMetrics {
                requests: self.calls.load(Ordering::SeqCst),
                ..ProviderMetrics::default()
            }
        }

        async fn auth_status(&self) -> AuthStatus {
            AuthStatus {
                provider: self.name.to_string(),
                authenticated: true,
                method: AuthMode::ApiKey,
                api_key_count: 1,
                oauth_credential_count: 0,
            }
        }

        fn rate_limits(&self) -> &RateLimitTracker {
            &self.tracker
        }
    }

    fn client() -> LLMClient {
        LLMClient::builder()
            .register_handle("tools-and-stream", Arc::new(DummyProvider::new("p1", true, true)) as DynProvider)
            .register_handle("stream-only", Arc::new(DummyProvider::new("p2", true, false)) as DynProvider)
            .register_handle("plain", Arc::new(DummyProvider::new("p3", false, false)) as DynProvider)
            .build()
    }

    #[tokio::test]
    async fn chat_routes_by_handle() {
        let client = client();
        let response = client
            .chat("stream-only", ChatRequest::from_prompt("hi"))
            .await
            .expect("chat");
        assert_eq!(response.content(), "from p2");
        assert_eq!(client.metrics()["stream-only"].requests, 1);
        assert_eq!(client.metrics()["plain"].requests, 0);
    }

    #[tokio::test]
    async fn unknown_handle_is_a_validation_error() {
        let err = client()
            .chat("missing", ChatRequest::from_prompt("hi"))
            .await
            .expect_err("should fail");
        match err {
            LLMError::Validation { message } => assert!(message.contains("missing")),
            other => panic!("unexpected error type: {other:?}"),
        }
    }

    #[test]
    fn handles_filter_by_capability() {
        let client = client();
        assert_eq!(client.handles(), vec!["plain", "stream-only", "tools-and-stream"]);
        assert_eq!(client.handles_supporting_tools(), vec!["tools-and-stream"]);
        assert_eq!(client.handles_supporting_stream(), vec!["stream-only", "tools-and-stream"]);
        assert!(client.provider("plain").is_some());
        assert!(client.provider("nope").is_none());
    }

    #[tokio::test]
    async fn refresh_failures_are_aggregated() {
        let mut failing = DummyProvider::new("bad", true, true);
        failing.refresh_fails = true;
        let client = LLMClient::builder()
            .register_handle("ok", Arc::new(DummyProvider::new("ok", true, true)) as DynProvider)
            .register_handle("bad", Arc::new(failing) as DynProvider)
            .build();
        match client.refresh_all_oauth_tokens(&CancellationToken::new()).await {
            Err(LLMError::Aggregate { errors }) => assert_eq!(errors.len(), 1),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
