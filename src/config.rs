use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::auth::OAuthCredential;
use crate::client::LLMClient;
use crate::error::LLMError;
use crate::http::{DEFAULT_REQUEST_TIMEOUT, DynHttpTransport};
use crate::provider::DynProvider;
use crate::provider::anthropic_messages::AnthropicMessagesProvider;
use crate::provider::google_gemini::GoogleGeminiProvider;
use crate::provider::openai_chat::OpenAiChatProvider;
use crate::types::ToolFormat;

/// Backend families the crate can dispatch to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
    Gemini,
    #[serde(rename = "openrouter")]
    OpenRouter,
    Cerebras,
    Qwen,
    #[serde(rename = "openai_compatible")]
    OpenAiCompatible,
}

impl ProviderType {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderType::OpenAi => "openai",
            ProviderType::Anthropic => "anthropic",
            ProviderType::Gemini => "gemini",
            ProviderType::OpenRouter => "openrouter",
            ProviderType::Cerebras => "cerebras",
            ProviderType::Qwen => "qwen",
            ProviderType::OpenAiCompatible => "openai_compatible",
        }
    }

    /// Whether the backend speaks the OpenAI Chat Completions wire format.
    pub fn is_openai_family(self) -> bool {
        !matches!(self, ProviderType::Anthropic | ProviderType::Gemini)
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            ProviderType::OpenAi | ProviderType::OpenAiCompatible => "https://api.openai.com/v1",
            ProviderType::Anthropic => "https://api.anthropic.com",
            ProviderType::Gemini => "https://generativelanguage.googleapis.com",
            ProviderType::OpenRouter => "https://openrouter.ai/api/v1",
            ProviderType::Cerebras => "https://api.cerebras.ai/v1",
            ProviderType::Qwen => "https://dashscope.aliyuncs.com/compatible-mode/v1",
        }
    }

    /// Model used when neither the request nor the config names one.
    pub fn default_model(self) -> &'static str {
        match self {
            ProviderType::OpenAi | ProviderType::OpenAiCompatible => "gpt-4o",
            ProviderType::Anthropic => "claude-sonnet-4-5",
            ProviderType::Gemini => "gemini-2.5-flash",
            ProviderType::OpenRouter => "openai/gpt-4o",
            ProviderType::Cerebras => "llama-3.3-70b",
            ProviderType::Qwen => "qwen3-coder-plus",
        }
    }

    pub fn tool_format(self) -> ToolFormat {
        match self {
            ProviderType::Anthropic => ToolFormat::Anthropic,
            ProviderType::Gemini => ToolFormat::Gemini,
            _ => ToolFormat::OpenAi,
        }
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderType {
    type Err = LLMError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "openai" => Ok(ProviderType::OpenAi),
            "anthropic" => Ok(ProviderType::Anthropic),
            "gemini" | "google" => Ok(ProviderType::Gemini),
            "openrouter" => Ok(ProviderType::OpenRouter),
            "cerebras" => Ok(ProviderType::Cerebras),
            "qwen" => Ok(ProviderType::Qwen),
            "openai_compatible" | "openai-compatible" => Ok(ProviderType::OpenAiCompatible),
            other => Err(LLMError::InvalidConfig {
                field: "provider_type".to_string(),
                reason: format!("unknown provider type `{other}`"),
            }),
        }
    }
}

/// Describes one backend: where it lives, which credentials it uses and what it supports.
///
/// Capability flags are explicit. `None` means "keep the current value" when the config
/// is applied through `Provider::configure`, and "use the provider default" otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub provider_type: ProviderType,
    /// Handle under which the provider is registered, e.g. `work-openai`.
    pub name: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Secondary keys tried after `api_key`.
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default)]
    pub oauth_credentials: Vec<OAuthCredential>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub supports_streaming: Option<bool>,
    #[serde(default)]
    pub supports_tool_calling: Option<bool>,
    #[serde(default)]
    pub supports_responses_api: Option<bool>,
    /// Free-form provider settings such as `organization` or `project_id`.
    #[serde(default)]
    pub provider_config: HashMap<String, Value>,
}

impl ProviderConfig {
    pub fn new(provider_type: ProviderType, name: impl Into<String>) -> Self {
        Self {
            provider_type,
            name: name.into(),
            api_key: None,
            api_keys: Vec::new(),
            oauth_credentials: Vec::new(),
            base_url: None,
            default_model: None,
            timeout_secs: None,
            max_tokens: None,
            supports_streaming: None,
            supports_tool_calling: None,
            supports_responses_api: None,
            provider_config: HashMap::new(),
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_api_keys(mut self, keys: impl IntoIterator<Item = String>) -> Self {
        self.api_keys.extend(keys);
        self
    }

    pub fn with_oauth_credential(mut self, credential: OAuthCredential) -> Self {
        self.oauth_credentials.push(credential);
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.provider_config.insert(key.into(), value.into());
        self
    }

    /// Primary key followed by the secondary keys, blanks and duplicates removed.
    pub fn all_api_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        for key in self.api_key.iter().chain(self.api_keys.iter()) {
            let key = key.trim();
            if !key.is_empty() && !keys.iter().any(|existing| existing == key) {
                keys.push(key.to_string());
            }
        }
        keys
    }

    pub fn base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| self.provider_type.default_base_url())
    }

    pub fn effective_default_model(&self) -> String {
        self.default_model
            .clone()
            .filter(|model| !model.is_empty())
            .unwrap_or_else(|| self.provider_type.default_model().to_string())
    }

    pub fn timeout(&self) -> Duration {
        self.timeout_secs
            .filter(|secs| *secs > 0)
            .map_or(DEFAULT_REQUEST_TIMEOUT, Duration::from_secs)
    }

    /// String setting from `provider_config`, ignoring blanks.
    pub fn setting_str(&self, key: &str) -> Option<String> {
        match self.provider_config.get(key) {
            Some(Value::String(value)) if !value.trim().is_empty() => Some(value.trim().to_string()),
            _ => None,
        }
    }

    /// Numeric setting from `provider_config`; numeric strings are accepted.
    pub fn setting_u64(&self, key: &str) -> Option<u64> {
        match self.provider_config.get(key) {
            Some(Value::Number(number)) => number.as_u64(),
            Some(Value::String(value)) => value.trim().parse().ok(),
            _ => None,
        }
    }

    /// Overlays `update` onto `self` the way `Provider::configure` does.
    ///
    /// Capability flags and credentials omitted from `update` keep their current values.
    pub fn merged_with(&self, update: ProviderConfig) -> ProviderConfig {
        let mut provider_config = self.provider_config.clone();
        provider_config.extend(update.provider_config);
        let has_keys = update.api_key.is_some() || !update.api_keys.is_empty();
        ProviderConfig {
            provider_type: self.provider_type,
            name: self.name.clone(),
            api_key: if has_keys { update.api_key } else { self.api_key.clone() },
            api_keys: if has_keys { update.api_keys } else { self.api_keys.clone() },
            oauth_credentials: if update.oauth_credentials.is_empty() {
                self.oauth_credentials.clone()
            } else {
                update.oauth_credentials
            },
            base_url: update.base_url.or_else(|| self.base_url.clone()),
            default_model: update.default_model.or_else(|| self.default_model.clone()),
            timeout_secs: update.timeout_secs.or(self.timeout_secs),
            max_tokens: update.max_tokens.or(self.max_tokens),
            supports_streaming: update.supports_streaming.or(self.supports_streaming),
            supports_tool_calling: update.supports_tool_calling.or(self.supports_tool_calling),
            supports_responses_api: update.supports_responses_api.or(self.supports_responses_api),
            provider_config,
        }
    }

    /// Copy safe to log or persist: keys removed and OAuth secrets blanked.
    pub fn sanitized(&self) -> ProviderConfig {
        let mut clean = self.clone();
        clean.api_key = self.api_key.as_ref().map(|_| "<redacted>".to_string());
        clean.api_keys = self.api_keys.iter().map(|_| "<redacted>".to_string()).collect();
        clean.oauth_credentials = self
            .oauth_credentials
            .iter()
            .map(OAuthCredential::sanitized)
            .collect();
        for (key, value) in clean.provider_config.iter_mut() {
            let lowered = key.to_ascii_lowercase();
            if ["key", "secret", "token", "password"]
                .iter()
                .any(|needle| lowered.contains(needle))
            {
                *value = Value::String("<redacted>".to_string());
            }
        }
        clean
    }
}

/// Authentication method requested through `Provider::authenticate`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    ApiKey,
    Bearer,
    OAuth,
    None,
    Other(String),
}

impl AuthMethod {
    pub fn as_str(&self) -> &str {
        match self {
            AuthMethod::ApiKey => "api_key",
            AuthMethod::Bearer => "bearer",
            AuthMethod::OAuth => "oauth",
            AuthMethod::None => "none",
            AuthMethod::Other(other) => other,
        }
    }
}

impl From<&str> for AuthMethod {
    fn from(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "api_key" | "apikey" | "api-key" => AuthMethod::ApiKey,
            "bearer" | "bearer_token" => AuthMethod::Bearer,
            "oauth" | "oauth2" => AuthMethod::OAuth,
            "none" | "" => AuthMethod::None,
            _ => AuthMethod::Other(value.to_string()),
        }
    }
}

impl Serialize for AuthMethod {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for AuthMethod {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(AuthMethod::from(raw.as_str()))
    }
}

/// Credentials supplied at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub method: AuthMethod,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub oauth_credentials: Vec<OAuthCredential>,
}

impl AuthConfig {
    pub fn api_key(key: impl Into<String>) -> Self {
        Self {
            method: AuthMethod::ApiKey,
            api_key: Some(key.into()),
            token: None,
            oauth_credentials: Vec::new(),
        }
    }

    pub fn oauth(credentials: Vec<OAuthCredential>) -> Self {
        Self {
            method: AuthMethod::OAuth,
            api_key: None,
            token: None,
            oauth_credentials: credentials,
        }
    }
}

/// Builds an [`LLMClient`] with one provider per config, keyed by `name`.
///
/// # Errors
///
/// Returns [`LLMError::InvalidConfig`] for duplicate names or a provider that cannot be
/// built from its config.
pub fn build_client_from_configs(
    configs: &[ProviderConfig],
    transport: DynHttpTransport,
) -> Result<LLMClient, LLMError> {
    let mut builder = LLMClient::builder();

    for config in configs {
        if builder.contains(&config.name) {
            return Err(LLMError::InvalidConfig {
                field: "name".to_string(),
                reason: format!("duplicate provider name `{}`", config.name),
            });
        }
        let provider = build_provider_from_config(config.clone(), transport.clone())?;
        builder = builder.register_handle(config.name.clone(), provider);
    }

    Ok(builder.build())
}

/// Builds the provider matching `config.provider_type`.
pub fn build_provider_from_config(
    config: ProviderConfig,
    transport: DynHttpTransport,
) -> Result<DynProvider, LLMError> {
    if config.name.trim().is_empty() {
        return Err(LLMError::InvalidConfig {
            field: "name".to_string(),
            reason: "provider name must not be empty".to_string(),
        });
    }
    let provider: DynProvider = match config.provider_type {
        ProviderType::Anthropic => Arc::new(AnthropicMessagesProvider::from_config(config, transport)?),
        ProviderType::Gemini => Arc::new(GoogleGeminiProvider::from_config(config, transport)?),
        _ => Arc::new(OpenAiChatProvider::from_config(config, transport)?),
    };
    Ok(provider)
}
