//! Credential management: API key pools, OAuth credentials, and the facade that picks
//! between them and stamps provider-specific auth headers.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{AuthConfig, AuthMethod, ProviderConfig, ProviderType};
use crate::error::LLMError;
use crate::http::HttpRequest;

pub mod keys;
pub mod oauth;
pub mod refresh;

pub use keys::{ApiKeyPool, ApiKeyRecord, DEFAULT_FAILURE_THRESHOLD};
pub use oauth::{CredentialState, CredentialStatus, OAuthCredential, OAuthManager};
pub use refresh::{HttpTokenRefresher, RefreshEncoding, TokenRefresher, refresher_for};

pub const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const ANTHROPIC_OAUTH_BETA: &str = "oauth-2025-04-20,claude-code-20250219,interleaved-thinking-2025-05-14,fine-grained-tool-streaming-2025-05-14";

/// Secret material handed to a dispatch attempt.
#[derive(Clone)]
pub enum Credential {
    ApiKey(String),
    OAuth(OAuthCredential),
}

impl Credential {
    pub fn mode(&self) -> AuthMode {
        match self {
            Credential::ApiKey(_) => AuthMode::ApiKey,
            Credential::OAuth(_) => AuthMode::OAuth,
        }
    }

    /// The string that goes on the wire.
    pub fn secret(&self) -> &str {
        match self {
            Credential::ApiKey(key) => key,
            Credential::OAuth(credential) => &credential.access_token,
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::ApiKey(_) => f.write_str("ApiKey(<redacted>)"),
            Credential::OAuth(credential) => write!(f, "OAuth({})", credential.id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    None,
    ApiKey,
    #[serde(rename = "oauth")]
    OAuth,
}

/// Read-only authentication summary. Never carries secrets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthStatus {
    pub provider: String,
    pub authenticated: bool,
    pub method: AuthMode,
    pub api_key_count: usize,
    pub oauth_credential_count: usize,
}

/// Non-secret header settings taken from `provider_config`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderPolicy {
    pub organization: Option<String>,
    pub http_referer: Option<String>,
    pub x_title: Option<String>,
    pub anthropic_version: Option<String>,
    pub anthropic_beta: Option<String>,
}

impl HeaderPolicy {
    pub fn from_config(config: &ProviderConfig) -> Self {
        Self {
            organization: config.setting_str("organization"),
            http_referer: config.setting_str("http_referer"),
            x_title: config.setting_str("x_title"),
            anthropic_version: config.setting_str("anthropic_version"),
            anthropic_beta: config.setting_str("anthropic_beta"),
        }
    }
}

/// Combines the key pool and OAuth manager behind one entry point.
///
/// OAuth credentials are preferred: every usable OAuth credential is tried first, then
/// every API key. The first success wins.
pub struct AuthFacade {
    provider_type: ProviderType,
    provider: String,
    keys: RwLock<Option<Arc<ApiKeyPool>>>,
    oauth: RwLock<Option<Arc<OAuthManager>>>,
    headers: RwLock<HeaderPolicy>,
}

impl AuthFacade {
    pub fn new(provider_type: ProviderType, provider: impl Into<String>) -> Self {
        Self {
            provider_type,
            provider: provider.into(),
            keys: RwLock::new(None),
            oauth: RwLock::new(None),
            headers: RwLock::new(HeaderPolicy::default()),
        }
    }

    /// Builds a facade holding the keys, OAuth credentials and header settings in `config`.
    ///
    /// # Errors
    ///
    /// Returns [`LLMError::InvalidConfig`] when OAuth credentials are configured for a
    /// provider without a refresh protocol.
    pub fn from_config(
        config: &ProviderConfig,
        refresher: Option<Arc<dyn TokenRefresher>>,
    ) -> Result<Self, LLMError> {
        let keys = config.all_api_keys();
        let keys = (!keys.is_empty()).then(|| Arc::new(ApiKeyPool::new(config.name.clone(), keys)));
        let oauth = if config.oauth_credentials.is_empty() {
            None
        } else {
            let refresher = refresher.ok_or_else(|| LLMError::InvalidConfig {
                field: "oauth_credentials".to_string(),
                reason: format!("{} does not support oauth", config.provider_type),
            })?;
            Some(Arc::new(OAuthManager::new(
                config.name.clone(),
                config.oauth_credentials.clone(),
                refresher,
            )))
        };
        Ok(Self {
            provider_type: config.provider_type,
            provider: config.name.clone(),
            keys: RwLock::new(keys),
            oauth: RwLock::new(oauth),
            headers: RwLock::new(HeaderPolicy::from_config(config)),
        })
    }

    pub fn provider_type(&self) -> ProviderType {
        self.provider_type
    }

    pub async fn set_header_policy(&self, policy: HeaderPolicy) {
        *self.headers.write().await = policy;
    }

    /// Replaces the key pool. An empty list removes it.
    pub async fn setup_api_keys(&self, keys: Vec<String>) {
        let keys: Vec<String> = keys.into_iter().filter(|key| !key.trim().is_empty()).collect();
        let pool = (!keys.is_empty()).then(|| Arc::new(ApiKeyPool::new(self.provider.clone(), keys)));
        debug!(provider = %self.provider, configured = pool.is_some(), "api key pool set up");
        *self.keys.write().await = pool;
    }

    /// Replaces the OAuth manager. An empty list removes it.
    pub async fn setup_oauth(
        &self,
        credentials: Vec<OAuthCredential>,
        refresher: Arc<dyn TokenRefresher>,
    ) {
        let manager = if credentials.is_empty() {
            None
        } else {
            Some(Arc::new(OAuthManager::new(self.provider.clone(), credentials, refresher)))
        };
        debug!(provider = %self.provider, configured = manager.is_some(), "oauth manager set up");
        *self.oauth.write().await = manager;
    }

    pub async fn keys(&self) -> Option<Arc<ApiKeyPool>> {
        self.keys.read().await.clone()
    }

    pub async fn oauth(&self) -> Option<Arc<OAuthManager>> {
        self.oauth.read().await.clone()
    }

    /// Wipes both credential stores.
    pub async fn clear_authentication(&self) {
        *self.keys.write().await = None;
        *self.oauth.write().await = None;
    }

    pub async fn is_authenticated(&self) -> bool {
        self.get_auth_status().await.authenticated
    }

    pub async fn get_auth_status(&self) -> AuthStatus {
        let api_key_count = match self.keys().await {
            Some(pool) => pool.len().await,
            None => 0,
        };
        let oauth_credential_count = match self.oauth().await {
            Some(manager) => manager.usable_count().await,
            None => 0,
        };
        let method = if oauth_credential_count > 0 {
            AuthMode::OAuth
        } else if api_key_count > 0 {
            AuthMode::ApiKey
        } else {
            AuthMode::None
        };
        AuthStatus {
            provider: self.provider.clone(),
            authenticated: method != AuthMode::None,
            method,
            api_key_count,
            oauth_credential_count,
        }
    }

    /// Checks that `config` carries what its method needs.
    ///
    /// # Errors
    ///
    /// Returns [`LLMError::InvalidConfig`] for a blank key or token, an OAuth config
    /// without credentials, or an unknown method.
    pub fn validate_auth_config(config: &AuthConfig) -> Result<(), LLMError> {
        let blank = |value: &Option<String>| value.as_deref().is_none_or(|v| v.trim().is_empty());
        match &config.method {
            AuthMethod::ApiKey if blank(&config.api_key) => Err(LLMError::InvalidConfig {
                field: "api_key".to_string(),
                reason: "api key authentication requires a non-empty key".to_string(),
            }),
            AuthMethod::Bearer if blank(&config.token) => Err(LLMError::InvalidConfig {
                field: "token".to_string(),
                reason: "bearer authentication requires a non-empty token".to_string(),
            }),
            AuthMethod::OAuth if config.oauth_credentials.is_empty() => Err(LLMError::InvalidConfig {
                field: "oauth_credentials".to_string(),
                reason: "oauth authentication requires at least one credential".to_string(),
            }),
            AuthMethod::Other(method) => Err(LLMError::InvalidConfig {
                field: "method".to_string(),
                reason: format!("unsupported authentication method `{method}`"),
            }),
            _ => Ok(()),
        }
    }

    /// Installs the credentials in `config`, replacing the store for its method.
    ///
    /// Bearer tokens are static and live in the key pool, where they are sent the same
    /// way as keys.
    pub async fn authenticate(
        &self,
        config: &AuthConfig,
        refresher: Option<Arc<dyn TokenRefresher>>,
    ) -> Result<(), LLMError> {
        Self::validate_auth_config(config)?;
        match &config.method {
            AuthMethod::ApiKey => {
                self.setup_api_keys(config.api_key.iter().cloned().collect()).await;
            }
            AuthMethod::Bearer => {
                self.setup_api_keys(config.token.iter().cloned().collect()).await;
            }
            AuthMethod::OAuth => {
                let refresher = refresher.ok_or_else(|| LLMError::InvalidConfig {
                    field: "method".to_string(),
                    reason: format!("{} does not support oauth", self.provider_type),
                })?;
                self.setup_oauth(config.oauth_credentials.clone(), refresher).await;
            }
            AuthMethod::None => self.clear_authentication().await,
            AuthMethod::Other(_) => {}
        }
        Ok(())
    }

    /// Runs `op` with every credential in turn until one succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`LLMError::NoCredentials`] when nothing is configured, otherwise the last
    /// failure. Cancellation and rejected requests ([`LLMError::stops_failover`]) stop the
    /// walk immediately.
    pub async fn execute_with_auth<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, LLMError>
    where
        F: FnMut(Credential) -> Fut,
        Fut: Future<Output = Result<T, LLMError>>,
    {
        let oauth = self.oauth().await;
        let keys = self.keys().await;
        let mut last_error = None;

        if let Some(manager) = oauth {
            if manager.usable_count().await > 0 {
                match manager
                    .execute_with_failover(cancel, |credential| op(Credential::OAuth(credential)))
                    .await
                {
                    Ok(value) => return Ok(value),
                    Err(err) if err.stops_failover() => return Err(err),
                    Err(err) => {
                        if keys.is_some() {
                            warn!(provider = %self.provider, error = %err, "oauth credentials exhausted, falling back to api keys");
                        }
                        last_error = Some(err);
                    }
                }
            }
        }

        if let Some(pool) = keys {
            match pool
                .execute_with_failover(cancel, |key| op(Credential::ApiKey(key)))
                .await
            {
                Ok(value) => return Ok(value),
                Err(err) => last_error = Some(err),
            }
        }

        Err(last_error.unwrap_or_else(|| LLMError::NoCredentials {
            provider: self.provider.clone(),
        }))
    }

    /// Refreshes every OAuth credential. A no-op without OAuth.
    pub async fn refresh_all(&self, cancel: &CancellationToken) -> Result<(), LLMError> {
        match self.oauth().await {
            Some(manager) => manager.refresh_all(cancel).await,
            None => Ok(()),
        }
    }

    /// Stamps the credential onto `request` according to the provider's header policy.
    ///
    /// # Errors
    ///
    /// Returns [`LLMError::Validation`] when a Gemini URL cannot take the `key` query.
    pub async fn apply_credential(
        &self,
        request: HttpRequest,
        credential: &Credential,
    ) -> Result<HttpRequest, LLMError> {
        let request = self.set_auth_headers(request, credential)?;
        Ok(self.set_provider_specific_headers(request, credential.mode()).await)
    }

    fn set_auth_headers(
        &self,
        mut request: HttpRequest,
        credential: &Credential,
    ) -> Result<HttpRequest, LLMError> {
        let secret = credential.secret();
        match (self.provider_type, credential.mode()) {
            (ProviderType::Anthropic, AuthMode::ApiKey) => Ok(request.with_header("x-api-key", secret)),
            (ProviderType::Gemini, AuthMode::ApiKey) => {
                let mut url = url::Url::parse(&request.url)
                    .map_err(|err| LLMError::validation(format!("invalid gemini url: {err}")))?;
                url.query_pairs_mut().append_pair("key", secret);
                request.url = url.into();
                Ok(request)
            }
            _ => Ok(request.with_header("Authorization", format!("Bearer {secret}"))),
        }
    }

    async fn set_provider_specific_headers(&self, mut request: HttpRequest, mode: AuthMode) -> HttpRequest {
        let policy = self.headers.read().await.clone();
        match self.provider_type {
            ProviderType::OpenAi => {
                if let Some(org) = policy.organization {
                    request = request.with_header("openai-organization", org);
                }
            }
            ProviderType::OpenRouter => {
                if let Some(referer) = policy.http_referer {
                    request = request.with_header("HTTP-Referer", referer);
                }
                if let Some(title) = policy.x_title {
                    request = request.with_header("X-Title", title);
                }
            }
            ProviderType::Anthropic => {
                let version = policy.anthropic_version.unwrap_or_else(|| ANTHROPIC_VERSION.to_string());
                request = request.with_header("anthropic-version", version);
                if mode == AuthMode::OAuth {
                    let beta = policy.anthropic_beta.unwrap_or_else(|| ANTHROPIC_OAUTH_BETA.to_string());
                    request = request.with_header("anthropic-beta", beta);
                }
            }
            _ => {}
        }
        request
    }
}

impl std::fmt::Debug for AuthFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthFacade")
            .field("provider_type", &self.provider_type)
            .field("provider", &self.provider)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::Mutex;

    use super::*;
    use crate::error::ApiError;

    struct NoRefresh;

    #[async_trait]
    impl TokenRefresher for NoRefresh {
        async fn refresh(&self, credential: &OAuthCredential) -> Result<OAuthCredential, LLMError> {
            Err(LLMError::Refresh {
                credential: credential.id.clone(),
                message: "disabled".into(),
                permanent: false,
            })
        }
    }

    fn live(id: &str) -> OAuthCredential {
        OAuthCredential::new(id).with_access_token(format!("at-{id}"), Utc::now() + ChronoDuration::hours(1))
    }

    fn request() -> HttpRequest {
        HttpRequest::post_json("https://api.example.com/v1/messages", b"{}".to_vec())
    }

    #[tokio::test]
    async fn anthropic_headers_follow_credential_mode() {
        let facade = AuthFacade::new(ProviderType::Anthropic, "claude");
        let keyed = facade
            .apply_credential(request(), &Credential::ApiKey("sk-ant".into()))
            .await
            .unwrap();
        assert_eq!(keyed.header("x-api-key"), Some("sk-ant"));
        assert_eq!(keyed.header("anthropic-version"), Some(ANTHROPIC_VERSION));
        assert_eq!(keyed.header("anthropic-beta"), None);
        assert_eq!(keyed.header("authorization"), None);

        let oauth = facade
            .apply_credential(request(), &Credential::OAuth(live("c1")))
            .await
            .unwrap();
        assert_eq!(oauth.header("authorization"), Some("Bearer at-c1"));
        assert_eq!(oauth.header("anthropic-beta"), Some(ANTHROPIC_OAUTH_BETA));
        assert_eq!(oauth.header("x-api-key"), None);
    }

    #[tokio::test]
    async fn gemini_key_goes_in_query() {
        let facade = AuthFacade::new(ProviderType::Gemini, "gemini");
        let req = HttpRequest::post_json(
            "https://g.example/v1beta/models/gemini-2.5-flash:generateContent",
            Vec::new(),
        );
        let keyed = facade
            .apply_credential(req, &Credential::ApiKey("AIza".into()))
            .await
            .unwrap();
        assert!(keyed.url.ends_with(":generateContent?key=AIza"), "{}", keyed.url);
        assert_eq!(keyed.header("authorization"), None);
    }

    #[tokio::test]
    async fn openrouter_and_openai_extras() {
        let facade = AuthFacade::new(ProviderType::OpenRouter, "or");
        facade
            .set_header_policy(HeaderPolicy {
                http_referer: Some("https://app.example".into()),
                x_title: Some("App".into()),
                organization: Some("ignored".into()),
                ..HeaderPolicy::default()
            })
            .await;
        let req = facade
            .apply_credential(request(), &Credential::ApiKey("k".into()))
            .await
            .unwrap();
        assert_eq!(req.header("authorization"), Some("Bearer k"));
        assert_eq!(req.header("http-referer"), Some("https://app.example"));
        assert_eq!(req.header("x-title"), Some("App"));
        assert_eq!(req.header("openai-organization"), None);

        let facade = AuthFacade::new(ProviderType::OpenAi, "oa");
        facade
            .set_header_policy(HeaderPolicy {
                organization: Some("org-1".into()),
                ..HeaderPolicy::default()
            })
            .await;
        let req = facade
            .apply_credential(request(), &Credential::ApiKey("k".into()))
            .await
            .unwrap();
        assert_eq!(req.header("openai-organization"), Some("org-1"));
    }

    #[tokio::test]
    async fn oauth_is_tried_before_keys() {
        let facade = AuthFacade::new(ProviderType::OpenAi, "oa");
        facade.setup_api_keys(vec!["k1".into()]).await;
        facade.setup_oauth(vec![live("c1")], Arc::new(NoRefresh)).await;

        let seen = Mutex::new(Vec::new());
        let result = facade
            .execute_with_auth(&CancellationToken::new(), |credential| {
                seen.lock().unwrap().push(format!("{credential:?}"));
                async move {
                    match credential {
                        Credential::OAuth(_) => Err(ApiError::from_status(429, "busy", "").into()),
                        Credential::ApiKey(key) => Ok(key),
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, "k1");
        assert_eq!(*seen.lock().unwrap(), vec!["OAuth(c1)", "ApiKey(<redacted>)"]);
    }

    #[tokio::test]
    async fn status_reports_counts_not_secrets() {
        let facade = AuthFacade::new(ProviderType::OpenAi, "oa");
        let status = facade.get_auth_status().await;
        assert!(!status.authenticated);
        assert_eq!(status.method, AuthMode::None);

        facade.setup_api_keys(vec!["secret-1".into(), "secret-2".into()]).await;
        let status = facade.get_auth_status().await;
        assert!(status.authenticated);
        assert_eq!(status.method, AuthMode::ApiKey);
        assert_eq!(status.api_key_count, 2);
        let dump = serde_json::to_string(&status).unwrap();
        assert!(!dump.contains("secret"), "{dump}");

        facade.clear_authentication().await;
        assert!(!facade.is_authenticated().await);
    }

    #[tokio::test]
    async fn from_config_loads_keys_and_rejects_oauth_without_refresher() {
        let config = ProviderConfig::new(ProviderType::OpenAi, "oa")
            .with_api_keys(vec!["k1".into(), "k2".into()])
            .with_setting("organization", "org-9");
        let facade = AuthFacade::from_config(&config, None).unwrap();
        assert_eq!(facade.get_auth_status().await.api_key_count, 2);
        let req = facade
            .apply_credential(request(), &Credential::ApiKey("k1".into()))
            .await
            .unwrap();
        assert_eq!(req.header("openai-organization"), Some("org-9"));

        let config = ProviderConfig::new(ProviderType::Cerebras, "cb").with_oauth_credential(live("c1"));
        match AuthFacade::from_config(&config, None) {
            Err(LLMError::InvalidConfig { field, .. }) => assert_eq!(field, "oauth_credentials"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn nothing_configured_is_no_credentials() {
        let facade = AuthFacade::new(ProviderType::OpenAi, "oa");
        let result: Result<(), _> = facade
            .execute_with_auth(&CancellationToken::new(), |_| async { Ok(()) })
            .await;
        match result {
            Err(LLMError::NoCredentials { .. }) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn validation_rules() {
        let ok = AuthConfig::api_key("k");
        assert!(AuthFacade::validate_auth_config(&ok).is_ok());

        let blank = AuthConfig::api_key("  ");
        assert!(AuthFacade::validate_auth_config(&blank).is_err());

        let bearer = AuthConfig {
            method: AuthMethod::Bearer,
            api_key: None,
            token: None,
            oauth_credentials: Vec::new(),
        };
        assert!(AuthFacade::validate_auth_config(&bearer).is_err());

        let unknown = AuthConfig {
            method: AuthMethod::Other("kerberos".into()),
            ..AuthConfig::api_key("k")
        };
        match AuthFacade::validate_auth_config(&unknown) {
            Err(LLMError::InvalidConfig { reason, .. }) => assert!(reason.contains("kerberos")),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
