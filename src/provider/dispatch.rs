//! Request plumbing shared by every backend: model resolution, rate-limit gating,
//! credential failover, error classification and metrics.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::auth::{AuthFacade, AuthStatus, Credential, refresher_for};
use crate::config::{AuthConfig, ProviderConfig, ProviderType};
use crate::error::{ApiError, ErrorKind, LLMError};
use crate::http::{
    DynHttpTransport, HttpRequest, HttpResponse, HttpStreamResponse, send_cancellable,
    send_stream_cancellable,
};
use crate::ratelimit::{ClientRateLimiter, DEFAULT_MAX_WAIT, RateLimitTracker};
use crate::stream::collect_stream_text;
use crate::types::{ChatRequest, ModelInfo};

use super::retry::retry_after_from_headers;
use super::{ModelCatalog, ProviderMetrics};

/// Turns a non-2xx status and body into a classified error.
pub(crate) type ErrorClassifier = fn(u16, &str) -> ApiError;

#[derive(Debug, Default)]
struct MetricsRecorder {
    requests: AtomicU64,
    successes: AtomicU64,
    errors: AtomicU64,
    tokens_used: AtomicU64,
    last_latency_ms: AtomicU64,
}

impl MetricsRecorder {
    fn begin(&self) -> Instant {
        self.requests.fetch_add(1, Ordering::Relaxed);
        Instant::now()
    }

    fn finish(&self, started: Instant, ok: bool, tokens: Option<u64>) {
        let latency = started.elapsed().as_millis() as u64;
        self.last_latency_ms.store(latency, Ordering::Relaxed);
        if ok {
            self.successes.fetch_add(1, Ordering::Relaxed);
            if let Some(tokens) = tokens {
                self.tokens_used.fetch_add(tokens, Ordering::Relaxed);
            }
        } else {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> ProviderMetrics {
        ProviderMetrics {
            requests: self.requests.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            tokens_used: self.tokens_used.load(Ordering::Relaxed),
            last_latency_ms: self.last_latency_ms.load(Ordering::Relaxed),
        }
    }
}

/// State and behaviour common to all providers. Each provider owns exactly one.
pub(crate) struct ProviderCore {
    name: String,
    label: &'static str,
    provider_type: ProviderType,
    config: RwLock<ProviderConfig>,
    auth: AuthFacade,
    tracker: RateLimitTracker,
    limiter: RwLock<Option<Arc<ClientRateLimiter>>>,
    transport: DynHttpTransport,
    metrics: MetricsRecorder,
    catalog: Option<Arc<dyn ModelCatalog>>,
    classify: ErrorClassifier,
}

impl ProviderCore {
    pub(crate) fn new(
        config: ProviderConfig,
        transport: DynHttpTransport,
        label: &'static str,
        classify: ErrorClassifier,
    ) -> Result<Self, LLMError> {
        if config.name.trim().is_empty() {
            return Err(LLMError::InvalidConfig {
                field: "name".to_string(),
                reason: "provider name must not be empty".to_string(),
            });
        }
        let provider_type = config.provider_type;
        let auth = AuthFacade::from_config(&config, refresher_for(provider_type, transport.clone()))?;
        let max_wait = config
            .setting_u64("rate_limit_max_wait_secs")
            .map_or(DEFAULT_MAX_WAIT, Duration::from_secs);
        Ok(Self {
            name: config.name.clone(),
            label,
            provider_type,
            tracker: RateLimitTracker::new(provider_type).with_max_wait(max_wait),
            limiter: RwLock::new(client_limiter(&config)),
            config: RwLock::new(config),
            auth,
            transport,
            metrics: MetricsRecorder::default(),
            catalog: None,
            classify,
        })
    }

    pub(crate) fn set_catalog(&mut self, catalog: Arc<dyn ModelCatalog>) {
        self.catalog = Some(catalog);
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn provider_type(&self) -> ProviderType {
        self.provider_type
    }

    /// Snapshot of the current configuration.
    pub(crate) fn config(&self) -> ProviderConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn auth(&self) -> &AuthFacade {
        &self.auth
    }

    pub(crate) fn tracker(&self) -> &RateLimitTracker {
        &self.tracker
    }

    pub(crate) fn metrics(&self) -> ProviderMetrics {
        self.metrics.snapshot()
    }

    pub(crate) fn default_model(&self) -> String {
        self.config().effective_default_model()
    }

    /// Request model, else configured default, else the provider's built-in default.
    pub(crate) fn resolve_model(&self, request: &ChatRequest) -> String {
        request
            .model
            .clone()
            .filter(|model| !model.trim().is_empty())
            .unwrap_or_else(|| self.default_model())
    }

    pub(crate) fn capability(&self, pick: fn(&ProviderConfig) -> Option<bool>, default: bool) -> bool {
        pick(&self.config.read().unwrap_or_else(PoisonError::into_inner)).unwrap_or(default)
    }

    pub(crate) async fn models(&self) -> Result<Vec<ModelInfo>, LLMError> {
        if let Some(catalog) = &self.catalog {
            return catalog.models(self.provider_type).await;
        }
        Ok(vec![ModelInfo {
            id: self.default_model(),
            provider: self.name.clone(),
            display_name: None,
            context_window: None,
        }])
    }

    pub(crate) async fn authenticate(&self, config: AuthConfig) -> Result<(), LLMError> {
        let refresher = refresher_for(self.provider_type, self.transport.clone());
        self.auth.authenticate(&config, refresher).await
    }

    pub(crate) async fn logout(&self) {
        debug!(provider = %self.name, "logging out");
        self.auth.clear_authentication().await;
    }

    pub(crate) async fn auth_status(&self) -> AuthStatus {
        self.auth.get_auth_status().await
    }

    pub(crate) async fn refresh_all(&self, cancel: &CancellationToken) -> Result<(), LLMError> {
        self.auth.refresh_all(cancel).await
    }

    /// Overlays `update` on the current config and reloads whatever it touched.
    pub(crate) async fn configure(&self, update: ProviderConfig) -> Result<(), LLMError> {
        if update.provider_type != self.provider_type {
            return Err(LLMError::InvalidConfig {
                field: "provider_type".to_string(),
                reason: format!(
                    "cannot reconfigure {} provider as {}",
                    self.provider_type, update.provider_type
                ),
            });
        }
        let keys_changed = update.api_key.is_some() || !update.api_keys.is_empty();
        let oauth_changed = !update.oauth_credentials.is_empty();
        let merged = self.config().merged_with(update);

        if oauth_changed {
            let refresher =
                refresher_for(self.provider_type, self.transport.clone()).ok_or_else(|| {
                    LLMError::InvalidConfig {
                        field: "oauth_credentials".to_string(),
                        reason: format!("{} does not support oauth", self.provider_type),
                    }
                })?;
            self.auth
                .setup_oauth(merged.oauth_credentials.clone(), refresher)
                .await;
        }
        if keys_changed {
            self.auth.setup_api_keys(merged.all_api_keys()).await;
        }
        self.auth
            .set_header_policy(crate::auth::HeaderPolicy::from_config(&merged))
            .await;
        *self.limiter.write().unwrap_or_else(PoisonError::into_inner) = client_limiter(&merged);
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = merged;
        debug!(provider = %self.name, "provider reconfigured");
        Ok(())
    }

    /// Runs `call` while counting it in the provider metrics.
    pub(crate) async fn track<T, Fut>(
        &self,
        call: Fut,
        tokens: impl FnOnce(&T) -> Option<u64>,
    ) -> Result<T, LLMError>
    where
        Fut: Future<Output = Result<T, LLMError>>,
    {
        let started = self.metrics.begin();
        let result = call.await;
        match &result {
            Ok(value) => self.metrics.finish(started, true, tokens(value)),
            Err(err) => {
                debug!(provider = %self.name, error = %err, "request failed");
                self.metrics.finish(started, false, None);
            }
        }
        result
    }

    /// Waits for the server-reported quota and, where configured, the client limiter.
    pub(crate) async fn gate(
        &self,
        cancel: &CancellationToken,
        model: &str,
        planned_tokens: u64,
    ) -> Result<(), LLMError> {
        if !self
            .tracker
            .check_rate_limit_and_wait(cancel, model, planned_tokens)
            .await?
        {
            debug!(provider = %self.name, model, "rate limit still exhausted after bounded wait, sending anyway");
        }
        let limiter = self
            .limiter
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(limiter) = limiter {
            limiter.acquire(cancel).await?;
        }
        Ok(())
    }

    /// Sends the request produced by `build` with each credential until one succeeds.
    pub(crate) async fn send<F>(
        &self,
        cancel: &CancellationToken,
        model: &str,
        build: F,
    ) -> Result<HttpResponse, LLMError>
    where
        F: Fn(&Credential) -> Result<HttpRequest, LLMError>,
    {
        let build = &build;
        self.auth
            .execute_with_auth(cancel, move |credential| async move {
                let request = self.prepare(build, &credential, model).await?;
                let response = send_cancellable(self.transport.as_ref(), request, cancel).await?;
                self.tracker.observe(&response.headers, model).await;
                if response.is_success() {
                    return Ok(response);
                }
                let body = String::from_utf8_lossy(&response.body).into_owned();
                Err(self.reject(response.status, &response.headers, &body, model).await)
            })
            .await
    }

    /// Streaming counterpart of [`ProviderCore::send`].
    pub(crate) async fn open_stream<F>(
        &self,
        cancel: &CancellationToken,
        model: &str,
        build: F,
    ) -> Result<HttpStreamResponse, LLMError>
    where
        F: Fn(&Credential) -> Result<HttpRequest, LLMError>,
    {
        let build = &build;
        self.auth
            .execute_with_auth(cancel, move |credential| async move {
                let request = self.prepare(build, &credential, model).await?;
                let response =
                    send_stream_cancellable(self.transport.as_ref(), request, cancel).await?;
                self.tracker.observe(&response.headers, model).await;
                if (200..300).contains(&response.status) {
                    return Ok(response);
                }
                let status = response.status;
                let headers = response.headers;
                let body = collect_stream_text(response.body, self.label).await?;
                Err(self.reject(status, &headers, &body, model).await)
            })
            .await
    }

    async fn prepare<F>(
        &self,
        build: &F,
        credential: &Credential,
        model: &str,
    ) -> Result<HttpRequest, LLMError>
    where
        F: Fn(&Credential) -> Result<HttpRequest, LLMError>,
    {
        let request = build(credential)?;
        let timeout = self.config().timeout();
        debug!(
            provider = %self.name,
            model,
            auth = ?credential.mode(),
            timeout_ms = timeout.as_millis() as u64,
            "dispatching request"
        );
        Ok(self
            .auth
            .apply_credential(request, credential)
            .await?
            .with_timeout(timeout))
    }

    async fn reject(
        &self,
        status: u16,
        headers: &HashMap<String, String>,
        body: &str,
        model: &str,
    ) -> LLMError {
        let mut error = (self.classify)(status, body);
        if error.retry_after.is_none() {
            error.retry_after = retry_after_from_headers(headers);
        }
        if error.kind == ErrorKind::RateLimit {
            match error.retry_after {
                Some(wait) => self.tracker.record_retry_after(model, wait).await,
                None => warn!(provider = %self.name, model, "rate limited without retry-after"),
            }
        }
        LLMError::Api(error)
    }
}

impl std::fmt::Debug for ProviderCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderCore")
            .field("name", &self.name)
            .field("provider_type", &self.provider_type)
            .finish_non_exhaustive()
    }
}

/// Gemini publishes no quota headers, so its calls are paced locally.
fn client_limiter(config: &ProviderConfig) -> Option<Arc<ClientRateLimiter>> {
    if config.provider_type != ProviderType::Gemini {
        return None;
    }
    let limiter = match config.setting_u64("requests_per_minute") {
        Some(rpm) if rpm > 0 => ClientRateLimiter::new(u32::try_from(rpm).unwrap_or(u32::MAX)),
        _ => ClientRateLimiter::for_tier(&config.setting_str("tier").unwrap_or_default()),
    };
    Some(Arc::new(limiter))
}

/// Text of the response body, for the provider's JSON decoder.
pub(crate) fn body_text(response: HttpResponse, provider: &'static str) -> Result<String, LLMError> {
    response
        .into_string()
        .map_err(|err| LLMError::provider(provider, format!("response is not UTF-8: {err}")))
}

/// Decodes a JSON body, tagging failures with the provider label.
pub(crate) fn try_parse<T: serde::de::DeserializeOwned>(
    text: &str,
    provider: &'static str,
) -> Result<T, LLMError> {
    serde_json::from_str(text)
        .map_err(|err| LLMError::provider(provider, format!("failed to parse response: {err}")))
}
