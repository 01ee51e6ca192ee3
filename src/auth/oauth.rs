use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ErrorKind, LLMError};

use super::refresh::TokenRefresher;

/// Tokens closer than this to their expiry are refreshed before use.
pub const DEFAULT_REFRESH_MARGIN_SECS: i64 = 60;

/// One OAuth credential set as loaded from configuration.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthCredential {
    pub id: String,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub client_id: String,
    /// Empty for public clients.
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub issued_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_refresh: Option<DateTime<Utc>>,
    #[serde(default)]
    pub refresh_count: u32,
    /// Provider-specific extension fields.
    #[serde(default)]
    pub extra: HashMap<String, Value>,
}

impl OAuthCredential {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            access_token: String::new(),
            refresh_token: String::new(),
            expires_at: None,
            client_id: String::new(),
            client_secret: String::new(),
            scopes: Vec::new(),
            issued_at: None,
            last_refresh: None,
            refresh_count: 0,
            extra: HashMap::new(),
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        self.access_token = token.into();
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_refresh_token(mut self, token: impl Into<String>) -> Self {
        self.refresh_token = token.into();
        self
    }

    pub fn with_client(mut self, client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self.client_secret = client_secret.into();
        self
    }

    /// Whether the access token can be used for at least `margin` more.
    ///
    /// A token without a recorded expiry is taken at face value.
    pub fn is_fresh(&self, now: DateTime<Utc>, margin: ChronoDuration) -> bool {
        !self.access_token.is_empty() && self.expires_at.is_none_or(|expiry| expiry > now + margin)
    }

    /// A credential is usable while it holds a live access token or a refresh token.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.is_fresh(now, ChronoDuration::zero()) || !self.refresh_token.is_empty()
    }

    /// Copy with every secret blanked, for logs and config dumps.
    pub fn sanitized(&self) -> Self {
        Self {
            access_token: String::new(),
            refresh_token: String::new(),
            client_secret: String::new(),
            ..self.clone()
        }
    }
}

impl fmt::Debug for OAuthCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthCredential")
            .field("id", &self.id)
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("client_id", &self.client_id)
            .field("scopes", &self.scopes)
            .field("last_refresh", &self.last_refresh)
            .field("refresh_count", &self.refresh_count)
            .finish_non_exhaustive()
    }
}

/// Lifecycle state of a managed credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialState {
    /// Usable. A stale access token is refreshed on next use.
    Valid,
    /// A refresh is in flight; callers wait for it.
    Refreshing,
    /// Refresh or use failed; skipped until [`OAuthManager::reset`].
    Expired,
    /// The provider rejected the refresh token.
    Invalid,
}

/// Read-only view of one credential for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CredentialStatus {
    pub id: String,
    pub state: CredentialState,
    pub expires_at: Option<DateTime<Utc>>,
    pub refresh_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Health {
    Active,
    Expired,
    Invalid,
}

struct Slot {
    credential: OAuthCredential,
    health: Health,
    refreshing: bool,
    gate: Arc<Mutex<()>>,
}

impl Slot {
    fn new(credential: OAuthCredential) -> Self {
        Self {
            credential,
            health: Health::Active,
            refreshing: false,
            gate: Arc::new(Mutex::new(())),
        }
    }

    fn state(&self) -> CredentialState {
        match (self.health, self.refreshing) {
            (Health::Invalid, _) => CredentialState::Invalid,
            (Health::Expired, _) => CredentialState::Expired,
            (Health::Active, true) => CredentialState::Refreshing,
            (Health::Active, false) => CredentialState::Valid,
        }
    }
}

/// Holds OAuth credentials and keeps their access tokens fresh.
///
/// Refreshes are single-flight per credential: concurrent callers that find the same
/// stale token queue behind one refresh and all observe its result.
pub struct OAuthManager {
    provider: String,
    margin: ChronoDuration,
    refresher: Arc<dyn TokenRefresher>,
    slots: RwLock<Vec<Slot>>,
}

impl OAuthManager {
    /// Builds a manager, dropping credentials that can never produce a token.
    pub fn new(
        provider: impl Into<String>,
        credentials: impl IntoIterator<Item = OAuthCredential>,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Self {
        let provider = provider.into();
        let now = Utc::now();
        let slots = credentials
            .into_iter()
            .filter(|credential| {
                let usable = credential.is_usable(now);
                if !usable {
                    warn!(
                        provider = %provider,
                        credential = %credential.id,
                        "dropping oauth credential without access or refresh token"
                    );
                }
                usable
            })
            .map(Slot::new)
            .collect();
        Self {
            provider,
            margin: ChronoDuration::seconds(DEFAULT_REFRESH_MARGIN_SECS),
            refresher,
            slots: RwLock::new(slots),
        }
    }

    pub fn with_margin(mut self, margin: std::time::Duration) -> Self {
        self.margin = ChronoDuration::from_std(margin).unwrap_or(self.margin);
        self
    }

    /// Credentials in their configured order.
    pub async fn credentials(&self) -> Vec<OAuthCredential> {
        self.slots
            .read()
            .await
            .iter()
            .map(|slot| slot.credential.clone())
            .collect()
    }

    pub async fn status(&self) -> Vec<CredentialStatus> {
        self.slots
            .read()
            .await
            .iter()
            .map(|slot| CredentialStatus {
                id: slot.credential.id.clone(),
                state: slot.state(),
                expires_at: slot.credential.expires_at,
                refresh_count: slot.credential.refresh_count,
            })
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.read().await.is_empty()
    }

    /// Number of credentials that are neither expired nor invalid.
    pub async fn usable_count(&self) -> usize {
        self.slots
            .read()
            .await
            .iter()
            .filter(|slot| slot.health == Health::Active)
            .count()
    }

    /// Adds or replaces a credential.
    ///
    /// # Errors
    ///
    /// Returns [`LLMError::InvalidConfig`] when the credential has neither a live access
    /// token nor a refresh token.
    pub async fn add_credential(&self, credential: OAuthCredential) -> Result<(), LLMError> {
        if !credential.is_usable(Utc::now()) {
            return Err(LLMError::InvalidConfig {
                field: "oauth_credentials".to_string(),
                reason: format!(
                    "credential {} has neither a live access token nor a refresh token",
                    credential.id
                ),
            });
        }
        let mut slots = self.slots.write().await;
        match slots.iter_mut().find(|slot| slot.credential.id == credential.id) {
            Some(slot) => *slot = Slot::new(credential),
            None => slots.push(Slot::new(credential)),
        }
        Ok(())
    }

    pub async fn remove_credential(&self, id: &str) -> bool {
        let mut slots = self.slots.write().await;
        let before = slots.len();
        slots.retain(|slot| slot.credential.id != id);
        slots.len() != before
    }

    /// Returns every expired or invalid credential to service.
    pub async fn reset(&self) {
        for slot in self.slots.write().await.iter_mut() {
            slot.health = Health::Active;
        }
    }

    pub async fn clear(&self) {
        self.slots.write().await.clear();
    }

    /// Returns an access token for `id` valid for at least the refresh margin.
    ///
    /// # Errors
    ///
    /// Returns [`LLMError::Refresh`] when the credential is quarantined or its refresh
    /// fails, [`LLMError::NoCredentials`] for an unknown id, and [`LLMError::Aborted`]
    /// on cancellation.
    pub async fn access_token_for(
        &self,
        cancel: &CancellationToken,
        id: &str,
    ) -> Result<String, LLMError> {
        let gate = match self.fresh_token_or_gate(id).await? {
            Ok(token) => return Ok(token),
            Err(gate) => gate,
        };

        let _guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LLMError::aborted("cancelled while waiting for token refresh")),
            guard = gate.lock() => guard,
        };

        // Another caller may have refreshed while this one waited on the gate.
        if let Ok(token) = self.fresh_token_or_gate(id).await? {
            return Ok(token);
        }
        self.refresh_locked(cancel, id).await
    }

    /// Refreshes every usable credential in parallel.
    ///
    /// # Errors
    ///
    /// Returns [`LLMError::Aggregate`] holding every failed refresh.
    pub async fn refresh_all(&self, cancel: &CancellationToken) -> Result<(), LLMError> {
        let targets: Vec<(String, Arc<Mutex<()>>)> = self
            .slots
            .read()
            .await
            .iter()
            .filter(|slot| slot.health != Health::Invalid)
            .map(|slot| (slot.credential.id.clone(), slot.gate.clone()))
            .collect();

        let results = join_all(targets.into_iter().map(|(id, gate)| async move {
            let _guard = gate.lock().await;
            self.refresh_locked(cancel, &id).await
        }))
        .await;

        let errors: Vec<LLMError> = results.into_iter().filter_map(Result::err).collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(LLMError::Aggregate { errors })
        }
    }

    /// Runs `op` with each usable credential, in configured order, until one succeeds.
    ///
    /// Each credential handed to `op` carries a fresh access token. Auth failures
    /// quarantine the credential; rate-limit failures move on to the next credential.
    ///
    /// # Errors
    ///
    /// Returns the last failure, [`LLMError::NoCredentials`] when nothing is usable, or
    /// [`LLMError::Aborted`] on cancellation.
    pub async fn execute_with_failover<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, LLMError>
    where
        F: FnMut(OAuthCredential) -> Fut,
        Fut: Future<Output = Result<T, LLMError>>,
    {
        let ids: Vec<String> = self
            .slots
            .read()
            .await
            .iter()
            .filter(|slot| slot.health == Health::Active)
            .map(|slot| slot.credential.id.clone())
            .collect();

        let mut last_error = None;
        for id in ids {
            if cancel.is_cancelled() {
                return Err(LLMError::aborted("cancelled during oauth failover"));
            }
            if let Err(err) = self.access_token_for(cancel, &id).await {
                if err.is_aborted() {
                    return Err(err);
                }
                warn!(provider = %self.provider, credential = %id, error = %err, "oauth credential unavailable");
                last_error = Some(err);
                continue;
            }
            let Some(credential) = self.snapshot(&id).await else {
                continue;
            };

            match op(credential).await {
                Ok(value) => return Ok(value),
                Err(err) if err.stops_failover() => return Err(err),
                Err(err) => {
                    match err.kind() {
                        ErrorKind::Auth => {
                            warn!(provider = %self.provider, credential = %id, error = %err, "quarantining oauth credential");
                            self.set_health(&id, Health::Expired).await;
                        }
                        ErrorKind::RateLimit => {
                            warn!(
                                provider = %self.provider,
                                credential = %id,
                                retry_after_ms = err.retry_after().map(|wait| wait.as_millis() as u64),
                                "oauth credential rate limited, trying next"
                            );
                        }
                        _ => {
                            warn!(provider = %self.provider, credential = %id, error = %err, "oauth credential failed, trying next");
                        }
                    }
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| LLMError::NoCredentials {
            provider: format!("{} (no usable oauth credentials)", self.provider),
        }))
    }

    async fn snapshot(&self, id: &str) -> Option<OAuthCredential> {
        self.slots
            .read()
            .await
            .iter()
            .find(|slot| slot.credential.id == id)
            .map(|slot| slot.credential.clone())
    }

    /// `Ok(Ok(token))` when no refresh is needed, `Ok(Err(gate))` otherwise.
    async fn fresh_token_or_gate(
        &self,
        id: &str,
    ) -> Result<Result<String, Arc<Mutex<()>>>, LLMError> {
        let slots = self.slots.read().await;
        let slot = slots
            .iter()
            .find(|slot| slot.credential.id == id)
            .ok_or_else(|| LLMError::NoCredentials {
                provider: format!("{} (unknown oauth credential {id})", self.provider),
            })?;
        match slot.health {
            Health::Invalid => Err(LLMError::Refresh {
                credential: id.to_string(),
                message: "refresh token was rejected".to_string(),
                permanent: true,
            }),
            Health::Expired => Err(LLMError::Refresh {
                credential: id.to_string(),
                message: "credential is quarantined until reset".to_string(),
                permanent: false,
            }),
            Health::Active if slot.credential.is_fresh(Utc::now(), self.margin) => {
                Ok(Ok(slot.credential.access_token.clone()))
            }
            Health::Active => Ok(Err(slot.gate.clone())),
        }
    }

    /// Performs the refresh. The caller must hold the credential's gate.
    async fn refresh_locked(&self, cancel: &CancellationToken, id: &str) -> Result<String, LLMError> {
        let current = {
            let mut slots = self.slots.write().await;
            let Some(slot) = slots.iter_mut().find(|slot| slot.credential.id == id) else {
                return Err(LLMError::NoCredentials {
                    provider: format!("{} (unknown oauth credential {id})", self.provider),
                });
            };
            slot.refreshing = true;
            slot.credential.clone()
        };

        debug!(provider = %self.provider, credential = %id, refresh_count = current.refresh_count, "refreshing oauth token");
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LLMError::aborted("cancelled during token refresh")),
            result = self.refresher.refresh(&current) => result,
        };

        let mut slots = self.slots.write().await;
        let Some(slot) = slots.iter_mut().find(|slot| slot.credential.id == id) else {
            return outcome.map(|credential| credential.access_token);
        };
        slot.refreshing = false;
        match outcome {
            Ok(credential) => {
                let token = credential.access_token.clone();
                slot.credential = credential;
                slot.health = Health::Active;
                Ok(token)
            }
            Err(err) => {
                match &err {
                    LLMError::Aborted { .. } => {}
                    LLMError::Refresh { permanent: true, .. } => {
                        warn!(provider = %self.provider, credential = %id, "refresh token rejected, credential invalid");
                        slot.health = Health::Invalid;
                    }
                    _ => {
                        warn!(provider = %self.provider, credential = %id, error = %err, "token refresh failed");
                        slot.health = Health::Expired;
                    }
                }
                Err(err)
            }
        }
    }

    async fn set_health(&self, id: &str, health: Health) {
        if let Some(slot) = self
            .slots
            .write()
            .await
            .iter_mut()
            .find(|slot| slot.credential.id == id)
        {
            slot.health = health;
        }
    }
}

impl fmt::Debug for OAuthManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthManager")
            .field("provider", &self.provider)
            .field("margin", &self.margin)
            .finish_non_exhaustive()
    }
}
