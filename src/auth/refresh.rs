//! Provider-specific OAuth refresh-token exchanges.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::config::ProviderType;
use crate::error::LLMError;
use crate::http::{DEFAULT_REFRESH_TIMEOUT, DynHttpTransport, HttpRequest, json_request};

use super::oauth::OAuthCredential;

/// Lifetime assumed when the token endpoint omits `expires_in`.
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

const OPENAI_TOKEN_URL: &str = "https://auth.openai.com/oauth/token";
const OPENAI_CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";
const ANTHROPIC_TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";
const ANTHROPIC_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GOOGLE_CLIENT_ID: &str =
    "681255809395-oo8ft2oprdrnp9e3aqf6av3hmdib135j.apps.googleusercontent.com";
const QWEN_TOKEN_URL: &str = "https://chat.qwen.ai/api/v1/oauth2/token";
const QWEN_CLIENT_ID: &str = "f0304373b74a44d2b584a3fb70ca9e56";

/// Exchanges a credential's refresh token for a new access token.
///
/// Implementations return the whole updated record: new access token, the rotated
/// refresh token when one was issued, new expiry, incremented refresh count and
/// last-refresh timestamp.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// # Errors
    ///
    /// Returns [`LLMError::Refresh`] with `permanent` set when the provider rejected the
    /// refresh token, or a transient [`LLMError::Refresh`]/[`LLMError::Transport`].
    async fn refresh(&self, credential: &OAuthCredential) -> Result<OAuthCredential, LLMError>;
}

/// How the refresh request body is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshEncoding {
    /// `application/x-www-form-urlencoded`, client secret included when present.
    Form,
    /// JSON `{grant_type, client_id, refresh_token}`.
    Json,
}

/// Refresh-token grant against an HTTP token endpoint.
pub struct HttpTokenRefresher {
    transport: DynHttpTransport,
    endpoint: String,
    encoding: RefreshEncoding,
    default_client_id: Option<String>,
    timeout: Duration,
}

impl HttpTokenRefresher {
    pub fn new(transport: DynHttpTransport, endpoint: impl Into<String>, encoding: RefreshEncoding) -> Self {
        Self {
            transport,
            endpoint: endpoint.into(),
            encoding,
            default_client_id: None,
            timeout: DEFAULT_REFRESH_TIMEOUT,
        }
    }

    /// Client id used when the credential does not carry one.
    pub fn with_default_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.default_client_id = Some(client_id.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn build_request(&self, credential: &OAuthCredential, client_id: &str) -> Result<HttpRequest, LLMError> {
        let request = match self.encoding {
            RefreshEncoding::Form => {
                let mut fields = vec![
                    ("grant_type", "refresh_token"),
                    ("refresh_token", credential.refresh_token.as_str()),
                    ("client_id", client_id),
                ];
                if !credential.client_secret.is_empty() {
                    fields.push(("client_secret", credential.client_secret.as_str()));
                }
                HttpRequest::post_form(self.endpoint.clone(), &fields)
            }
            RefreshEncoding::Json => json_request(
                self.endpoint.clone(),
                Default::default(),
                &json!({
                    "grant_type": "refresh_token",
                    "client_id": client_id,
                    "refresh_token": credential.refresh_token,
                }),
            )?,
        };
        Ok(request
            .with_header("Accept", "application/json")
            .with_timeout(self.timeout))
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorBody {
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    error_description: Option<String>,
}

fn refresh_error_message(body: &str) -> String {
    match serde_json::from_str::<TokenErrorBody>(body) {
        Ok(parsed) => {
            let code = match parsed.error {
                Some(Value::String(code)) => code,
                Some(Value::Object(map)) => map
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
                _ => "unknown error".to_string(),
            };
            match parsed.error_description {
                Some(description) => format!("{code}: {description}"),
                None => code,
            }
        }
        Err(_) => body.chars().take(200).collect(),
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, credential: &OAuthCredential) -> Result<OAuthCredential, LLMError> {
        if credential.refresh_token.is_empty() {
            return Err(LLMError::Refresh {
                credential: credential.id.clone(),
                message: "credential has no refresh token".to_string(),
                permanent: true,
            });
        }
        let client_id = if credential.client_id.is_empty() {
            self.default_client_id.clone().unwrap_or_default()
        } else {
            credential.client_id.clone()
        };

        let request = self.build_request(credential, &client_id)?;
        let response = self.transport.send(request).await.map_err(|err| LLMError::Refresh {
            credential: credential.id.clone(),
            message: err.to_string(),
            permanent: false,
        })?;

        let status = response.status;
        let text = response.into_string()?;
        if !(200..300).contains(&status) {
            return Err(LLMError::Refresh {
                credential: credential.id.clone(),
                message: format!("token endpoint returned {status}: {}", refresh_error_message(&text)),
                // 400 invalid_grant and 401 invalid_client mean the refresh token is dead.
                permanent: matches!(status, 400 | 401),
            });
        }

        let parsed: TokenResponse = serde_json::from_str(&text).map_err(|err| LLMError::Refresh {
            credential: credential.id.clone(),
            message: format!("failed to parse token response: {err}"),
            permanent: false,
        })?;

        let now = Utc::now();
        let mut next = credential.clone();
        next.access_token = parsed.access_token;
        if let Some(rotated) = parsed.refresh_token.filter(|token| !token.is_empty()) {
            next.refresh_token = rotated;
        }
        let lifetime = parsed.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        next.expires_at = Some(now + ChronoDuration::seconds(lifetime));
        next.last_refresh = Some(now);
        next.refresh_count += 1;
        if next.client_id.is_empty() {
            next.client_id = client_id;
        }
        if let Some(scope) = parsed.scope {
            next.scopes = scope.split_whitespace().map(str::to_string).collect();
        }
        if let Some(token_type) = parsed.token_type {
            next.extra.insert("token_type".to_string(), Value::String(token_type));
        }
        if let Some(id_token) = parsed.id_token {
            next.extra.insert("id_token".to_string(), Value::String(id_token));
        }

        debug!(credential = %next.id, expires_in = lifetime, refresh_count = next.refresh_count, "oauth token refreshed");
        Ok(next)
    }
}

/// Builds the refresher for a provider family, or `None` when it has no OAuth flow.
pub fn refresher_for(provider: ProviderType, transport: DynHttpTransport) -> Option<Arc<dyn TokenRefresher>> {
    let refresher = match provider {
        ProviderType::OpenAi => HttpTokenRefresher::new(transport, OPENAI_TOKEN_URL, RefreshEncoding::Form)
            .with_default_client_id(OPENAI_CLIENT_ID),
        ProviderType::Anthropic => {
            HttpTokenRefresher::new(transport, ANTHROPIC_TOKEN_URL, RefreshEncoding::Json)
                .with_default_client_id(ANTHROPIC_CLIENT_ID)
        }
        ProviderType::Gemini => HttpTokenRefresher::new(transport, GOOGLE_TOKEN_URL, RefreshEncoding::Form)
            .with_default_client_id(GOOGLE_CLIENT_ID),
        ProviderType::Qwen => HttpTokenRefresher::new(transport, QWEN_TOKEN_URL, RefreshEncoding::Form)
            .with_default_client_id(QWEN_CLIENT_ID),
        ProviderType::OpenRouter | ProviderType::Cerebras | ProviderType::OpenAiCompatible => {
            return None;
        }
    };
    Some(Arc::new(refresher))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::http::{HttpResponse, HttpStreamResponse, HttpTransport};

    struct RecordingTransport {
        status: u16,
        body: String,
        seen: Mutex<Vec<HttpRequest>>,
    }

    impl RecordingTransport {
        fn new(status: u16, body: &str) -> Arc<Self> {
            Arc::new(Self {
                status,
                body: body.to_string(),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl HttpTransport for RecordingTransport {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, LLMError> {
            self.seen.lock().unwrap().push(request);
            Ok(HttpResponse {
                status: self.status,
                headers: Default::default(),
                body: self.body.clone().into_bytes(),
            })
        }

        async fn send_stream(&self, _request: HttpRequest) -> Result<HttpStreamResponse, LLMError> {
            panic!("send_stream should not be called");
        }
    }

    fn credential() -> OAuthCredential {
        OAuthCredential::new("c1").with_refresh_token("rt-old")
    }

    #[tokio::test]
    async fn form_refresh_adopts_rotated_token() {
        let transport = RecordingTransport::new(
            200,
            r#"{"access_token":"at-new","refresh_token":"rt-new","expires_in":120,"token_type":"Bearer"}"#,
        );
        let refresher = refresher_for(ProviderType::Qwen, transport.clone()).unwrap();
        let next = refresher.refresh(&credential()).await.unwrap();
        assert_eq!(next.access_token, "at-new");
        assert_eq!(next.refresh_token, "rt-new");
        assert_eq!(next.refresh_count, 1);
        let lifetime = next.expires_at.unwrap() - Utc::now();
        assert!(lifetime.num_seconds() > 100 && lifetime.num_seconds() <= 120);

        let seen = transport.seen.lock().unwrap();
        let body = String::from_utf8(seen[0].body.clone().unwrap()).unwrap();
        assert!(body.contains("grant_type=refresh_token"), "{body}");
        assert!(body.contains("refresh_token=rt-old"), "{body}");
        assert!(body.contains(&format!("client_id={QWEN_CLIENT_ID}")), "{body}");
        assert!(!body.contains("client_secret"), "{body}");
        assert_eq!(seen[0].timeout, Some(DEFAULT_REFRESH_TIMEOUT));
    }

    #[tokio::test]
    async fn endpoint_and_timeout_can_be_overridden() {
        let transport = RecordingTransport::new(200, r#"{"access_token":"at-new"}"#);
        let refresher = HttpTokenRefresher::new(transport.clone(), "https://unused.example", RefreshEncoding::Json)
            .with_endpoint("https://sso.example/oauth/token")
            .with_timeout(Duration::from_secs(3));
        refresher.refresh(&credential()).await.unwrap();

        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen[0].url, "https://sso.example/oauth/token");
        assert_eq!(seen[0].timeout, Some(Duration::from_secs(3)));
    }

    #[tokio::test]
    async fn json_refresh_keeps_old_token_and_defaults_expiry() {
        let transport = RecordingTransport::new(200, r#"{"access_token":"at-new"}"#);
        let refresher = refresher_for(ProviderType::Anthropic, transport.clone()).unwrap();
        let next = refresher.refresh(&credential()).await.unwrap();
        assert_eq!(next.refresh_token, "rt-old");
        let lifetime = next.expires_at.unwrap() - Utc::now();
        assert!(lifetime.num_seconds() > 3500);

        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen[0].header("content-type"), Some("application/json"));
        let body: Value = serde_json::from_slice(seen[0].body.as_ref().unwrap()).unwrap();
        assert_eq!(body["grant_type"], "refresh_token");
        assert_eq!(body["client_id"], ANTHROPIC_CLIENT_ID);
        assert_eq!(body["refresh_token"], "rt-old");
    }

    #[tokio::test]
    async fn client_secret_is_sent_for_google() {
        let transport = RecordingTransport::new(200, r#"{"access_token":"at"}"#);
        let refresher = refresher_for(ProviderType::Gemini, transport.clone()).unwrap();
        let cred = credential().with_client("my-client", "my-secret");
        refresher.refresh(&cred).await.unwrap();
        let seen = transport.seen.lock().unwrap();
        let body = String::from_utf8(seen[0].body.clone().unwrap()).unwrap();
        assert!(body.contains("client_id=my-client"), "{body}");
        assert!(body.contains("client_secret=my-secret"), "{body}");
    }

    #[tokio::test]
    async fn invalid_grant_is_permanent() {
        let transport = RecordingTransport::new(
            400,
            r#"{"error":"invalid_grant","error_description":"refresh token revoked"}"#,
        );
        let refresher = refresher_for(ProviderType::OpenAi, transport).unwrap();
        match refresher.refresh(&credential()).await {
            Err(LLMError::Refresh { permanent, message, .. }) => {
                assert!(permanent);
                assert!(message.contains("invalid_grant"), "{message}");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let transport = RecordingTransport::new(503, "unavailable");
        let refresher = refresher_for(ProviderType::OpenAi, transport).unwrap();
        match refresher.refresh(&credential()).await {
            Err(LLMError::Refresh { permanent: false, .. }) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn key_only_providers_have_no_refresher() {
        let transport: DynHttpTransport = RecordingTransport::new(200, "{}");
        assert!(refresher_for(ProviderType::OpenRouter, transport.clone()).is_none());
        assert!(refresher_for(ProviderType::Cerebras, transport).is_none());
    }
}
