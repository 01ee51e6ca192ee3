use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_core::Stream;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::LLMError;

/// Timeout applied to chat requests when the provider config does not set one.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
/// Timeout applied to OAuth token endpoint calls.
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(10);

/// Enumerates HTTP methods understood by the lightweight transport abstraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// Minimal HTTP request representation shared across providers.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    /// Builds a POST request with a JSON request body.
    ///
    /// # Examples
    ///
    /// ```
    /// use llm_relay::http::{HttpMethod, HttpRequest};
    ///
    /// let request = HttpRequest::post_json("https://example.com", br"{}".to_vec());
    /// assert_eq!(request.method, HttpMethod::Post);
    /// assert_eq!(request.header("content-type"), Some("application/json"));
    /// ```
    pub fn post_json(url: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            method: HttpMethod::Post,
            url: url.into(),
            headers: HashMap::from([("Content-Type".to_string(), "application/json".to_string())]),
            body: Some(body),
            timeout: None,
        }
    }

    /// Builds a POST request with an `application/x-www-form-urlencoded` body.
    ///
    /// # Examples
    ///
    /// ```
    /// use llm_relay::http::HttpRequest;
    ///
    /// let request = HttpRequest::post_form(
    ///     "https://example.com/token",
    ///     &[("grant_type", "refresh_token"), ("refresh_token", "a b")],
    /// );
    /// assert_eq!(request.body.as_deref(), Some(&b"grant_type=refresh_token&refresh_token=a+b"[..]));
    /// ```
    pub fn post_form(url: impl Into<String>, fields: &[(&str, &str)]) -> Self {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(fields.iter().copied())
            .finish();
        Self {
            method: HttpMethod::Post,
            url: url.into(),
            headers: HashMap::from([(
                "Content-Type".to_string(),
                "application/x-www-form-urlencoded".to_string(),
            )]),
            body: Some(body.into_bytes()),
            timeout: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            headers: HashMap::new(),
            body: None,
            timeout: None,
        }
    }

    /// Merges `headers` into the request, replacing entries with the same name.
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        for (name, value) in headers {
            self = self.with_header(name, value);
        }
        self
    }

    /// Sets a single header, replacing any existing value regardless of case.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        self.headers.retain(|existing, _| !existing.eq_ignore_ascii_case(&name));
        self.headers.insert(name, value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }
}

/// Looks up a header in a map without regard to case.
pub fn header_value<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Minimal HTTP response representation.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Converts the body into a UTF-8 string.
    ///
    /// # Errors
    ///
    /// Returns [`LLMError::Transport`] when the body cannot be interpreted as UTF-8.
    pub fn into_string(self) -> Result<String, LLMError> {
        String::from_utf8(self.body).map_err(|err| LLMError::transport(err.to_string()))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// HTTP response that carries a streaming body.
pub struct HttpStreamResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: HttpBodyStream,
}

impl std::fmt::Debug for HttpStreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpStreamResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Alias for the body stream returned by [`HttpTransport::send_stream`].
pub type HttpBodyStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, LLMError>> + Send>>;

/// Transport abstraction used to decouple providers from the concrete HTTP client.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Sends a request and resolves when the full response is available.
    ///
    /// # Examples
    ///
    /// ```
    /// # use async_trait::async_trait;
    /// # use llm_relay::http::{HttpTransport, HttpRequest, HttpResponse, HttpStreamResponse};
    /// # use llm_relay::error::LLMError;
    /// # use futures_util::stream;
    /// struct MemoryTransport;
    ///
    /// #[async_trait]
    /// impl HttpTransport for MemoryTransport {
    ///     async fn send(&self, request: HttpRequest) -> Result<HttpResponse, LLMError> {
    ///         Ok(HttpResponse { status: 200, headers: request.headers, body: b"ok".to_vec() })
    ///     }
    ///     async fn send_stream(&self, request: HttpRequest) -> Result<HttpStreamResponse, LLMError> {
    ///         Ok(HttpStreamResponse { status: 200, headers: request.headers, body: Box::pin(stream::empty()) })
    ///     }
    /// }
    ///
    /// # tokio::runtime::Runtime::new().unwrap().block_on(async {
    /// let response = MemoryTransport
    ///     .send(HttpRequest::post_json("https://example.com", br"{}".to_vec()))
    ///     .await
    ///     .unwrap();
    /// assert_eq!(response.status, 200);
    /// # });
    /// ```
    ///
    /// # Errors
    ///
    /// Implementations should map transport failures to [`LLMError::Transport`].
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, LLMError>;

    /// Sends a request and returns a streaming body.
    ///
    /// # Errors
    ///
    /// Implementations should return [`LLMError::Transport`] for network failures.
    async fn send_stream(&self, request: HttpRequest) -> Result<HttpStreamResponse, LLMError>;
}

/// Thread-safe handle to a transport implementation.
pub type DynHttpTransport = Arc<dyn HttpTransport>;

/// Sends `request`, giving up with [`LLMError::Aborted`] as soon as `cancel` fires.
pub async fn send_cancellable(
    transport: &dyn HttpTransport,
    request: HttpRequest,
    cancel: &CancellationToken,
) -> Result<HttpResponse, LLMError> {
    if cancel.is_cancelled() {
        return Err(LLMError::aborted("cancelled before the request was sent"));
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(LLMError::aborted("cancelled while waiting for the response")),
        result = transport.send(request) => result,
    }
}

/// Streaming counterpart of [`send_cancellable`].
pub async fn send_stream_cancellable(
    transport: &dyn HttpTransport,
    request: HttpRequest,
    cancel: &CancellationToken,
) -> Result<HttpStreamResponse, LLMError> {
    if cancel.is_cancelled() {
        return Err(LLMError::aborted("cancelled before the request was sent"));
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(LLMError::aborted("cancelled while opening the stream")),
        result = transport.send_stream(request) => result,
    }
}

/// Serializes a body to JSON and builds a POST request carrying `headers`.
///
/// # Errors
///
/// Returns [`LLMError::Validation`] if serialization fails.
pub fn json_request<T: Serialize>(
    url: impl Into<String>,
    headers: HashMap<String, String>,
    body: &T,
) -> Result<HttpRequest, LLMError> {
    let payload = serde_json::to_vec(body).map_err(|err| LLMError::Validation {
        message: format!("failed to serialize request: {err}"),
    })?;
    Ok(HttpRequest::post_json(url, payload).with_headers(headers))
}

pub mod reqwest;

#[cfg(test)]
mod tests {
    use super::*;
    use serde::ser;

    /// Body type that intentionally fails serialization to trigger validation errors.
    struct NonSerializableBody;

    impl Serialize for NonSerializableBody {
        fn serialize<S>(&self, _serializer: S) -> Result<S::Ok, S::Error>
        where
            S: serde::Serializer,
        {
            Err(ser::Error::custom("intentional serialization failure for test"))
        }
    }

    struct PendingTransport;

    #[async_trait]
    impl HttpTransport for PendingTransport {
        async fn send(&self, _request: HttpRequest) -> Result<HttpResponse, LLMError> {
            futures_util::future::pending().await
        }

        async fn send_stream(&self, _request: HttpRequest) -> Result<HttpStreamResponse, LLMError> {
            futures_util::future::pending().await
        }
    }

    #[test]
    fn json_request_returns_validation_on_serde_error() {
        match json_request("http://example.com", HashMap::new(), &NonSerializableBody) {
            Err(LLMError::Validation { message }) => {
                assert!(
                    message.contains("failed to serialize request"),
                    "unexpected validation message: {message}"
                );
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn with_header_replaces_case_insensitively() {
        let request = HttpRequest::post_json("http://example.com", Vec::new())
            .with_header("content-type", "text/plain");
        assert_eq!(request.headers.len(), 1);
        assert_eq!(request.header("Content-Type"), Some("text/plain"));
    }

    #[tokio::test]
    async fn cancelled_send_is_aborted() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let request = HttpRequest::get("http://example.com");
        match send_cancellable(&PendingTransport, request, &cancel).await {
            Err(LLMError::Aborted { .. }) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
