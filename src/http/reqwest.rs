use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, Response};
use tracing::debug;

use crate::error::LLMError;

use super::{
    DynHttpTransport, HttpBodyStream, HttpMethod, HttpRequest, HttpResponse, HttpStreamResponse,
    HttpTransport,
};

const USER_AGENT: &str = concat!("llm-relay/", env!("CARGO_PKG_VERSION"));
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default [`HttpTransport`] backed by `reqwest`.
///
/// Per-request timeouts come from [`HttpRequest::timeout`]; the client itself only bounds
/// connection setup so long-lived SSE bodies are not cut off.
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Builds a transport with the crate's user agent and connect timeout.
    pub fn default_client() -> Result<Self, LLMError> {
        Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map(Self::new)
            .map_err(|err| LLMError::transport(format!("failed to create reqwest client: {err}")))
    }

    async fn execute(&self, request: HttpRequest) -> Result<Response, LLMError> {
        let HttpRequest { method, url, headers, body, timeout } = request;
        let method = match method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
        };

        let mut builder = self.client.request(method, &url).headers(header_map(headers)?);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }

        builder.send().await.map_err(|err| {
            if err.is_timeout() {
                LLMError::transport(format!("request to {} timed out", redact_query(&url)))
            } else if err.is_connect() {
                LLMError::transport(format!("failed to connect to {}: {err}", redact_query(&url)))
            } else {
                LLMError::transport(err.without_url().to_string())
            }
        })
    }
}

fn header_map(headers: HashMap<String, String>) -> Result<HeaderMap, LLMError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| LLMError::transport(format!("invalid header name {name:?}: {err}")))?;
        let mut value = HeaderValue::from_str(&value)
            .map_err(|err| LLMError::transport(format!("invalid value for header {name}: {err}")))?;
        if is_secret_header(&name) {
            value.set_sensitive(true);
        }
        map.insert(name, value);
    }
    Ok(map)
}

fn is_secret_header(name: &HeaderName) -> bool {
    matches!(name.as_str(), "authorization" | "x-api-key" | "x-goog-api-key")
}

/// Response headers flattened with lowercase names; non-UTF-8 values become empty strings.
fn flatten_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| (name.as_str().to_owned(), value.to_str().unwrap_or_default().to_owned()))
        .collect()
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, LLMError> {
        debug!(method = ?request.method, url = %redact_query(&request.url), "sending request");
        let response = self.execute(request).await?;

        let status = response.status().as_u16();
        let headers = flatten_headers(response.headers());
        let body = response
            .bytes()
            .await
            .map_err(|err| LLMError::transport(format!("failed to read response body: {err}")))?
            .to_vec();
        debug!(status, bytes = body.len(), "received response");

        Ok(HttpResponse { status, headers, body })
    }

    async fn send_stream(&self, request: HttpRequest) -> Result<HttpStreamResponse, LLMError> {
        debug!(method = ?request.method, url = %redact_query(&request.url), "opening stream");
        let response = self.execute(request).await?;

        let status = response.status().as_u16();
        let headers = flatten_headers(response.headers());
        let body: HttpBodyStream = Box::pin(response.bytes_stream().map(|piece| {
            piece
                .map(|bytes| bytes.to_vec())
                .map_err(|err| LLMError::transport(format!("stream interrupted: {err}")))
        }));

        Ok(HttpStreamResponse { status, headers, body })
    }
}

/// Strips the query string so `?key=` credentials never reach the logs.
fn redact_query(url: &str) -> &str {
    url.split_once('?').map_or(url, |(base, _)| base)
}

/// Builds a shareable transport over [`ReqwestTransport::default_client`].
pub fn default_dyn_transport() -> Result<DynHttpTransport, LLMError> {
    Ok(Arc::new(ReqwestTransport::default_client()?))
}
