#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::stream;
use llm_relay::error::LLMError;
use llm_relay::http::{DynHttpTransport, HttpRequest, HttpResponse, HttpStreamResponse, HttpTransport};
use serde_json::Value;

/// Canned answer for one request.
pub struct MockReply {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl MockReply {
    pub fn json(status: u16, body: Value) -> Self {
        Self {
            status,
            headers: HashMap::from([("content-type".to_string(), "application/json".to_string())]),
            body: body.to_string(),
        }
    }

    pub fn sse(body: &str) -> Self {
        Self {
            status: 200,
            headers: HashMap::from([("content-type".to_string(), "text/event-stream".to_string())]),
            body: body.to_string(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }
}

type Handler = Box<dyn Fn(&HttpRequest) -> MockReply + Send + Sync>;

/// In-memory transport that records every request and answers through `handler`.
///
/// Streaming bodies are cut into small pieces so SSE lines straddle chunk boundaries.
pub struct MockTransport {
    handler: Handler,
    requests: Mutex<Vec<HttpRequest>>,
}

impl MockTransport {
    pub fn new(handler: impl Fn(&HttpRequest) -> MockReply + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn dyn_transport(self: &Arc<Self>) -> DynHttpTransport {
        self.clone()
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Number of requests whose URL contains `needle`.
    pub fn calls_to(&self, needle: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|request| request.url.contains(needle))
            .count()
    }

    fn answer(&self, request: HttpRequest) -> MockReply {
        let reply = (self.handler)(&request);
        self.requests.lock().unwrap().push(request);
        reply
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, LLMError> {
        tokio::task::yield_now().await;
        let reply = self.answer(request);
        Ok(HttpResponse {
            status: reply.status,
            headers: reply.headers,
            body: reply.body.into_bytes(),
        })
    }

    async fn send_stream(&self, request: HttpRequest) -> Result<HttpStreamResponse, LLMError> {
        tokio::task::yield_now().await;
        let reply = self.answer(request);
        let pieces: Vec<Result<Vec<u8>, LLMError>> = reply
            .body
            .into_bytes()
            .chunks(7)
            .map(|piece| Ok(piece.to_vec()))
            .collect();
        Ok(HttpStreamResponse {
            status: reply.status,
            headers: reply.headers,
            body: Box::pin(stream::iter(pieces)),
        })
    }
}

/// Decoded JSON body of a recorded request.
pub fn json_body(request: &HttpRequest) -> Value {
    serde_json::from_slice(request.body.as_deref().unwrap_or_default()).unwrap()
}
