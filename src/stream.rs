//! Provider-agnostic SSE reader producing canonical [`Chunk`]s.
//!
//! The reader consumes the body line by line. Empty lines, `:` comments and every field
//! other than `data:` are ignored, so framing noise never changes the chunk sequence.
//! Each data payload goes to a provider [`LineParser`].

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use futures_core::Stream;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::LLMError;
use crate::http::HttpBodyStream;
use crate::types::Chunk;

/// Converts one SSE data payload into a canonical chunk.
pub trait LineParser: Send {
    /// Returns `Ok(None)` for payloads that carry nothing for the consumer.
    ///
    /// # Errors
    ///
    /// Malformed payloads return an error; the reader logs and skips them.
    fn parse_line(&mut self, data: &str) -> Result<Option<Chunk>, LLMError>;

    /// Whether the payload ends the stream.
    fn is_done(&self, data: &str) -> bool;

    /// Terminal chunk for a stream that ended through `[DONE]`, a done payload without
    /// content, or end of body. Parsers fold anything they held back into it.
    fn finish(&mut self) -> Chunk {
        Chunk::terminal()
    }
}

/// Cloneable handle that closes a [`ChunkStream`] from any task.
#[derive(Debug, Clone)]
pub struct StreamCloser {
    closed: Arc<AtomicBool>,
    token: CancellationToken,
}

impl StreamCloser {
    fn new(token: CancellationToken) -> Self {
        Self {
            closed: Arc::new(AtomicBool::new(false)),
            token,
        }
    }

    /// Stops the stream and releases the body. Calling it again is a no-op.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.token.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Stream of canonical chunks.
///
/// At most one chunk with `done` set is produced and nothing follows it. Cancelling
/// the request token yields a terminal chunk whose `error` names the cancellation.
/// Transport failures surface as an `Err` item and end the stream.
pub struct ChunkStream {
    inner: BoxStream<'static, Result<Chunk, LLMError>>,
    closer: StreamCloser,
}

impl ChunkStream {
    /// Wraps an SSE body. The stream stops when `cancel` (or a parent of it) fires.
    pub fn sse(
        body: HttpBodyStream,
        parser: Box<dyn LineParser>,
        cancel: &CancellationToken,
        provider: &'static str,
    ) -> Self {
        let closer = StreamCloser::new(cancel.child_token());
        let state = SseState {
            body,
            parser,
            buffer: Vec::new(),
            pending: VecDeque::new(),
            terminal_queued: false,
            body_done: false,
            finished: false,
            closer: closer.clone(),
            provider,
        };
        let inner = stream::unfold(state, |mut state| async move {
            state.next_item().await.map(|item| (item, state))
        })
        .boxed();
        Self { inner, closer }
    }

    /// Stream that replays `chunks`, stopping after the first terminal chunk.
    pub fn from_chunks(chunks: Vec<Chunk>) -> Self {
        let mut seen_done = false;
        let items: Vec<Result<Chunk, LLMError>> = chunks
            .into_iter()
            .take_while(|chunk| {
                let keep = !seen_done;
                seen_done |= chunk.done;
                keep
            })
            .map(Ok)
            .collect();
        Self {
            inner: stream::iter(items).boxed(),
            closer: StreamCloser::new(CancellationToken::new()),
        }
    }

    /// Stream whose only item is `err`.
    pub fn failed(err: LLMError) -> Self {
        Self {
            inner: stream::once(async move { Err(err) }).boxed(),
            closer: StreamCloser::new(CancellationToken::new()),
        }
    }

    /// Closes the stream. Safe to call repeatedly and after cancellation.
    pub fn close(&self) {
        self.closer.close();
    }

    pub fn closer(&self) -> StreamCloser {
        self.closer.clone()
    }

    /// Drains the stream, concatenating chunk content.
    ///
    /// # Errors
    ///
    /// Returns the first `Err` item, or [`LLMError::StreamClosed`] for a terminal chunk
    /// carrying an error.
    pub async fn collect_text(mut self) -> Result<String, LLMError> {
        let mut text = String::new();
        while let Some(item) = self.next().await {
            let chunk = item?;
            if let Some(error) = chunk.error {
                return Err(LLMError::StreamClosed { message: error });
            }
            text.push_str(&chunk.content);
        }
        Ok(text)
    }
}

impl Stream for ChunkStream {
    type Item = Result<Chunk, LLMError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.closer.is_closed() {
            return Poll::Ready(None);
        }
        this.inner.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for ChunkStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStream")
            .field("closed", &self.closer.is_closed())
            .finish_non_exhaustive()
    }
}

struct SseState {
    body: HttpBodyStream,
    parser: Box<dyn LineParser>,
    buffer: Vec<u8>,
    pending: VecDeque<Chunk>,
    terminal_queued: bool,
    body_done: bool,
    finished: bool,
    closer: StreamCloser,
    provider: &'static str,
}

impl SseState {
    async fn next_item(&mut self) -> Option<Result<Chunk, LLMError>> {
        loop {
            if self.finished || self.closer.is_closed() {
                return None;
            }
            if self.closer.token.is_cancelled() {
                return Some(Ok(self.cancelled()));
            }
            if let Some(chunk) = self.pending.pop_front() {
                if chunk.done {
                    self.finish();
                }
                return Some(Ok(chunk));
            }
            if self.body_done {
                if !self.buffer.is_empty() {
                    let line = std::mem::take(&mut self.buffer);
                    self.handle_line(&line);
                    continue;
                }
                // Body ended without an explicit terminal payload.
                let chunk = self.terminal_chunk();
                self.finish();
                return Some(Ok(chunk));
            }

            let token = self.closer.token.clone();
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    if self.closer.is_closed() {
                        return None;
                    }
                    return Some(Ok(self.cancelled()));
                }
                next = self.body.next() => match next {
                    Some(Ok(bytes)) => {
                        self.buffer.extend_from_slice(&bytes);
                        while let Some(line) = drain_line(&mut self.buffer) {
                            self.handle_line(&line);
                        }
                    }
                    Some(Err(err)) => {
                        self.finish();
                        return Some(Err(err));
                    }
                    None => self.body_done = true,
                }
            }
        }
    }

    fn cancelled(&mut self) -> Chunk {
        debug!(provider = self.provider, "stream cancelled");
        self.finish();
        Chunk::terminal_error(LLMError::aborted("stream cancelled").to_string())
    }

    fn finish(&mut self) {
        self.finished = true;
        self.pending.clear();
        self.buffer.clear();
    }

    fn terminal_chunk(&mut self) -> Chunk {
        let mut chunk = self.parser.finish();
        chunk.done = true;
        chunk
    }

    fn queue_terminal(&mut self) {
        let chunk = self.terminal_chunk();
        self.pending.push_back(chunk);
        self.terminal_queued = true;
    }

    fn handle_line(&mut self, line: &[u8]) {
        if self.terminal_queued {
            return;
        }
        let Ok(line) = std::str::from_utf8(line) else {
            warn!(provider = self.provider, "skipping non UTF-8 stream line");
            return;
        };
        let line = line.trim_end_matches('\r');
        let Some(data) = line.strip_prefix("data:") else {
            // Empty lines, `:` comments, `event:`, `id:` and `retry:` carry nothing.
            return;
        };
        let data = data.strip_prefix(' ').unwrap_or(data);
        if data.trim().is_empty() {
            return;
        }

        if data.trim() == "[DONE]" {
            self.queue_terminal();
            return;
        }

        let done = self.parser.is_done(data);
        match self.parser.parse_line(data) {
            Ok(Some(mut chunk)) => {
                chunk.done |= done;
                self.terminal_queued = chunk.done;
                if !chunk.is_empty() {
                    self.pending.push_back(chunk);
                }
            }
            Ok(None) if done => self.queue_terminal(),
            Ok(None) => {}
            Err(err) => {
                warn!(provider = self.provider, error = %err, "skipping malformed stream line");
                if done {
                    self.queue_terminal();
                }
            }
        }
    }
}

fn drain_line(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    buffer.iter().position(|b| *b == b'\n').map(|pos| {
        let mut line: Vec<u8> = buffer.drain(..=pos).collect();
        line.pop();
        line
    })
}

/// Reads a whole (error) body into a string.
pub(crate) async fn collect_stream_text(
    mut body: HttpBodyStream,
    provider: &'static str,
) -> Result<String, LLMError> {
    let mut bytes = Vec::new();
    while let Some(chunk) = body.next().await {
        bytes.extend_from_slice(&chunk?);
    }
    String::from_utf8(bytes).map_err(|err| LLMError::Provider {
        provider,
        message: format!("failed to decode stream error body: {err}"),
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::Value;

    use super::*;

    /// Parser that reads `{"text": "...", "end": bool}` payloads.
    struct TextParser;

    impl LineParser for TextParser {
        fn parse_line(&mut self, data: &str) -> Result<Option<Chunk>, LLMError> {
            let value: Value = serde_json::from_str(data)
                .map_err(|err| LLMError::provider("test", err.to_string()))?;
            Ok(Some(Chunk::text(value["text"].as_str().unwrap_or_default())))
        }

        fn is_done(&self, data: &str) -> bool {
            data.contains("\"end\":true")
        }
    }

    fn body(parts: Vec<&'static str>) -> HttpBodyStream {
        Box::pin(stream::iter(
            parts.into_iter().map(|part| Ok(part.as_bytes().to_vec())),
        ))
    }

    fn sse(parts: Vec<&'static str>) -> ChunkStream {
        ChunkStream::sse(body(parts), Box::new(TextParser), &CancellationToken::new(), "test")
    }

    async fn drain(mut stream: ChunkStream) -> Vec<Chunk> {
        let mut out = Vec::new();
        while let Some(item) = stream.next().await {
            out.push(item.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn done_marker_ends_stream() {
        let chunks = drain(sse(vec![
            "data: {\"text\":\"a\"}\n\n",
            "data: {\"text\":\"b\"}\n\ndata: [DONE]\n\n",
            "data: {\"text\":\"ignored\"}\n\n",
        ]))
        .await;
        let contents: Vec<_> = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(contents, vec!["a", "b", ""]);
        assert_eq!(chunks.iter().filter(|c| c.done).count(), 1);
        assert!(chunks.last().unwrap().done);
    }

    #[tokio::test]
    async fn framing_noise_does_not_change_output() {
        let clean = drain(sse(vec![
            "data: {\"text\":\"one\"}\n",
            "data: {\"text\":\"two\",\"end\":true}\n",
        ]))
        .await;
        let noisy = drain(sse(vec![
            ": keep-alive\n\nevent: message\nid: 7\nretry: 100\n",
            "data:{\"text\":\"one\"}\r\n\r\n: ping\n",
            "\n\nevent: message\ndata: {\"text\":\"two\",\"end\":true}\n\n",
        ]))
        .await;
        assert_eq!(clean, noisy);
        assert_eq!(clean.len(), 2);
        assert!(clean[1].done);
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let chunks = drain(sse(vec![
            "data: {not json\n",
            "data: {\"text\":\"ok\"}\n",
            "data: [DONE]\n",
        ]))
        .await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].content, "ok");
    }

    #[tokio::test]
    async fn lines_split_across_reads_are_joined() {
        let chunks = drain(sse(vec!["da", "ta: {\"te", "xt\":\"joined\"}", "\n", "data: [DONE]"])).await;
        assert_eq!(chunks[0].content, "joined");
        assert!(chunks[1].done);
    }

    #[tokio::test]
    async fn transport_error_is_terminal() {
        let failing: HttpBodyStream = Box::pin(stream::iter(vec![
            Ok(b"data: {\"text\":\"a\"}\n".to_vec()),
            Err(LLMError::transport("reset by peer")),
            Ok(b"data: {\"text\":\"b\"}\n".to_vec()),
        ]));
        let mut stream =
            ChunkStream::sse(failing, Box::new(TextParser), &CancellationToken::new(), "test");
        assert_eq!(stream.next().await.unwrap().unwrap().content, "a");
        assert!(matches!(stream.next().await, Some(Err(LLMError::Transport { .. }))));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn cancellation_yields_one_terminal_error_chunk() {
        let cancel = CancellationToken::new();
        let pending: HttpBodyStream = Box::pin(stream::pending());
        let mut stream = ChunkStream::sse(pending, Box::new(TextParser), &cancel, "test");
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let chunk = stream.next().await.unwrap().unwrap();
        assert!(chunk.done);
        assert!(chunk.error.unwrap().contains("aborted"));
        assert!(stream.next().await.is_none());
        stream.close();
        stream.close();
    }

    #[tokio::test]
    async fn close_is_idempotent_and_ends_stream() {
        let pending: HttpBodyStream = Box::pin(stream::pending());
        let mut stream = ChunkStream::sse(pending, Box::new(TextParser), &CancellationToken::new(), "test");
        let closer = stream.closer();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            closer.close();
            closer.close();
        });
        assert!(stream.next().await.is_none());
        handle.await.unwrap();
        stream.close();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn from_chunks_stops_after_terminal() {
        let stream = ChunkStream::from_chunks(vec![
            Chunk::text("x"),
            Chunk::terminal(),
            Chunk::text("late"),
        ]);
        let chunks = drain(stream).await;
        assert_eq!(chunks.len(), 2);
    }

    #[tokio::test]
    async fn failed_stream_surfaces_error() {
        let stream = ChunkStream::failed(LLMError::transport("boom"));
        assert!(stream.collect_text().await.is_err());
    }
}
