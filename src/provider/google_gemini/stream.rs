use crate::error::LLMError;
use crate::stream::LineParser;
use crate::types::{Chunk, ToolCallDelta};

use super::response::{blocked_reason, convert_finish_reason, convert_usage, decode_response};

/// Line parser for `streamGenerateContent?alt=sse`.
///
/// Every payload is a full `GenerateContentResponse`; the stream ends on the first
/// candidate carrying a `finishReason`. Function calls arrive whole and get the same
/// `call_N` ids a non-streamed response would.
#[derive(Debug, Default)]
pub struct GeminiLineParser {
    calls_seen: usize,
}

impl GeminiLineParser {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LineParser for GeminiLineParser {
    fn parse_line(&mut self, data: &str) -> Result<Option<Chunk>, LLMError> {
        let parsed = decode_response(data).map_err(|err| {
            LLMError::provider("google_gemini", format!("failed to parse stream chunk: {err}"))
        })?;
        let mut chunk = Chunk {
            id: parsed.response_id.unwrap_or_default(),
            model: parsed.model_version.unwrap_or_default(),
            usage: parsed.usage_metadata.map(convert_usage),
            ..Chunk::default()
        };
        let Some(candidate) = parsed
            .candidates
            .into_iter()
            .min_by_key(|candidate| candidate.index.unwrap_or(0))
        else {
            return Ok(Some(chunk));
        };
        if let Some(reason) = blocked_reason(&candidate) {
            let error = LLMError::from(super::error::safety_error(reason));
            return Ok(Some(Chunk::terminal_error(error.to_string())));
        }

        let parts = candidate.content.map(|content| content.parts).unwrap_or_default();
        for part in parts {
            if let Some(call) = part.function_call {
                let index = self.calls_seen;
                self.calls_seen += 1;
                chunk.tool_calls.push(ToolCallDelta {
                    index,
                    id: Some(format!("call_{index}")),
                    name: Some(call.name),
                    arguments: Some(
                        call.args
                            .map(|args| args.to_string())
                            .unwrap_or_else(|| "{}".to_string()),
                    ),
                });
            } else if let Some(text) = part.text {
                if part.thought != Some(true) {
                    chunk.content.push_str(&text);
                }
            }
        }
        chunk.finish_reason = convert_finish_reason(
            candidate.finish_reason.as_deref(),
            self.calls_seen > 0,
        );
        Ok(Some(chunk))
    }

    fn is_done(&self, data: &str) -> bool {
        decode_response(data).is_ok_and(|parsed| {
            parsed.candidates.iter().any(|candidate| {
                candidate
                    .finish_reason
                    .as_deref()
                    .is_some_and(|reason| !reason.is_empty())
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use futures_util::{StreamExt, stream};
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::http::HttpBodyStream;
    use crate::stream::ChunkStream;
    use crate::types::Usage;

    fn sse(text: &'static str) -> ChunkStream {
        let body: HttpBodyStream = Box::pin(stream::iter(vec![Ok(text.as_bytes().to_vec())]));
        ChunkStream::sse(body, Box::new(GeminiLineParser::new()), &CancellationToken::new(), "google_gemini")
    }

    #[tokio::test]
    async fn finish_reason_terminates_with_usage() {
        let mut stream = sse(concat!(
            "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"Hel\"}]}}],\"modelVersion\":\"gemini-2.5-flash\"}\r\n\r\n",
            "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"lo\"}]},\"finishReason\":\"STOP\"}],\"usageMetadata\":{\"promptTokenCount\":3,\"candidatesTokenCount\":2,\"totalTokenCount\":5}}\r\n\r\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"after the end\"}]}}]}\r\n\r\n",
        ));
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.content, "Hel");
        assert_eq!(first.model, "gemini-2.5-flash");
        assert!(!first.done);
        let last = stream.next().await.unwrap().unwrap();
        assert_eq!(last.content, "lo");
        assert!(last.done);
        assert_eq!(last.finish_reason.as_deref(), Some("stop"));
        assert_eq!(last.usage, Some(Usage { prompt_tokens: 3, completion_tokens: 2, total_tokens: 5 }));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn function_calls_stream_with_ids() {
        let mut stream = sse(concat!(
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"functionCall\":{\"name\":\"get_weather\",\"args\":{\"city\":\"Tokyo\"}}}]}}]}\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"functionCall\":{\"name\":\"get_time\",\"args\":{}}}]},\"finishReason\":\"STOP\"}]}\n",
        ));
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.tool_calls[0].id.as_deref(), Some("call_0"));
        assert_eq!(first.tool_calls[0].arguments.as_deref(), Some("{\"city\":\"Tokyo\"}"));
        let last = stream.next().await.unwrap().unwrap();
        assert_eq!(last.tool_calls[0].id.as_deref(), Some("call_1"));
        assert_eq!(last.tool_calls[0].index, 1);
        assert_eq!(last.finish_reason.as_deref(), Some("tool_calls"));
        assert!(last.done);
    }

    #[test]
    fn safety_stop_is_an_error_chunk() {
        let mut parser = GeminiLineParser::new();
        let data = r#"{"candidates":[{"finishReason":"SAFETY"}]}"#;
        assert!(parser.is_done(data));
        let chunk = parser.parse_line(data).unwrap().unwrap();
        assert!(chunk.done);
        assert!(chunk.error.unwrap().contains("safety"));
    }
}
