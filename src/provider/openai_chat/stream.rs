use serde_json::Value;

use crate::error::LLMError;
use crate::stream::LineParser;
use crate::types::{Chunk, ToolCallDelta};

use super::response::convert_usage;
use super::types::{OpenAiStreamChunk, OpenAiToolCallDelta};

/// Line parser for OpenAI-shaped `chat.completion.chunk` payloads.
///
/// The chunk carrying `finish_reason` is held back, together with any usage-only chunk
/// that follows it, and becomes the terminal chunk once `[DONE]` arrives.
#[derive(Debug, Default)]
pub struct OpenAiLineParser {
    held: Option<Chunk>,
}

impl OpenAiLineParser {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LineParser for OpenAiLineParser {
    fn parse_line(&mut self, data: &str) -> Result<Option<Chunk>, LLMError> {
        let parsed: OpenAiStreamChunk = serde_json::from_str(data).map_err(|err| {
            LLMError::provider("openai_chat", format!("failed to parse stream chunk: {err}"))
        })?;
        if let Some(error) = &parsed.error {
            return Ok(Some(Chunk::terminal_error(error_message(error))));
        }
        let chunk = convert_stream_chunk(parsed);

        if let Some(held) = &mut self.held {
            held.content.push_str(&chunk.content);
            held.tool_calls.extend(chunk.tool_calls);
            if chunk.usage.is_some() {
                held.usage = chunk.usage;
            }
            return Ok(None);
        }
        if chunk.finish_reason.is_some() {
            self.held = Some(chunk);
            return Ok(None);
        }
        Ok(Some(chunk))
    }

    fn is_done(&self, data: &str) -> bool {
        data.trim() == "[DONE]"
    }

    fn finish(&mut self) -> Chunk {
        self.held.take().unwrap_or_default()
    }
}

fn convert_stream_chunk(parsed: OpenAiStreamChunk) -> Chunk {
    let mut chunk = Chunk {
        id: parsed.id.unwrap_or_default(),
        model: parsed.model.unwrap_or_default(),
        created: parsed.created.unwrap_or_default(),
        usage: parsed.usage.map(convert_usage),
        ..Chunk::default()
    };
    if let Some(choice) = parsed.choices.into_iter().min_by_key(|choice| choice.index) {
        if let Some(delta) = choice.delta {
            chunk.content = delta.content.unwrap_or_default();
            chunk.tool_calls = delta
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .enumerate()
                .map(|(position, call)| convert_tool_call_delta(call, position))
                .collect();
        }
        chunk.finish_reason = choice.finish_reason.filter(|reason| !reason.is_empty());
    }
    chunk
}

fn convert_tool_call_delta(delta: OpenAiToolCallDelta, position: usize) -> ToolCallDelta {
    let (name, arguments) = delta
        .function
        .map(|function| (function.name, function.arguments))
        .unwrap_or((None, None));
    ToolCallDelta {
        index: delta.index.unwrap_or(position),
        id: delta.id,
        name,
        arguments,
    }
}

fn error_message(error: &Value) -> String {
    error
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string())
}
