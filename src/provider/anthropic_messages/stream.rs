use std::collections::HashMap;

use crate::error::LLMError;
use crate::stream::LineParser;
use crate::types::{Chunk, ToolCallDelta, Usage};

use super::response::convert_finish_reason;
use super::types::{AnthropicStreamEvent, AnthropicUsage};

/// Line parser for the Messages event stream.
///
/// `message_start` and `message_delta` only update state; the terminal chunk built on
/// `message_stop` carries the stop reason and the cumulative usage.
#[derive(Debug, Default)]
pub struct AnthropicLineParser {
    id: String,
    model: String,
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
    stop_reason: Option<String>,
    /// Content block index to tool-call ordinal.
    tool_blocks: HashMap<usize, usize>,
}

impl AnthropicLineParser {
    pub fn new() -> Self {
        Self::default()
    }

    fn absorb_usage(&mut self, usage: Option<AnthropicUsage>) {
        if let Some(usage) = usage {
            self.input_tokens = usage.input_tokens.or(self.input_tokens);
            self.output_tokens = usage.output_tokens.or(self.output_tokens);
        }
    }

    fn chunk(&self) -> Chunk {
        Chunk {
            id: self.id.clone(),
            model: self.model.clone(),
            ..Chunk::default()
        }
    }
}

impl LineParser for AnthropicLineParser {
    fn parse_line(&mut self, data: &str) -> Result<Option<Chunk>, LLMError> {
        let event: AnthropicStreamEvent = serde_json::from_str(data).map_err(|err| {
            LLMError::provider("anthropic_messages", format!("failed to parse stream event: {err}"))
        })?;

        match event.kind.as_str() {
            "message_start" => {
                if let Some(message) = event.message {
                    self.id = message.id.unwrap_or_default();
                    self.model = message.model.unwrap_or_default();
                    self.absorb_usage(message.usage);
                }
                Ok(None)
            }
            "content_block_start" => {
                let Some(block) = event.content_block else {
                    return Ok(None);
                };
                match block.kind.as_str() {
                    "tool_use" => {
                        let ordinal = self.tool_blocks.len();
                        self.tool_blocks.insert(event.index.unwrap_or(ordinal), ordinal);
                        Ok(Some(Chunk {
                            tool_calls: vec![ToolCallDelta {
                                index: ordinal,
                                id: block.id,
                                name: block.name,
                                arguments: None,
                            }],
                            ..self.chunk()
                        }))
                    }
                    "text" => Ok(block
                        .text
                        .filter(|text| !text.is_empty())
                        .map(|text| Chunk { content: text, ..self.chunk() })),
                    _ => Ok(None),
                }
            }
            "content_block_delta" => {
                let Some(delta) = event.delta else {
                    return Ok(None);
                };
                match delta.kind.as_deref() {
                    Some("text_delta") => Ok(delta.text.map(|text| Chunk {
                        content: text,
                        ..self.chunk()
                    })),
                    Some("input_json_delta") => {
                        let ordinal = event
                            .index
                            .and_then(|index| self.tool_blocks.get(&index).copied())
                            .unwrap_or(0);
                        Ok(Some(Chunk {
                            tool_calls: vec![ToolCallDelta {
                                index: ordinal,
                                arguments: delta.partial_json,
                                ..ToolCallDelta::default()
                            }],
                            ..self.chunk()
                        }))
                    }
                    _ => Ok(None),
                }
            }
            "message_delta" => {
                if let Some(reason) = event.delta.and_then(|delta| delta.stop_reason) {
                    self.stop_reason = Some(reason);
                }
                self.absorb_usage(event.usage);
                Ok(None)
            }
            "error" => {
                let message = event
                    .error
                    .map(|error| match (error.kind, error.message) {
                        (Some(kind), Some(message)) => format!("{message} ({kind})"),
                        (_, Some(message)) => message,
                        (Some(kind), None) => kind,
                        (None, None) => "unknown stream error".to_string(),
                    })
                    .unwrap_or_else(|| "unknown stream error".to_string());
                Ok(Some(Chunk::terminal_error(message)))
            }
            // ping, content_block_stop, message_stop
            _ => Ok(None),
        }
    }

    fn is_done(&self, data: &str) -> bool {
        serde_json::from_str::<AnthropicStreamEvent>(data)
            .is_ok_and(|event| event.kind == "message_stop")
    }

    fn finish(&mut self) -> Chunk {
        let usage = match (self.input_tokens, self.output_tokens) {
            (None, None) => None,
            (input, output) => Some(Usage::new(input.unwrap_or(0), output.unwrap_or(0))),
        };
        Chunk {
            done: true,
            finish_reason: self.stop_reason.as_deref().map(convert_finish_reason),
            usage,
            ..self.chunk()
        }
    }
}
