use serde_json::{Map, Value, json};

use crate::error::LLMError;
use crate::types::{ChatRequest, ContentPart, Message, Role, ToolCall, ToolChoice, ToolDefinition};

/// `max_tokens` is mandatory on Messages; used when neither request nor config sets it.
pub(crate) const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Builds the Anthropic Messages request body.
pub(crate) fn build_anthropic_body(
    request: &ChatRequest,
    model: &str,
    stream: bool,
    default_max_tokens: Option<u32>,
) -> Result<Value, LLMError> {
    request.validate_tools()?;
    let mut body = Map::new();
    body.insert("model".to_string(), Value::String(model.to_string()));

    // System turns fold into the top-level `system` string.
    let mut system_texts = Vec::new();
    let mut messages: Vec<Value> = Vec::new();
    for message in request.all_messages() {
        if message.role == Role::System {
            let text = message.flat_text();
            if !text.is_empty() {
                system_texts.push(text);
            }
            continue;
        }
        let (role, blocks) = convert_message(&message)?;
        if blocks.is_empty() {
            continue;
        }
        push_turn(&mut messages, role, blocks);
    }

    if messages.is_empty() {
        return Err(LLMError::Validation {
            message: "Anthropic Messages request requires at least one user/assistant message"
                .to_string(),
        });
    }
    body.insert("messages".to_string(), Value::Array(messages));
    if !system_texts.is_empty() {
        body.insert("system".to_string(), Value::String(system_texts.join("\n\n")));
    }

    let max_tokens = request
        .max_tokens
        .or(default_max_tokens)
        .unwrap_or(DEFAULT_MAX_TOKENS);
    body.insert("max_tokens".to_string(), Value::from(max_tokens));
    if let Some(temperature) = request.temperature {
        body.insert("temperature".to_string(), Value::from(temperature));
    }
    if let Some(top_p) = request.top_p {
        body.insert("top_p".to_string(), Value::from(top_p));
    }
    if !request.stop.is_empty() {
        body.insert("stop_sequences".to_string(), json!(request.stop));
    }

    // Messages has no "none" choice: leaving the tools out is how it is expressed.
    if let Some(choice) = request.effective_tool_choice() {
        if let Some(value) = convert_tool_choice(&choice) {
            body.insert("tools".to_string(), Value::Array(convert_tools(&request.tools)));
            body.insert("tool_choice".to_string(), value);
        }
    }

    for (k, v) in &request.extra {
        body.insert(k.clone(), v.clone());
    }
    body.insert("stream".to_string(), Value::Bool(stream));
    Ok(Value::Object(body))
}

/// Consecutive turns of the same role are merged; tool results ride on user turns.
fn push_turn(messages: &mut Vec<Value>, role: &str, blocks: Vec<Value>) {
    if let Some(last) = messages.last_mut() {
        if last["role"] == role {
            if let Some(content) = last["content"].as_array_mut() {
                content.extend(blocks);
                return;
            }
        }
    }
    messages.push(json!({ "role": role, "content": blocks }));
}

fn convert_message(message: &Message) -> Result<(&'static str, Vec<Value>), LLMError> {
    if message.role == Role::Tool {
        let tool_use_id = message
            .tool_call_id
            .clone()
            .or_else(|| {
                message.parts.iter().find_map(|part| match part {
                    ContentPart::ToolResult { tool_use_id, .. } => Some(tool_use_id.clone()),
                    _ => None,
                })
            })
            .ok_or_else(|| LLMError::Validation {
                message: "tool message missing tool_call_id (mapped to tool_use_id)".to_string(),
            })?;
        let is_error = message
            .parts
            .iter()
            .any(|part| matches!(part, ContentPart::ToolResult { is_error: true, .. }));
        let block = json!({
            "type": "tool_result",
            "tool_use_id": tool_use_id,
            "content": message.result_text(),
            "is_error": is_error
        });
        return Ok(("user", vec![block]));
    }

    let role = if message.role == Role::Assistant { "assistant" } else { "user" };
    let mut blocks = Vec::new();
    if message.parts.is_empty() {
        if !message.content.is_empty() {
            blocks.push(json!({ "type": "text", "text": message.content }));
        }
    } else {
        for part in &message.parts {
            blocks.push(convert_content_part(part)?);
        }
    }
    let has_tool_use = blocks.iter().any(|block| block["type"] == "tool_use");
    if !has_tool_use {
        blocks.extend(message.tool_calls.iter().map(convert_tool_call));
    }
    Ok((role, blocks))
}

fn convert_content_part(part: &ContentPart) -> Result<Value, LLMError> {
    let block = match part {
        ContentPart::Text { text } => json!({ "type": "text", "text": text }),
        ContentPart::Thinking { text } => json!({ "type": "text", "text": format!("[Thinking]: {text}") }),
        ContentPart::ImageBase64 { mime_type, data } => json!({
            "type": "image",
            "source": { "type": "base64", "media_type": mime_type, "data": data }
        }),
        ContentPart::ImageUrl { url, .. } => json!({
            "type": "image",
            "source": { "type": "url", "url": url }
        }),
        ContentPart::Document { mime_type, data, url } => match (data, url) {
            (Some(data), _) => json!({
                "type": "document",
                "source": { "type": "base64", "media_type": mime_type, "data": data }
            }),
            (None, Some(url)) => json!({
                "type": "document",
                "source": { "type": "url", "url": url }
            }),
            (None, None) => {
                return Err(LLMError::validation("document part needs data or url"));
            }
        },
        ContentPart::Audio { .. } => {
            return Err(LLMError::UnsupportedFeature {
                feature: "audio input on anthropic",
            });
        }
        ContentPart::ToolUse { id, name, input } => json!({
            "type": "tool_use",
            "id": id,
            "name": name,
            "input": input
        }),
        ContentPart::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => json!({
            "type": "tool_result",
            "tool_use_id": tool_use_id,
            "content": content,
            "is_error": is_error
        }),
    };
    Ok(block)
}

/// OpenAI-style JSON-string arguments become the structured `input` map.
pub(crate) fn convert_tool_call(call: &ToolCall) -> Value {
    let input = match call.parsed_arguments() {
        Value::Object(map) => Value::Object(map),
        _ => Value::Object(Map::new()),
    };
    json!({
        "type": "tool_use",
        "id": call.id,
        "name": call.function.name,
        "input": input
    })
}

fn convert_tools(tools: &[ToolDefinition]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            json!({
                "name": tool.name,
                "description": tool.description,
                "input_schema": tool.input_schema
            })
        })
        .collect()
}

fn convert_tool_choice(choice: &ToolChoice) -> Option<Value> {
    match choice {
        ToolChoice::Auto => Some(json!({ "type": "auto" })),
        ToolChoice::Required => Some(json!({ "type": "any" })),
        ToolChoice::Specific(name) if !name.trim().is_empty() => {
            Some(json!({ "type": "tool", "name": name }))
        }
        ToolChoice::Specific(_) => Some(json!({ "type": "auto" })),
        ToolChoice::None => None,
    }
}
