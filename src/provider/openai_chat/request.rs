use serde_json::{Map, Value, json};

use crate::error::LLMError;
use crate::types::{ChatRequest, ContentPart, Message, Role, ToolCall, ToolChoice, ToolDefinition};

/// Knobs that differ between OpenAI-compatible backends.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct BodyOptions {
    /// Fallback `max_tokens` from the provider config.
    pub(crate) max_tokens: Option<u32>,
    /// Ask for a trailing usage chunk when streaming.
    pub(crate) include_stream_usage: bool,
}

pub(crate) fn build_openai_body(
    request: &ChatRequest,
    model: &str,
    stream: bool,
    options: BodyOptions,
) -> Result<Value, LLMError> {
    request.validate_tools()?;
    let mut body = Map::new();
    body.insert("model".to_string(), Value::String(model.to_string()));
    body.insert(
        "messages".to_string(),
        Value::Array(convert_messages(&request.all_messages())?),
    );
    if let Some(temperature) = request.temperature {
        body.insert("temperature".to_string(), Value::from(temperature));
    }
    if let Some(top_p) = request.top_p {
        body.insert("top_p".to_string(), Value::from(top_p));
    }
    if let Some(max_tokens) = request.max_tokens.or(options.max_tokens) {
        body.insert("max_tokens".to_string(), Value::from(max_tokens));
    }
    if !request.stop.is_empty() {
        body.insert("stop".to_string(), json!(request.stop));
    }
    if !request.tools.is_empty() {
        body.insert("tools".to_string(), Value::Array(convert_tools(&request.tools)));
    }
    if let Some(choice) = request.effective_tool_choice() {
        if !request.tools.is_empty() {
            body.insert("tool_choice".to_string(), convert_tool_choice(&choice));
        }
    }
    for (k, v) in &request.extra {
        body.insert(k.clone(), v.clone());
    }
    body.insert("stream".to_string(), Value::Bool(stream));
    if stream && options.include_stream_usage {
        body.insert("stream_options".to_string(), json!({ "include_usage": true }));
    }
    Ok(Value::Object(body))
}

fn convert_messages(messages: &[Message]) -> Result<Vec<Value>, LLMError> {
    messages.iter().map(convert_message).collect()
}

pub(crate) fn convert_message(message: &Message) -> Result<Value, LLMError> {
    let mut obj = Map::new();
    obj.insert(
        "role".to_string(),
        Value::String(message.role.as_str().to_string()),
    );

    if message.role == Role::Tool {
        let call_id = message
            .tool_call_id
            .clone()
            .or_else(|| {
                message.parts.iter().find_map(|part| match part {
                    ContentPart::ToolResult { tool_use_id, .. } => Some(tool_use_id.clone()),
                    _ => None,
                })
            })
            .ok_or_else(|| LLMError::Validation {
                message: "tool message missing tool_call_id".to_string(),
            })?;
        obj.insert("tool_call_id".to_string(), Value::String(call_id));
        obj.insert("content".to_string(), Value::String(message.result_text()));
        return Ok(Value::Object(obj));
    }

    if let Some(name) = &message.name {
        obj.insert("name".to_string(), Value::String(name.clone()));
    }

    let mut tool_calls: Vec<Value> = message.tool_calls.iter().map(convert_tool_call).collect();
    if tool_calls.is_empty() {
        for part in &message.parts {
            if let ContentPart::ToolUse { id, name, input } = part {
                tool_calls.push(convert_tool_call(&ToolCall::function(
                    id.clone(),
                    name.clone(),
                    input.to_string(),
                )));
            }
        }
    }

    let content = convert_content(message);
    let content = match content {
        Value::String(text) if text.is_empty() && !tool_calls.is_empty() => Value::Null,
        other => other,
    };
    obj.insert("content".to_string(), content);
    if !tool_calls.is_empty() {
        obj.insert("tool_calls".to_string(), Value::Array(tool_calls));
    }
    Ok(Value::Object(obj))
}

/// A plain string when the message is text only, otherwise an array of typed parts.
fn convert_content(message: &Message) -> Value {
    let textual = message.parts.iter().all(|part| {
        matches!(
            part,
            ContentPart::Text { .. }
                | ContentPart::Thinking { .. }
                | ContentPart::ToolUse { .. }
                | ContentPart::ToolResult { .. }
        )
    });
    if textual {
        if message.parts.is_empty() {
            return Value::String(message.content.clone());
        }
        let text: String = message.parts.iter().filter_map(part_text).collect();
        return Value::String(text);
    }

    let parts: Vec<Value> = message
        .parts
        .iter()
        .filter_map(|part| match part {
            ContentPart::ImageBase64 { mime_type, data } => Some(json!({
                "type": "image_url",
                "image_url": { "url": format!("data:{mime_type};base64,{data}") }
            })),
            ContentPart::ImageUrl { url, .. } => Some(json!({
                "type": "image_url",
                "image_url": { "url": url }
            })),
            ContentPart::Document { mime_type, data, url } => match (data, url) {
                (Some(data), _) => Some(json!({
                    "type": "file",
                    "file": { "file_data": format!("data:{mime_type};base64,{data}") }
                })),
                (None, Some(url)) => Some(json!({ "type": "text", "text": format!("[Document: {url}]") })),
                (None, None) => None,
            },
            ContentPart::Audio { mime_type, data } => Some(json!({
                "type": "input_audio",
                "input_audio": { "data": data, "format": audio_format(mime_type) }
            })),
            other => part_text(other).map(|text| json!({ "type": "text", "text": text })),
        })
        .collect();
    Value::Array(parts)
}

fn part_text(part: &ContentPart) -> Option<String> {
    match part {
        ContentPart::Text { text } => Some(text.clone()),
        ContentPart::Thinking { text } => Some(format!("[Thinking]: {text}")),
        ContentPart::ToolResult { content, .. } => Some(content.clone()),
        _ => None,
    }
}

fn audio_format(mime_type: &str) -> &str {
    match mime_type.rsplit('/').next() {
        Some("mpeg") => "mp3",
        Some(subtype) if !subtype.is_empty() => subtype,
        _ => "wav",
    }
}

pub(crate) fn convert_tool_call(call: &ToolCall) -> Value {
    let arguments = if call.function.arguments.trim().is_empty() {
        "{}"
    } else {
        call.function.arguments.as_str()
    };
    json!({
        "id": call.id,
        "type": "function",
        "function": {
            "name": call.function.name,
            "arguments": arguments
        }
    })
}

pub(crate) fn convert_tools(tools: &[ToolDefinition]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.input_schema
                }
            })
        })
        .collect()
}

pub(crate) fn convert_tool_choice(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::Auto => Value::String("auto".to_string()),
        ToolChoice::Required => Value::String("required".to_string()),
        ToolChoice::None => Value::String("none".to_string()),
        ToolChoice::Specific(name) if !name.trim().is_empty() => json!({
            "type": "function",
            "function": { "name": name }
        }),
        ToolChoice::Specific(_) => Value::String("auto".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weather_tool() -> ToolDefinition {
        ToolDefinition {
            name: "get_weather".into(),
            description: "Look up the weather".into(),
            input_schema: json!({"type": "object", "properties": {"city": {"type": "string"}}}),
        }
    }

    #[test]
    fn text_message_is_a_plain_string() {
        let request = ChatRequest::from_prompt("Hi").with_model("gpt-4o");
        let body = build_openai_body(&request, "gpt-4o", false, BodyOptions::default()).unwrap();
        assert_eq!(body["messages"][0], json!({"role": "user", "content": "Hi"}));
        assert_eq!(body["stream"], json!(false));
        assert!(body.get("tools").is_none());
        assert!(body.get("tool_choice").is_none());
    }

    #[test]
    fn multimodal_message_becomes_typed_parts() {
        let message = Message::with_parts(
            Role::User,
            vec![
                ContentPart::text("What is this?"),
                ContentPart::ImageBase64 {
                    mime_type: "image/png".into(),
                    data: "iVBOR".into(),
                },
                ContentPart::ImageUrl {
                    url: "https://example.com/cat.jpg".into(),
                    mime_type: None,
                },
            ],
        );
        let value = convert_message(&message).unwrap();
        assert_eq!(value["content"][0], json!({"type": "text", "text": "What is this?"}));
        assert_eq!(value["content"][1]["image_url"]["url"], json!("data:image/png;base64,iVBOR"));
        assert_eq!(value["content"][2]["image_url"]["url"], json!("https://example.com/cat.jpg"));
    }

    #[test]
    fn thinking_parts_are_rendered_as_text() {
        let message = Message::with_parts(
            Role::Assistant,
            vec![ContentPart::Thinking { text: "hmm".into() }, ContentPart::text("42")],
        );
        let value = convert_message(&message).unwrap();
        assert_eq!(value["content"], json!("[Thinking]: hmm42"));
    }

    #[test]
    fn tools_and_choice_are_translated() {
        let mut request = ChatRequest::from_prompt("weather?").with_tools(vec![weather_tool()]);
        let body = build_openai_body(&request, "gpt-4o", true, BodyOptions {
            max_tokens: Some(256),
            include_stream_usage: true,
        })
        .unwrap();
        assert_eq!(body["tools"][0]["function"]["name"], json!("get_weather"));
        assert_eq!(body["tools"][0]["function"]["parameters"]["type"], json!("object"));
        assert_eq!(body["tool_choice"], json!("auto"));
        assert_eq!(body["max_tokens"], json!(256));
        assert_eq!(body["stream_options"]["include_usage"], json!(true));

        request.tool_choice = Some(ToolChoice::Specific("get_weather".into()));
        let body = build_openai_body(&request, "gpt-4o", false, BodyOptions::default()).unwrap();
        assert_eq!(body["tool_choice"]["function"]["name"], json!("get_weather"));
        assert_eq!(convert_tool_choice(&ToolChoice::Required), json!("required"));
        assert_eq!(convert_tool_choice(&ToolChoice::Specific(String::new())), json!("auto"));
    }

    #[test]
    fn duplicate_tool_names_are_rejected() {
        let request = ChatRequest::from_prompt("x").with_tools(vec![weather_tool(), weather_tool()]);
        match build_openai_body(&request, "gpt-4o", false, BodyOptions::default()) {
            Err(LLMError::Validation { message }) => assert!(message.contains("get_weather")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn assistant_tool_calls_and_tool_results() {
        let assistant = Message::assistant("").with_tool_calls(vec![ToolCall::function(
            "call_1",
            "get_weather",
            "",
        )]);
        let value = convert_message(&assistant).unwrap();
        assert_eq!(value["content"], Value::Null);
        assert_eq!(value["tool_calls"][0]["function"]["arguments"], json!("{}"));

        let result = convert_message(&Message::tool_result("call_1", "sunny")).unwrap();
        assert_eq!(
            result,
            json!({"role": "tool", "tool_call_id": "call_1", "content": "sunny"})
        );

        let orphan = Message::new(Role::Tool, "sunny");
        assert!(convert_message(&orphan).is_err());
    }
}
