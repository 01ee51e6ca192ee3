use std::collections::HashMap;

use serde_json::{Map, Value, json};

use crate::error::LLMError;
use crate::types::{ChatRequest, ContentPart, Message, Role, ToolChoice, ToolDefinition};

/// Builds the `generateContent` request body.
pub(crate) fn build_gemini_body(
    request: &ChatRequest,
    default_max_tokens: Option<u32>,
) -> Result<Value, LLMError> {
    request.validate_tools()?;
    let mut body = Map::new();

    let mut system_texts = Vec::new();
    let mut contents: Vec<Value> = Vec::new();
    // Tool-call id to function name, for tool results that only carry the id.
    let mut call_names: HashMap<String, String> = HashMap::new();
    for message in request.all_messages() {
        if message.role == Role::System {
            let text = message.flat_text();
            if !text.is_empty() {
                system_texts.push(text);
            }
            continue;
        }
        let (role, parts) = convert_message(&message, &mut call_names)?;
        if parts.is_empty() {
            continue;
        }
        push_content(&mut contents, role, parts);
    }
    if contents.is_empty() {
        return Err(LLMError::Validation {
            message: "Gemini request requires at least one user/model message".to_string(),
        });
    }
    body.insert("contents".to_string(), Value::Array(contents));
    if !system_texts.is_empty() {
        body.insert(
            "systemInstruction".to_string(),
            json!({ "parts": [{ "text": system_texts.join("\n\n") }] }),
        );
    }

    if let Some(config) = build_generation_config(request, default_max_tokens) {
        body.insert("generationConfig".to_string(), config);
    }

    if !request.tools.is_empty() {
        body.insert("tools".to_string(), json!([{ "functionDeclarations": convert_tools(&request.tools) }]));
        if let Some(config) = request.effective_tool_choice().and_then(|c| convert_tool_choice(&c)) {
            body.insert("toolConfig".to_string(), config);
        }
    }

    for (k, v) in &request.extra {
        body.insert(k.clone(), v.clone());
    }
    Ok(Value::Object(body))
}

fn push_content(contents: &mut Vec<Value>, role: &str, parts: Vec<Value>) {
    if let Some(last) = contents.last_mut() {
        if last["role"] == role {
            if let Some(existing) = last["parts"].as_array_mut() {
                existing.extend(parts);
                return;
            }
        }
    }
    contents.push(json!({ "role": role, "parts": parts }));
}

fn convert_message(
    message: &Message,
    call_names: &mut HashMap<String, String>,
) -> Result<(&'static str, Vec<Value>), LLMError> {
    if message.role == Role::Tool {
        return Ok(("user", vec![function_response(message, call_names)?]));
    }

    let role = if message.role == Role::Assistant { "model" } else { "user" };
    let mut parts = Vec::new();
    if message.parts.is_empty() {
        if !message.content.is_empty() {
            parts.push(json!({ "text": message.content }));
        }
    } else {
        for part in &message.parts {
            if let ContentPart::ToolUse { id, name, .. } = part {
                call_names.insert(id.clone(), name.clone());
            }
            if let Some(value) = convert_content_part(part) {
                parts.push(value);
            }
        }
    }
    for call in &message.tool_calls {
        call_names.insert(call.id.clone(), call.function.name.clone());
        parts.push(json!({
            "functionCall": { "name": call.function.name, "args": call.parsed_arguments() }
        }));
    }
    Ok((role, parts))
}

fn function_response(message: &Message, call_names: &HashMap<String, String>) -> Result<Value, LLMError> {
    let call_id = message.tool_call_id.clone().or_else(|| {
        message.parts.iter().find_map(|part| match part {
            ContentPart::ToolResult { tool_use_id, .. } => Some(tool_use_id.clone()),
            _ => None,
        })
    });
    let name = message
        .name
        .clone()
        .or_else(|| call_id.as_ref().and_then(|id| call_names.get(id).cloned()))
        .ok_or_else(|| {
            LLMError::validation("tool result needs a function name or a known tool_call_id")
        })?;
    let text = message.result_text();
    let response = match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(map)) => Value::Object(map),
        _ => json!({ "content": text }),
    };
    Ok(json!({ "functionResponse": { "name": name, "response": response } }))
}

fn convert_content_part(part: &ContentPart) -> Option<Value> {
    match part {
        ContentPart::Text { text } => Some(json!({ "text": text })),
        ContentPart::Thinking { text } => Some(json!({ "text": format!("[Thinking]: {text}") })),
        ContentPart::ImageBase64 { mime_type, data } | ContentPart::Audio { mime_type, data } => {
            Some(json!({ "inlineData": { "mimeType": mime_type, "data": data } }))
        }
        ContentPart::ImageUrl { url, mime_type } => {
            let mime_type = mime_type.clone().unwrap_or_else(|| guess_image_mime(url).to_string());
            Some(json!({ "fileData": { "mimeType": mime_type, "fileUri": url } }))
        }
        ContentPart::Document { mime_type, data, url } => match (data, url) {
            (Some(data), _) => Some(json!({ "inlineData": { "mimeType": mime_type, "data": data } })),
            (None, Some(url)) => Some(json!({ "fileData": { "mimeType": mime_type, "fileUri": url } })),
            (None, None) => None,
        },
        ContentPart::ToolUse { name, input, .. } => {
            Some(json!({ "functionCall": { "name": name, "args": input } }))
        }
        ContentPart::ToolResult { content, .. } => Some(json!({ "text": content })),
    }
}

fn guess_image_mime(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    if path.ends_with(".png") {
        "image/png"
    } else if path.ends_with(".gif") {
        "image/gif"
    } else if path.ends_with(".webp") {
        "image/webp"
    } else {
        "image/jpeg"
    }
}

fn build_generation_config(request: &ChatRequest, default_max_tokens: Option<u32>) -> Option<Value> {
    let mut config = Map::new();
    if let Some(temperature) = request.temperature {
        config.insert("temperature".to_string(), Value::from(temperature));
    }
    if let Some(top_p) = request.top_p {
        config.insert("topP".to_string(), Value::from(top_p));
    }
    if let Some(max_tokens) = request.max_tokens.or(default_max_tokens) {
        config.insert("maxOutputTokens".to_string(), Value::from(max_tokens));
    }
    if !request.stop.is_empty() {
        config.insert("stopSequences".to_string(), json!(request.stop));
    }
    (!config.is_empty()).then_some(Value::Object(config))
}

fn convert_tools(tools: &[ToolDefinition]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            let mut decl = Map::new();
            decl.insert("name".to_string(), Value::String(tool.name.clone()));
            if !tool.description.is_empty() {
                decl.insert("description".to_string(), Value::String(tool.description.clone()));
            }
            let has_properties = tool
                .input_schema
                .get("properties")
                .and_then(Value::as_object)
                .is_some_and(|props| !props.is_empty());
            if has_properties {
                decl.insert("parameters".to_string(), sanitize_schema(&tool.input_schema));
            }
            Value::Object(decl)
        })
        .collect()
}

/// Reduces a JSON Schema to the subset Gemini accepts.
pub(crate) fn sanitize_schema(schema: &Value) -> Value {
    let Some(object) = schema.as_object() else {
        return json!({ "type": "string" });
    };
    let mut out = Map::new();
    if let Some(kind) = schema_type(object.get("type")) {
        out.insert("type".to_string(), Value::String(kind));
    }
    for key in ["description", "enum", "format", "nullable"] {
        if let Some(value) = object.get(key) {
            out.insert(key.to_string(), value.clone());
        }
    }
    if let Some(properties) = object.get("properties").and_then(Value::as_object) {
        let cleaned: Map<String, Value> = properties
            .iter()
            .map(|(name, prop)| (name.clone(), sanitize_schema(prop)))
            .collect();
        out.insert("properties".to_string(), Value::Object(cleaned));
        if let Some(required) = object.get("required").and_then(Value::as_array) {
            let known: Vec<Value> = required
                .iter()
                .filter(|name| name.as_str().is_some_and(|name| properties.contains_key(name)))
                .cloned()
                .collect();
            if !known.is_empty() {
                out.insert("required".to_string(), Value::Array(known));
            }
        }
    }
    if let Some(items) = object.get("items") {
        out.insert("items".to_string(), sanitize_schema(items));
    }
    Value::Object(out)
}

/// `["string", "null"]` style unions keep their first concrete type.
fn schema_type(kind: Option<&Value>) -> Option<String> {
    match kind? {
        Value::String(kind) => Some(kind.clone()),
        Value::Array(kinds) => kinds
            .iter()
            .filter_map(Value::as_str)
            .find(|kind| *kind != "null")
            .map(str::to_string),
        _ => None,
    }
}

fn convert_tool_choice(choice: &ToolChoice) -> Option<Value> {
    match choice {
        ToolChoice::Auto => None,
        ToolChoice::Required => Some(json!({ "functionCallingConfig": { "mode": "ANY" } })),
        ToolChoice::None => Some(json!({ "functionCallingConfig": { "mode": "NONE" } })),
        ToolChoice::Specific(name) if !name.trim().is_empty() => Some(json!({
            "functionCallingConfig": { "mode": "ANY", "allowedFunctionNames": [name] }
        })),
        ToolChoice::Specific(_) => None,
    }
}
