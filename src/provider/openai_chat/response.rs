use crate::error::LLMError;
use crate::types::{ChatResponse, Message, Role, ToolCall, Usage};

use super::types::{
    OpenAiChatResponse, OpenAiMessageContent, OpenAiResponseMessage, OpenAiToolCallResponse,
    OpenAiUsage,
};

pub(crate) fn map_response(
    resp: OpenAiChatResponse,
    provider: &str,
    model: &str,
) -> Result<ChatResponse, LLMError> {
    let choice = resp
        .choices
        .into_iter()
        .min_by_key(|choice| choice.index)
        .ok_or_else(|| LLMError::provider("openai_chat", "response contained no choices"))?;
    let message = match choice.message {
        Some(message) => convert_response_message(message),
        None => Message::assistant(""),
    };
    Ok(ChatResponse {
        id: resp.id,
        model: resp.model.unwrap_or_else(|| model.to_string()),
        message,
        finish_reason: choice.finish_reason,
        usage: resp.usage.map(convert_usage),
        provider: provider.to_string(),
    })
}

fn convert_response_message(message: OpenAiResponseMessage) -> Message {
    let role = message
        .role
        .as_deref()
        .and_then(Role::parse)
        .unwrap_or(Role::Assistant);
    let content = match &message.content {
        None => String::new(),
        Some(OpenAiMessageContent::Text(text)) => text.clone(),
        Some(OpenAiMessageContent::Parts(parts)) => parts
            .iter()
            .filter(|part| part.kind == "text")
            .filter_map(|part| part.text.as_deref())
            .collect(),
    };
    let content = with_reasoning_fallback(
        content,
        message.reasoning_content.as_deref(),
        message.reasoning.as_deref(),
    );
    let tool_calls = message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .map(|(index, call)| convert_tool_call_response(call, index))
        .collect();
    Message {
        role,
        content,
        tool_calls,
        reasoning_content: message.reasoning_content,
        reasoning: message.reasoning,
        ..Message::default()
    }
}

/// Reasoning models may leave `content` empty (or a lone newline) and put the answer in
/// `reasoning_content` or `reasoning`.
pub(crate) fn with_reasoning_fallback(
    content: String,
    reasoning_content: Option<&str>,
    reasoning: Option<&str>,
) -> String {
    if !content.is_empty() && content != "\n" {
        return content;
    }
    reasoning_content
        .filter(|text| !text.is_empty())
        .or(reasoning.filter(|text| !text.is_empty()))
        .map_or(content, str::to_string)
}

pub(crate) fn convert_usage(usage: OpenAiUsage) -> Usage {
    let prompt = usage.prompt_tokens.unwrap_or(0);
    let completion = usage.completion_tokens.unwrap_or(0);
    Usage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: usage.total_tokens.unwrap_or(prompt + completion),
    }
}

pub(crate) fn convert_tool_call_response(call: OpenAiToolCallResponse, index: usize) -> ToolCall {
    let (name, arguments) = match call.function {
        Some(function) => (
            function.name.unwrap_or_default(),
            function.arguments.unwrap_or_default(),
        ),
        None => (String::new(), String::new()),
    };
    let id = call
        .id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| format!("call_{index}"));
    ToolCall::function(id, name, arguments)
}
