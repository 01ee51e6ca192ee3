use serde_json::Value;

use crate::error::LLMError;
use crate::types::{ChatResponse, Message, ToolCall, Usage};

use super::error::safety_error;
use super::types::{GeminiCandidate, GeminiGenerateContentResponse, GeminiUsageMetadata};

/// Finish reasons that mean the safety filters stopped the candidate.
const BLOCKED_REASONS: [&str; 4] = ["SAFETY", "PROHIBITED_CONTENT", "BLOCKLIST", "SPII"];

/// Decodes a response body, unwrapping the CloudCode `{"response": ...}` envelope.
pub(crate) fn decode_response(text: &str) -> Result<GeminiGenerateContentResponse, serde_json::Error> {
    let value = match serde_json::from_str::<Value>(text)? {
        Value::Object(mut map) if map.get("response").is_some_and(Value::is_object) => {
            map.remove("response").unwrap_or_default()
        }
        other => other,
    };
    serde_json::from_value(value)
}

pub(crate) fn map_response(
    resp: GeminiGenerateContentResponse,
    provider: &str,
    model: &str,
) -> Result<ChatResponse, LLMError> {
    if resp.candidates.is_empty() {
        if let Some(reason) = resp.prompt_feedback.and_then(|feedback| feedback.block_reason) {
            return Err(safety_error(&reason).into());
        }
    }
    let candidate = resp
        .candidates
        .into_iter()
        .min_by_key(|candidate| candidate.index.unwrap_or(0))
        .ok_or_else(|| LLMError::provider("google_gemini", "response contained no candidates"))?;
    if let Some(reason) = blocked_reason(&candidate) {
        return Err(safety_error(reason).into());
    }

    let finish_reason = candidate.finish_reason.clone();
    let parts = candidate.content.map(|content| content.parts).unwrap_or_default();
    let mut content = String::new();
    let mut thinking = String::new();
    let mut tool_calls = Vec::new();
    for part in parts {
        if let Some(call) = part.function_call {
            let index = tool_calls.len();
            tool_calls.push(ToolCall::function(
                format!("call_{index}"),
                call.name,
                call.args.map(|args| args.to_string()).unwrap_or_default(),
            ));
        } else if let Some(text) = part.text {
            if part.thought == Some(true) {
                thinking.push_str(&text);
            } else {
                content.push_str(&text);
            }
        }
    }

    let finish_reason = convert_finish_reason(finish_reason.as_deref(), !tool_calls.is_empty());
    Ok(ChatResponse {
        id: resp.response_id,
        model: resp.model_version.unwrap_or_else(|| model.to_string()),
        message: Message {
            tool_calls,
            reasoning_content: (!thinking.is_empty()).then_some(thinking),
            ..Message::assistant(content)
        },
        finish_reason,
        usage: resp.usage_metadata.map(convert_usage),
        provider: provider.to_string(),
    })
}

pub(crate) fn blocked_reason(candidate: &GeminiCandidate) -> Option<&str> {
    candidate
        .finish_reason
        .as_deref()
        .filter(|reason| BLOCKED_REASONS.contains(reason))
}

/// Maps Gemini finish reasons onto the canonical OpenAI vocabulary.
pub(crate) fn convert_finish_reason(reason: Option<&str>, has_tool_calls: bool) -> Option<String> {
    let reason = reason.filter(|reason| !reason.is_empty())?;
    let mapped = match reason {
        _ if has_tool_calls => "tool_calls".to_string(),
        "STOP" => "stop".to_string(),
        "MAX_TOKENS" => "length".to_string(),
        other => other.to_ascii_lowercase(),
    };
    Some(mapped)
}

pub(crate) fn convert_usage(usage: GeminiUsageMetadata) -> Usage {
    let prompt = usage.prompt_token_count.unwrap_or(0);
    let completion = usage.candidates_token_count.unwrap_or(0);
    Usage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: usage.total_token_count.unwrap_or(prompt + completion),
    }
}
