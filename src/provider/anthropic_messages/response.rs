use crate::error::LLMError;
use crate::types::{ChatResponse, Message, ToolCall, Usage};

use super::error::safety_error;
use super::types::{AnthropicMessageResponse, AnthropicUsage};

pub(crate) fn map_response(
    resp: AnthropicMessageResponse,
    provider: &str,
    model: &str,
) -> Result<ChatResponse, LLMError> {
    if resp.stop_reason.as_deref() == Some("refusal") {
        return Err(safety_error("stop_reason: refusal").into());
    }

    let mut content = String::new();
    let mut thinking = String::new();
    let mut tool_calls = Vec::new();
    for block in resp.content {
        match block.kind.as_str() {
            "text" => content.push_str(block.text.as_deref().unwrap_or_default()),
            "thinking" => thinking.push_str(block.thinking.as_deref().unwrap_or_default()),
            "tool_use" => {
                let index = tool_calls.len();
                let id = block
                    .id
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(|| format!("call_{index}"));
                let arguments = block
                    .input
                    .map(|input| input.to_string())
                    .unwrap_or_default();
                tool_calls.push(ToolCall::function(id, block.name.unwrap_or_default(), arguments));
            }
            _ => {}
        }
    }

    Ok(ChatResponse {
        id: resp.id,
        model: resp.model.unwrap_or_else(|| model.to_string()),
        message: Message {
            tool_calls,
            reasoning_content: (!thinking.is_empty()).then_some(thinking),
            ..Message::assistant(content)
        },
        finish_reason: resp.stop_reason.as_deref().map(convert_finish_reason),
        usage: resp.usage.map(convert_usage),
        provider: provider.to_string(),
    })
}

/// Maps Anthropic stop reasons onto the OpenAI vocabulary used by canonical responses.
pub(crate) fn convert_finish_reason(reason: &str) -> String {
    match reason {
        "end_turn" | "stop_sequence" => "stop",
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        "refusal" => "content_filter",
        other => other,
    }
    .to_string()
}

pub(crate) fn convert_usage(usage: AnthropicUsage) -> Usage {
    Usage::new(usage.input_tokens.unwrap_or(0), usage.output_tokens.unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::ErrorKind;
    use crate::provider::anthropic_messages::request::convert_tool_call;
    use crate::provider::anthropic_messages::types::AnthropicContentBlock;

    fn parse(value: serde_json::Value) -> AnthropicMessageResponse {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn text_and_usage() {
        let resp = parse(json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "model": "claude-sonnet-4-5",
            "content": [{"type": "text", "text": "Hello"}, {"type": "text", "text": " there"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 10, "output_tokens": 3}
        }));
        let mapped = map_response(resp, "anthropic", "claude-sonnet-4-5").unwrap();
        assert_eq!(mapped.content(), "Hello there");
        assert_eq!(mapped.finish_reason.as_deref(), Some("stop"));
        assert_eq!(mapped.usage, Some(Usage::new(10, 3)));
        assert_eq!(mapped.id.as_deref(), Some("msg_1"));
    }

    #[test]
    fn tool_use_and_thinking_blocks() {
        let resp = parse(json!({
            "content": [
                {"type": "thinking", "thinking": "need the weather tool", "signature": "sig"},
                {"type": "tool_use", "id": "toolu_1", "name": "get_weather", "input": {"city": "Tokyo"}}
            ],
            "stop_reason": "tool_use"
        }));
        let mapped = map_response(resp, "anthropic", "claude-sonnet-4-5").unwrap();
        assert_eq!(mapped.model, "claude-sonnet-4-5");
        assert_eq!(mapped.finish_reason.as_deref(), Some("tool_calls"));
        assert_eq!(mapped.message.reasoning_content.as_deref(), Some("need the weather tool"));
        let call = &mapped.tool_calls()[0];
        assert_eq!(call.id, "toolu_1");
        assert_eq!(call.function.name, "get_weather");
        assert_eq!(call.parsed_arguments(), json!({"city": "Tokyo"}));
    }

    #[test]
    fn tool_call_survives_a_wire_round_trip() {
        let call = ToolCall::function("x", "get_weather", r#"{"city":"Tokyo"}"#);
        let block: AnthropicContentBlock = serde_json::from_value(convert_tool_call(&call)).unwrap();
        let resp = AnthropicMessageResponse {
            id: None,
            model: None,
            content: vec![block],
            stop_reason: Some("tool_use".into()),
            usage: None,
        };
        let back = map_response(resp, "anthropic", "m").unwrap();
        assert_eq!(back.tool_calls()[0].id, "x");
        assert_eq!(back.tool_calls()[0].parsed_arguments(), json!({"city": "Tokyo"}));
    }

    #[test]
    fn refusals_are_invalid_requests() {
        let resp = parse(json!({"content": [], "stop_reason": "refusal"}));
        match map_response(resp, "anthropic", "m") {
            Err(LLMError::Api(api)) => assert_eq!(api.kind, ErrorKind::InvalidRequest),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
