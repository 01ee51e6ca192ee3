//! Shared data structures modeling canonical chat requests, responses and stream chunks.
//!
//! These types normalize provider-specific payloads so the rest of the crate can stay
//! agnostic of individual API differences.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Chat role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    /// Parses a wire role, treating Gemini's `model` as the assistant.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "system" | "developer" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" | "model" => Some(Role::Assistant),
            "tool" | "function" => Some(Role::Tool),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized chat message shared across providers.
///
/// `content` is the sole payload when `parts` is empty. When parts are present,
/// `content` holds the concatenation of their text parts, which is what backends that
/// do not accept parts receive.
///
/// # Examples
///
/// ```
/// use llm_relay::types::{ContentPart, Message, Role};
///
/// let msg = Message::with_parts(
///     Role::User,
///     vec![
///         ContentPart::text("Describe "),
///         ContentPart::ImageUrl { url: "https://example.com/a.png".into(), mime_type: None },
///         ContentPart::text("this image"),
///     ],
/// );
/// assert_eq!(msg.content, "Describe this image");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<ContentPart>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Only meaningful on [`Role::Tool`] messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Tool name for tool results; Gemini needs it for `functionResponse`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Original `reasoning_content` field returned by OpenAI-compatible backends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    /// Original `reasoning` field returned by OpenAI-compatible backends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl Default for Role {
    fn default() -> Self {
        Role::User
    }
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// A tool result answering the call identified by `tool_call_id`.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            ..Self::default()
        }
    }

    /// Builds a message from parts, deriving `content` from the text parts.
    pub fn with_parts(role: Role, parts: Vec<ContentPart>) -> Self {
        let content = text_of_parts(&parts);
        Self {
            role,
            content,
            parts,
            ..Self::default()
        }
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCall>) -> Self {
        self.tool_calls = tool_calls;
        self
    }

    /// The text a parts-unaware backend should see.
    pub fn flat_text(&self) -> String {
        if self.parts.is_empty() {
            self.content.clone()
        } else {
            text_of_parts(&self.parts)
        }
    }

    /// Payload of a tool-result message: `content`, else its tool-result and text parts.
    pub fn result_text(&self) -> String {
        if !self.content.is_empty() {
            return self.content.clone();
        }
        self.parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::ToolResult { content, .. } | ContentPart::Text { text: content } => {
                    Some(content.as_str())
                }
                _ => None,
            })
            .collect()
    }
}

fn text_of_parts(parts: &[ContentPart]) -> String {
    parts
        .iter()
        .filter_map(|part| match part {
            ContentPart::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

/// One element of a multimodal message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    /// Base64 payload without the `data:` prefix.
    ImageBase64 {
        mime_type: String,
        data: String,
    },
    ImageUrl {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
    /// A document such as a PDF, given either inline or by URL.
    Document {
        mime_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    Audio {
        mime_type: String,
        data: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
    Thinking {
        text: String,
    },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }
}

/// A tool the model may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON Schema object describing the arguments.
    pub input_schema: Value,
}

/// An assistant's request to run a function.
///
/// The arguments travel as an opaque JSON string and are only parsed on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: FunctionCall,
}

fn function_kind() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

impl ToolCall {
    /// Builds a function call. Empty arguments become `{}` so the string stays valid JSON.
    pub fn function(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        let arguments = arguments.into();
        let arguments = if arguments.trim().is_empty() {
            "{}".to_string()
        } else {
            arguments
        };
        Self {
            id: id.into(),
            kind: function_kind(),
            function: FunctionCall {
                name: name.into(),
                arguments,
            },
        }
    }

    /// Parses the argument string. Invalid JSON yields an empty object.
    pub fn parsed_arguments(&self) -> Value {
        match serde_json::from_str::<Value>(&self.function.arguments) {
            Ok(Value::Null) | Err(_) => Value::Object(Default::default()),
            Ok(value) => value,
        }
    }
}

/// How the model may pick tools.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    #[default]
    Auto,
    Required,
    None,
    Specific(String),
}

/// Canonical chat completion request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Overrides the provider default model when set.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Convenience single-turn prompt appended as a user message.
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub stop: Vec<String>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    #[serde(default)]
    pub tool_choice: Option<ToolChoice>,
    /// Extra top-level fields forwarded verbatim to the provider body.
    #[serde(default)]
    pub extra: HashMap<String, Value>,
    /// Cancels HTTP calls, stream reads and rate-limit waits made for this request.
    #[serde(skip)]
    pub cancellation: Option<CancellationToken>,
}

impl ChatRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: Some(prompt.into()),
            ..Self::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Messages with `prompt` folded in as a trailing user turn.
    pub fn all_messages(&self) -> Vec<Message> {
        let mut messages = self.messages.clone();
        if let Some(prompt) = &self.prompt {
            messages.push(Message::user(prompt.clone()));
        }
        messages
    }

    /// Tool choice with the default applied: `auto` whenever tools are present.
    pub fn effective_tool_choice(&self) -> Option<ToolChoice> {
        match &self.tool_choice {
            Some(choice) => Some(choice.clone()),
            None if !self.tools.is_empty() => Some(ToolChoice::Auto),
            None => None,
        }
    }

    /// Rejects tool lists with duplicate names.
    pub fn validate_tools(&self) -> Result<(), crate::error::LLMError> {
        let mut seen = std::collections::HashSet::new();
        for tool in &self.tools {
            if !seen.insert(tool.name.as_str()) {
                return Err(crate::error::LLMError::validation(format!(
                    "duplicate tool name: {}",
                    tool.name
                )));
            }
        }
        Ok(())
    }

    /// Rough token estimate used for proactive rate-limit gating.
    pub fn estimated_tokens(&self) -> u64 {
        let chars: usize = self
            .all_messages()
            .iter()
            .map(|m| m.flat_text().len())
            .sum();
        (chars / 4) as u64 + u64::from(self.max_tokens.unwrap_or(0))
    }

    pub fn token(&self) -> CancellationToken {
        self.cancellation.clone().unwrap_or_default()
    }
}

/// Token counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Canonical non-streaming response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub id: Option<String>,
    pub model: String,
    pub message: Message,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
    /// Provider handle such as `openai` or `anthropic`.
    pub provider: String,
}

impl ChatResponse {
    pub fn content(&self) -> &str {
        &self.message.content
    }

    pub fn tool_calls(&self) -> &[ToolCall] {
        &self.message.tool_calls
    }
}

/// Incremental fragment of a streamed tool call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallDelta {
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// One incremental piece of an assistant message.
///
/// A chunk with `done` set terminates the stream; at most one is produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub model: String,
    pub created: i64,
    pub content: String,
    pub done: bool,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallDelta>,
    pub error: Option<String>,
}

impl Chunk {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    /// An empty terminal chunk.
    pub fn terminal() -> Self {
        Self {
            done: true,
            ..Self::default()
        }
    }

    pub fn terminal_error(error: impl Into<String>) -> Self {
        Self {
            done: true,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
            && self.tool_calls.is_empty()
            && self.finish_reason.is_none()
            && self.usage.is_none()
            && self.error.is_none()
            && !self.done
    }
}

/// Tool wire format family a provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolFormat {
    OpenAi,
    Anthropic,
    Gemini,
}

/// Model entry returned by `Provider::models`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub provider: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub context_window: Option<u64>,
}
