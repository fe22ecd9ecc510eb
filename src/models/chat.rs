use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;

/// Chat Completions role enumeration.
///
/// Lowercase serialization matches the upstream API:
/// "system" | "developer" | "user" | "assistant" | "tool"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    /// Newer alias for system-level guidance; forwarded verbatim.
    Developer,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn parse(value: &str) -> Option<Role> {
        match value {
            "system" => Some(Role::System),
            "developer" => Some(Role::Developer),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

/// JSON Schema for a function tool declaration sent upstream.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatToolFunction {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// JSON Schema object describing the function parameters.
    #[serde(default)]
    pub parameters: Option<Value>,
}

/// Upstream tool declaration; every tool kind is virtualized onto `function`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatToolDefinition {
    Function { function: ChatToolFunction },
}

impl ChatToolDefinition {
    pub fn function(&self) -> &ChatToolFunction {
        match self {
            ChatToolDefinition::Function { function } => function,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatToolCallFunction {
    pub name: String,
    /// Arguments as a JSON-encoded string, per the Chat Completions wire shape.
    pub arguments: String,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ChatToolCallFunction,
}

impl ChatToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: "function".into(),
            function: ChatToolCallFunction {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

/// One turn in the upstream `messages` list.
///
/// `content` accepts a string or an array of content parts; `Value` keeps
/// both shapes intact. An assistant message carrying `tool_calls` pairs with
/// one `tool` message per call on the next turn.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default)]
    pub content: Option<Value>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ChatToolCall>>,
    #[serde(default)]
    pub tool_call_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub reasoning: Option<String>,
    /// Provider-specific reasoning blocks replayed across turns.
    #[serde(default)]
    pub reasoning_details: Option<Vec<Value>>,
}

impl ChatMessage {
    pub fn text(role: Role, content: impl Into<Value>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
            name: None,
            reasoning: None,
            reasoning_details: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::text(Role::System, Value::String(content.into()))
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(Role::User, Value::String(content.into()))
    }

    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(Value::String(content.into())),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
            name: None,
            reasoning: None,
            reasoning_details: None,
        }
    }

    pub fn assistant_tool_calls(tool_calls: Vec<ChatToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: None,
            tool_calls: Some(tool_calls),
            tool_call_id: None,
            name: None,
            reasoning: None,
            reasoning_details: None,
        }
    }

    /// Text content, if the content is a plain string.
    pub fn content_text(&self) -> Option<&str> {
        self.content.as_ref().and_then(|v| v.as_str())
    }
}

/// Chat Completions request (the subset this bridge produces).
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub tools: Option<Vec<ChatToolDefinition>>,
    #[serde(default)]
    pub tool_choice: Option<Value>,
    #[serde(default)]
    pub parallel_tool_calls: Option<bool>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub verbosity: Option<String>,
    #[serde(default)]
    pub reasoning: Option<Value>,
    #[serde(default)]
    pub response_format: Option<Value>,
    #[serde(default)]
    pub stream: Option<bool>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionChoice {
    #[serde(default)]
    pub index: Option<u32>,
    #[serde(default)]
    pub message: Option<ChatMessage>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub object: Option<String>,
    #[serde(default)]
    pub created: Option<u64>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub choices: Vec<ChatCompletionChoice>,
    #[serde(default)]
    pub usage: Option<Value>,
}

// ============================================================================
// Streaming chunk models (upstream SSE deltas)
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolCallFunctionDelta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

/// One indexed fragment of a streamed tool call.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolCallDelta {
    #[serde(default)]
    pub index: Option<usize>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<ToolCallFunctionDelta>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatStreamDelta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatStreamChoice {
    #[serde(default)]
    pub delta: ChatStreamDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// One upstream SSE `data:` chunk.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatStreamChunk {
    #[serde(default)]
    pub choices: Vec<ChatStreamChoice>,
    #[serde(default)]
    pub usage: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn assistant_tool_call_serializes_without_nulls() {
        let msg = ChatMessage::assistant_tool_calls(vec![ChatToolCall::new(
            "call_1",
            "get_weather",
            r#"{"city":"Paris"}"#,
        )]);
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["role"], "assistant");
        assert!(v.get("content").is_none());
        assert_eq!(v["tool_calls"][0]["id"], "call_1");
        assert_eq!(v["tool_calls"][0]["type"], "function");
        assert_eq!(v["tool_calls"][0]["function"]["name"], "get_weather");
    }

    #[test]
    fn stream_chunk_parses_tool_call_fragments() {
        let chunk: ChatStreamChunk = serde_json::from_value(json!({
            "choices": [{
                "delta": {
                    "tool_calls": [{
                        "index": 0,
                        "id": "call_9",
                        "function": {"name": "shell", "arguments": "{\"cmd\":"}
                    }]
                }
            }]
        }))
        .unwrap();
        let tc = &chunk.choices[0].delta.tool_calls.as_ref().unwrap()[0];
        assert_eq!(tc.index, Some(0));
        assert_eq!(tc.id.as_deref(), Some("call_9"));
        assert_eq!(
            tc.function.as_ref().unwrap().arguments.as_deref(),
            Some("{\"cmd\":")
        );
    }

    #[test]
    fn unknown_role_is_rejected() {
        let err = serde_json::from_value::<ChatMessage>(json!({
            "role": "narrator",
            "content": "hi"
        }));
        assert!(err.is_err());
    }
}
