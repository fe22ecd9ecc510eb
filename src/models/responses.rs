use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serde_with::skip_serializing_none;

/// Function payload of a Responses tool declaration.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsesToolFunction {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Option<Value>,
}

/// A tool declaration as clients send it.
///
/// Two shapes are accepted: nested `{type:"function", function:{…}}` and flat
/// `{type:"function", name, parameters}`. Built-in tools are declared by bare
/// type, e.g. `{type:"apply_patch"}`.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsesTool {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub function: Option<ResponsesToolFunction>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Option<Value>,
}

impl ResponsesTool {
    pub fn builtin(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            function: None,
            name: None,
            description: None,
            parameters: None,
        }
    }

    pub fn function(name: impl Into<String>, parameters: Value) -> Self {
        Self {
            kind: "function".into(),
            function: Some(ResponsesToolFunction {
                name: name.into(),
                description: None,
                parameters: Some(parameters),
            }),
            name: None,
            description: None,
            parameters: None,
        }
    }

    /// Declared function name, from either the nested or the flat shape.
    pub fn function_name(&self) -> Option<&str> {
        self.function
            .as_ref()
            .map(|f| f.name.as_str())
            .or(self.name.as_deref())
    }
}

/// Object-shaped tool_choice selectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolChoiceSelector {
    Function {
        name: String,
    },
    AllowedTools {
        mode: String,
        tools: Vec<ResponsesTool>,
    },
}

/// `tool_choice`: a bare mode string or an object selector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
    Mode(String),
    Selector(ToolChoiceSelector),
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseTextFormat {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub strict: Option<bool>,
    #[serde(default)]
    pub schema: Option<Value>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseTextConfig {
    #[serde(default)]
    pub format: Option<ResponseTextFormat>,
}

/// One entry of the Responses `input` sequence.
///
/// The item space is open-ended (`shell_call`, `apply_patch_call_output`, …),
/// so this stays a permissive struct; [`InputItem::classify`] gives the
/// reducer an exhaustive view. Unmodeled fields land in `extra` and feed the
/// built-in argument projection.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputItem {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<Value>,
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Classified view of an input item, for exhaustive handling in the reducer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputItemKind<'a> {
    /// `{role, content}` with or without an explicit `message` type.
    Message,
    Reasoning,
    FunctionCall,
    FunctionCallOutput,
    /// A virtualized built-in call, e.g. `shell_call`.
    BuiltinCall(&'a str),
    /// Its output counterpart, e.g. `shell_call_output`.
    BuiltinCallOutput(&'a str),
    Unknown,
}

impl InputItem {
    pub fn message(role: impl Into<String>, content: impl Into<Value>) -> Self {
        Self {
            kind: None,
            role: Some(role.into()),
            content: Some(content.into()),
            call_id: None,
            name: None,
            arguments: None,
            output: None,
            extra: Map::new(),
        }
    }

    pub fn classify(&self) -> InputItemKind<'_> {
        if self.role.is_some() && self.content.is_some() {
            return InputItemKind::Message;
        }
        let kind = self.kind.as_deref().unwrap_or("");
        match kind {
            "reasoning" => InputItemKind::Reasoning,
            "function_call" => InputItemKind::FunctionCall,
            "function_call_output" => InputItemKind::FunctionCallOutput,
            _ => {
                if let Some(external) = kind.strip_suffix("_call_output") {
                    if !external.is_empty() {
                        return InputItemKind::BuiltinCallOutput(external);
                    }
                }
                if let Some(external) = kind.strip_suffix("_call") {
                    if !external.is_empty() {
                        return InputItemKind::BuiltinCall(external);
                    }
                }
                InputItemKind::Unknown
            }
        }
    }
}

/// The `input` field: a bare prompt string or an ordered item sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponsesInput {
    Text(String),
    Items(Vec<InputItem>),
}

/// A Responses API create request.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsesRequest {
    pub model: String,
    pub input: ResponsesInput,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub tools: Option<Vec<ResponsesTool>>,
    #[serde(default)]
    pub tool_choice: Option<ToolChoice>,
    #[serde(default)]
    pub parallel_tool_calls: Option<bool>,
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub verbosity: Option<String>,
    #[serde(default)]
    pub text: Option<ResponseTextConfig>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub previous_response_id: Option<String>,
    #[serde(default)]
    pub store: Option<bool>,
    #[serde(default)]
    pub reasoning: Option<Value>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputTextPart {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

impl OutputTextPart {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            kind: "output_text".into(),
            text: text.into(),
        }
    }
}

/// One entry of `ResponseObject.output`: a `message`, `function_call`,
/// un-virtualized `*_call`, or `reasoning` item.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputItem {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<Vec<OutputTextPart>>,
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
    #[serde(default)]
    pub reasoning_details: Option<Vec<Value>>,
}

impl OutputItem {
    pub fn message(id: String, text: impl Into<String>) -> Self {
        Self {
            id,
            kind: "message".into(),
            role: Some("assistant".into()),
            content: Some(vec![OutputTextPart::new(text)]),
            call_id: None,
            name: None,
            arguments: None,
            reasoning_details: None,
        }
    }

    pub fn call(
        id: String,
        kind: impl Into<String>,
        call_id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id,
            kind: kind.into(),
            role: None,
            content: None,
            call_id: Some(call_id.into()),
            name: Some(name.into()),
            arguments: Some(arguments.into()),
            reasoning_details: None,
        }
    }

    pub fn reasoning(id: String, details: Vec<Value>) -> Self {
        Self {
            id,
            kind: "reasoning".into(),
            role: None,
            content: None,
            call_id: None,
            name: None,
            arguments: None,
            reasoning_details: Some(details),
        }
    }
}

/// The final non-streaming payload, or the semantic aggregate of a stream.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseObject {
    pub id: String,
    pub object: String,
    pub created_at: u64,
    pub model: String,
    pub status: String,
    pub output: Vec<OutputItem>,
    #[serde(default)]
    pub usage: Option<Value>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl ResponseObject {
    pub fn new(id: String, created_at: u64, model: String, status: impl Into<String>) -> Self {
        Self {
            id,
            object: "response".into(),
            created_at,
            model,
            status: status.into(),
            output: Vec::new(),
            usage: None,
            metadata: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn input_accepts_string_and_items() {
        let req: ResponsesRequest =
            serde_json::from_value(json!({"model": "gpt-4.1", "input": "Hello"})).unwrap();
        assert!(matches!(req.input, ResponsesInput::Text(ref s) if s == "Hello"));

        let req: ResponsesRequest = serde_json::from_value(json!({
            "model": "gpt-4.1",
            "input": [{"role": "user", "content": "Hello"}]
        }))
        .unwrap();
        match req.input {
            ResponsesInput::Items(items) => assert_eq!(items.len(), 1),
            _ => panic!("expected items"),
        }
    }

    #[test]
    fn classify_covers_call_shapes() {
        let item: InputItem = serde_json::from_value(json!({
            "type": "shell_call", "call_id": "c1", "command": "ls"
        }))
        .unwrap();
        assert_eq!(item.classify(), InputItemKind::BuiltinCall("shell"));
        assert_eq!(item.extra.get("command"), Some(&json!("ls")));

        let item: InputItem = serde_json::from_value(json!({
            "type": "shell_call_output", "call_id": "c1", "output": "ok"
        }))
        .unwrap();
        assert_eq!(item.classify(), InputItemKind::BuiltinCallOutput("shell"));

        let item: InputItem =
            serde_json::from_value(json!({"type": "wobble", "payload": 1})).unwrap();
        assert_eq!(item.classify(), InputItemKind::Unknown);
    }

    #[test]
    fn tool_choice_parses_modes_and_selectors() {
        let tc: ToolChoice = serde_json::from_value(json!("auto")).unwrap();
        assert!(matches!(tc, ToolChoice::Mode(ref m) if m == "auto"));

        let tc: ToolChoice =
            serde_json::from_value(json!({"type": "function", "name": "lookup"})).unwrap();
        assert!(matches!(
            tc,
            ToolChoice::Selector(ToolChoiceSelector::Function { ref name }) if name == "lookup"
        ));

        let tc: ToolChoice = serde_json::from_value(json!({
            "type": "allowed_tools",
            "mode": "required",
            "tools": [{"type": "function", "name": "lookup"}]
        }))
        .unwrap();
        match tc {
            ToolChoice::Selector(ToolChoiceSelector::AllowedTools { mode, tools }) => {
                assert_eq!(mode, "required");
                assert_eq!(tools[0].function_name(), Some("lookup"));
            }
            _ => panic!("expected allowed_tools"),
        }
    }

    #[test]
    fn flat_and_nested_tool_shapes_expose_one_name() {
        let nested: ResponsesTool = serde_json::from_value(json!({
            "type": "function",
            "function": {"name": "lookup", "parameters": {"type": "object"}}
        }))
        .unwrap();
        let flat: ResponsesTool = serde_json::from_value(json!({
            "type": "function", "name": "lookup", "parameters": {"type": "object"}
        }))
        .unwrap();
        assert_eq!(nested.function_name(), Some("lookup"));
        assert_eq!(flat.function_name(), Some("lookup"));
    }
}
