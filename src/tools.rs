//! Tool virtualization.
//!
//! Every tool kind a client declares — built-in (`apply_patch`, `shell`, …)
//! or plain function — is projected onto a function-tool declaration for the
//! upstream. The process-wide [`ToolRegistry`] is the immutable catalog of
//! built-ins; each turn gets its own [`ToolMap`] bijection so responses can
//! be un-virtualized without global state.

use std::collections::{HashMap, HashSet};

use serde_json::{json, Value};

use crate::error::BridgeError;
use crate::models::chat::{ChatToolDefinition, ChatToolFunction};
use crate::models::responses::{InputItem, ResponsesTool};

/// Function names the bridge reserves for its own virtualized tools.
pub const RESERVED_PREFIX: &str = "r2c_";

/// Per-turn bijection between external tool types and upstream function names.
#[derive(Debug, Clone, Default)]
pub struct ToolMap {
    /// Normalized declarations to send upstream.
    pub chat_tools: Vec<ChatToolDefinition>,
    /// Virtualized function name -> external tool type.
    pub function_to_external: HashMap<String, String>,
    /// External tool type -> virtualized function name.
    pub external_to_function: HashMap<String, String>,
}

impl ToolMap {
    pub fn external_for_function(&self, function_name: &str) -> Option<&str> {
        self.function_to_external
            .get(function_name)
            .map(|s| s.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.chat_tools.is_empty()
    }
}

fn apply_patch_tool() -> ChatToolDefinition {
    ChatToolDefinition::Function {
        function: ChatToolFunction {
            name: "apply_patch".into(),
            description: Some(
                "Use the `apply_patch` tool to edit files. \
                 Return the entire apply_patch patch as a string in `input`."
                    .into(),
            ),
            parameters: Some(json!({
                "type": "object",
                "properties": {
                    "input": {
                        "type": "string",
                        "description": "The entire contents of the apply_patch command."
                    }
                },
                "required": ["input"],
                "additionalProperties": false
            })),
        },
    }
}

fn shell_tool(name: &str) -> ChatToolDefinition {
    ChatToolDefinition::Function {
        function: ChatToolFunction {
            name: name.into(),
            description: Some("Return a shell command to run locally.".into()),
            parameters: Some(json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string"},
                    "timeout_ms": {"type": "integer", "minimum": 0},
                    "cwd": {"type": "string"}
                },
                "required": ["command"],
                "additionalProperties": false
            })),
        },
    }
}

/// Static catalog of virtualized built-in tools.
///
/// Canonical names are unprefixed and equal to the external tool type, so a
/// `shell_call` item round-trips through the upstream function `shell`.
/// Immutable after process start; read by all request tasks.
pub struct ToolRegistry {
    prefix: String,
    builtins: HashMap<String, ChatToolDefinition>,
}

impl ToolRegistry {
    pub fn new(prefix: impl Into<String>) -> Self {
        let mut registry = Self {
            prefix: prefix.into(),
            builtins: HashMap::new(),
        };
        for (external, def) in [
            ("apply_patch", apply_patch_tool()),
            ("shell", shell_tool("shell")),
            ("local_shell", shell_tool("local_shell")),
        ] {
            registry
                .register_builtin(external, def)
                .expect("default builtin names are not reserved");
        }
        registry
    }

    pub fn with_defaults() -> Self {
        Self::new(RESERVED_PREFIX)
    }

    /// Register a built-in under its external type. Names carrying the
    /// reserved prefix are refused here, before any request can see them.
    pub fn register_builtin(
        &mut self,
        external_type: &str,
        definition: ChatToolDefinition,
    ) -> Result<(), BridgeError> {
        let name = definition.function().name.clone();
        if external_type.starts_with(&self.prefix) || name.starts_with(&self.prefix) {
            return Err(BridgeError::InvalidRequest(format!(
                "Built-in tool name must not start with reserved prefix {:?}: {:?}",
                self.prefix, name
            )));
        }
        self.builtins.insert(external_type.to_string(), definition);
        Ok(())
    }

    pub fn lookup(&self, external_type: &str) -> Option<&ChatToolDefinition> {
        self.builtins.get(external_type)
    }

    pub fn all(&self) -> impl Iterator<Item = (&str, &ChatToolDefinition)> {
        self.builtins.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Canonical function names claimed by built-ins, for collision checks.
    pub fn reserved_names(&self) -> HashSet<String> {
        self.builtins
            .values()
            .map(|def| def.function().name.clone())
            .collect()
    }

    /// Upstream function name for an external tool type. Unknown types get a
    /// deterministic prefixed fallback.
    pub fn function_name_for_external(&self, external_type: &str) -> String {
        match self.builtins.get(external_type) {
            Some(def) => def.function().name.clone(),
            None => format!("{}{}", self.prefix, external_type),
        }
    }

    /// Full upstream declaration for an external tool type. Unknown types
    /// degrade to a generic single-string payload schema.
    pub fn definition_for_external(&self, external_type: &str) -> ChatToolDefinition {
        match self.builtins.get(external_type) {
            Some(def) => def.clone(),
            None => ChatToolDefinition::Function {
                function: ChatToolFunction {
                    name: self.function_name_for_external(external_type),
                    description: Some(format!("Return a JSON payload for {external_type}.")),
                    parameters: Some(json!({
                        "type": "object",
                        "properties": {"payload": {"type": "string"}},
                        "required": ["payload"],
                        "additionalProperties": false
                    })),
                },
            },
        }
    }

    /// Normalize the declared tools into upstream function declarations and
    /// build the turn's bijection. Fails on duplicate names, reserved-prefix
    /// function names, and built-in vs function collisions.
    pub fn virtualize_tools(&self, tools: &[ResponsesTool]) -> Result<ToolMap, BridgeError> {
        let mut map = ToolMap::default();
        let mut seen_names: HashSet<String> = HashSet::new();

        for tool in tools {
            if tool.kind == "function" {
                let Some(name) = tool.function_name() else {
                    continue;
                };
                let name = name.to_string();
                if name.starts_with(&self.prefix) {
                    return Err(BridgeError::InvalidRequest(format!(
                        "Function tool name must not start with reserved prefix {:?}: {name:?}",
                        self.prefix
                    )));
                }
                if !seen_names.insert(name.clone()) {
                    return Err(BridgeError::InvalidRequest(format!(
                        "Duplicate tool name: {name:?}"
                    )));
                }
                let (description, parameters) = match &tool.function {
                    Some(f) => (f.description.clone(), f.parameters.clone()),
                    None => (tool.description.clone(), tool.parameters.clone()),
                };
                map.chat_tools.push(ChatToolDefinition::Function {
                    function: ChatToolFunction {
                        name,
                        description,
                        parameters,
                    },
                });
            } else {
                let external_type = tool.kind.clone();
                let definition = self.definition_for_external(&external_type);
                let name = definition.function().name.clone();
                if !seen_names.insert(name.clone()) {
                    return Err(BridgeError::InvalidRequest(format!(
                        "Tool name collision for external type {external_type:?}: {name:?}"
                    )));
                }
                map.chat_tools.push(definition);
                map.function_to_external
                    .insert(name.clone(), external_type.clone());
                map.external_to_function.insert(external_type, name);
            }
        }

        Ok(map)
    }

    /// Project a `*_call` input item's fields into the function's JSON
    /// arguments string. An `arguments` field that is already valid JSON is
    /// forwarded untouched.
    pub fn call_arguments_from_item(&self, item: &InputItem) -> String {
        if let Some(args) = &item.arguments {
            if serde_json::from_str::<Value>(args).is_ok() {
                return args.clone();
            }
        }

        let mut data = item.extra.clone();
        data.remove("id");
        if let Some(role) = &item.role {
            data.insert("role".into(), Value::String(role.clone()));
        }
        if let Some(content) = &item.content {
            data.insert("content".into(), content.clone());
        }
        if let Some(name) = &item.name {
            data.insert("name".into(), Value::String(name.clone()));
        }
        if let Some(args) = &item.arguments {
            data.insert("arguments".into(), Value::String(args.clone()));
        }
        if let Some(output) = &item.output {
            data.insert("output".into(), output.clone());
        }
        Value::Object(data).to_string()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
