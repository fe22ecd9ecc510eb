//! Responses request -> Chat Completions request.
//!
//! The translator walks the input item sequence once, reducing it onto the
//! upstream `messages` shape, and emits a [`TranslationContext`] the response
//! side (streaming or not) consumes to un-virtualize tool calls and persist
//! the turn.

use std::collections::{HashMap, HashSet};

use serde_json::{json, Value};

use crate::config::Settings;
use crate::error::BridgeError;
use crate::models::chat::{ChatCompletionRequest, ChatMessage, ChatToolCall, Role};
use crate::models::responses::{
    InputItem, InputItemKind, ResponsesInput, ResponsesRequest, ResponsesTool, ToolChoice,
    ToolChoiceSelector,
};
use crate::tools::{ToolMap, ToolRegistry};

/// Per-turn artifacts threaded from request translation into response
/// translation, the streaming bridge, and the store write.
#[derive(Debug, Clone, Default)]
pub struct TranslationContext {
    pub tool_map: ToolMap,
    /// Whether tool declarations were synthesized from call items.
    pub tools_inferred: bool,
    /// The system message injected for this turn; never persisted.
    pub injected_instructions: Option<String>,
    /// Reasoning blocks replayed upstream, in observed order.
    pub reasoning_replay: Vec<Value>,
    /// Fields removed by degradation retries, recorded by the orchestrator.
    pub dropped_fields: Vec<String>,
    /// Reduced history to persist after the turn: prior messages plus this
    /// turn's input reduction. Excludes the injected system message.
    pub messages_for_state: Vec<ChatMessage>,
}

#[derive(Debug, Clone)]
pub struct TranslationResult {
    pub chat_request: ChatCompletionRequest,
    pub context: TranslationContext,
}

/// Resolve the client's model name to the upstream form.
///
/// Alias map first; names already carrying a provider segment pass through;
/// bare names default to the `openai/` namespace.
pub fn resolve_model(model: &str, alias_map: &HashMap<String, String>) -> String {
    if let Some(mapped) = alias_map.get(model) {
        return mapped.clone();
    }
    if model.contains('/') {
        return model.to_string();
    }
    format!("openai/{model}")
}

pub fn translate_request(
    settings: &Settings,
    registry: &ToolRegistry,
    request: &ResponsesRequest,
    history: &[ChatMessage],
) -> Result<TranslationResult, BridgeError> {
    let mut messages: Vec<ChatMessage> = history.to_vec();

    let injected_instructions = request
        .instructions
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    if let Some(instructions) = &injected_instructions {
        messages.insert(0, ChatMessage::system(instructions.clone()));
    }

    let reduced = input_items_to_messages(registry, &request.input)?;
    messages.extend(reduced.messages.iter().cloned());

    let inferred = infer_tools_from_input(&request.input, registry);
    let tools_inferred = request.tools.as_deref().unwrap_or_default().is_empty() && !inferred.is_empty();
    let merged = merge_tools(request.tools.as_deref(), inferred);

    // A follow-up that carries tool-loop items but declares no tools must not
    // trigger fresh tool calls upstream.
    let effective_choice = if tools_inferred && request.tool_choice.is_none() {
        Some(ToolChoice::Mode("none".into()))
    } else {
        request.tool_choice.clone()
    };

    let (tool_map, tool_choice) = normalize_tools_and_choice(registry, merged, effective_choice)?;

    if let Some(reasoning) = &request.reasoning {
        if !reasoning.is_object() {
            return Err(BridgeError::InvalidRequest(
                "reasoning must be an object".into(),
            ));
        }
    }

    let chat_request = ChatCompletionRequest {
        model: resolve_model(&request.model, &settings.model_alias_map),
        messages,
        tools: (!tool_map.chat_tools.is_empty()).then(|| tool_map.chat_tools.clone()),
        tool_choice,
        parallel_tool_calls: request.parallel_tool_calls,
        max_tokens: upstream_max_tokens(request.max_output_tokens, settings.max_tokens_buffer),
        temperature: request.temperature,
        top_p: request.top_p,
        verbosity: request.verbosity.clone(),
        reasoning: request.reasoning.clone(),
        response_format: build_response_format(request),
        stream: request.stream,
    };

    let mut messages_for_state = history.to_vec();
    messages_for_state.extend(reduced.messages);

    Ok(TranslationResult {
        chat_request,
        context: TranslationContext {
            tool_map,
            tools_inferred,
            injected_instructions,
            reasoning_replay: reduced.reasoning_replay,
            dropped_fields: Vec::new(),
            messages_for_state,
        },
    })
}

struct ReducedInput {
    messages: Vec<ChatMessage>,
    reasoning_replay: Vec<Value>,
}

/// Walk the input items in order and append to the upstream `messages` list.
fn input_items_to_messages(
    registry: &ToolRegistry,
    input: &ResponsesInput,
) -> Result<ReducedInput, BridgeError> {
    let items = match input {
        ResponsesInput::Text(text) => {
            return Ok(ReducedInput {
                messages: vec![ChatMessage::user(text.clone())],
                reasoning_replay: Vec::new(),
            })
        }
        ResponsesInput::Items(items) => items,
    };

    let mut messages: Vec<ChatMessage> = Vec::new();
    let mut reasoning_replay: Vec<Value> = Vec::new();
    let mut pending_reasoning: Vec<Value> = Vec::new();

    for item in items {
        match item.classify() {
            InputItemKind::Message => {
                let role_str = item.role.as_deref().unwrap_or_default();
                let role = Role::parse(role_str).ok_or_else(|| {
                    BridgeError::InvalidRequest(format!("Unknown message role: {role_str:?}"))
                })?;
                let content = normalize_content(item.content.clone().unwrap_or(Value::Null));
                let mut msg = ChatMessage::text(role, content);
                if role == Role::Assistant && !pending_reasoning.is_empty() {
                    msg.reasoning_details = Some(std::mem::take(&mut pending_reasoning));
                }
                messages.push(msg);
            }
            InputItemKind::Reasoning => {
                // Retained and replayed via the next assistant message's
                // reasoning_details, never stringified into content.
                if let Some(details) = item.extra.get("reasoning_details").and_then(Value::as_array)
                {
                    for detail in details {
                        if detail.is_object() {
                            pending_reasoning.push(detail.clone());
                            reasoning_replay.push(detail.clone());
                        }
                    }
                }
            }
            InputItemKind::FunctionCall => {
                append_tool_call(
                    &mut messages,
                    ChatToolCall::new(
                        item.call_id.clone().unwrap_or_default(),
                        item.name.clone().unwrap_or_default(),
                        item.arguments.clone().unwrap_or_else(|| "{}".into()),
                    ),
                );
                attach_pending_reasoning(&mut messages, &mut pending_reasoning);
            }
            InputItemKind::FunctionCallOutput => {
                messages.push(ChatMessage::tool(
                    item.call_id.clone().unwrap_or_default(),
                    stringify_output(item.output.as_ref()),
                ));
            }
            InputItemKind::BuiltinCall(external_type) => {
                let function_name = registry.function_name_for_external(external_type);
                append_tool_call(
                    &mut messages,
                    ChatToolCall::new(
                        item.call_id.clone().unwrap_or_default(),
                        function_name,
                        registry.call_arguments_from_item(item),
                    ),
                );
                attach_pending_reasoning(&mut messages, &mut pending_reasoning);
            }
            InputItemKind::BuiltinCallOutput(_) => {
                messages.push(ChatMessage::tool(
                    item.call_id.clone().unwrap_or_default(),
                    stringify_output(item.output.as_ref()),
                ));
            }
            InputItemKind::Unknown => {}
        }
    }

    Ok(ReducedInput {
        messages,
        reasoning_replay,
    })
}

fn normalize_content(content: Value) -> Value {
    match content {
        v @ (Value::String(_) | Value::Array(_) | Value::Object(_)) => v,
        other => Value::String(other.to_string()),
    }
}

/// Coalesce consecutive calls into one assistant message.
fn append_tool_call(messages: &mut Vec<ChatMessage>, tool_call: ChatToolCall) {
    if let Some(last) = messages.last_mut() {
        if last.role == Role::Assistant {
            if let Some(calls) = last.tool_calls.as_mut() {
                calls.push(tool_call);
                return;
            }
        }
    }
    messages.push(ChatMessage::assistant_tool_calls(vec![tool_call]));
}

fn attach_pending_reasoning(messages: &mut Vec<ChatMessage>, pending: &mut Vec<Value>) {
    if pending.is_empty() {
        return;
    }
    if let Some(last) = messages.last_mut() {
        if last.role == Role::Assistant {
            last.reasoning_details = Some(std::mem::take(pending));
        }
    }
}

fn stringify_output(output: Option<&Value>) -> String {
    match output {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Synthesize minimal tool declarations from call items, for follow-up
/// requests that omit `tools`.
fn infer_tools_from_input(input: &ResponsesInput, _registry: &ToolRegistry) -> Vec<ResponsesTool> {
    let items = match input {
        ResponsesInput::Text(_) => return Vec::new(),
        ResponsesInput::Items(items) => items,
    };

    let mut inferred: Vec<ResponsesTool> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for item in items {
        match item.classify() {
            InputItemKind::FunctionCall => {
                let name = item.name.as_deref().unwrap_or("").trim();
                if name.is_empty() || name.starts_with(crate::tools::RESERVED_PREFIX) {
                    continue;
                }
                if !seen.insert(format!("function:{name}")) {
                    continue;
                }
                let mut tool = ResponsesTool::function(
                    name,
                    json!({
                        "type": "object",
                        "properties": {},
                        "additionalProperties": true
                    }),
                );
                if let Some(f) = tool.function.as_mut() {
                    f.description =
                        Some("Inferred tool definition (client did not provide schema).".into());
                }
                inferred.push(tool);
            }
            InputItemKind::BuiltinCall(external) | InputItemKind::BuiltinCallOutput(external) => {
                if seen.insert(format!("builtin:{external}")) {
                    inferred.push(ResponsesTool::builtin(external));
                }
            }
            _ => {}
        }
    }

    inferred
}

fn merge_tools(declared: Option<&[ResponsesTool]>, inferred: Vec<ResponsesTool>) -> Vec<ResponsesTool> {
    let mut merged: Vec<ResponsesTool> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    let key_of = |tool: &ResponsesTool| -> Option<String> {
        if tool.kind == "function" {
            let name = tool.function_name().unwrap_or("").trim().to_string();
            if name.is_empty() {
                return None;
            }
            Some(format!("function:{name}"))
        } else {
            Some(format!("builtin:{}", tool.kind))
        }
    };

    for tool in declared.unwrap_or_default().iter().cloned().chain(inferred) {
        let Some(key) = key_of(&tool) else { continue };
        if seen.insert(key) {
            merged.push(tool);
        }
    }

    merged
}

fn normalize_tools_and_choice(
    registry: &ToolRegistry,
    tools: Vec<ResponsesTool>,
    tool_choice: Option<ToolChoice>,
) -> Result<(ToolMap, Option<Value>), BridgeError> {
    let mut filtered = tools;

    let normalized = match tool_choice {
        Some(ToolChoice::Mode(mode)) => Some(Value::String(mode)),
        Some(ToolChoice::Selector(ToolChoiceSelector::Function { name })) => {
            Some(json!({"type": "function", "function": {"name": name}}))
        }
        Some(ToolChoice::Selector(ToolChoiceSelector::AllowedTools { mode, tools: allowed })) => {
            filtered = filter_tools_by_allowed(filtered, &allowed);
            Some(Value::String(mode))
        }
        None => None,
    };

    let tool_map = registry.virtualize_tools(&filtered)?;
    Ok((tool_map, normalized))
}

fn filter_tools_by_allowed(
    tools: Vec<ResponsesTool>,
    allowed: &[ResponsesTool],
) -> Vec<ResponsesTool> {
    let mut allowed_set: HashSet<String> = HashSet::new();
    for tool in allowed {
        if tool.kind == "function" {
            if let Some(name) = tool.function_name() {
                allowed_set.insert(name.to_string());
            }
        } else {
            allowed_set.insert(tool.kind.clone());
        }
    }

    tools
        .into_iter()
        .filter(|tool| {
            if tool.kind == "function" {
                tool.function_name()
                    .map(|name| allowed_set.contains(name))
                    .unwrap_or(false)
            } else {
                allowed_set.contains(&tool.kind)
            }
        })
        .collect()
}

fn build_response_format(request: &ResponsesRequest) -> Option<Value> {
    let format = request.text.as_ref()?.format.as_ref()?;
    match format.kind.as_str() {
        "json_schema" => {
            let mut json_schema = serde_json::Map::new();
            if let Some(name) = &format.name {
                json_schema.insert("name".into(), Value::String(name.clone()));
            }
            if let Some(strict) = format.strict {
                json_schema.insert("strict".into(), Value::Bool(strict));
            }
            if let Some(schema) = &format.schema {
                json_schema.insert("schema".into(), schema.clone());
            }
            Some(json!({"type": "json_schema", "json_schema": json_schema}))
        }
        "json_object" => Some(json!({"type": "json_object"})),
        _ => None,
    }
}

/// Compute upstream `max_tokens` from Responses `max_output_tokens`.
///
/// Some upstreams count hidden reasoning tokens against `max_tokens`, which
/// can starve short visible outputs. The buffer keeps "OK"-style replies and
/// tool-loop follow-ups from being truncated.
fn upstream_max_tokens(max_output_tokens: Option<u32>, buffer: u32) -> Option<u32> {
    let n = max_output_tokens?;
    if n == 0 {
        return Some(0);
    }
    Some(n.saturating_add(buffer))
}
