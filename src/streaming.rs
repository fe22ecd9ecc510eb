//! Streaming bridge: upstream chunk deltas -> Responses lifecycle events.
//!
//! One [`StreamBridge`] exists per request and is driven by a single serial
//! loop; nothing here is shared across tasks. Tool-call arguments arrive as
//! indexed string fragments and are joined per index, so the closing events
//! carry exactly the concatenation of the observed deltas.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::models::chat::{ChatMessage, ChatStreamChunk, ChatToolCall, Role, ToolCallDelta};
use crate::models::events::*;
use crate::models::responses::{OutputItem, OutputTextPart, ResponseObject};
use crate::tools::ToolMap;
use crate::util::new_id;

/// One outgoing SSE frame: `event: <name>\ndata: <json>\n\n`.
#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub name: &'static str,
    pub data: Value,
}

impl StreamEvent {
    fn new<T: Serialize>(name: &'static str, payload: T) -> Self {
        Self {
            name,
            data: serde_json::to_value(payload).unwrap_or(Value::Null),
        }
    }

    pub fn to_sse(&self) -> axum::response::sse::Event {
        axum::response::sse::Event::default()
            .event(self.name)
            .data(self.data.to_string())
    }
}

#[derive(Debug)]
struct ToolCallState {
    call_id: String,
    name: String,
    arguments: String,
    output_index: usize,
    item_id: String,
    external_type: Option<String>,
}

pub struct StreamBridge {
    response_id: String,
    model: String,
    created_at: u64,
    tool_map: ToolMap,
    output_items: Vec<OutputItem>,
    text_index: Option<usize>,
    text_item_id: Option<String>,
    text: String,
    tool_calls: BTreeMap<usize, ToolCallState>,
    usage: Option<Value>,
    finish_reason: Option<String>,
}

impl StreamBridge {
    pub fn new(response_id: String, model: String, created_at: u64, tool_map: ToolMap) -> Self {
        Self {
            response_id,
            model,
            created_at,
            tool_map,
            output_items: Vec::new(),
            text_index: None,
            text_item_id: None,
            text: String::new(),
            tool_calls: BTreeMap::new(),
            usage: None,
            finish_reason: None,
        }
    }

    /// Events emitted on the first upstream byte.
    pub fn start_events(&self) -> Vec<StreamEvent> {
        vec![StreamEvent::new(
            "response.created",
            ResponseCreatedEvent {
                tp: "response.created",
                response: self.build_response("in_progress"),
            },
        )]
    }

    pub fn process_chunk(&mut self, chunk: &ChatStreamChunk) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if chunk.usage.is_some() {
            self.usage = chunk.usage.clone();
        }
        for choice in &chunk.choices {
            if let Some(reason) = &choice.finish_reason {
                self.finish_reason = Some(reason.clone());
            }
            if let Some(content) = &choice.delta.content {
                events.extend(self.handle_text_delta(content));
            }
            if let Some(tool_calls) = &choice.delta.tool_calls {
                for delta in tool_calls {
                    events.extend(self.handle_tool_call_delta(delta));
                }
            }
        }
        events
    }

    /// Close every open item and emit `response.completed` last.
    pub fn finish_events(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();

        if let (Some(index), Some(item_id)) = (self.text_index, self.text_item_id.clone()) {
            events.push(StreamEvent::new(
                "response.output_text.done",
                OutputTextDoneEvent {
                    tp: "response.output_text.done",
                    item_id: item_id.clone(),
                    output_index: index,
                    content_index: 0,
                    text: self.text.clone(),
                },
            ));
            events.push(StreamEvent::new(
                "response.content_part.done",
                ContentPartDoneEvent {
                    tp: "response.content_part.done",
                    item_id,
                    output_index: index,
                    content_index: 0,
                    part: OutputTextPart::new(self.text.clone()),
                },
            ));
            events.push(StreamEvent::new(
                "response.output_item.done",
                OutputItemDoneEvent {
                    tp: "response.output_item.done",
                    output_index: index,
                    item: self.output_items[index].clone(),
                },
            ));
        }

        let mut states: Vec<&ToolCallState> = self.tool_calls.values().collect();
        states.sort_by_key(|s| s.output_index);
        for state in states {
            events.push(StreamEvent::new(
                "response.function_call_arguments.done",
                FunctionCallArgumentsDoneEvent {
                    tp: "response.function_call_arguments.done",
                    item_id: state.item_id.clone(),
                    output_index: state.output_index,
                    arguments: state.arguments.clone(),
                },
            ));
            events.push(StreamEvent::new(
                "response.output_item.done",
                OutputItemDoneEvent {
                    tp: "response.output_item.done",
                    output_index: state.output_index,
                    item: self.output_items[state.output_index].clone(),
                },
            ));
        }

        events.push(StreamEvent::new(
            "response.completed",
            ResponseCompletedEvent {
                tp: "response.completed",
                response: self.final_response(),
            },
        ));
        events
    }

    /// The single terminal event for failures after the stream has started.
    pub fn failure_event(&self, error: Value) -> StreamEvent {
        StreamEvent::new(
            "response.failed",
            ResponseFailedEvent {
                tp: "response.failed",
                response: self.build_response("failed"),
                error,
            },
        )
    }

    /// Assistant message equivalent of the aggregated stream, for the store.
    pub fn assistant_message(&self) -> Option<ChatMessage> {
        let mut states: Vec<&ToolCallState> = self.tool_calls.values().collect();
        states.sort_by_key(|s| s.output_index);
        let tool_calls: Vec<ChatToolCall> = states
            .iter()
            .map(|s| ChatToolCall::new(s.call_id.clone(), s.name.clone(), s.arguments.clone()))
            .collect();

        if self.text.is_empty() && tool_calls.is_empty() {
            return None;
        }
        let mut message = ChatMessage::text(Role::Assistant, Value::Null);
        message.content = (!self.text.is_empty()).then(|| Value::String(self.text.clone()));
        message.tool_calls = (!tool_calls.is_empty()).then_some(tool_calls);
        Some(message)
    }

    pub fn final_response(&self) -> ResponseObject {
        let status = if self.finish_reason.as_deref() == Some("length") {
            "incomplete"
        } else {
            "completed"
        };
        self.build_response(status)
    }

    fn handle_text_delta(&mut self, delta: &str) -> Vec<StreamEvent> {
        let mut events = Vec::new();

        if self.text_index.is_none() {
            let item_id = new_id("item");
            let item = OutputItem::message(item_id.clone(), "");
            let index = self.output_items.len();
            self.output_items.push(item.clone());
            self.text_index = Some(index);
            self.text_item_id = Some(item_id.clone());
            events.push(StreamEvent::new(
                "response.output_item.added",
                OutputItemAddedEvent {
                    tp: "response.output_item.added",
                    output_index: index,
                    item,
                },
            ));
            events.push(StreamEvent::new(
                "response.content_part.added",
                ContentPartAddedEvent {
                    tp: "response.content_part.added",
                    item_id,
                    output_index: index,
                    content_index: 0,
                    part: OutputTextPart::new(""),
                },
            ));
        }

        let index = self.text_index.expect("text item opened above");
        self.text.push_str(delta);
        if let Some(parts) = self.output_items[index].content.as_mut() {
            if let Some(part) = parts.first_mut() {
                part.text = self.text.clone();
            }
        }
        events.push(StreamEvent::new(
            "response.output_text.delta",
            OutputTextDeltaEvent {
                tp: "response.output_text.delta",
                item_id: self.text_item_id.clone().unwrap_or_default(),
                output_index: index,
                content_index: 0,
                delta: delta.to_string(),
            },
        ));
        events
    }

    fn handle_tool_call_delta(&mut self, delta: &ToolCallDelta) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        let index = delta.index.unwrap_or(0);
        let incoming_name = delta.function.as_ref().and_then(|f| f.name.clone());
        let arguments_delta = delta.function.as_ref().and_then(|f| f.arguments.clone());

        if !self.tool_calls.contains_key(&index) {
            let call_id = delta
                .id
                .clone()
                .unwrap_or_else(|| new_id("call"));
            let name = incoming_name.clone().unwrap_or_default();
            let external_type = self
                .tool_map
                .external_for_function(&name)
                .map(str::to_string);
            let (item_kind, item_name) = match &external_type {
                Some(external) => (format!("{external}_call"), external.clone()),
                None => ("function_call".to_string(), name.clone()),
            };
            let item_id = new_id("item");
            let item = OutputItem::call(item_id.clone(), item_kind, call_id.clone(), item_name, "");
            let output_index = self.output_items.len();
            self.output_items.push(item.clone());
            self.tool_calls.insert(
                index,
                ToolCallState {
                    call_id,
                    name,
                    arguments: String::new(),
                    output_index,
                    item_id,
                    external_type,
                },
            );
            events.push(StreamEvent::new(
                "response.output_item.added",
                OutputItemAddedEvent {
                    tp: "response.output_item.added",
                    output_index,
                    item,
                },
            ));
        }

        let Self {
            tool_calls,
            output_items,
            tool_map,
            ..
        } = self;
        let state = tool_calls.get_mut(&index).expect("state inserted above");

        // A late-arriving function name can re-virtualize the open item.
        if let Some(name) = incoming_name {
            if !name.is_empty() && state.name != name {
                state.name = name.clone();
                if state.external_type.is_none() {
                    let item = &mut output_items[state.output_index];
                    if let Some(external) = tool_map.external_for_function(&name) {
                        state.external_type = Some(external.to_string());
                        item.kind = format!("{external}_call");
                        item.name = Some(external.to_string());
                    } else {
                        item.name = Some(name);
                    }
                }
            }
        }

        if let Some(fragment) = arguments_delta {
            if !fragment.is_empty() {
                state.arguments.push_str(&fragment);
                output_items[state.output_index].arguments = Some(state.arguments.clone());
                events.push(StreamEvent::new(
                    "response.function_call_arguments.delta",
                    FunctionCallArgumentsDeltaEvent {
                        tp: "response.function_call_arguments.delta",
                        item_id: state.item_id.clone(),
                        output_index: state.output_index,
                        delta: fragment,
                    },
                ));
            }
        }

        events
    }

    fn build_response(&self, status: &str) -> ResponseObject {
        let mut response = ResponseObject::new(
            self.response_id.clone(),
            self.created_at,
            self.model.clone(),
            status,
        );
        response.output = self.output_items.clone();
        response.usage = self.usage.clone();
        response
    }
}
