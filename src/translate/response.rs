//! Chat Completions completion -> Responses object.

use crate::models::chat::{ChatCompletionResponse, ChatMessage, ChatToolCall};
use crate::models::responses::{OutputItem, ResponseObject};
use crate::tools::ToolMap;
use crate::util::new_id;

/// Project the upstream completion into a Responses object.
///
/// The assistant message maps to output items in order: reasoning details,
/// textual content, then each tool call (un-virtualized through the turn's
/// [`ToolMap`], with `call_id` copied verbatim). A `length` finish reason
/// marks the response `incomplete`.
pub fn chat_response_to_response_object(
    chat_response: &ChatCompletionResponse,
    model: &str,
    tool_map: &ToolMap,
    response_id: String,
    created_at: u64,
) -> ResponseObject {
    let choice = chat_response.choices.first();
    let message = choice.and_then(|c| c.message.as_ref());
    let finish_reason = choice.and_then(|c| c.finish_reason.as_deref());

    let status = if finish_reason == Some("length") {
        "incomplete"
    } else {
        "completed"
    };
    let mut response = ResponseObject::new(response_id, created_at, model.to_string(), status);

    if let Some(message) = message {
        if let Some(details) = &message.reasoning_details {
            if !details.is_empty() {
                response
                    .output
                    .push(OutputItem::reasoning(new_id("item"), details.clone()));
            }
        }
        if let Some(text) = message.content_text() {
            if !text.is_empty() {
                response.output.push(OutputItem::message(new_id("item"), text));
            }
        }
        for tool_call in message.tool_calls.as_deref().unwrap_or_default() {
            response.output.push(tool_call_to_output_item(tool_call, tool_map));
        }
    }

    response.usage = chat_response.usage.clone();
    response
}

fn tool_call_to_output_item(tool_call: &ChatToolCall, tool_map: &ToolMap) -> OutputItem {
    let function_name = tool_call.function.name.as_str();
    let (kind, name) = match tool_map.external_for_function(function_name) {
        Some(external) => (format!("{external}_call"), external.to_string()),
        None => ("function_call".to_string(), function_name.to_string()),
    };
    OutputItem::call(
        new_id("item"),
        kind,
        tool_call.id.clone(),
        name,
        tool_call.function.arguments.clone(),
    )
}

/// The assistant message to append to the stored history, if the completion
/// produced one.
pub fn assistant_message_for_state(chat_response: &ChatCompletionResponse) -> Option<ChatMessage> {
    chat_response
        .choices
        .first()
        .and_then(|c| c.message.clone())
}
