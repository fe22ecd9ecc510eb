//! Payload structs for the Responses streaming lifecycle events.
//!
//! Each event is framed as `event: <name>\ndata: <json>\n\n`; the payload
//! repeats the event name in its `type` field.

use serde::Serialize;
use serde_json::Value;

use crate::models::responses::{OutputItem, OutputTextPart, ResponseObject};

#[derive(Debug, Serialize)]
pub struct ResponseCreatedEvent {
    #[serde(rename = "type")]
    pub tp: &'static str,
    pub response: ResponseObject,
}

#[derive(Debug, Serialize)]
pub struct OutputItemAddedEvent {
    #[serde(rename = "type")]
    pub tp: &'static str,
    pub output_index: usize,
    pub item: OutputItem,
}

#[derive(Debug, Serialize)]
pub struct ContentPartAddedEvent {
    #[serde(rename = "type")]
    pub tp: &'static str,
    pub item_id: String,
    pub output_index: usize,
    pub content_index: usize,
    pub part: OutputTextPart,
}

#[derive(Debug, Serialize)]
pub struct OutputTextDeltaEvent {
    #[serde(rename = "type")]
    pub tp: &'static str,
    pub item_id: String,
    pub output_index: usize,
    pub content_index: usize,
    pub delta: String,
}

#[derive(Debug, Serialize)]
pub struct OutputTextDoneEvent {
    #[serde(rename = "type")]
    pub tp: &'static str,
    pub item_id: String,
    pub output_index: usize,
    pub content_index: usize,
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct ContentPartDoneEvent {
    #[serde(rename = "type")]
    pub tp: &'static str,
    pub item_id: String,
    pub output_index: usize,
    pub content_index: usize,
    pub part: OutputTextPart,
}

#[derive(Debug, Serialize)]
pub struct FunctionCallArgumentsDeltaEvent {
    #[serde(rename = "type")]
    pub tp: &'static str,
    pub item_id: String,
    pub output_index: usize,
    pub delta: String,
}

#[derive(Debug, Serialize)]
pub struct FunctionCallArgumentsDoneEvent {
    #[serde(rename = "type")]
    pub tp: &'static str,
    pub item_id: String,
    pub output_index: usize,
    pub arguments: String,
}

#[derive(Debug, Serialize)]
pub struct OutputItemDoneEvent {
    #[serde(rename = "type")]
    pub tp: &'static str,
    pub output_index: usize,
    pub item: OutputItem,
}

#[derive(Debug, Serialize)]
pub struct ResponseCompletedEvent {
    #[serde(rename = "type")]
    pub tp: &'static str,
    pub response: ResponseObject,
}

#[derive(Debug, Serialize)]
pub struct ResponseFailedEvent {
    #[serde(rename = "type")]
    pub tp: &'static str,
    pub response: ResponseObject,
    pub error: Value,
}
