pub mod chat;
pub mod events;
pub mod responses;

pub use chat::{
    ChatCompletionRequest, ChatCompletionResponse, ChatMessage, ChatStreamChunk,
    ChatToolCall, ChatToolDefinition, Role,
};
pub use responses::{
    InputItem, OutputItem, OutputTextPart, ResponseObject, ResponsesInput, ResponsesRequest,
    ResponsesTool, ToolChoice,
};
