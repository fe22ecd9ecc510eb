#![forbid(unsafe_code)]
#![doc = r#"
Response2Chat

Expose an OpenAI Responses API surface and forward every inference to an
OpenRouter-style Chat Completions backend.

Crate highlights
- Request translation: Responses input items -> Chat `messages`, with per-turn
  tool virtualization (`translate`, `tools`).
- Streaming bridge: upstream chunk deltas -> Responses lifecycle events
  (`streaming`).
- Conversation state: `previous_response_id` rehydration over a pluggable
  memory/redis store (`state`).
- HTTP server (in `server`): `POST /v1/responses` plus retrieval, deletion,
  and operational endpoints.

Note: Keep the mapping rules aligned with the Responses API docs; the event
set evolves over time.
"#]

pub mod config;
pub mod error;
pub mod models;
pub mod server;
pub mod state;
pub mod streaming;
pub mod tools;
pub mod translate;
pub mod upstream;
pub mod util;

// Re-export the primary types for ergonomic library use.
pub use crate::config::Settings;
pub use crate::error::BridgeError;
pub use crate::server::{build_router, AppState};
pub use crate::tools::{ToolMap, ToolRegistry};
pub use crate::translate::translate_request;

// Re-export model namespaces for convenience (downstream users can do
// `use response2chat::chat`).
pub use crate::models::{chat, responses};
