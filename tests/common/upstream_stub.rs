use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use http::{header, StatusCode};
use serde_json::Value;
use tokio::net::TcpListener;

/// One canned reply from the stub upstream.
#[derive(Clone)]
pub enum StubResponse {
    Json { status: u16, body: Value },
    Sse { body: String },
}

impl StubResponse {
    pub fn ok(body: Value) -> Self {
        StubResponse::Json { status: 200, body }
    }

    pub fn error(status: u16, body: Value) -> Self {
        StubResponse::Json { status, body }
    }

    pub fn sse(frames: &[&str]) -> Self {
        let mut body = String::new();
        for frame in frames {
            body.push_str("data: ");
            body.push_str(frame);
            body.push_str("\n\n");
        }
        body.push_str("data: [DONE]\n\n");
        StubResponse::Sse { body }
    }
}

struct StubState {
    responses: Mutex<VecDeque<StubResponse>>,
    fallback: StubResponse,
    calls: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<Value>>>,
}

/// Minimal Chat Completions upstream bound to an ephemeral port; records
/// every request body and replays the configured responses in order.
pub struct UpstreamStub {
    pub base_url: String,
    calls: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<Value>>>,
}

impl UpstreamStub {
    pub async fn start(responses: Vec<StubResponse>) -> Self {
        let calls = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let fallback = responses
            .last()
            .cloned()
            .unwrap_or_else(|| StubResponse::ok(serde_json::json!({"choices": []})));
        let state = Arc::new(StubState {
            responses: Mutex::new(VecDeque::from(responses)),
            fallback,
            calls: calls.clone(),
            requests: requests.clone(),
        });

        let router = Router::new()
            .route("/chat/completions", post(chat_completions))
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind stub upstream");
        let addr = listener.local_addr().expect("stub local addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve stub");
        });

        Self {
            base_url: format!("http://{addr}"),
            calls,
            requests,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The nth captured upstream request body.
    pub fn request(&self, index: usize) -> Value {
        self.requests.lock().unwrap()[index].clone()
    }
}

async fn chat_completions(State(state): State<Arc<StubState>>, Json(body): Json<Value>) -> Response {
    state.calls.fetch_add(1, Ordering::SeqCst);
    state.requests.lock().unwrap().push(body);

    let next = state
        .responses
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(|| state.fallback.clone());

    match next {
        StubResponse::Json { status, body } => (
            StatusCode::from_u16(status).unwrap(),
            [("x-request-id", "upstream-req-1")],
            Json(body),
        )
            .into_response(),
        StubResponse::Sse { body } => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE.as_str(), "text/event-stream"),
                ("x-request-id", "upstream-req-1"),
            ],
            body,
        )
            .into_response(),
    }
}
