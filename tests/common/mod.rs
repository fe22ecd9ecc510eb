pub mod upstream_stub;

use response2chat::config::{Settings, StateBackendKind};
use response2chat::server::{build_router, AppState};
use tokio::net::TcpListener;

/// Settings wired to a stub upstream, with fast retries for tests.
pub fn test_settings(upstream_base_url: &str) -> Settings {
    Settings {
        upstream_base_url: upstream_base_url.to_string(),
        upstream_api_key: "test-key".into(),
        retry_backoff: 0.01,
        retry_max_seconds: 2.0,
        request_timeout_s: 5.0,
        ..Settings::default()
    }
}

pub fn test_settings_disabled_state(upstream_base_url: &str) -> Settings {
    Settings {
        state_backend: StateBackendKind::Disabled,
        ..test_settings(upstream_base_url)
    }
}

/// Serve the bridge on an ephemeral port and return its base URL.
pub async fn start_app(settings: Settings) -> String {
    let state = AppState::from_settings(settings).expect("app state");
    let app = build_router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind app");
    let addr = listener.local_addr().expect("app local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve app");
    });
    format!("http://{addr}")
}

/// Assert the named SSE events occur in order within a raw body.
pub fn assert_event_order(body: &str, names: &[&str]) {
    let mut position = 0;
    for name in names {
        let needle = format!("event: {name}");
        match body[position..].find(&needle) {
            Some(offset) => position += offset + needle.len(),
            None => panic!("event {name:?} not found after byte {position} in:\n{body}"),
        }
    }
}
