use std::net::SocketAddr;

use response2chat::server::{build_router, AppState};
use response2chat::util::init_tracing;
use response2chat::Settings;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() {
    init_tracing();

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("configuration error: {err:#}");
            std::process::exit(1);
        }
    };

    let addr: SocketAddr = settings
        .bind_addr
        .parse()
        .expect("Invalid RESPONSE2CHAT_BIND_ADDR (expected host:port)");

    let state = match AppState::from_settings(settings) {
        Ok(state) => state,
        Err(err) => {
            eprintln!("startup error: {err:#}");
            std::process::exit(1);
        }
    };

    let app = build_router(state);
    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind TCP listener");
    tracing::info!(
        "Response2Chat listening on http://{}",
        listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| addr.to_string())
    );
    if let Err(e) = axum::serve(listener, app).await {
        eprintln!("server error: {e:#}");
    }
}
