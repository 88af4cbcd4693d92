mod backend;
mod config;
mod frame;
mod routes;
mod services;
mod state;

use std::sync::Arc;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let gateway_config = config::GatewayConfig::from_env();
    let backend = Arc::new(
        backend::HttpBackend::from_env().expect("backend init failed: BACKEND_BASE_URL required"),
    );

    let state = state::AppState::new(
        backend.clone(),
        backend.clone(),
        backend.clone(),
        backend,
        gateway_config,
    );

    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", gateway_config.port))
        .await
        .expect("failed to bind");

    tracing::info!(port = %gateway_config.port, "studysync listening");
    axum::serve(listener, app).await.expect("server failed");
}
