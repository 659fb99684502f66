use crate::error::{ProxyError, ProxyResult};
use crate::proxy::{admin, handlers, state::AppState};
use axum::{
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::cors::CorsLayer;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/messages", post(handlers::messages::handle_messages))
        .route("/health", get(health))
        .nest("/admin", admin::router())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn serve(state: AppState) -> ProxyResult<()> {
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let cancel = state.cancel.clone();
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| ProxyError::Internal(format!("failed to bind {}: {}", addr, e)))?;
    tracing::info!("[Server] Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| ProxyError::Internal(format!("server error: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AppConfig;

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.data_dir = dir.path().to_path_buf();
        let state = AppState::new(config, dir.path().join("config.json"));
        let app = build_router(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let body: serde_json::Value = reqwest::get(format!("http://{}/health", addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
        server.abort();
    }

    #[tokio::test]
    async fn messages_rejects_malformed_body() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.data_dir = dir.path().to_path_buf();
        let state = AppState::new(config, dir.path().join("config.json"));
        let app = build_router(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = reqwest::Client::new();
        let response = client
            .post(format!("http://{}/v1/messages", addr))
            .json(&serde_json::json!({"model": "m", "messages": []}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 400);

        // No accounts configured: a valid request surfaces 503.
        let response = client
            .post(format!("http://{}/v1/messages", addr))
            .json(&serde_json::json!({
                "model": "claude-sonnet-4-20250514",
                "max_tokens": 16,
                "messages": [{"role": "user", "content": "a real question here"}]
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 503);
        server.abort();
    }
}
