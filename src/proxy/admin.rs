use crate::models::{OAuthToken, ProxySettings};
use crate::proxy::accounts::refresh;
use crate::proxy::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

// Admin CRUD surface over the registry, pool, and settings. Thin handlers;
// all behavior lives in the managers. Proxy URLs go out redacted.

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/accounts", get(list_accounts).post(add_account))
        .route("/accounts/batch_delete", post(batch_delete_accounts))
        .route("/accounts/batch_refresh", post(batch_refresh_accounts))
        .route("/accounts/:id", axum::routing::delete(delete_account))
        .route("/accounts/:id/refresh", post(refresh_account))
        .route("/proxies", get(get_proxies).put(put_proxies))
        .route("/proxies/status", get(proxies_status))
        .route("/settings/proxy", get(get_proxy_settings).put(put_proxy_settings))
        .route("/status", get(fleet_status))
}

#[derive(Debug, Deserialize)]
struct AddAccountRequest {
    #[serde(default)]
    cookie_value: Option<String>,
    #[serde(default)]
    oauth_token: Option<OAuthToken>,
    #[serde(default)]
    organization_uuid: Option<String>,
    #[serde(default)]
    capabilities: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct BatchIdsRequest {
    organization_uuids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct BatchRefreshRequest {
    organization_uuids: Vec<String>,
    #[serde(default = "default_refresh_concurrency")]
    max_concurrency: usize,
}

fn default_refresh_concurrency() -> usize {
    5
}

async fn list_accounts(State(state): State<AppState>) -> Response {
    Json(state.registry.list().await).into_response()
}

async fn add_account(
    State(state): State<AppState>,
    Json(body): Json<AddAccountRequest>,
) -> Response {
    match state
        .registry
        .add_account(
            body.cookie_value,
            body.oauth_token,
            body.organization_uuid,
            body.capabilities,
        )
        .await
    {
        Ok(account) => (
            StatusCode::CREATED,
            Json(json!({
                "organization_uuid": account.organization_uuid,
                "auth_type": account.auth_type,
                "status": account.status,
            })),
        )
            .into_response(),
        Err(e) => crate::proxy::handlers::errors::error_response(&e),
    }
}

async fn delete_account(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.registry.remove_account(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => crate::proxy::handlers::errors::error_response(&e),
    }
}

async fn batch_delete_accounts(
    State(state): State<AppState>,
    Json(body): Json<BatchIdsRequest>,
) -> Response {
    match state.registry.batch_remove(&body.organization_uuids).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => crate::proxy::handlers::errors::error_response(&e),
    }
}

async fn refresh_account(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let outcome = refresh::refresh_account(
        &state.registry,
        &state.pool,
        &id,
        Duration::from_secs(state.config.probe_timeout),
    )
    .await;
    Json(outcome).into_response()
}

async fn batch_refresh_accounts(
    State(state): State<AppState>,
    Json(body): Json<BatchRefreshRequest>,
) -> Response {
    match refresh::batch_refresh(
        state.registry.clone(),
        state.pool.clone(),
        body.organization_uuids,
        body.max_concurrency,
        Duration::from_secs(state.config.probe_timeout),
    )
    .await
    {
        Ok(report) => Json(report).into_response(),
        Err(e) => crate::proxy::handlers::errors::error_response(&e),
    }
}

// The proxy list is sensitive; responses only ever carry redacted forms.
async fn get_proxies(State(state): State<AppState>) -> Response {
    Json(json!({ "proxies": state.pool.redacted_list() })).into_response()
}

// Body is the proxies.txt content (one per line). The file is persisted
// alongside accounts.json and the pool replaced in place.
async fn put_proxies(State(state): State<AppState>, body: String) -> Response {
    let count = state.pool.reload(&body);
    let path = state.config.data_dir.join("proxies.txt");
    if let Err(e) = std::fs::create_dir_all(&state.config.data_dir)
        .and_then(|_| std::fs::write(&path, &body))
    {
        tracing::error!("[Admin] Failed to persist proxies.txt: {}", e);
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": format!("failed to persist proxy list: {}", e)})),
        )
            .into_response();
    }
    Json(json!({ "loaded": count })).into_response()
}

async fn proxies_status(State(state): State<AppState>) -> Response {
    Json(state.pool.status()).into_response()
}

async fn get_proxy_settings(State(state): State<AppState>) -> Response {
    Json(state.pool.settings()).into_response()
}

async fn put_proxy_settings(
    State(state): State<AppState>,
    Json(settings): Json<ProxySettings>,
) -> Response {
    state.pool.update_settings(settings.clone());
    // Keep config.json in sync so the change survives a restart.
    let mut config = (*state.config).clone();
    config.proxy = settings;
    if let Err(e) = crate::models::save_config(&state.config_path, &config) {
        tracing::warn!("[Admin] Failed to persist proxy settings: {}", e);
    }
    Json(state.pool.settings()).into_response()
}

async fn fleet_status(State(state): State<AppState>) -> Response {
    let registry = state.registry.status().await;
    Json(json!({
        "accounts": registry,
        "sessions": state.sessions.len(),
        "proxy_pool": state.pool.status(),
    }))
    .into_response()
}
