use crate::error::ProxyError;
use crate::models::MessagesRequest;
use crate::proxy::handlers::{errors, retry};
use crate::proxy::pipeline::events::{EventStream, StreamingEvent};
use crate::proxy::pipeline::{build_pipeline, collector::CollectedMessage, emitter, stages, tokens, PipelineContext, SharedContext};
use crate::proxy::proxy_pool::FailureCause;
use crate::proxy::sessions::derive_session_key;
use crate::proxy::state::AppState;
use crate::proxy::upstream::{client, oauth, web, DriverKind};
use axum::{
    body::Body,
    extract::{Json, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

// In-client transport retries on one proxy; the third failure quarantines.
const TRANSPORT_ATTEMPTS: usize = 3;
const PEEK_TIMEOUT: Duration = Duration::from_secs(60);

struct AttemptError {
    error: ProxyError,
    account_id: Option<String>,
    driver: Option<DriverKind>,
}

impl AttemptError {
    fn bare(error: ProxyError) -> Self {
        Self {
            error,
            account_id: None,
            driver: None,
        }
    }

    fn on_account(error: ProxyError, account_id: &str, driver: DriverKind) -> Self {
        Self {
            error,
            account_id: Some(account_id.to_string()),
            driver: Some(driver),
        }
    }
}

struct Ready {
    events: EventStream,
    account_id: String,
    driver: DriverKind,
    ctx: SharedContext,
    cleanup: Option<ConversationCleanup>,
}

// Dropped when the response finishes or the client disconnects; schedules
// web conversation teardown unless a client tool call is pending.
struct ConversationCleanup {
    sessions: Arc<crate::proxy::sessions::SessionManager>,
    session_key: String,
    ctx: SharedContext,
}

impl Drop for ConversationCleanup {
    fn drop(&mut self) {
        let keep = self
            .ctx
            .lock()
            .map(|c| c.pending_tool_call.is_some())
            .unwrap_or(false);
        let sessions = self.sessions.clone();
        let key = self.session_key.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                sessions.finish_conversation(&key, keep).await;
            });
        }
    }
}

pub async fn handle_messages(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let trace_id: String =
        rand::Rng::sample_iter(rand::thread_rng(), &rand::distributions::Alphanumeric)
            .take(6)
            .map(char::from)
            .collect::<String>()
            .to_lowercase();

    let request: MessagesRequest = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(e) => {
            return errors::invalid_request_response(format!("Invalid request body: {}", e))
        }
    };
    if let Err(reason) = request.validate() {
        return errors::invalid_request_response(reason);
    }

    info!(
        "[{}] Messages request | model: {} | stream: {} | messages: {} | tools: {}",
        trace_id,
        request.model,
        request.stream,
        request.messages.len(),
        request.tools.as_ref().map(|t| t.len()).unwrap_or(0)
    );

    if let Some(reply) = stages::liveness_reply(&request) {
        info!("[{}] Liveness probe intercepted, returning canned reply", trace_id);
        return canned_response(&request, reply);
    }

    // Over-cap requests queue here.
    let permit = match state.concurrency.clone().acquire_owned().await {
        Ok(p) => p,
        Err(_) => {
            return errors::error_response(&ProxyError::Internal(
                "server is shutting down".into(),
            ))
        }
    };

    let session_key = derive_session_key(&request);
    let server_tools = stages::server_tool_names(request.tools.as_ref());

    let mut attempts: usize = 0;
    let mut overload_attempts: u32 = 0;
    let max_attempts = state.config.retry_attempts.max(1);

    loop {
        let ready = match attempt_once(&state, &request, &session_key, &server_tools, &trace_id)
            .await
        {
            Ok(Some(ready)) => ready,
            Ok(None) => {
                // Empty or stalled upstream stream; plain re-pick.
                attempts += 1;
                if attempts >= max_attempts {
                    return errors::retry_exhausted_response(
                        attempts,
                        &ProxyError::UpstreamProtocol("empty upstream response stream".into()),
                    );
                }
                warn!("[{}] Empty upstream stream, retrying", trace_id);
                continue;
            }
            Err(attempt_error) => {
                match dispatch_failure(
                    &state,
                    attempt_error,
                    &session_key,
                    &trace_id,
                    &mut attempts,
                    &mut overload_attempts,
                    max_attempts,
                )
                .await
                {
                    Some(response) => return response,
                    None => continue,
                }
            }
        };

        state.registry.touch(&ready.account_id).await;
        debug!(
            "[{}] Upstream attempt succeeded via {:?} on account {}",
            trace_id,
            ready.driver,
            crate::models::short_id(&ready.account_id)
        );

        if request.stream {
            return streaming_response(ready, permit);
        }

        // Buffered mode: drive the pipeline to completion, then emit the
        // materialized message. Headers are not committed yet, so a
        // mid-drain failure goes back through the failure dispatcher.
        let Ready {
            events,
            account_id,
            driver,
            ctx,
            cleanup,
        } = ready;
        match emitter::drain(events).await {
            Ok(()) => {
                drop(cleanup);
                let mut message = ctx.lock().expect("pipeline context").collector.message.clone();
                tokens::fill_missing_usage(&mut message, &request);
                info!(
                    "[{}] Request finished | model: {} | in: {} | out: {}",
                    trace_id,
                    message.model,
                    message.usage.input_tokens,
                    message.usage.output_tokens
                );
                drop(permit);
                return buffered_response(&account_id, message);
            }
            Err(e) => {
                drop(cleanup);
                let attempt_error = AttemptError::on_account(e, &account_id, driver);
                match dispatch_failure(
                    &state,
                    attempt_error,
                    &session_key,
                    &trace_id,
                    &mut attempts,
                    &mut overload_attempts,
                    max_attempts,
                )
                .await
                {
                    Some(response) => return response,
                    None => continue,
                }
            }
        }
    }
}

// Marks health state per the error kind and decides between retry (None)
// and a final response (Some).
async fn dispatch_failure(
    state: &AppState,
    attempt_error: AttemptError,
    session_key: &str,
    trace_id: &str,
    attempts: &mut usize,
    overload_attempts: &mut u32,
    max_attempts: usize,
) -> Option<Response> {
    let AttemptError {
        error,
        account_id,
        driver,
    } = attempt_error;

    match &error {
        ProxyError::UpstreamOverloaded(_) => {
            if let Some(id) = &account_id {
                let cooldown = Duration::from_secs(state.config.overload_cooldown);
                if let Err(e) = state.registry.mark_overloaded(id, cooldown).await {
                    warn!("[{}] Failed to mark account overloaded: {}", trace_id, e);
                }
            }
            *overload_attempts += 1;
            if *overload_attempts >= state.config.overload_retry_attempts as u32 {
                return Some(errors::retry_exhausted_response(
                    *overload_attempts as usize,
                    &error,
                ));
            }
            retry::apply(
                retry::RetryStrategy::ExponentialBackoff {
                    attempt: *overload_attempts - 1,
                    cap_secs: 30,
                },
                trace_id,
            )
            .await;
            return None;
        }
        ProxyError::RateLimited { resets_at } => {
            if let Some(id) = &account_id {
                if let Err(e) = state.registry.mark_rate_limited(id, *resets_at).await {
                    warn!("[{}] Failed to mark account rate limited: {}", trace_id, e);
                }
            }
        }
        ProxyError::InvalidCredentials(_) => {
            if let Some(id) = &account_id {
                if let Err(e) = state.registry.mark_invalid(id).await {
                    warn!("[{}] Failed to mark account invalid: {}", trace_id, e);
                }
            }
            if driver == Some(DriverKind::Web) {
                state.sessions.destroy(session_key, "credentials invalid").await;
            }
        }
        ProxyError::ProxyTransport { proxy, message } => {
            let cause = if message.contains("HTTP 403") {
                FailureCause::Http403
            } else {
                FailureCause::Transport
            };
            state.pool.report_failure(proxy, cause);
            if driver == Some(DriverKind::Web) {
                // The session's captured egress is quarantined; rebuild.
                state.sessions.destroy(session_key, "proxy quarantined").await;
            }
        }
        _ => {}
    }

    let strategy = retry::strategy_for(&error, *overload_attempts, state.config.retry_interval);
    if strategy == retry::RetryStrategy::NoRetry {
        if driver == Some(DriverKind::Web) {
            state.sessions.destroy(session_key, "terminal error").await;
        }
        return Some(errors::error_response(&error));
    }

    *attempts += 1;
    if *attempts >= max_attempts {
        if driver == Some(DriverKind::Web) {
            state.sessions.destroy(session_key, "retries exhausted").await;
        }
        return Some(errors::retry_exhausted_response(*attempts, &error));
    }
    retry::apply(strategy, trace_id).await;
    None
}

// One upstream attempt: pick driver + account + proxy, open the raw
// stream, assemble the pipeline, and peek the first event so an upstream
// overload is caught before response headers commit. Ok(None) asks the
// caller to retry (empty/stalled stream).
async fn attempt_once(
    state: &AppState,
    request: &MessagesRequest,
    session_key: &str,
    server_tools: &std::collections::HashSet<String>,
    trace_id: &str,
) -> Result<Option<Ready>, AttemptError> {
    // OAuth when an OAuth-capable account is free; otherwise the web path.
    let outcome = match state.registry.pick_for_oauth().await {
        Ok(account) => oauth_attempt(state, request, account, server_tools).await,
        Err(ProxyError::NoAccountsAvailable(_)) => {
            web_attempt(state, request, session_key, server_tools).await
        }
        Err(e) => Err(AttemptError::bare(e)),
    };

    let mut ready = outcome?;
    match stages::peek_first_event(&mut ready.events, PEEK_TIMEOUT).await {
        Ok(Some(first)) => {
            let rest = std::mem::replace(
                &mut ready.events,
                Box::pin(futures::stream::empty()),
            );
            ready.events = Box::pin(futures::stream::iter(vec![Ok(first)]).chain(rest));
            Ok(Some(ready))
        }
        Ok(None) => {
            debug!("[{}] No first event from upstream", trace_id);
            Ok(None)
        }
        Err(e) => Err(AttemptError {
            error: e,
            account_id: Some(ready.account_id.clone()),
            driver: Some(ready.driver),
        }),
    }
}

async fn oauth_attempt(
    state: &AppState,
    request: &MessagesRequest,
    account: crate::models::Account,
    server_tools: &std::collections::HashSet<String>,
) -> Result<Ready, AttemptError> {
    let account_id = account.organization_uuid.clone();
    let token = oauth::ensure_fresh_token(&state.registry, &account)
        .await
        .map_err(|e| AttemptError::on_account(e, &account_id, DriverKind::OAuth))?;

    // Stateless path: the proxy is picked per call.
    let proxy = state
        .pool
        .get_proxy(Some(&account_id))
        .map_err(AttemptError::bare)?;
    let proxy_id = proxy.as_ref().map(|p| p.id());
    let http = client::build_client(proxy.as_ref(), Duration::from_secs(state.config.request_timeout))
        .map_err(AttemptError::bare)?;

    let mut transport_failures = 0usize;
    let raw = loop {
        match oauth::stream(&http, &token.access_token, request, proxy_id.as_deref()).await {
            Ok(stream) => break stream,
            Err(ProxyError::Network(e)) => {
                transport_failures += 1;
                warn!(
                    "[OAuth] Transport failure {}/{}: {}",
                    transport_failures, TRANSPORT_ATTEMPTS, e
                );
                if transport_failures < TRANSPORT_ATTEMPTS {
                    continue;
                }
                let error = match &proxy_id {
                    Some(id) => {
                        state.pool.report_failure(id, FailureCause::Transport);
                        ProxyError::ProxyTransport {
                            proxy: id.clone(),
                            message: e.to_string(),
                        }
                    }
                    None => ProxyError::Network(e),
                };
                return Err(AttemptError::on_account(error, &account_id, DriverKind::OAuth));
            }
            Err(e) => {
                return Err(AttemptError::on_account(e, &account_id, DriverKind::OAuth))
            }
        }
    };

    let mut ctx = PipelineContext::new(
        request.model.clone(),
        request.stop_sequences.clone(),
        request.stream,
    );
    ctx.server_tool_names = server_tools.clone();
    let ctx = ctx.shared();
    let events = build_pipeline(raw, ctx.clone());

    Ok(Ready {
        events,
        account_id,
        driver: DriverKind::OAuth,
        ctx,
        cleanup: None,
    })
}

async fn web_attempt(
    state: &AppState,
    request: &MessagesRequest,
    session_key: &str,
    server_tools: &std::collections::HashSet<String>,
) -> Result<Ready, AttemptError> {
    let session_arc = state
        .sessions
        .get_or_create(session_key)
        .await
        .map_err(AttemptError::bare)?;
    let mut session = session_arc.lock().await;
    let account_id = session.account_id.clone();
    let account = state
        .registry
        .get(&account_id)
        .await
        .ok_or_else(|| {
            AttemptError::bare(ProxyError::NoAccountsAvailable(
                "session account disappeared".into(),
            ))
        })?;
    let proxy_id = session.proxy.as_ref().map(|p| p.id());

    let empty = Vec::new();
    let (wants_search, web_tools) =
        web::process_web_search_tools(request.tools.as_ref().unwrap_or(&empty));

    let conversation = match session.conversation_uuid.clone() {
        Some(conversation) => conversation,
        None => {
            let conversation =
                web::create_conversation(&session.client, &account, proxy_id.as_deref())
                    .await
                    .map_err(|e| AttemptError::on_account(e, &account_id, DriverKind::Web))?;
            session.conversation_uuid = Some(conversation.clone());
            session.web_search_enabled = false;
            session.paprika_mode = false;
            conversation
        }
    };

    // Conversation-level switches: extended thinking first, then web
    // search (required alongside the injected web_search_v0 tool).
    crate::proxy::sessions::set_thinking(&mut session, &account, request.thinking_enabled())
        .await
        .map_err(|e| AttemptError::on_account(e, &account_id, DriverKind::Web))?;
    if wants_search {
        crate::proxy::sessions::set_web_search(&mut session, &account, true)
            .await
            .map_err(|e| AttemptError::on_account(e, &account_id, DriverKind::Web))?;
    }

    // Inline images ride as uploaded files, not transcript text.
    let images = web::extract_images(request);
    let file_ids = if images.is_empty() {
        Vec::new()
    } else {
        web::upload_images(&session.client, &account, &images).await
    };

    let payload = web::build_completion_request(request, web_tools, file_ids)
        .map_err(AttemptError::bare)?;

    let mut transport_failures = 0usize;
    let raw = loop {
        match web::send_completion(
            &session.client,
            &account,
            &conversation,
            &payload,
            proxy_id.as_deref(),
        )
        .await
        {
            Ok(stream) => break stream,
            Err(ProxyError::Network(e)) => {
                transport_failures += 1;
                warn!(
                    "[Web] Transport failure {}/{}: {}",
                    transport_failures, TRANSPORT_ATTEMPTS, e
                );
                if transport_failures < TRANSPORT_ATTEMPTS {
                    continue;
                }
                let error = match &proxy_id {
                    Some(id) => {
                        state.pool.report_failure(id, FailureCause::Transport);
                        ProxyError::ProxyTransport {
                            proxy: id.clone(),
                            message: e.to_string(),
                        }
                    }
                    None => ProxyError::Network(e),
                };
                return Err(AttemptError::on_account(error, &account_id, DriverKind::Web));
            }
            Err(e) => return Err(AttemptError::on_account(e, &account_id, DriverKind::Web)),
        }
    };
    drop(session);

    let mut ctx = PipelineContext::new(
        request.model.clone(),
        request.stop_sequences.clone(),
        request.stream,
    );
    ctx.server_tool_names = server_tools.clone();
    let ctx = ctx.shared();
    let events = build_pipeline(raw, ctx.clone());

    Ok(Ready {
        events,
        account_id,
        driver: DriverKind::Web,
        ctx: ctx.clone(),
        cleanup: Some(ConversationCleanup {
            sessions: state.sessions.clone(),
            session_key: session_key.to_string(),
            ctx: ctx.clone(),
        }),
    })
}

fn streaming_response(ready: Ready, permit: tokio::sync::OwnedSemaphorePermit) -> Response {
    let Ready {
        events,
        account_id,
        cleanup,
        ..
    } = ready;
    let sse = emitter::into_sse_bytes(events);
    // The permit and conversation guard live exactly as long as the
    // response body; client disconnect drops both.
    let body = async_stream::stream! {
        let _permit = permit;
        let _cleanup = cleanup;
        let mut sse = sse;
        while let Some(item) = sse.next().await {
            yield item;
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("X-Accel-Buffering", "no")
        .header("X-Account-Id", account_id)
        .body(Body::from_stream(body))
        .expect("static response builder")
}

fn buffered_response(account_id: &str, message: CollectedMessage) -> Response {
    (
        StatusCode::OK,
        [("X-Account-Id", account_id)],
        axum::Json(message),
    )
        .into_response()
}

// Canned reply for liveness probes, in both response shapes.
fn canned_response(request: &MessagesRequest, text: &str) -> Response {
    let message_id = format!("msg_{}", uuid::Uuid::new_v4().simple());
    if !request.stream {
        return (
            StatusCode::OK,
            axum::Json(json!({
                "id": message_id,
                "type": "message",
                "role": "assistant",
                "model": request.model,
                "content": [{"type": "text", "text": text}],
                "stop_reason": "end_turn",
                "stop_sequence": null,
                "usage": {"input_tokens": 1, "output_tokens": tokens::estimate_tokens(text)},
            })),
        )
            .into_response();
    }

    let events = vec![
        StreamingEvent::MessageStart {
            message: serde_json::from_value(json!({
                "id": message_id,
                "type": "message",
                "role": "assistant",
                "model": request.model,
                "content": [],
                "usage": {"input_tokens": 1, "output_tokens": 0},
            }))
            .expect("static message shell"),
        },
        StreamingEvent::ContentBlockStart {
            index: 0,
            content_block: crate::proxy::pipeline::events::ContentBlock::Text {
                text: String::new(),
                citations: None,
            },
        },
        StreamingEvent::text_delta(0, text.to_string()),
        StreamingEvent::ContentBlockStop { index: 0 },
        StreamingEvent::MessageDelta {
            delta: crate::proxy::pipeline::events::MessageDeltaBody {
                stop_reason: Some("end_turn".into()),
                stop_sequence: None,
            },
            usage: Some(crate::proxy::pipeline::events::Usage {
                input_tokens: 1,
                output_tokens: tokens::estimate_tokens(text),
                ..Default::default()
            }),
        },
        StreamingEvent::MessageStop,
    ];
    let frames: Vec<Result<bytes::Bytes, std::io::Error>> =
        events.iter().map(|e| Ok(emitter::sse_frame(e))).collect();

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(futures::stream::iter(frames)))
        .expect("static response builder")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AppConfig, ProxyMode, ProxySettings, RotationStrategy};
    use serde_json::json;

    fn test_state() -> AppState {
        let dir = tempfile::tempdir().unwrap().into_path();
        let mut config = AppConfig::default();
        config.data_dir = dir.clone();
        AppState::new(config, dir.join("config.json"))
    }

    // Overload marks the account's cooldown (now + overload_cooldown) and
    // asks for another attempt with backoff.
    #[tokio::test]
    async fn overload_marks_account_and_requests_retry() {
        let state = test_state();
        state
            .registry
            .add_account(Some("cookie".into()), None, Some("org-1".into()), vec![])
            .await
            .unwrap();

        let mut attempts = 0usize;
        let mut overload_attempts = 0u32;
        let before = chrono::Utc::now();
        let outcome = dispatch_failure(
            &state,
            AttemptError::on_account(
                ProxyError::UpstreamOverloaded("overloaded".into()),
                "org-1",
                DriverKind::OAuth,
            ),
            "sid-test",
            "t",
            &mut attempts,
            &mut overload_attempts,
            3,
        )
        .await;

        assert!(outcome.is_none(), "first overload should retry");
        assert_eq!(overload_attempts, 1);
        let account = state.registry.get("org-1").await.unwrap();
        let until = account.overloaded_until.expect("cooldown set");
        let delta = (until - before).num_seconds();
        assert!((25..=35).contains(&delta), "cooldown ~30s, got {}s", delta);
    }

    #[tokio::test]
    async fn overload_attempt_cap_surfaces_error() {
        let state = test_state();
        let mut attempts = 0usize;
        // One short of the default cap of 5.
        let mut overload_attempts = 4u32;
        let outcome = dispatch_failure(
            &state,
            AttemptError::bare(ProxyError::UpstreamOverloaded("overloaded".into())),
            "sid-test",
            "t",
            &mut attempts,
            &mut overload_attempts,
            3,
        )
        .await;
        let response = outcome.expect("cap reached, must surface");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    // Proxy transport failure quarantines the proxy and retries with a
    // fresh pick.
    #[tokio::test]
    async fn proxy_transport_quarantines_and_retries() {
        let state = test_state();
        state.pool.update_settings(ProxySettings {
            mode: ProxyMode::Dynamic,
            rotation_strategy: RotationStrategy::Sequential,
            ..ProxySettings::default()
        });
        state.pool.reload("10.0.0.1:8080\n10.0.0.2:8080");

        let mut attempts = 0usize;
        let mut overload_attempts = 0u32;
        let outcome = dispatch_failure(
            &state,
            AttemptError::bare(ProxyError::ProxyTransport {
                proxy: "http://10.0.0.1:8080".into(),
                message: "connection reset".into(),
            }),
            "sid-test",
            "t",
            &mut attempts,
            &mut overload_attempts,
            3,
        )
        .await;

        assert!(outcome.is_none(), "transport fault should retry");
        assert_eq!(attempts, 1);
        let status = state.pool.status();
        assert_eq!(status.available, 1, "failed proxy is cooling down");
    }

    #[tokio::test]
    async fn rate_limit_marks_account_before_retry() {
        let state = test_state();
        state
            .registry
            .add_account(Some("cookie".into()), None, Some("org-1".into()), vec![])
            .await
            .unwrap();
        let resets_at = chrono::Utc::now() + chrono::Duration::minutes(5);

        let mut attempts = 0usize;
        let mut overload_attempts = 0u32;
        let outcome = dispatch_failure(
            &state,
            AttemptError::on_account(
                ProxyError::RateLimited {
                    resets_at: Some(resets_at),
                },
                "org-1",
                DriverKind::OAuth,
            ),
            "sid-test",
            "t",
            &mut attempts,
            &mut overload_attempts,
            3,
        )
        .await;

        assert!(outcome.is_none());
        let account = state.registry.get("org-1").await.unwrap();
        assert_eq!(account.status, crate::models::AccountStatus::RateLimited);
        assert_eq!(
            account.resets_at.unwrap().timestamp(),
            resets_at.timestamp()
        );
        // The marked account is no longer selectable for new work.
        assert!(state.registry.pick_for_session("sid-other").await.is_err());
    }

    #[tokio::test]
    async fn non_retryable_errors_surface_immediately() {
        let state = test_state();
        let mut attempts = 0usize;
        let mut overload_attempts = 0u32;
        let outcome = dispatch_failure(
            &state,
            AttemptError::bare(ProxyError::UpstreamProtocol("garbled".into())),
            "sid-test",
            "t",
            &mut attempts,
            &mut overload_attempts,
            3,
        )
        .await;
        let response = outcome.expect("protocol errors are terminal");
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(attempts, 0);
    }

    #[test]
    fn canned_response_shapes_follow_stream_flag() {
        let buffered: MessagesRequest = serde_json::from_value(json!({
            "model": "m", "messages": [{"role": "user", "content": "ping"}]
        }))
        .unwrap();
        let response = canned_response(&buffered, "pong");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(header::CONTENT_TYPE)
                .unwrap()
                .to_str()
                .unwrap(),
            "application/json"
        );

        let streaming: MessagesRequest = serde_json::from_value(json!({
            "model": "m", "stream": true, "messages": [{"role": "user", "content": "ping"}]
        }))
        .unwrap();
        let response = canned_response(&streaming, "pong");
        assert_eq!(
            response
                .headers()
                .get(header::CONTENT_TYPE)
                .unwrap()
                .to_str()
                .unwrap(),
            "text/event-stream"
        );
    }
}
