use crate::constants;
use crate::error::{classify_upstream_status, ProxyError, ProxyResult};
use crate::models::{Account, MessagesRequest, OAuthToken};
use crate::proxy::accounts::AccountRegistry;
use crate::proxy::upstream::{ByteStream, ProbeOutcome};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

// OAuth path: the client body goes to the public /v1/messages endpoint
// nearly unchanged, with the account's access token. Responses are already
// in the public event schema.

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

// Exchange the refresh token for a fresh access token and persist it.
pub async fn refresh_token_for(
    registry: &AccountRegistry,
    account: &Account,
) -> ProxyResult<OAuthToken> {
    let token = account
        .oauth_token
        .as_ref()
        .ok_or_else(|| ProxyError::InvalidCredentials("account has no OAuth token".into()))?;
    let refresh_token = token
        .refresh_token
        .as_ref()
        .ok_or_else(|| ProxyError::InvalidCredentials("account has no refresh token".into()))?;

    let client = reqwest::Client::new();
    let response = client
        .post(constants::OAUTH_TOKEN_URL)
        .json(&json!({
            "grant_type": "refresh_token",
            "refresh_token": refresh_token,
            "client_id": constants::OAUTH_CLIENT_ID,
        }))
        .send()
        .await?;

    let status = response.status().as_u16();
    if status != 200 {
        let body = response.text().await.unwrap_or_default();
        return Err(ProxyError::InvalidCredentials(format!(
            "token refresh failed (HTTP {}): {}",
            status, body
        )));
    }

    let parsed: TokenResponse = response
        .json()
        .await
        .map_err(|e| ProxyError::UpstreamProtocol(format!("token response: {}", e)))?;

    let refreshed = OAuthToken {
        access_token: parsed.access_token,
        refresh_token: parsed.refresh_token.or_else(|| Some(refresh_token.clone())),
        expires_at: parsed.expires_in.map(|s| Utc::now().timestamp() + s),
    };
    registry
        .update_oauth_token(&account.organization_uuid, refreshed.clone())
        .await?;
    tracing::info!("[OAuth] Refreshed token for account {}", account.short_id());
    Ok(refreshed)
}

// Return a usable access token, refreshing lazily when close to expiry.
pub async fn ensure_fresh_token(
    registry: &AccountRegistry,
    account: &Account,
) -> ProxyResult<OAuthToken> {
    let token = account
        .oauth_token
        .as_ref()
        .ok_or_else(|| ProxyError::InvalidCredentials("account has no OAuth token".into()))?;
    if token.expires_within(300, Utc::now()) && token.refresh_token.is_some() {
        return refresh_token_for(registry, account).await;
    }
    Ok(token.clone())
}

fn messages_headers(access_token: &str) -> Vec<(&'static str, String)> {
    vec![
        ("Authorization", format!("Bearer {}", access_token)),
        ("anthropic-version", constants::ANTHROPIC_VERSION.to_string()),
        ("anthropic-beta", constants::OAUTH_BETA_HEADER.to_string()),
        ("Content-Type", "application/json".to_string()),
        ("Accept", "text/event-stream".to_string()),
    ]
}

pub fn parse_reset_header(value: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = value?;
    // Header is RFC3339; some upstreams use a trailing Z.
    DateTime::parse_from_rfc3339(&raw.replace('Z', "+00:00"))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

// Open the upstream SSE stream. `stream` is forced on so both client modes
// share one upstream shape; the non-streaming emitter collects later.
pub async fn stream(
    client: &reqwest::Client,
    access_token: &str,
    request: &MessagesRequest,
    via_proxy: Option<&str>,
) -> ProxyResult<ByteStream> {
    let mut body = serde_json::to_value(request)
        .map_err(|e| ProxyError::Internal(format!("serialize request: {}", e)))?;
    body["stream"] = Value::Bool(true);

    let url = format!("{}/v1/messages", constants::CLAUDE_API_BASE_URL);
    let mut req = client.post(&url).json(&body);
    for (name, value) in messages_headers(access_token) {
        req = req.header(name, value);
    }

    let response = req.send().await?;
    let status = response.status().as_u16();
    if status >= 400 {
        let resets_at = parse_reset_header(
            response
                .headers()
                .get(constants::RATELIMIT_RESET_HEADER)
                .and_then(|v| v.to_str().ok()),
        );
        let body = response.text().await.unwrap_or_default();
        return Err(classify_upstream_status(status, &body, resets_at, via_proxy));
    }

    Ok(Box::pin(response.bytes_stream()))
}

// Minimal max_tokens=1 chat used by the admin refresh probe.
pub async fn probe(client: &reqwest::Client, access_token: &str) -> ProbeOutcome {
    let payload = json!({
        "model": constants::PROBE_MODEL,
        "max_tokens": 1,
        "messages": [{"role": "user", "content": "hi"}],
    });

    let url = format!("{}/v1/messages", constants::CLAUDE_API_BASE_URL);
    let mut req = client.post(&url).json(&payload);
    for (name, value) in messages_headers(access_token) {
        if name != "Accept" {
            req = req.header(name, value);
        }
    }

    match req.send().await {
        Ok(response) => {
            let status = response.status().as_u16();
            match status {
                200 => ProbeOutcome::Valid,
                429 => {
                    let resets_at = parse_reset_header(
                        response
                            .headers()
                            .get(constants::RATELIMIT_RESET_HEADER)
                            .and_then(|v| v.to_str().ok()),
                    );
                    ProbeOutcome::RateLimited(resets_at)
                }
                s => ProbeOutcome::Inconclusive(format!("HTTP {}", s)),
            }
        }
        Err(e) => ProbeOutcome::Inconclusive(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_header_parses_rfc3339() {
        let at = parse_reset_header(Some("2026-08-02T10:00:00Z")).unwrap();
        assert_eq!(at.timestamp(), 1_785_664_800);
        assert!(parse_reset_header(Some("not-a-date")).is_none());
        assert!(parse_reset_header(None).is_none());
    }

    #[test]
    fn messages_headers_carry_oauth_beta() {
        let headers = messages_headers("tok");
        assert!(headers
            .iter()
            .any(|(k, v)| *k == "anthropic-beta" && v == constants::OAUTH_BETA_HEADER));
        assert!(headers
            .iter()
            .any(|(k, v)| *k == "Authorization" && v == "Bearer tok"));
    }
}
