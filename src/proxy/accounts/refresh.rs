use crate::constants;
use crate::error::ProxyResult;
use crate::models::{Account, AccountStatus};
use crate::proxy::accounts::AccountRegistry;
use crate::proxy::proxy_pool::{cookie_digest_key, ProxyPool};
use crate::proxy::upstream::{client, oauth, web, ProbeOutcome};
use futures::{stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

// Admin-initiated two-phase health probe.
//
// Phase 1 checks credential validity against the cheap organization-info
// endpoint. Phase 2 runs only for currently rate-limited accounts whose
// credentials checked out, and issues a minimal chat to learn whether the
// limit has lifted. Network faults leave state unchanged.

#[derive(Debug, Clone, Serialize)]
pub struct RefreshOutcome {
    pub organization_uuid: String,
    pub previous_status: AccountStatus,
    pub new_status: AccountStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchRefreshReport {
    pub success_count: usize,
    pub failure_count: usize,
    pub results: Vec<RefreshOutcome>,
}

#[derive(Debug, PartialEq)]
enum CookieCheck {
    Valid(Vec<String>),
    Invalid,
    Inconclusive,
}

// GET /api/organizations with the account cookie. 2xx proves the cookie;
// auth errors disprove it; anything else is inconclusive.
async fn check_cookie(
    http: &reqwest::Client,
    cookie: &str,
    account: &Account,
) -> CookieCheck {
    let url = format!("{}/api/organizations", constants::CLAUDE_WEB_BASE_URL);
    let response = match http.get(&url).header("Cookie", cookie).send().await {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(
                "[Refresh] Cookie check inconclusive for {}: {}",
                account.short_id(),
                e
            );
            return CookieCheck::Inconclusive;
        }
    };

    match response.status().as_u16() {
        200..=299 => {
            let capabilities = response
                .json::<Value>()
                .await
                .ok()
                .and_then(|body| extract_capabilities(&body, &account.organization_uuid))
                .unwrap_or_default();
            CookieCheck::Valid(capabilities)
        }
        401 | 403 => CookieCheck::Invalid,
        _ => CookieCheck::Inconclusive,
    }
}

fn extract_capabilities(body: &Value, organization_uuid: &str) -> Option<Vec<String>> {
    let orgs = body.as_array()?;
    let org = orgs
        .iter()
        .find(|o| o.get("uuid").and_then(Value::as_str) == Some(organization_uuid))
        .or_else(|| orgs.first())?;
    Some(
        org.get("capabilities")?
            .as_array()?
            .iter()
            .filter_map(|c| c.as_str().map(str::to_string))
            .collect(),
    )
}

async fn probe_rate_limit(
    http: &reqwest::Client,
    registry: &AccountRegistry,
    account: &Account,
) -> ProbeOutcome {
    if account.can_oauth() {
        match oauth::ensure_fresh_token(registry, account).await {
            Ok(token) => oauth::probe(http, &token.access_token).await,
            Err(e) => ProbeOutcome::Inconclusive(e.to_string()),
        }
    } else {
        web::probe(http, account).await
    }
}

pub async fn refresh_account(
    registry: &AccountRegistry,
    pool: &ProxyPool,
    organization_uuid: &str,
    probe_timeout: Duration,
) -> RefreshOutcome {
    let Some(account) = registry.get(organization_uuid).await else {
        return RefreshOutcome {
            organization_uuid: organization_uuid.to_string(),
            previous_status: AccountStatus::Invalid,
            new_status: AccountStatus::Invalid,
            error: Some("account not found".into()),
        };
    };
    let previous_status = account.status;

    let proxy_key = account
        .cookie_value
        .as_deref()
        .map(cookie_digest_key)
        .unwrap_or_else(|| account.organization_uuid.clone());
    let proxy = match pool.get_proxy(Some(&proxy_key)) {
        Ok(p) => p,
        Err(e) => {
            return RefreshOutcome {
                organization_uuid: organization_uuid.to_string(),
                previous_status,
                new_status: previous_status,
                error: Some(e.to_string()),
            }
        }
    };
    let http = match client::build_client(proxy.as_ref(), probe_timeout) {
        Ok(c) => c,
        Err(e) => {
            return RefreshOutcome {
                organization_uuid: organization_uuid.to_string(),
                previous_status,
                new_status: previous_status,
                error: Some(e.to_string()),
            }
        }
    };

    // Phase 1: credential validity.
    let cookie_check = match account.cookie_value.as_deref() {
        Some(cookie) => check_cookie(&http, cookie, &account).await,
        // OAuth-only accounts have no cookie to validate; phase 2 decides.
        None => CookieCheck::Inconclusive,
    };

    // Phase 2: rate-limit probe, only when phase 1 did not disprove the
    // credentials and the account is currently rate limited.
    let probe = if previous_status == AccountStatus::RateLimited
        && !matches!(cookie_check, CookieCheck::Invalid)
    {
        Some(probe_rate_limit(&http, registry, &account).await)
    } else {
        None
    };

    let new_status = apply_refresh_transition(registry, &account, cookie_check, probe).await;
    tracing::info!(
        "[Refresh] Account {}: {:?} -> {:?}",
        account.short_id(),
        previous_status,
        new_status
    );

    RefreshOutcome {
        organization_uuid: organization_uuid.to_string(),
        previous_status,
        new_status,
        error: None,
    }
}

async fn apply_refresh_transition(
    registry: &AccountRegistry,
    account: &Account,
    cookie_check: CookieCheck,
    probe: Option<ProbeOutcome>,
) -> AccountStatus {
    let id = &account.organization_uuid;
    let mut status = account.status;

    match account.status {
        AccountStatus::RateLimited => match cookie_check {
            CookieCheck::Invalid => {
                let _ = registry.mark_invalid(id).await;
                status = AccountStatus::Invalid;
            }
            _ => match probe {
                Some(ProbeOutcome::Valid) => {
                    let _ = registry.clear_rate_limit(id).await;
                    status = AccountStatus::Valid;
                }
                Some(ProbeOutcome::RateLimited(resets_at)) => {
                    // Keep the previous reset instant when the upstream
                    // did not provide a fresh one.
                    if resets_at.is_some() {
                        let _ = registry.mark_rate_limited(id, resets_at).await;
                    }
                }
                Some(ProbeOutcome::Inconclusive(_)) | None => {}
            },
        },
        AccountStatus::Invalid => {
            if let CookieCheck::Valid(_) = cookie_check {
                let _ = registry
                    .set_status(id, AccountStatus::Valid, None)
                    .await;
                status = AccountStatus::Valid;
            }
        }
        AccountStatus::Valid => {
            if cookie_check == CookieCheck::Invalid {
                let _ = registry.mark_invalid(id).await;
                status = AccountStatus::Invalid;
            }
        }
    }

    status
}

// Bounded-parallel batch refresh, one pass over the given ids.
pub async fn batch_refresh(
    registry: Arc<AccountRegistry>,
    pool: Arc<ProxyPool>,
    ids: Vec<String>,
    max_concurrency: usize,
    probe_timeout: Duration,
) -> ProxyResult<BatchRefreshReport> {
    let concurrency = max_concurrency.clamp(1, 20);
    let results: Vec<RefreshOutcome> = stream::iter(ids)
        .map(|id| {
            let registry = registry.clone();
            let pool = pool.clone();
            async move { refresh_account(&registry, &pool, &id, probe_timeout).await }
        })
        .buffer_unordered(concurrency)
        .collect()
        .await;

    let failure_count = results.iter().filter(|r| r.error.is_some()).count();
    Ok(BatchRefreshReport {
        success_count: results.len() - failure_count,
        failure_count,
        results,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn capabilities_extracted_for_matching_org() {
        let body = json!([
            {"uuid": "org-a", "capabilities": ["chat"]},
            {"uuid": "org-b", "capabilities": ["chat", "claude_pro"]}
        ]);
        let caps = extract_capabilities(&body, "org-b").unwrap();
        assert_eq!(caps, vec!["chat".to_string(), "claude_pro".to_string()]);
    }

    #[test]
    fn capabilities_fall_back_to_first_org() {
        let body = json!([{"uuid": "org-a", "capabilities": ["chat"]}]);
        let caps = extract_capabilities(&body, "org-unknown").unwrap();
        assert_eq!(caps, vec!["chat".to_string()]);
    }

    #[tokio::test]
    async fn rate_limited_with_dead_cookie_becomes_invalid() {
        let dir = tempfile::tempdir().unwrap().into_path();
        let registry = AccountRegistry::new(dir, 4);
        registry
            .add_account(Some("cookie".into()), None, Some("org-1".into()), vec![])
            .await
            .unwrap();
        registry
            .mark_rate_limited("org-1", Some(chrono::Utc::now() + chrono::Duration::hours(1)))
            .await
            .unwrap();
        let account = registry.get("org-1").await.unwrap();

        let status =
            apply_refresh_transition(&registry, &account, CookieCheck::Invalid, None).await;
        assert_eq!(status, AccountStatus::Invalid);
        assert_eq!(
            registry.get("org-1").await.unwrap().status,
            AccountStatus::Invalid
        );
    }

    #[tokio::test]
    async fn successful_probe_clears_rate_limit() {
        let dir = tempfile::tempdir().unwrap().into_path();
        let registry = AccountRegistry::new(dir, 4);
        registry
            .add_account(Some("cookie".into()), None, Some("org-1".into()), vec![])
            .await
            .unwrap();
        registry
            .mark_rate_limited("org-1", Some(chrono::Utc::now() + chrono::Duration::hours(1)))
            .await
            .unwrap();
        let account = registry.get("org-1").await.unwrap();

        let status = apply_refresh_transition(
            &registry,
            &account,
            CookieCheck::Valid(vec![]),
            Some(ProbeOutcome::Valid),
        )
        .await;
        assert_eq!(status, AccountStatus::Valid);
        assert!(registry.get("org-1").await.unwrap().resets_at.is_none());
    }

    #[tokio::test]
    async fn inconclusive_probe_leaves_state_unchanged() {
        let dir = tempfile::tempdir().unwrap().into_path();
        let registry = AccountRegistry::new(dir, 4);
        registry
            .add_account(Some("cookie".into()), None, Some("org-1".into()), vec![])
            .await
            .unwrap();
        let resets_at = chrono::Utc::now() + chrono::Duration::hours(1);
        registry
            .mark_rate_limited("org-1", Some(resets_at))
            .await
            .unwrap();
        let account = registry.get("org-1").await.unwrap();

        let status = apply_refresh_transition(
            &registry,
            &account,
            CookieCheck::Valid(vec![]),
            Some(ProbeOutcome::Inconclusive("net down".into())),
        )
        .await;
        assert_eq!(status, AccountStatus::RateLimited);
        let after = registry.get("org-1").await.unwrap();
        assert_eq!(after.resets_at.unwrap().timestamp(), resets_at.timestamp());
    }

    #[tokio::test]
    async fn valid_account_with_good_cookie_stays_valid() {
        let dir = tempfile::tempdir().unwrap().into_path();
        let registry = AccountRegistry::new(dir, 4);
        registry
            .add_account(Some("cookie".into()), None, Some("org-1".into()), vec![])
            .await
            .unwrap();
        let account = registry.get("org-1").await.unwrap();
        let status = apply_refresh_transition(
            &registry,
            &account,
            CookieCheck::Valid(vec!["claude_pro".into()]),
            None,
        )
        .await;
        assert_eq!(status, AccountStatus::Valid);
    }
}
