use crate::error::ProxyResult;
use crate::models::{AccountStatus, MessagesRequest};
use crate::proxy::accounts::AccountRegistry;
use crate::proxy::proxy_pool::{ProxyEndpoint, ProxyPool};
use crate::proxy::upstream::{client, web};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

// A web session: an account binding plus the HTTP client that will carry
// every request for it. The proxy is captured at creation so the upstream
// conversation stays on one egress.
pub struct WebSession {
    pub key: String,
    pub account_id: String,
    pub proxy: Option<ProxyEndpoint>,
    pub client: reqwest::Client,
    pub conversation_uuid: Option<String>,
    pub web_search_enabled: bool,
    pub paprika_mode: bool,
    pub created_at: Instant,
}

pub struct SessionManager {
    sessions: DashMap<String, Arc<Mutex<WebSession>>>,
    registry: Arc<AccountRegistry>,
    pool: Arc<ProxyPool>,
    ttl: Duration,
    request_timeout: Duration,
}

impl SessionManager {
    pub fn new(
        registry: Arc<AccountRegistry>,
        pool: Arc<ProxyPool>,
        ttl: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            registry,
            pool,
            ttl,
            request_timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    // Lazy creation on first use of a client key. An existing session is
    // reused while it is inside its TTL and its account is still valid.
    pub async fn get_or_create(&self, key: &str) -> ProxyResult<Arc<Mutex<WebSession>>> {
        if let Some(existing) = self.sessions.get(key).map(|e| e.value().clone()) {
            let (expired, account_id) = {
                let session = existing.lock().await;
                (session.created_at.elapsed() > self.ttl, session.account_id.clone())
            };
            if !expired {
                match self.registry.get(&account_id).await {
                    Some(account) if account.status == AccountStatus::Valid => {
                        return Ok(existing)
                    }
                    _ => {}
                }
            }
            self.destroy(key, if expired { "ttl expired" } else { "account no longer valid" })
                .await;
        }

        let account = self.registry.pick_for_session(key).await?;
        let proxy = self.pool.get_proxy(Some(&account.organization_uuid))?;
        let http = client::build_client(proxy.as_ref(), self.request_timeout)?;
        tracing::info!(
            "[Sessions] Created session {} on account {} (proxy: {})",
            key,
            account.short_id(),
            proxy.as_ref().map(|p| p.redacted()).unwrap_or_else(|| "direct".into())
        );

        let session = Arc::new(Mutex::new(WebSession {
            key: key.to_string(),
            account_id: account.organization_uuid,
            proxy,
            client: http,
            conversation_uuid: None,
            web_search_enabled: false,
            paprika_mode: false,
            created_at: Instant::now(),
        }));
        self.sessions.insert(key.to_string(), session.clone());
        Ok(session)
    }

    // Tear the session down. The upstream conversation is deleted on a
    // best-effort basis; the registry binding always goes.
    pub async fn destroy(&self, key: &str, reason: &str) {
        if let Some((_, session)) = self.sessions.remove(key) {
            let mut guard = session.lock().await;
            if let Some(conversation) = guard.conversation_uuid.take() {
                if let Some(account) = self.registry.get(&guard.account_id).await {
                    let http = guard.client.clone();
                    tokio::spawn(async move {
                        if let Err(e) =
                            web::delete_conversation(&http, &account, &conversation).await
                        {
                            tracing::debug!("[Sessions] Conversation cleanup failed: {}", e);
                        }
                    });
                }
            }
            drop(guard);
            self.registry.release_session(key);
            tracing::info!("[Sessions] Destroyed session {} ({})", key, reason);
        }
    }

    // End-of-request conversation handling. A pending client tool call
    // keeps the conversation for the continuation; otherwise it is deleted
    // best-effort and unbound from the session.
    pub async fn finish_conversation(&self, key: &str, keep: bool) {
        if keep {
            tracing::debug!("[Sessions] Keeping conversation for session {} (pending tool call)", key);
            return;
        }
        let Some(session) = self.sessions.get(key).map(|e| e.value().clone()) else {
            return;
        };
        let mut guard = session.lock().await;
        let Some(conversation) = guard.conversation_uuid.take() else {
            return;
        };
        let Some(account) = self.registry.get(&guard.account_id).await else {
            return;
        };
        let http = guard.client.clone();
        drop(guard);
        if let Err(e) = web::delete_conversation(&http, &account, &conversation).await {
            tracing::debug!("[Sessions] Conversation cleanup failed: {}", e);
        }
    }

    // Periodic TTL sweep.
    pub fn start_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        tokio::spawn(async move {
            let interval = Duration::from_secs(60);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let mut expired = Vec::new();
                for entry in self.sessions.iter() {
                    if let Ok(session) = entry.value().try_lock() {
                        if session.created_at.elapsed() > self.ttl {
                            expired.push(entry.key().clone());
                        }
                    }
                }
                for key in expired {
                    self.destroy(&key, "ttl expired").await;
                }
            }
        });
    }
}

// Enable the upstream conversation's web-search setting and cache the
// flag. Both this setting and the injected web_search_v0 tool are needed
// for search to trigger.
pub async fn set_web_search(
    session: &mut WebSession,
    account: &crate::models::Account,
    enabled: bool,
) -> ProxyResult<()> {
    if session.web_search_enabled == enabled {
        return Ok(());
    }
    if let Some(conversation) = session.conversation_uuid.clone() {
        web::update_conversation_settings(
            &session.client,
            account,
            &conversation,
            enabled,
            session.paprika_mode.then_some("extended"),
        )
        .await?;
    }
    session.web_search_enabled = enabled;
    Ok(())
}

// Toggle extended thinking (upstream "paprika" mode) on the conversation.
pub async fn set_thinking(
    session: &mut WebSession,
    account: &crate::models::Account,
    enabled: bool,
) -> ProxyResult<()> {
    if session.paprika_mode == enabled {
        return Ok(());
    }
    if let Some(conversation) = session.conversation_uuid.clone() {
        web::update_conversation_settings(
            &session.client,
            account,
            &conversation,
            session.web_search_enabled,
            enabled.then_some("extended"),
        )
        .await?;
    }
    session.paprika_mode = enabled;
    Ok(())
}

// Stable session key for a request. Explicit metadata.user_id wins; the
// fallback fingerprints the first meaningful user message so every turn of
// one conversation lands on the same account.
pub fn derive_session_key(request: &MessagesRequest) -> String {
    if let Some(user_id) = request
        .metadata
        .as_ref()
        .and_then(|m| m.user_id.as_deref())
    {
        if !user_id.is_empty() && !user_id.contains("session-") {
            return user_id.to_string();
        }
    }

    let mut hasher = Sha256::new();
    let mut content_found = false;
    for message in &request.messages {
        if message.role != "user" {
            continue;
        }
        let text = message.text();
        let clean = text.trim();
        if clean.len() > 10 && !clean.contains("<system-reminder>") {
            hasher.update(clean.as_bytes());
            content_found = true;
            break;
        }
    }
    if !content_found {
        if let Some(last) = request.messages.last() {
            hasher.update(last.text().as_bytes());
        }
    }

    let hash = format!("{:x}", hasher.finalize());
    format!("sid-{}", &hash[..16])
}
