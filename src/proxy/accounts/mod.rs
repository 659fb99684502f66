pub mod persistence;
pub mod refresh;

use crate::error::{ProxyError, ProxyResult};
use crate::models::{short_id, Account, AccountStatus, OAuthToken};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

// Fleet state and selection. All mutations run under the write lock, and
// every mutating operation persists before releasing it, so the file can
// never observe a state the registry did not hold.
pub struct AccountRegistry {
    accounts: RwLock<HashMap<String, Account>>,
    // client session key -> organization uuid
    session_accounts: DashMap<String, String>,
    // organization uuid -> bound client session keys
    account_sessions: DashMap<String, HashSet<String>>,
    data_dir: PathBuf,
    session_cap: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountSummary {
    pub organization_uuid: String,
    pub auth_type: crate::models::AuthType,
    pub status: AccountStatus,
    pub capabilities: Vec<String>,
    pub sessions: usize,
    pub cookie: Option<String>,
    pub has_oauth: bool,
    pub last_used: DateTime<Utc>,
    pub resets_at: Option<DateTime<Utc>>,
    pub overloaded_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStatus {
    pub total_accounts: usize,
    pub valid_accounts: usize,
    pub rate_limited_accounts: usize,
    pub invalid_accounts: usize,
    pub active_sessions: usize,
    pub accounts: Vec<AccountSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchRemoveReport {
    pub success_count: usize,
    pub failures: Vec<BatchFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchFailure {
    pub organization_uuid: String,
    pub error: String,
}

impl AccountRegistry {
    pub fn new(data_dir: PathBuf, session_cap: usize) -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            session_accounts: DashMap::new(),
            account_sessions: DashMap::new(),
            data_dir,
            session_cap,
        }
    }

    pub async fn load(&self) -> ProxyResult<usize> {
        let loaded = persistence::load_accounts(&self.data_dir)?;
        let count = loaded.len();
        *self.accounts.write().await = loaded;
        Ok(count)
    }

    pub async fn add_account(
        &self,
        cookie_value: Option<String>,
        oauth_token: Option<OAuthToken>,
        organization_uuid: Option<String>,
        capabilities: Vec<String>,
    ) -> ProxyResult<Account> {
        if cookie_value.is_none() && oauth_token.is_none() {
            return Err(ProxyError::Validation(
                "either cookie_value or oauth_token must be provided".into(),
            ));
        }

        let mut accounts = self.accounts.write().await;

        // Same cookie resubmitted: return the existing account.
        if let Some(cookie) = &cookie_value {
            if let Some(existing) = accounts
                .values()
                .find(|a| a.cookie_value.as_deref() == Some(cookie.as_str()))
            {
                return Ok(existing.clone());
            }
        }

        let id = organization_uuid.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        // Known organization: update credentials in place.
        if let Some(existing) = accounts.get_mut(&id) {
            if cookie_value.is_some() {
                existing.cookie_value = cookie_value;
            }
            if oauth_token.is_some() {
                existing.oauth_token = oauth_token;
            }
            let updated = existing.clone();
            persistence::save_accounts(&self.data_dir, &accounts)?;
            return Ok(updated);
        }

        let account = Account::new(id.clone(), cookie_value, oauth_token, capabilities);
        tracing::info!(
            "[Registry] Added account {} (auth: {:?})",
            account.short_id(),
            account.auth_type
        );
        accounts.insert(id, account.clone());
        persistence::save_accounts(&self.data_dir, &accounts)?;
        Ok(account)
    }

    fn unbind_all_sessions(&self, organization_uuid: &str) {
        if let Some((_, keys)) = self.account_sessions.remove(organization_uuid) {
            for key in keys {
                self.session_accounts.remove(&key);
            }
        }
    }

    pub async fn remove_account(&self, organization_uuid: &str) -> ProxyResult<()> {
        let mut accounts = self.accounts.write().await;
        if accounts.remove(organization_uuid).is_none() {
            return Err(ProxyError::Validation(format!(
                "account {} not found",
                organization_uuid
            )));
        }
        self.unbind_all_sessions(organization_uuid);
        persistence::save_accounts(&self.data_dir, &accounts)?;
        tracing::info!("[Registry] Removed account {}", short_id(organization_uuid));
        Ok(())
    }

    // N removals, one persist.
    pub async fn batch_remove(&self, ids: &[String]) -> ProxyResult<BatchRemoveReport> {
        let mut accounts = self.accounts.write().await;
        let mut success_count = 0;
        let mut failures = Vec::new();
        for id in ids {
            if accounts.remove(id).is_some() {
                self.unbind_all_sessions(id);
                success_count += 1;
            } else {
                failures.push(BatchFailure {
                    organization_uuid: id.clone(),
                    error: "account not found".into(),
                });
            }
        }
        if success_count > 0 {
            persistence::save_accounts(&self.data_dir, &accounts)?;
        }
        tracing::info!(
            "[Registry] Batch remove: {} succeeded, {} failed",
            success_count,
            failures.len()
        );
        Ok(BatchRemoveReport {
            success_count,
            failures,
        })
    }

    pub fn session_count(&self, organization_uuid: &str) -> usize {
        self.account_sessions
            .get(organization_uuid)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    fn selectable(&self, account: &Account, now: DateTime<Utc>) -> bool {
        account.status == AccountStatus::Valid && !account.is_overloaded(now)
    }

    // Least bound sessions, ties broken by oldest last_used.
    fn pick_best<'a, I>(&self, candidates: I) -> Option<Account>
    where
        I: Iterator<Item = &'a Account>,
    {
        let mut best: Option<(&Account, usize)> = None;
        for account in candidates {
            let sessions = self.session_count(&account.organization_uuid);
            let better = match &best {
                None => true,
                Some((current, current_sessions)) => {
                    sessions < *current_sessions
                        || (sessions == *current_sessions && account.last_used < current.last_used)
                }
            };
            if better {
                best = Some((account, sessions));
            }
        }
        best.map(|(a, _)| a.clone())
    }

    pub async fn pick_for_oauth(&self) -> ProxyResult<Account> {
        let now = Utc::now();
        let accounts = self.accounts.read().await;
        self.pick_best(
            accounts
                .values()
                .filter(|a| a.can_oauth() && self.selectable(a, now)),
        )
        .ok_or_else(|| ProxyError::NoAccountsAvailable("no OAuth-capable account".into()))
    }

    // Sticky selection: an already-bound key keeps its account while that
    // account stays valid; otherwise the binding is dropped and re-made.
    pub async fn pick_for_session(&self, client_key: &str) -> ProxyResult<Account> {
        let now = Utc::now();
        let accounts = self.accounts.read().await;

        if let Some(bound) = self.session_accounts.get(client_key).map(|v| v.clone()) {
            match accounts.get(&bound) {
                Some(account) if account.status == AccountStatus::Valid => {
                    return Ok(account.clone());
                }
                _ => {
                    drop(
                        self.session_accounts.remove(client_key),
                    );
                    if let Some(mut set) = self.account_sessions.get_mut(&bound) {
                        set.remove(client_key);
                    }
                }
            }
        }

        let chosen = self.pick_best(accounts.values().filter(|a| {
            a.can_web()
                && self.selectable(a, now)
                && self.session_count(&a.organization_uuid) < self.session_cap
        }));

        match chosen {
            Some(account) => {
                // Bind while still holding the read lock so the status we
                // checked cannot change under us.
                self.session_accounts
                    .insert(client_key.to_string(), account.organization_uuid.clone());
                self.account_sessions
                    .entry(account.organization_uuid.clone())
                    .or_default()
                    .insert(client_key.to_string());
                tracing::debug!(
                    "[Registry] Bound session {} to account {} ({} sessions)",
                    client_key,
                    account.short_id(),
                    self.session_count(&account.organization_uuid)
                );
                Ok(account)
            }
            None => Err(ProxyError::NoAccountsAvailable(
                "no web-capable account with free session slots".into(),
            )),
        }
    }

    pub fn release_session(&self, client_key: &str) {
        if let Some((_, org)) = self.session_accounts.remove(client_key) {
            if let Some(mut set) = self.account_sessions.get_mut(&org) {
                set.remove(client_key);
            }
            tracing::debug!("[Registry] Released session {}", client_key);
        }
    }

    pub async fn get(&self, organization_uuid: &str) -> Option<Account> {
        self.accounts.read().await.get(organization_uuid).cloned()
    }

    pub async fn touch(&self, organization_uuid: &str) {
        let mut accounts = self.accounts.write().await;
        if let Some(a) = accounts.get_mut(organization_uuid) {
            a.last_used = Utc::now();
        }
        // last_used is selection metadata, not worth an fsync per request.
    }

    async fn mutate_and_persist<F>(&self, organization_uuid: &str, f: F) -> ProxyResult<()>
    where
        F: FnOnce(&mut Account),
    {
        let mut accounts = self.accounts.write().await;
        let account = accounts.get_mut(organization_uuid).ok_or_else(|| {
            ProxyError::Validation(format!("account {} not found", organization_uuid))
        })?;
        f(account);
        persistence::save_accounts(&self.data_dir, &accounts)
    }

    pub async fn mark_rate_limited(
        &self,
        organization_uuid: &str,
        resets_at: Option<DateTime<Utc>>,
    ) -> ProxyResult<()> {
        // RATE_LIMITED always carries a reset instant; a missing header
        // falls back to a conservative hour.
        let resets_at = resets_at.unwrap_or_else(|| Utc::now() + Duration::hours(1));
        tracing::warn!(
            "[Registry] Account {} rate limited until {}",
            short_id(organization_uuid),
            resets_at
        );
        self.mutate_and_persist(organization_uuid, |a| {
            a.status = AccountStatus::RateLimited;
            a.resets_at = Some(resets_at);
        })
        .await
    }

    pub async fn mark_invalid(&self, organization_uuid: &str) -> ProxyResult<()> {
        tracing::warn!(
            "[Registry] Account {} marked invalid",
            short_id(organization_uuid)
        );
        let result = self
            .mutate_and_persist(organization_uuid, |a| {
                a.status = AccountStatus::Invalid;
                a.resets_at = None;
            })
            .await;
        // Sessions never migrate off a dead account; they are destroyed.
        self.unbind_all_sessions(organization_uuid);
        result
    }

    pub async fn mark_overloaded(
        &self,
        organization_uuid: &str,
        duration: std::time::Duration,
    ) -> ProxyResult<()> {
        let until = Utc::now() + Duration::seconds(duration.as_secs() as i64);
        tracing::warn!(
            "[Registry] Account {} overloaded until {}",
            short_id(organization_uuid),
            until
        );
        self.mutate_and_persist(organization_uuid, |a| {
            a.overloaded_until = Some(until);
        })
        .await
    }

    pub async fn clear_rate_limit(&self, organization_uuid: &str) -> ProxyResult<()> {
        self.mutate_and_persist(organization_uuid, |a| {
            if a.status == AccountStatus::RateLimited {
                a.status = AccountStatus::Valid;
            }
            a.resets_at = None;
        })
        .await
    }

    pub async fn update_oauth_token(
        &self,
        organization_uuid: &str,
        token: OAuthToken,
    ) -> ProxyResult<()> {
        self.mutate_and_persist(organization_uuid, |a| {
            a.oauth_token = Some(token);
        })
        .await
    }

    pub async fn set_status(
        &self,
        organization_uuid: &str,
        status: AccountStatus,
        resets_at: Option<DateTime<Utc>>,
    ) -> ProxyResult<()> {
        self.mutate_and_persist(organization_uuid, |a| {
            a.status = status;
            a.resets_at = resets_at;
        })
        .await
    }

    // Flip RateLimited accounts back to Valid once their reset passes.
    pub async fn recover_expired(&self) -> usize {
        let now = Utc::now();
        let mut accounts = self.accounts.write().await;
        let mut recovered = 0;
        for account in accounts.values_mut() {
            if account.status == AccountStatus::RateLimited
                && matches!(account.resets_at, Some(at) if now >= at)
            {
                account.status = AccountStatus::Valid;
                account.resets_at = None;
                recovered += 1;
                tracing::info!("[Registry] Recovered rate-limited account {}", account.short_id());
            }
        }
        if recovered > 0 {
            if let Err(e) = persistence::save_accounts(&self.data_dir, &accounts) {
                tracing::error!("[Registry] Failed to persist recovery: {}", e);
            }
        }
        recovered
    }

    // Accounts whose OAuth token expires within the window and can refresh.
    pub async fn accounts_needing_token_refresh(&self, window_secs: i64) -> Vec<Account> {
        let now = Utc::now();
        self.accounts
            .read()
            .await
            .values()
            .filter(|a| {
                a.can_oauth()
                    && a.oauth_token
                        .as_ref()
                        .map(|t| t.refresh_token.is_some() && t.expires_within(window_secs, now))
                        .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    pub async fn list(&self) -> Vec<AccountSummary> {
        let accounts = self.accounts.read().await;
        let mut out: Vec<AccountSummary> = accounts.values().map(|a| self.summarize(a)).collect();
        out.sort_by(|x, y| x.organization_uuid.cmp(&y.organization_uuid));
        out
    }

    fn summarize(&self, account: &Account) -> AccountSummary {
        AccountSummary {
            organization_uuid: account.organization_uuid.clone(),
            auth_type: account.auth_type,
            status: account.status,
            capabilities: account.capabilities.clone(),
            sessions: self.session_count(&account.organization_uuid),
            cookie: account
                .cookie_value
                .as_ref()
                .map(|c| format!("{}...", &c[..c.len().min(16)])),
            has_oauth: account.oauth_token.is_some(),
            last_used: account.last_used,
            resets_at: account.resets_at,
            overloaded_until: account.overloaded_until,
        }
    }

    pub async fn status(&self) -> RegistryStatus {
        let accounts = self.accounts.read().await;
        let count_by = |status: AccountStatus| {
            accounts.values().filter(|a| a.status == status).count()
        };
        RegistryStatus {
            total_accounts: accounts.len(),
            valid_accounts: count_by(AccountStatus::Valid),
            rate_limited_accounts: count_by(AccountStatus::RateLimited),
            invalid_accounts: count_by(AccountStatus::Invalid),
            active_sessions: self.session_accounts.len(),
            accounts: accounts.values().map(|a| self.summarize(a)).collect(),
        }
    }

    // Periodic maintenance: rate-limit recovery and lazy token refresh.
    pub fn start_maintenance(
        self: Arc<Self>,
        interval: std::time::Duration,
        cancel: CancellationToken,
    ) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                self.recover_expired().await;
                for account in self.accounts_needing_token_refresh(300).await {
                    let registry = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) =
                            crate::proxy::upstream::oauth::refresh_token_for(&registry, &account)
                                .await
                        {
                            tracing::warn!(
                                "[Registry] Token refresh failed for {}: {}",
                                account.short_id(),
                                e
                            );
                        }
                    });
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OAuthToken;

    fn registry() -> AccountRegistry {
        let dir = tempfile::tempdir().unwrap();
        // Leak the tempdir so the path stays writable for the test duration.
        let path = dir.into_path();
        AccountRegistry::new(path, 2)
    }

    fn oauth_token() -> OAuthToken {
        OAuthToken {
            access_token: "tok".into(),
            refresh_token: Some("ref".into()),
            expires_at: Some(Utc::now().timestamp() + 3600),
        }
    }

    #[tokio::test]
    async fn add_requires_some_credential() {
        let r = registry();
        assert!(r.add_account(None, None, None, vec![]).await.is_err());
    }

    #[tokio::test]
    async fn duplicate_cookie_returns_existing_account() {
        let r = registry();
        let a = r
            .add_account(Some("sessionKey=k1".into()), None, Some("org-1".into()), vec![])
            .await
            .unwrap();
        let b = r
            .add_account(Some("sessionKey=k1".into()), None, None, vec![])
            .await
            .unwrap();
        assert_eq!(a.organization_uuid, b.organization_uuid);
    }

    #[tokio::test]
    async fn pick_for_session_is_sticky() {
        let r = registry();
        r.add_account(Some("c1".into()), None, Some("org-1".into()), vec![])
            .await
            .unwrap();
        r.add_account(Some("c2".into()), None, Some("org-2".into()), vec![])
            .await
            .unwrap();

        let first = r.pick_for_session("sid-1").await.unwrap();
        for _ in 0..5 {
            let again = r.pick_for_session("sid-1").await.unwrap();
            assert_eq!(again.organization_uuid, first.organization_uuid);
        }
        assert_eq!(r.session_count(&first.organization_uuid), 1);
    }

    #[tokio::test]
    async fn selection_prefers_fewest_sessions() {
        let r = registry();
        r.add_account(Some("c1".into()), None, Some("org-1".into()), vec![])
            .await
            .unwrap();
        r.add_account(Some("c2".into()), None, Some("org-2".into()), vec![])
            .await
            .unwrap();

        let a = r.pick_for_session("sid-1").await.unwrap();
        let b = r.pick_for_session("sid-2").await.unwrap();
        assert_ne!(a.organization_uuid, b.organization_uuid);
    }

    #[tokio::test]
    async fn session_cap_is_enforced() {
        let r = registry();
        r.add_account(Some("c1".into()), None, Some("org-1".into()), vec![])
            .await
            .unwrap();

        r.pick_for_session("sid-1").await.unwrap();
        r.pick_for_session("sid-2").await.unwrap();
        // Cap is 2; a third distinct key finds no free slot.
        let err = r.pick_for_session("sid-3").await.unwrap_err();
        assert!(matches!(err, ProxyError::NoAccountsAvailable(_)));
    }

    #[tokio::test]
    async fn rate_limited_account_is_skipped_until_reset() {
        let r = registry();
        r.add_account(Some("c1".into()), None, Some("org-1".into()), vec![])
            .await
            .unwrap();
        r.mark_rate_limited("org-1", Some(Utc::now() + Duration::seconds(60)))
            .await
            .unwrap();

        assert!(r.pick_for_session("sid-1").await.is_err());

        // Past the reset instant, recovery flips it back.
        r.set_status(
            "org-1",
            AccountStatus::RateLimited,
            Some(Utc::now() - Duration::seconds(1)),
        )
        .await
        .unwrap();
        assert_eq!(r.recover_expired().await, 1);
        assert!(r.pick_for_session("sid-1").await.is_ok());
    }

    #[tokio::test]
    async fn invalid_account_loses_bindings() {
        let r = registry();
        r.add_account(Some("c1".into()), None, Some("org-1".into()), vec![])
            .await
            .unwrap();
        r.pick_for_session("sid-1").await.unwrap();
        assert_eq!(r.session_count("org-1"), 1);

        r.mark_invalid("org-1").await.unwrap();
        assert_eq!(r.session_count("org-1"), 0);
        assert!(r.pick_for_session("sid-1").await.is_err());
    }

    #[tokio::test]
    async fn overloaded_account_is_skipped() {
        let r = registry();
        r.add_account(None, Some(oauth_token()), Some("org-1".into()), vec![])
            .await
            .unwrap();
        r.mark_overloaded("org-1", std::time::Duration::from_secs(30))
            .await
            .unwrap();
        assert!(r.pick_for_oauth().await.is_err());
    }

    #[tokio::test]
    async fn oauth_pick_breaks_ties_by_oldest_last_used() {
        let r = registry();
        r.add_account(None, Some(oauth_token()), Some("org-1".into()), vec![])
            .await
            .unwrap();
        r.add_account(None, Some(oauth_token()), Some("org-2".into()), vec![])
            .await
            .unwrap();
        r.touch("org-1").await;

        // Neither has sessions; org-2 was used less recently.
        let picked = r.pick_for_oauth().await.unwrap();
        assert_eq!(picked.organization_uuid, "org-2");
    }

    #[tokio::test]
    async fn batch_remove_reports_missing_ids() {
        let r = registry();
        r.add_account(Some("c1".into()), None, Some("org-1".into()), vec![])
            .await
            .unwrap();
        let report = r
            .batch_remove(&["org-1".to_string(), "org-missing".to_string()])
            .await
            .unwrap();
        assert_eq!(report.success_count, 1);
        assert_eq!(report.failures.len(), 1);
    }

    #[tokio::test]
    async fn release_session_decrements_count() {
        let r = registry();
        r.add_account(Some("c1".into()), None, Some("org-1".into()), vec![])
            .await
            .unwrap();
        r.pick_for_session("sid-1").await.unwrap();
        assert_eq!(r.session_count("org-1"), 1);
        r.release_session("sid-1");
        assert_eq!(r.session_count("org-1"), 0);
    }
}
