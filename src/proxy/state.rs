use crate::error::ProxyResult;
use crate::models::AppConfig;
use crate::proxy::accounts::AccountRegistry;
use crate::proxy::proxy_pool::ProxyPool;
use crate::proxy::sessions::SessionManager;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

// One root context per process; constructed at startup and passed
// explicitly. No ambient globals.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub config_path: Arc<PathBuf>,
    pub registry: Arc<AccountRegistry>,
    pub sessions: Arc<SessionManager>,
    pub pool: Arc<ProxyPool>,
    pub concurrency: Arc<Semaphore>,
    pub cancel: CancellationToken,
}

impl AppState {
    pub fn new(config: AppConfig, config_path: PathBuf) -> Self {
        let registry = Arc::new(AccountRegistry::new(
            config.data_dir.clone(),
            config.per_account_session_cap,
        ));
        let pool = Arc::new(ProxyPool::new(config.proxy.clone()));
        let sessions = Arc::new(SessionManager::new(
            registry.clone(),
            pool.clone(),
            Duration::from_secs(config.session_ttl),
            Duration::from_secs(config.request_timeout),
        ));
        let concurrency = Arc::new(Semaphore::new(config.max_concurrent_requests.max(1)));

        Self {
            config: Arc::new(config),
            config_path: Arc::new(config_path),
            registry,
            sessions,
            pool,
            concurrency,
            cancel: CancellationToken::new(),
        }
    }

    // Load persisted state and start the background loops.
    pub async fn bootstrap(&self) -> ProxyResult<()> {
        let loaded = self.registry.load().await?;
        tracing::info!("[Startup] Registry ready with {} accounts", loaded);

        let proxies_path = self.config.data_dir.join("proxies.txt");
        if let Ok(text) = std::fs::read_to_string(&proxies_path) {
            let count = self.pool.reload(&text);
            tracing::info!(
                "[Startup] Proxy pool loaded {} proxies from {}",
                count,
                proxies_path.display()
            );
        }

        self.pool.clone().start_rotation_ticker(self.cancel.clone());
        self.sessions.clone().start_sweeper(self.cancel.clone());
        self.registry
            .clone()
            .start_maintenance(Duration::from_secs(60), self.cancel.clone());
        Ok(())
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bootstrap_with_empty_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.data_dir = dir.path().to_path_buf();
        let state = AppState::new(config, dir.path().join("config.json"));
        state.bootstrap().await.unwrap();
        assert_eq!(state.registry.status().await.total_accounts, 0);
        state.shutdown();
    }
}
