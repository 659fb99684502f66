pub mod constants;
pub mod error;
pub mod logger;
pub mod models;
pub mod proxy;

use proxy::state::AppState;
use std::path::PathBuf;
use tracing::{error, info, warn};

fn config_path() -> PathBuf {
    std::env::var("TRESTLE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.json"))
}

fn apply_env_overrides(config: &mut models::AppConfig) {
    if let Ok(port) = std::env::var("PORT") {
        match port.trim().parse::<u16>() {
            Ok(p) if p > 0 => {
                config.port = p;
                info!("Using port from environment: {}", p);
            }
            _ => warn!("Ignoring invalid PORT value: {}", port),
        }
    }
    if let Ok(host) = std::env::var("HOST") {
        if !host.trim().is_empty() {
            config.host = host.trim().to_string();
            info!("Using host from environment: {}", config.host);
        }
    }
    if let Ok(dir) = std::env::var("TRESTLE_DATA_DIR") {
        if !dir.trim().is_empty() {
            config.data_dir = PathBuf::from(dir.trim());
        }
    }
}

pub fn run() {
    let path = config_path();
    let mut config = models::load_config(&path);
    apply_env_overrides(&mut config);

    logger::init_logger(&config.data_dir);
    info!(
        "Starting trestle v{} on {}:{}",
        env!("CARGO_PKG_VERSION"),
        config.host,
        config.port
    );

    let runtime = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime");
    runtime.block_on(async {
        let state = AppState::new(config, path);
        if let Err(e) = state.bootstrap().await {
            error!("Startup failed: {}", e);
            std::process::exit(1);
        }

        let server_state = state.clone();
        let server = tokio::spawn(async move { proxy::server::serve(server_state).await });

        let _ = tokio::signal::ctrl_c().await;
        info!("Shutting down");
        state.shutdown();
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Server exited with error: {}", e),
            Err(e) => error!("Server task panicked: {}", e),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    #[test]
    fn env_port_overrides_config() {
        let _guard = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let mut config = models::AppConfig::default();
        let original = config.port;
        std::env::set_var("PORT", "9977");
        apply_env_overrides(&mut config);
        std::env::remove_var("PORT");
        assert_eq!(config.port, 9977);
        assert_ne!(config.port, original);
    }

    #[test]
    fn invalid_env_port_is_ignored() {
        let _guard = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let mut config = models::AppConfig::default();
        let original = config.port;
        std::env::set_var("PORT", "not-a-port");
        apply_env_overrides(&mut config);
        std::env::remove_var("PORT");
        assert_eq!(config.port, original);
    }
}
