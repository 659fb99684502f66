mod account;
mod config;
mod messages;

pub use account::{short_id, Account, AccountStatus, AuthType, OAuthToken};
pub use config::{
    load_config, migrate_legacy_proxy_url, save_config, AppConfig, ProxyMode, ProxySettings,
    RotationStrategy,
};
pub use messages::{Message, MessageContent, MessagesRequest, RequestMetadata, ThinkingConfig};
