use once_cell::sync::Lazy;

// Upstream endpoints
pub const CLAUDE_API_BASE_URL: &str = "https://api.anthropic.com";
pub const CLAUDE_WEB_BASE_URL: &str = "https://claude.ai";
pub const OAUTH_TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";

// Headers required by the OAuth messages path
pub const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const OAUTH_BETA_HEADER: &str = "oauth-2025-04-20";
pub const RATELIMIT_RESET_HEADER: &str = "anthropic-ratelimit-unified-reset";

// Public OAuth client id used for refresh-token exchange
pub const OAUTH_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";

// Model used by minimal rate-limit probes
pub const PROBE_MODEL: &str = "claude-sonnet-4-20250514";

// Claude.ai web completion tool vocabulary. The public API sends versioned
// server tool types (web_search_20250305, ...); the web endpoint only
// understands its own variant.
pub const WEB_SEARCH_TOOL_PREFIX: &str = "web_search_";
pub const WEB_SEARCH_V0_TYPE: &str = "web_search_v0";
pub const WEB_SEARCH_TOOL_NAME: &str = "web_search";

pub static USER_AGENT: Lazy<String> = Lazy::new(|| {
    format!(
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
         (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 trestle/{}",
        env!("CARGO_PKG_VERSION")
    )
});
