use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use thiserror::Error;

// One tagged error for the whole request path. The orchestrator dispatches
// on the variant; surfaced errors carry a stable numeric code so operators
// can grep logs and clients can branch without parsing messages.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("upstream overloaded: {0}")]
    UpstreamOverloaded(String),

    #[error("upstream rate limited (resets_at: {resets_at:?})")]
    RateLimited { resets_at: Option<DateTime<Utc>> },

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("proxy transport failure via {proxy}: {message}")]
    ProxyTransport { proxy: String, message: String },

    #[error("all proxies are cooling down")]
    AllProxiesUnavailable,

    #[error("no accounts available: {0}")]
    NoAccountsAvailable(String),

    #[error("upstream protocol error: {0}")]
    UpstreamProtocol(String),

    #[error("client disconnected")]
    ClientDisconnected,

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}

impl ProxyError {
    // Whether the orchestrator may retry this failure with a fresh
    // account/proxy pick. Overload retry is additionally bounded by its own
    // attempt cap.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ProxyError::UpstreamOverloaded(_)
                | ProxyError::RateLimited { .. }
                | ProxyError::InvalidCredentials(_)
                | ProxyError::ProxyTransport { .. }
                | ProxyError::Network(_)
        )
    }

    // Stable surface code reported in error bodies and logs.
    pub fn code(&self) -> u32 {
        match self {
            ProxyError::NoAccountsAvailable(_) => 503_100,
            ProxyError::AllProxiesUnavailable => 503_200,
            ProxyError::ProxyTransport { .. } => 503_201,
            ProxyError::UpstreamOverloaded(_) => 503_510,
            ProxyError::RateLimited { .. } => 429_000,
            ProxyError::InvalidCredentials(_) => 401_000,
            ProxyError::UpstreamProtocol(_) => 502_000,
            ProxyError::Validation(_) => 400_000,
            ProxyError::ClientDisconnected => 499_000,
            _ => 503_500,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Validation(_) => StatusCode::BAD_REQUEST,
            ProxyError::InvalidCredentials(_) => StatusCode::UNAUTHORIZED,
            ProxyError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::UpstreamProtocol(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    // Anthropic `error.type` discriminant for client-facing bodies.
    pub fn error_type(&self) -> &'static str {
        match self {
            ProxyError::Validation(_) => "invalid_request_error",
            ProxyError::InvalidCredentials(_) => "authentication_error",
            ProxyError::RateLimited { .. } => "rate_limit_error",
            ProxyError::UpstreamOverloaded(_) | ProxyError::NoAccountsAvailable(_) => {
                "overloaded_error"
            }
            _ => "api_error",
        }
    }
}

// Classify a non-2xx upstream HTTP response into an error kind. `via_proxy`
// carries the proxy id when the request went through the pool: a 403 on a
// proxied connection is treated as a proxy problem, not an account problem.
pub fn classify_upstream_status(
    status: u16,
    body: &str,
    resets_at: Option<DateTime<Utc>>,
    via_proxy: Option<&str>,
) -> ProxyError {
    match status {
        401 => ProxyError::InvalidCredentials(truncate(body, 200)),
        403 => match via_proxy {
            Some(proxy) => ProxyError::ProxyTransport {
                proxy: proxy.to_string(),
                message: format!("HTTP 403: {}", truncate(body, 200)),
            },
            None => ProxyError::InvalidCredentials(truncate(body, 200)),
        },
        429 => ProxyError::RateLimited { resets_at },
        529 => ProxyError::UpstreamOverloaded(truncate(body, 200)),
        s if s >= 500 => {
            if body.contains("overloaded") {
                ProxyError::UpstreamOverloaded(truncate(body, 200))
            } else {
                ProxyError::Internal(format!("HTTP {}: {}", s, truncate(body, 200)))
            }
        }
        s => ProxyError::UpstreamProtocol(format!("HTTP {}: {}", s, truncate(body, 200))),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let prefix: String = s.chars().take(max).collect();
        format!("{}...", prefix)
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn surface_codes_are_stable() {
        assert_eq!(ProxyError::AllProxiesUnavailable.code(), 503_200);
        assert_eq!(
            ProxyError::ProxyTransport {
                proxy: "http://p:1".into(),
                message: "t".into()
            }
            .code(),
            503_201
        );
        assert_eq!(ProxyError::UpstreamOverloaded("x".into()).code(), 503_510);
        assert_eq!(ProxyError::Internal("x".into()).code(), 503_500);
    }

    #[test]
    fn forbidden_while_proxied_is_a_proxy_fault() {
        let err = classify_upstream_status(403, "blocked", None, Some("http://p1:8080"));
        assert!(matches!(err, ProxyError::ProxyTransport { .. }));

        let err = classify_upstream_status(403, "blocked", None, None);
        assert!(matches!(err, ProxyError::InvalidCredentials(_)));
    }

    #[test]
    fn overloaded_is_retryable_but_protocol_errors_are_not() {
        assert!(ProxyError::UpstreamOverloaded("".into()).retryable());
        assert!(!ProxyError::UpstreamProtocol("".into()).retryable());
        assert!(!ProxyError::Validation("".into()).retryable());
    }

    #[test]
    fn status_529_maps_to_overloaded() {
        let err = classify_upstream_status(529, "overloaded_error", None, None);
        assert!(matches!(err, ProxyError::UpstreamOverloaded(_)));
    }
}
