use crate::error::{ProxyError, ProxyResult};
use crate::proxy::proxy_pool::ProxyEndpoint;
use std::time::Duration;

// Build an egress client, optionally routed through a pool proxy. Transport
// settings mirror what a browser session looks like from the far end.
pub fn build_client(
    proxy: Option<&ProxyEndpoint>,
    timeout: Duration,
) -> ProxyResult<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(20))
        .pool_max_idle_per_host(8)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .timeout(timeout)
        .user_agent(crate::constants::USER_AGENT.as_str());

    if let Some(endpoint) = proxy {
        builder = builder.proxy(endpoint.to_reqwest_proxy()?);
    }

    builder
        .build()
        .map_err(|e| ProxyError::Internal(format!("failed to build HTTP client: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::proxy_pool::parse_proxy_line;

    #[test]
    fn builds_direct_and_proxied_clients() {
        assert!(build_client(None, Duration::from_secs(10)).is_ok());
        let endpoint = parse_proxy_line("socks5://10.0.0.1:1080").unwrap();
        assert!(build_client(Some(&endpoint), Duration::from_secs(10)).is_ok());
    }
}
