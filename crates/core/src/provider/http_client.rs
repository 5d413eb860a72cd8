//! Shared `reqwest` client builder, one instance reused by every adapter.

use std::time::Duration;

use reqwest::{Client, header};

fn default_http_client_builder() -> reqwest::ClientBuilder {
    let mut headers = header::HeaderMap::new();
    headers.insert(header::CONNECTION, header::HeaderValue::from_static("keep-alive"));

    Client::builder()
        .timeout(Duration::from_secs(60))
        // Hyper's connection pool only exposes max-idle-per-host and an idle
        // timeout, no TTL on individual connections. A 5s idle timeout is
        // short enough that we still pick up DNS changes for a provider
        // endpoint without giving up meaningful connection reuse.
        .pool_idle_timeout(Some(Duration::from_secs(5)))
        .tcp_nodelay(true)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .default_headers(headers)
}

/// Build a fresh client. Each adapter holds its own instance rather than a
/// process-wide singleton so per-provider base URLs/timeouts can diverge
/// later without reaching for interior mutability.
pub fn http_client() -> Client {
    default_http_client_builder().build().expect("default HTTP client configuration is always valid")
}
