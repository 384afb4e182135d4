use reqwest::Client;
use std::time::Duration;

// All sidecar traffic is loopback; system proxies must not see it.

pub fn build_http_client(timeout: Option<Duration>) -> Client {
    let mut builder = Client::builder().no_proxy();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder.build().unwrap_or_else(|e| {
        tracing::warn!("falling back to default HTTP client: {}", e);
        Client::new()
    })
}

pub fn build_stream_client() -> Client {
    Client::builder()
        .no_proxy()
        .http1_only()
        .tcp_keepalive(Duration::from_secs(60))
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!("falling back to default stream client: {}", e);
            Client::new()
        })
}
