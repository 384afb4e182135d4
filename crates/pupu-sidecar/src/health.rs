use crate::client::build_http_client;
use crate::config::MISO_AUTH_HEADER;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Polls the sidecar's health endpoint until it answers 2xx.
#[derive(Debug, Clone)]
pub struct HealthProber {
    client: reqwest::Client,
    interval: Duration,
    timeout: Duration,
}

impl HealthProber {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            client: build_http_client(None),
            interval,
            timeout,
        }
    }

    /// One probe. Never fails; transport errors count as "not healthy".
    pub async fn ping(&self, url: &str, token: Option<&str>, budget: Duration) -> bool {
        let mut request = self.client.get(url).timeout(budget);
        if let Some(token) = token {
            request = request.header(MISO_AUTH_HEADER, token);
        }
        match request.send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::trace!("health probe failed: {}", e);
                false
            }
        }
    }

    /// Probe every interval until healthy, the timeout elapses, or `abort` fires.
    pub async fn wait_until_ready(
        &self,
        url: &str,
        token: Option<&str>,
        abort: &CancellationToken,
    ) -> bool {
        let deadline = Instant::now() + self.timeout;
        loop {
            if abort.is_cancelled() {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }

            let healthy = tokio::select! {
                _ = abort.cancelled() => return false,
                ok = self.ping(url, token, remaining) => ok,
            };
            if healthy {
                return true;
            }

            tokio::select! {
                _ = abort.cancelled() => return false,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answers `fail_first` requests with 503, then 200, checking the auth header.
    async fn spawn_health_server(fail_first: usize, token: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local_addr");
        tokio::spawn(async move {
            let mut served = 0usize;
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = [0u8; 4096];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                let req = String::from_utf8_lossy(&buf[..n]).to_lowercase();
                assert!(req.starts_with("get /health"), "unexpected request: {req}");
                assert!(req.contains(&format!("x-miso-auth: {token}")));
                let status = if served < fail_first {
                    "503 Service Unavailable"
                } else {
                    "200 OK"
                };
                served += 1;
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok",
                    status
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{}/health", addr)
    }

    #[tokio::test]
    async fn becomes_ready_after_failed_probes() {
        let url = spawn_health_server(2, "tok").await;
        let prober = HealthProber::new(Duration::from_millis(20), Duration::from_secs(5));
        let abort = CancellationToken::new();
        assert!(prober.wait_until_ready(&url, Some("tok"), &abort).await);
    }

    #[tokio::test]
    async fn times_out_when_nothing_listens() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let url = format!("http://{}/health", listener.local_addr().expect("addr"));
        drop(listener);

        let prober = HealthProber::new(Duration::from_millis(20), Duration::from_millis(200));
        let started = std::time::Instant::now();
        assert!(!prober.wait_until_ready(&url, None, &CancellationToken::new()).await);
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn abort_stops_waiting_early() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let url = format!("http://{}/health", listener.local_addr().expect("addr"));
        drop(listener);

        let prober = HealthProber::new(Duration::from_millis(20), Duration::from_secs(30));
        let abort = CancellationToken::new();
        let trigger = abort.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        assert!(!prober.wait_until_ready(&url, None, &abort).await);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
