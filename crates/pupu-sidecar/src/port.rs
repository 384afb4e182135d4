use tokio::net::TcpListener;

/// Returns true when nothing is listening on `host:port`.
pub async fn is_port_available(host: &str, port: u16) -> bool {
    TcpListener::bind((host, port)).await.is_ok()
}

/// First free port in `start..=end`, or `start` when the whole range is taken.
///
/// The probe listener is dropped immediately, so a later bind can still race.
pub async fn find_available_port(host: &str, start: u16, end: u16) -> u16 {
    for port in start..=end {
        if is_port_available(host, port).await {
            return port;
        }
    }
    tracing::warn!(start, end, "no free port in range, falling back to {}", start);
    start
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn occupied_port_is_reported_busy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        assert!(!is_port_available("127.0.0.1", port).await);
        drop(listener);
        assert!(is_port_available("127.0.0.1", port).await);
    }

    #[tokio::test]
    async fn exhausted_range_falls_back_to_start() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        assert_eq!(find_available_port("127.0.0.1", port, port).await, port);
    }

    #[tokio::test]
    async fn busy_start_is_skipped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let Some(next) = port.checked_add(1) else {
            return;
        };
        let picked = find_available_port("127.0.0.1", port, next).await;
        if is_port_available("127.0.0.1", next).await {
            assert_eq!(picked, next);
        } else {
            assert_eq!(picked, port);
        }
    }
}
