#![allow(dead_code)]

use parking_lot::Mutex;
use pupu_sidecar::{
    ConsumerId, Entrypoint, EntrypointKind, EntrypointResolver, EventSink, SidecarSupervisor,
    StreamEvent, SupervisorConfig,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// How the fake sidecar answers a chat stream request.
#[derive(Debug, Clone)]
pub enum StreamScript {
    /// Send the events, then close the connection.
    Events(Vec<(&'static str, &'static str)>),
    /// Send the events, then keep the connection open until the server stops.
    Hold(Vec<(&'static str, &'static str)>),
    /// Plain HTTP error response.
    Status(u16, &'static str),
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub auth: Option<String>,
    pub body: Value,
}

#[derive(Default)]
struct FakeState {
    scripts: HashMap<String, StreamScript>,
    requests: Vec<RecordedRequest>,
}

/// Minimal HTTP/1.1 stand-in for the Miso sidecar. Chat requests pick their
/// script by the `message` field of the JSON body.
pub struct FakeMiso {
    pub port: u16,
    state: Arc<Mutex<FakeState>>,
    stop: CancellationToken,
}

impl FakeMiso {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake miso");
        let port = listener.local_addr().expect("local_addr").port();
        let state = Arc::new(Mutex::new(FakeState::default()));
        let stop = CancellationToken::new();

        let accept_state = state.clone();
        let accept_stop = stop.clone();
        tokio::spawn(async move {
            loop {
                let socket = tokio::select! {
                    _ = accept_stop.cancelled() => return,
                    accepted = listener.accept() => match accepted {
                        Ok((socket, _)) => socket,
                        Err(_) => return,
                    },
                };
                let state = accept_state.clone();
                let stop = accept_stop.clone();
                tokio::spawn(async move {
                    let _ = handle_connection(socket, state, stop).await;
                });
            }
        });

        Self { port, state, stop }
    }

    pub fn script(&self, message: &str, script: StreamScript) {
        self.state.lock().scripts.insert(message.to_string(), script);
    }

    pub fn requests(&self, path: &str) -> Vec<RecordedRequest> {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|r| r.path == path)
            .cloned()
            .collect()
    }

    pub fn shutdown(&self) {
        self.stop.cancel();
    }
}

impl Drop for FakeMiso {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn read_request(socket: &mut TcpStream) -> std::io::Result<Option<(String, Vec<u8>)>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
    };
    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);
    let mut body = buf[head_end..].to_vec();
    while body.len() < content_length {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    Ok(Some((head, body)))
}

async fn handle_connection(
    mut socket: TcpStream,
    state: Arc<Mutex<FakeState>>,
    stop: CancellationToken,
) -> std::io::Result<()> {
    let Some((head, body)) = read_request(&mut socket).await? else {
        return Ok(());
    };
    let request_line = head.lines().next().unwrap_or_default().to_string();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();
    let auth = head.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.eq_ignore_ascii_case("x-miso-auth")
            .then(|| value.trim().to_string())
    });
    let body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);

    let script = {
        let mut state = state.lock();
        state.requests.push(RecordedRequest {
            method: method.clone(),
            path: path.clone(),
            auth,
            body: body.clone(),
        });
        body.get("message")
            .and_then(Value::as_str)
            .and_then(|m| state.scripts.get(m).cloned())
    };

    if path == "/health" {
        socket
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
            .await?;
        return Ok(());
    }

    match script {
        None => {
            socket
                .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await?;
        }
        Some(StreamScript::Status(status, body)) => {
            let response = format!(
                "HTTP/1.1 {} Error\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await?;
        }
        Some(StreamScript::Events(events)) => {
            write_sse(&mut socket, &events).await?;
        }
        Some(StreamScript::Hold(events)) => {
            write_sse(&mut socket, &events).await?;
            stop.cancelled().await;
        }
    }
    socket.shutdown().await
}

async fn write_sse(socket: &mut TcpStream, events: &[(&str, &str)]) -> std::io::Result<()> {
    socket
        .write_all(
            b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n",
        )
        .await?;
    for (event, data) in events {
        let block = format!("event: {}\ndata: {}\n\n", event, data);
        socket.write_all(block.as_bytes()).await?;
        socket.flush().await?;
    }
    Ok(())
}

/// Sink that records every delivered event.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<(ConsumerId, StreamEvent)>>,
}

impl CollectingSink {
    pub fn for_request(&self, request_id: &str) -> Vec<(String, Value)> {
        self.events
            .lock()
            .iter()
            .filter(|(_, e)| e.request_id == request_id)
            .map(|(_, e)| (e.event.clone(), e.data.clone()))
            .collect()
    }

    pub fn for_consumer(&self, consumer: ConsumerId, request_id: &str) -> Vec<(String, Value)> {
        self.events
            .lock()
            .iter()
            .filter(|(c, e)| *c == consumer && e.request_id == request_id)
            .map(|(_, e)| (e.event.clone(), e.data.clone()))
            .collect()
    }

    /// Poll until a terminal event for `request_id` shows up.
    pub async fn wait_for_terminal(&self, request_id: &str, timeout: Duration) -> Vec<(String, Value)> {
        let deadline = Instant::now() + timeout;
        loop {
            let events = self.for_request(request_id);
            if events.iter().any(|(event, data)| is_terminal(event, data)) {
                return events;
            }
            assert!(
                Instant::now() < deadline,
                "no terminal event for {request_id}; got {events:?}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until at least `count` events for `request_id` were delivered.
    pub async fn wait_for_events(&self, request_id: &str, count: usize, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while self.for_request(request_id).len() < count {
            assert!(Instant::now() < deadline, "timed out waiting for {request_id}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, consumer: ConsumerId, event: StreamEvent) {
        self.events.lock().push((consumer, event));
    }
}

pub fn is_terminal(event: &str, data: &Value) -> bool {
    match event {
        "done" | "error" => true,
        "frame" => matches!(
            data.get("type").and_then(Value::as_str),
            Some("done" | "error")
        ),
        _ => false,
    }
}

pub fn terminal_count(events: &[(String, Value)]) -> usize {
    events
        .iter()
        .filter(|(event, data)| is_terminal(event, data))
        .count()
}

/// Launches a long-lived placeholder process; health comes from `FakeMiso`.
pub struct SleepResolver;

impl EntrypointResolver for SleepResolver {
    fn resolve(&self) -> Option<Entrypoint> {
        ShellResolver("sleep 30").resolve()
    }
}

/// Runs a shell script as the sidecar process.
pub struct ShellResolver(pub &'static str);

impl EntrypointResolver for ShellResolver {
    fn resolve(&self) -> Option<Entrypoint> {
        Some(Entrypoint {
            kind: EntrypointKind::DevScript,
            command: "sh".into(),
            args: vec!["-c".into(), self.0.into()],
            cwd: std::env::temp_dir(),
        })
    }
}

/// A supervisor whose only candidate port is the fake server's, so the
/// health probe reaches it and the supervisor turns ready.
pub async fn ready_supervisor(
    server: &FakeMiso,
    sink: Arc<dyn EventSink>,
) -> Arc<SidecarSupervisor> {
    ready_supervisor_with(server, sink, Arc::new(SleepResolver)).await
}

pub async fn ready_supervisor_with(
    server: &FakeMiso,
    sink: Arc<dyn EventSink>,
    resolver: Arc<dyn EntrypointResolver>,
) -> Arc<SidecarSupervisor> {
    let config = SupervisorConfig {
        port_range_start: server.port,
        port_range_end: server.port,
        boot_timeout_ms: 5_000,
        health_retry_ms: 20,
        restart_delay_ms: 60_000,
        kill_grace_ms: 300,
        ..SupervisorConfig::default()
    };
    let supervisor = SidecarSupervisor::new(config, resolver, sink);
    supervisor.start().await;
    assert!(supervisor.is_ready(), "supervisor did not become ready: {:?}", supervisor.status());
    supervisor
}
