//! Lifecycle of the Miso sidecar process.
//!
//! One supervisor owns at most one child. Every launch gets a generation
//! number; exit watchers and output readers of older launches are ignored.

use crate::config::{SupervisorConfig, MISO_HEALTH_ENDPOINT};
use crate::health::HealthProber;
use crate::launcher::EntrypointResolver;
use crate::logs::{LogRingBuffer, LogStream};
use crate::port::find_available_port;
use crate::process::{describe_exit, watch_child, ProcessControl};
use crate::registry::{AdmitError, ConsumerId, EventSink, StreamLease, StreamRegistry};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use pupu_observability::{emit_event, redact_text, ObservabilityEvent, ProcessKind};
use rand::RngCore;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Level;

static FATAL_STDERR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)ModuleNotFoundError|No module named").expect("valid fatal stderr regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SidecarState {
    Stopped,
    Starting,
    Ready,
    Error,
    NotFound,
}

impl SidecarState {
    pub fn as_str(self) -> &'static str {
        match self {
            SidecarState::Stopped => "stopped",
            SidecarState::Starting => "starting",
            SidecarState::Ready => "ready",
            SidecarState::Error => "error",
            SidecarState::NotFound => "not_found",
        }
    }
}

/// Externally visible supervisor status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SidecarStatus {
    pub status: SidecarState,
    pub reason: String,
    pub ready: bool,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    pub url: Option<String>,
}

/// Where and how to reach a ready sidecar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidecarEndpoint {
    pub base_url: String,
    pub auth_token: String,
}

struct LiveProcess {
    generation: u64,
    control: ProcessControl,
    // cancelled on exit, fatal output, or stop; ends the readiness wait
    abort_wait: CancellationToken,
}

struct SupervisorState {
    state: SidecarState,
    reason: String,
    generation: u64,
    process: Option<LiveProcess>,
    port: Option<u16>,
    auth_token: Option<String>,
    restart_timer: Option<JoinHandle<()>>,
    retiring: Option<ProcessControl>,
    quitting: bool,
}

impl SupervisorState {
    fn is_starting(&self, generation: u64) -> bool {
        self.generation == generation && self.state == SidecarState::Starting
    }

    fn owns(&self, generation: u64) -> bool {
        self.process
            .as_ref()
            .is_some_and(|p| p.generation == generation)
    }

    /// Detach the live process so its exit is ignored, keeping its control
    /// for `wait_for_exit` and the next launch.
    fn retire_process(&mut self) -> Option<LiveProcess> {
        self.auth_token = None;
        let live = self.process.take();
        if let Some(live) = &live {
            self.retiring = Some(live.control.clone());
        }
        live
    }
}

pub struct SidecarSupervisor {
    config: SupervisorConfig,
    resolver: Arc<dyn EntrypointResolver>,
    prober: HealthProber,
    streams: Arc<StreamRegistry>,
    logs: Arc<LogRingBuffer>,
    inner: Mutex<SupervisorState>,
    this: Weak<SidecarSupervisor>,
}

impl SidecarSupervisor {
    pub fn new(
        config: SupervisorConfig,
        resolver: Arc<dyn EntrypointResolver>,
        sink: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        let prober = HealthProber::new(config.health_retry(), config.boot_timeout());
        let logs = Arc::new(LogRingBuffer::new(config.log_ring_lines));
        Arc::new_cyclic(|this| Self {
            config,
            resolver,
            prober,
            streams: Arc::new(StreamRegistry::new(sink)),
            logs,
            inner: Mutex::new(SupervisorState {
                state: SidecarState::Stopped,
                reason: String::new(),
                generation: 0,
                process: None,
                port: None,
                auth_token: None,
                restart_timer: None,
                retiring: None,
                quitting: false,
            }),
            this: this.clone(),
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn streams(&self) -> &Arc<StreamRegistry> {
        &self.streams
    }

    pub fn logs(&self) -> &Arc<LogRingBuffer> {
        &self.logs
    }

    pub fn state(&self) -> SidecarState {
        self.inner.lock().state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SidecarState::Ready
    }

    pub fn restart_pending(&self) -> bool {
        self.inner.lock().restart_timer.is_some()
    }

    pub fn status(&self) -> SidecarStatus {
        let inner = self.inner.lock();
        SidecarStatus {
            status: inner.state,
            reason: inner.reason.clone(),
            ready: inner.state == SidecarState::Ready,
            pid: inner.process.as_ref().and_then(|p| p.control.pid()),
            port: inner.port,
            url: inner.port.map(|port| self.base_url(port)),
        }
    }

    /// Base URL and auth token, only while ready.
    pub fn endpoint(&self) -> Option<SidecarEndpoint> {
        let inner = self.inner.lock();
        self.endpoint_locked(&inner)
    }

    /// Register a stream and snapshot the endpoint it should talk to, as one
    /// step against readiness.
    pub fn admit_stream(
        &self,
        request_id: &str,
        consumer: ConsumerId,
    ) -> Result<(StreamLease, SidecarEndpoint), AdmitError> {
        let inner = self.inner.lock();
        let endpoint = self.endpoint_locked(&inner).ok_or(AdmitError::Closed)?;
        let lease = self.streams.admit(request_id, consumer)?;
        Ok((lease, endpoint))
    }

    fn endpoint_locked(&self, inner: &SupervisorState) -> Option<SidecarEndpoint> {
        if inner.state != SidecarState::Ready {
            return None;
        }
        Some(SidecarEndpoint {
            base_url: self.base_url(inner.port?),
            auth_token: inner.auth_token.clone()?,
        })
    }

    fn base_url(&self, port: u16) -> String {
        format!("http://{}:{}", self.config.host, port)
    }

    /// Launch the sidecar and wait for it to become healthy. No-op while a
    /// process is running or a launch is in flight, and after shutdown.
    pub async fn start(&self) {
        let generation = {
            let mut inner = self.inner.lock();
            if inner.quitting {
                tracing::debug!("host is quitting, not starting miso");
                return;
            }
            if inner.process.is_some() || inner.state == SidecarState::Starting {
                tracing::debug!("miso already running or starting");
                return;
            }
            inner.generation += 1;
            inner.state = SidecarState::Starting;
            inner.reason.clear();
            inner.generation
        };
        self.lifecycle(Level::INFO, "sidecar.launch.start", None, None, None);

        let retiring = self.inner.lock().retiring.take();
        if let Some(previous) = retiring {
            let wait = self.config.kill_grace() + Duration::from_secs(1);
            if tokio::time::timeout(wait, previous.exited()).await.is_err() {
                tracing::warn!(pid = ?previous.pid(), "previous miso process is still alive");
            }
        }

        let port = find_available_port(
            &self.config.host,
            self.config.port_range_start,
            self.config.port_range_end,
        )
        .await;
        let token = mint_auth_token();
        {
            let mut inner = self.inner.lock();
            if !inner.is_starting(generation) {
                return;
            }
            inner.port = Some(port);
            inner.auth_token = Some(token.clone());
        }

        let resolver = self.resolver.clone();
        let resolved =
            tokio::task::spawn_blocking(move || (resolver.resolve(), resolver.child_env())).await;
        let (entrypoint, extra_env) = match resolved {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::error!("entrypoint resolution panicked: {}", e);
                (None, Vec::new())
            }
        };
        let Some(entrypoint) = entrypoint else {
            self.finish_not_found(generation, "Miso server entrypoint was not found");
            return;
        };
        tracing::info!(
            command = ?entrypoint.command,
            args = ?entrypoint.args,
            cwd = %entrypoint.cwd.display(),
            port,
            auth = %redact_text(&token),
            "spawning miso"
        );

        let mut command = tokio::process::Command::new(&entrypoint.command);
        command
            .args(&entrypoint.args)
            .current_dir(&entrypoint.cwd)
            .envs(extra_env)
            .env("MISO_HOST", &self.config.host)
            .env("MISO_PORT", port.to_string())
            .env("MISO_AUTH_TOKEN", &token)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(windows)]
        {
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            command.creation_flags(CREATE_NO_WINDOW);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.on_spawn_error(generation, e);
                return;
            }
        };
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let abort_wait = CancellationToken::new();

        let pid = {
            let mut inner = self.inner.lock();
            if !inner.is_starting(generation) {
                tracing::debug!("launch superseded while spawning, dropping child");
                return;
            }
            let weak = self.this.clone();
            let exit_abort = abort_wait.clone();
            let control = watch_child(child, move |status| {
                if let Some(supervisor) = weak.upgrade() {
                    supervisor.on_process_exit(generation, status);
                }
                exit_abort.cancel();
            });
            let pid = control.pid();
            inner.process = Some(LiveProcess {
                generation,
                control,
                abort_wait: abort_wait.clone(),
            });
            pid
        };
        self.lifecycle(Level::INFO, "sidecar.spawned", Some(port), pid, None);

        if let Some(stdout) = stdout {
            self.spawn_output_reader(generation, LogStream::Stdout, stdout);
        }
        if let Some(stderr) = stderr {
            self.spawn_output_reader(generation, LogStream::Stderr, stderr);
        }

        let url = format!("{}{}", self.base_url(port), MISO_HEALTH_ENDPOINT);
        let ready = self
            .prober
            .wait_until_ready(&url, Some(&token), &abort_wait)
            .await;
        self.finish_start(generation, ready);
    }

    fn finish_start(&self, generation: u64, ready: bool) {
        let mut inner = self.inner.lock();
        if !inner.is_starting(generation) {
            // stopped or exited while we were waiting
            return;
        }

        if ready {
            inner.state = SidecarState::Ready;
            inner.reason.clear();
            self.streams.open();
            let pid = inner.process.as_ref().and_then(|p| p.control.pid());
            let port = inner.port;
            drop(inner);
            self.lifecycle(Level::INFO, "sidecar.ready", port, pid, None);
            return;
        }

        inner.state = SidecarState::Error;
        if inner.reason.is_empty() {
            inner.reason = format!(
                "Health check timed out after {}ms",
                self.config.boot_timeout_ms
            );
        }
        let live = inner.retire_process();
        let reason = inner.reason.clone();
        let port = inner.port;
        drop(inner);

        let pid = live.as_ref().and_then(|l| l.control.pid());
        self.lifecycle(Level::WARN, "sidecar.start.failed", port, pid, Some(reason.as_str()));
        if let Some(live) = live {
            live.control.shutdown(self.config.kill_grace());
        }
        self.schedule_restart();
    }

    fn finish_not_found(&self, generation: u64, reason: &str) {
        {
            let mut inner = self.inner.lock();
            if !inner.is_starting(generation) {
                return;
            }
            inner.state = SidecarState::NotFound;
            inner.reason = reason.to_string();
            inner.port = None;
            inner.auth_token = None;
        }
        self.lifecycle(Level::WARN, "sidecar.not_found", None, None, Some(reason));
    }

    fn on_spawn_error(&self, generation: u64, error: std::io::Error) {
        let not_found = error.kind() == std::io::ErrorKind::NotFound;
        let message = error.to_string();
        {
            let mut inner = self.inner.lock();
            if !inner.is_starting(generation) {
                return;
            }
            inner.state = if not_found {
                SidecarState::NotFound
            } else {
                SidecarState::Error
            };
            inner.reason = message.clone();
            inner.port = None;
            inner.auth_token = None;
        }
        self.lifecycle(Level::ERROR, "sidecar.spawn.failed", None, None, Some(message.as_str()));
        self.streams.terminate_all(
            "error",
            json!({ "code": "miso_process_error", "message": message }),
        );
        if !not_found {
            self.schedule_restart();
        }
    }

    fn on_process_exit(&self, generation: u64, status: std::io::Result<ExitStatus>) {
        let (code, signal) = describe_exit(&status);
        let message = format!("Miso process exited (code={}, signal={})", code, signal);

        let mut inner = self.inner.lock();
        if !inner.owns(generation) {
            tracing::debug!(generation, "retired miso process exited: {}", message);
            return;
        }
        let pid = inner.process.take().and_then(|p| p.control.pid());
        inner.auth_token = None;
        if inner.quitting {
            inner.state = SidecarState::Stopped;
            inner.reason.clear();
            return;
        }

        // a fatal stderr line seen during boot is the better explanation
        let keep_reason = inner.state == SidecarState::Starting && !inner.reason.is_empty();
        inner.state = SidecarState::Error;
        if !keep_reason {
            inner.reason = message.clone();
        }
        let port = inner.port;
        drop(inner);

        emit_event(
            Level::WARN,
            ProcessKind::Sidecar,
            ObservabilityEvent {
                event: "sidecar.exit",
                component: "supervisor",
                service: Some("miso"),
                port,
                pid,
                status: Some(SidecarState::Error.as_str()),
                detail: Some(message.as_str()),
                ..Default::default()
            },
        );
        self.streams.terminate_all(
            "error",
            json!({ "code": "miso_process_exit", "message": message }),
        );
        self.schedule_restart();
    }

    fn on_fatal_output(&self, generation: u64, text: &str) {
        let mut inner = self.inner.lock();
        let Some(abort) = inner
            .process
            .as_ref()
            .filter(|p| p.generation == generation)
            .map(|p| p.abort_wait.clone())
        else {
            return;
        };
        inner.reason = text.to_string();
        let state = inner.state;
        match state {
            SidecarState::Starting => abort.cancel(),
            SidecarState::Ready => {
                inner.state = SidecarState::Error;
                let live = inner.retire_process();
                let port = inner.port;
                drop(inner);

                let pid = live.as_ref().and_then(|l| l.control.pid());
                self.lifecycle(Level::WARN, "sidecar.fatal_output", port, pid, Some(text));
                self.streams.terminate_all(
                    "error",
                    json!({ "code": "miso_process_error", "message": text }),
                );
                if let Some(live) = live {
                    live.abort_wait.cancel();
                    live.control.shutdown(self.config.kill_grace());
                }
                self.schedule_restart();
            }
            _ => {}
        }
    }

    fn spawn_output_reader<R>(&self, generation: u64, stream: LogStream, reader: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let weak = self.this.clone();
        let logs = self.logs.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                let line = String::from_utf8_lossy(&buf);
                let text = line.trim();
                if text.is_empty() {
                    continue;
                }
                match stream {
                    LogStream::Stdout => tracing::info!(target: "pupu.miso", "[miso] {}", text),
                    LogStream::Stderr => {
                        tracing::warn!(target: "pupu.miso", "[miso:error] {}", text)
                    }
                }
                logs.push(stream, text.to_string());
                if stream == LogStream::Stderr && FATAL_STDERR_RE.is_match(text) {
                    if let Some(supervisor) = weak.upgrade() {
                        supervisor.on_fatal_output(generation, text);
                    }
                }
            }
        });
    }

    fn schedule_restart(&self) {
        let mut inner = self.inner.lock();
        if inner.quitting || inner.restart_timer.is_some() {
            return;
        }
        let weak = self.this.clone();
        let delay = self.config.restart_delay();
        inner.restart_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(supervisor) = weak.upgrade() else {
                return;
            };
            {
                let mut inner = supervisor.inner.lock();
                inner.restart_timer = None;
                if inner.quitting {
                    return;
                }
            }
            supervisor.start().await;
        }));
        drop(inner);
        let detail = format!("delay_ms={}", delay.as_millis());
        self.lifecycle(
            Level::INFO,
            "sidecar.restart.scheduled",
            None,
            None,
            Some(detail.as_str()),
        );
    }

    /// Stop the sidecar: cancel any pending restart, end every stream with
    /// `done {cancelled: true, reason: "service_stopping"}`, then terminate
    /// the child (forced after the grace period). Does not wait for exit.
    pub fn stop(&self) {
        let (live, pid) = {
            let mut inner = self.inner.lock();
            if let Some(timer) = inner.restart_timer.take() {
                timer.abort();
            }
            inner.generation += 1;
            inner.state = SidecarState::Stopped;
            if inner.quitting {
                inner.reason.clear();
            }
            inner.port = None;
            let live = inner.retire_process();
            let pid = live.as_ref().and_then(|l| l.control.pid());
            (live, pid)
        };

        let ended = self.streams.terminate_all(
            "done",
            json!({ "cancelled": true, "reason": "service_stopping" }),
        );
        if ended > 0 {
            tracing::info!(streams = ended, "terminated active miso streams");
        }
        if let Some(live) = live {
            live.abort_wait.cancel();
            live.control.shutdown(self.config.kill_grace());
            self.lifecycle(Level::INFO, "sidecar.stop", None, pid, None);
        }
    }

    /// `stop` followed by `start`.
    pub async fn restart(&self) {
        self.stop();
        self.start().await;
    }

    /// Host quit: never restart again, then stop.
    pub fn shutdown(&self) {
        self.inner.lock().quitting = true;
        self.stop();
    }

    /// Wait until the last stopped child has exited, bounded by `timeout`.
    pub async fn wait_for_exit(&self, timeout: Duration) -> bool {
        let retiring = self.inner.lock().retiring.clone();
        match retiring {
            Some(control) => tokio::time::timeout(timeout, control.exited())
                .await
                .is_ok(),
            None => true,
        }
    }

    fn lifecycle(
        &self,
        level: Level,
        event: &str,
        port: Option<u16>,
        pid: Option<u32>,
        detail: Option<&str>,
    ) {
        let state = self.state();
        emit_event(
            level,
            ProcessKind::Host,
            ObservabilityEvent {
                event,
                component: "supervisor",
                service: Some("miso"),
                port,
                pid,
                status: Some(state.as_str()),
                detail,
                ..Default::default()
            },
        );
    }
}

/// 24 random bytes, hex encoded.
pub fn mint_auth_token() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
