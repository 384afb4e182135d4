//! Best-effort auto-start of a local Ollama server.
//!
//! No restart policy: a started process that dies is simply forgotten.

use crate::client::build_http_client;
use crate::config::OllamaConfig;
use crate::error::{Result, SidecarError};
use crate::process::{watch_child, ProcessControl};
use parking_lot::Mutex;
use pupu_observability::{emit_event, ObservabilityEvent, ProcessKind};
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OllamaStatus {
    Checking,
    AlreadyRunning,
    Started,
    NotFound,
    Error,
}

impl OllamaStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OllamaStatus::Checking => "checking",
            OllamaStatus::AlreadyRunning => "already_running",
            OllamaStatus::Started => "started",
            OllamaStatus::NotFound => "not_found",
            OllamaStatus::Error => "error",
        }
    }
}

struct OwnedProcess {
    generation: u64,
    control: ProcessControl,
}

struct OllamaState {
    status: OllamaStatus,
    generation: u64,
    process: Option<OwnedProcess>,
}

pub struct OllamaAutoStarter {
    config: OllamaConfig,
    client: reqwest::Client,
    library_client: reqwest::Client,
    state: Arc<Mutex<OllamaState>>,
}

impl OllamaAutoStarter {
    pub fn new(config: OllamaConfig) -> Self {
        let client = build_http_client(Some(config.ping_timeout()));
        let library_client = build_library_client(config.library_timeout());
        Self {
            config,
            client,
            library_client,
            state: Arc::new(Mutex::new(OllamaState {
                status: OllamaStatus::Checking,
                generation: 0,
                process: None,
            })),
        }
    }

    pub fn status(&self) -> OllamaStatus {
        self.state.lock().status
    }

    /// True while a process this host spawned is still alive.
    pub fn owns_process(&self) -> bool {
        self.state
            .lock()
            .process
            .as_ref()
            .is_some_and(|p| !p.control.has_exited())
    }

    /// Any HTTP answer counts as alive.
    pub async fn ping(&self) -> bool {
        self.client.get(&self.config.url).send().await.is_ok()
    }

    fn set_status(&self, status: OllamaStatus) {
        self.state.lock().status = status;
        emit_event(
            Level::INFO,
            ProcessKind::Host,
            ObservabilityEvent {
                event: "ollama.status",
                component: "ollama",
                service: Some("ollama"),
                status: Some(status.as_str()),
                ..Default::default()
            },
        );
    }

    pub async fn start(&self) -> OllamaStatus {
        if self.ping().await {
            self.set_status(OllamaStatus::AlreadyRunning);
            return OllamaStatus::AlreadyRunning;
        }

        let mut command = tokio::process::Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        #[cfg(windows)]
        {
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            command.creation_flags(CREATE_NO_WINDOW);
        }

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let status = if e.kind() == std::io::ErrorKind::NotFound {
                    OllamaStatus::NotFound
                } else {
                    OllamaStatus::Error
                };
                tracing::warn!("failed to spawn {}: {}", self.config.command, e);
                self.set_status(status);
                return status;
            }
        };

        {
            let mut state = self.state.lock();
            state.generation += 1;
            let generation = state.generation;
            let shared = self.state.clone();
            let control = watch_child(child, move |exit| {
                let mut state = shared.lock();
                if state.process.as_ref().map(|p| p.generation) == Some(generation) {
                    state.process = None;
                }
                tracing::info!("ollama serve exited: {:?}", exit);
            });
            tracing::info!(pid = ?control.pid(), "spawned ollama serve");
            state.process = Some(OwnedProcess {
                generation,
                control,
            });
        }

        tokio::time::sleep(self.config.settle_delay()).await;
        let status = if self.ping().await {
            OllamaStatus::Started
        } else {
            OllamaStatus::Error
        };
        self.set_status(status);
        status
    }

    /// Terminate the process this host started, if any.
    pub fn stop(&self) {
        let owned = self.state.lock().process.take();
        if let Some(owned) = owned {
            owned.control.shutdown(self.config.kill_grace());
        }
    }

    pub async fn restart(&self) -> OllamaStatus {
        self.stop();
        self.state.lock().status = OllamaStatus::Checking;
        self.start().await
    }

    /// Raw HTML of the public library search page. Blank `query` and
    /// `category` are left out of the URL.
    pub async fn search_library(&self, query: &str, category: &str) -> Result<String> {
        let params: Vec<(&str, &str)> = [("q", query.trim()), ("c", category.trim())]
            .into_iter()
            .filter(|(_, value)| !value.is_empty())
            .collect();
        let response = self
            .library_client
            .get(&self.config.library_url)
            .header(reqwest::header::ACCEPT, "text/html")
            .query(&params)
            .send()
            .await
            .map_err(library_error)?;
        response.text().await.map_err(library_error)
    }
}

fn build_library_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent("Mozilla/5.0")
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!("falling back to default library client: {}", e);
            reqwest::Client::new()
        })
}

fn library_error(error: reqwest::Error) -> SidecarError {
    if error.is_timeout() {
        SidecarError::Timeout("ollama library search timed out".to_string())
    } else {
        SidecarError::Http(error)
    }
}
