//! JSON-lines IPC surface for UI consumers.
//!
//! Each inbound line is `{"id"?, "method", "params"?}`. Requests that carry an
//! `id` get exactly one `{"id", "result"}` or `{"id", "error"}` reply; stream
//! events are pushed as `{"channel": "miso:stream:event", ...}`.

use crate::bridge::{StreamBridge, StreamProtocol};
use crate::catalog::{fetch_catalog, CatalogKind};
use crate::client::build_http_client;
use crate::error::{Result, SidecarError};
use crate::ollama::OllamaAutoStarter;
use crate::registry::{ConsumerId, EventSink, StreamEvent};
use crate::runtime_dir::{clear_runtime_dir, delete_runtime_entry, runtime_dir_size};
use crate::supervisor::SidecarSupervisor;
use crate::workspace::validate_workspace_root;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

pub const STREAM_EVENT_CHANNEL: &str = "miso:stream:event";

const DEFAULT_LOG_LINES: usize = 200;

#[derive(Debug, Clone, Deserialize)]
pub struct IpcRequest {
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum IpcMessage {
    Reply {
        id: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Event {
        channel: &'static str,
        #[serde(flatten)]
        event: StreamEvent,
    },
}

impl IpcMessage {
    fn reply(id: Value, outcome: Result<Value>) -> Self {
        match outcome {
            Ok(result) => IpcMessage::Reply {
                id,
                result: Some(result),
                error: None,
            },
            Err(e) => IpcMessage::Reply {
                id,
                result: None,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Routes stream events to the outbound queue of each connected consumer.
/// Events for consumers that already left are dropped.
#[derive(Default)]
pub struct ConsumerHub {
    next_id: AtomicU64,
    senders: Mutex<HashMap<ConsumerId, mpsc::UnboundedSender<IpcMessage>>>,
}

impl ConsumerHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self) -> (ConsumerId, mpsc::UnboundedReceiver<IpcMessage>) {
        let id = ConsumerId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().insert(id, tx);
        (id, rx)
    }

    pub fn disconnect(&self, consumer: ConsumerId) -> bool {
        self.senders.lock().remove(&consumer).is_some()
    }

    pub fn connected(&self) -> usize {
        self.senders.lock().len()
    }

    pub fn send(&self, consumer: ConsumerId, message: IpcMessage) -> bool {
        match self.senders.lock().get(&consumer) {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }
}

impl EventSink for ConsumerHub {
    fn emit(&self, consumer: ConsumerId, event: StreamEvent) {
        if !self.send(
            consumer,
            IpcMessage::Event {
                channel: STREAM_EVENT_CHANNEL,
                event,
            },
        ) {
            tracing::trace!(consumer = consumer.0, "dropping event for departed consumer");
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct StreamStartParams {
    request_id: Option<String>,
    payload: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct StreamCancelParams {
    request_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WorkspaceParams {
    path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RuntimeDirParams {
    dir_path: Option<String>,
    entry_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct LogsParams {
    last_n: Option<usize>,
    since: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LibrarySearchParams {
    query: Option<String>,
    category: Option<String>,
}

fn parse_params<T: DeserializeOwned + Default>(params: Value) -> Result<T> {
    if params.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(params).map_err(|e| SidecarError::InvalidParams(e.to_string()))
}

async fn blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| SidecarError::Sidecar(format!("blocking task failed: {e}")))
}

pub struct IpcGateway {
    hub: Arc<ConsumerHub>,
    supervisor: Arc<SidecarSupervisor>,
    bridge: Arc<StreamBridge>,
    ollama: Arc<OllamaAutoStarter>,
    http: reqwest::Client,
    version: String,
}

impl IpcGateway {
    pub fn new(
        hub: Arc<ConsumerHub>,
        bridge: Arc<StreamBridge>,
        ollama: Arc<OllamaAutoStarter>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            hub,
            supervisor: bridge.supervisor().clone(),
            bridge,
            ollama,
            http: build_http_client(None),
            version: version.into(),
        }
    }

    pub fn hub(&self) -> &Arc<ConsumerHub> {
        &self.hub
    }

    pub fn supervisor(&self) -> &Arc<SidecarSupervisor> {
        &self.supervisor
    }

    pub fn ollama(&self) -> &Arc<OllamaAutoStarter> {
        &self.ollama
    }

    /// Stream start and cancel are handled in arrival order so a cancel can
    /// never overtake the start it refers to. Returns `None` for other methods.
    fn handle_stream_op(
        &self,
        consumer: ConsumerId,
        method: &str,
        params: &Value,
    ) -> Option<Result<Value>> {
        let protocol = match method {
            "miso:stream:start" => StreamProtocol::V1,
            "miso:stream:start-v2" => StreamProtocol::V2,
            "miso:stream:cancel" => {
                return Some(
                    parse_params::<StreamCancelParams>(params.clone()).map(|p| {
                        let request_id = p.request_id.unwrap_or_default();
                        Value::Bool(self.bridge.cancel_stream(&request_id))
                    }),
                );
            }
            _ => return None,
        };

        let params = match parse_params::<StreamStartParams>(params.clone()) {
            Ok(params) => params,
            Err(e) => return Some(Err(e)),
        };
        let request_id = params.request_id.unwrap_or_default();
        if let Some(pending) = self
            .bridge
            .admit(&request_id, params.payload, consumer, protocol)
        {
            let bridge = self.bridge.clone();
            tokio::spawn(async move { bridge.run(pending).await });
        }
        Some(Ok(Value::Null))
    }

    /// Answer one request-style method.
    pub async fn dispatch(&self, consumer: ConsumerId, method: &str, params: Value) -> Result<Value> {
        if let Some(outcome) = self.handle_stream_op(consumer, method, &params) {
            return outcome;
        }

        match method {
            "miso:get-status" => Ok(serde_json::to_value(self.supervisor.status())?),
            "miso:restart" => {
                self.supervisor.restart().await;
                Ok(serde_json::to_value(self.supervisor.status())?)
            }
            "miso:get-logs" => {
                let params: LogsParams = parse_params(params)?;
                let logs = self.supervisor.logs();
                let lines = match params.since {
                    Some(seq) => logs.since(seq),
                    None => logs.snapshot(params.last_n.unwrap_or(DEFAULT_LOG_LINES)),
                };
                Ok(json!({ "lines": lines, "dropped": logs.dropped_total() }))
            }
            "miso:get-model-catalog" => {
                let endpoint = self.supervisor.endpoint();
                fetch_catalog(&self.http, endpoint.as_ref(), CatalogKind::Models).await
            }
            "miso:get-toolkit-catalog" => {
                let endpoint = self.supervisor.endpoint();
                fetch_catalog(&self.http, endpoint.as_ref(), CatalogKind::Toolkits).await
            }
            "miso:validate-workspace-root" => {
                let params: WorkspaceParams = parse_params(params)?;
                let path = params.path.unwrap_or_default();
                let validation = blocking(move || validate_workspace_root(&path, true)).await?;
                Ok(serde_json::to_value(validation)?)
            }
            "miso:get-runtime-dir-size" => {
                let params: RuntimeDirParams = parse_params(params)?;
                let dir = params.dir_path.unwrap_or_default();
                Ok(serde_json::to_value(blocking(move || runtime_dir_size(&dir)).await?)?)
            }
            "miso:delete-runtime-entry" => {
                let params: RuntimeDirParams = parse_params(params)?;
                let dir = params.dir_path.unwrap_or_default();
                let name = params.entry_name.unwrap_or_default();
                let outcome = blocking(move || delete_runtime_entry(&dir, &name)).await?;
                Ok(serde_json::to_value(outcome)?)
            }
            "miso:clear-runtime-dir" => {
                let params: RuntimeDirParams = parse_params(params)?;
                let dir = params.dir_path.unwrap_or_default();
                Ok(serde_json::to_value(blocking(move || clear_runtime_dir(&dir)).await?)?)
            }
            "ollama-get-status" => Ok(json!(self.ollama.status())),
            "ollama-restart" => Ok(json!(self.ollama.restart().await)),
            "ollama:library-search" => {
                let params: LibrarySearchParams = parse_params(params)?;
                let html = self
                    .ollama
                    .search_library(
                        params.query.as_deref().unwrap_or_default(),
                        params.category.as_deref().unwrap_or_default(),
                    )
                    .await?;
                Ok(Value::String(html))
            }
            "app:get-version" => Ok(Value::String(self.version.clone())),
            other => Err(SidecarError::UnknownMethod(other.to_string())),
        }
    }

    /// Serve one consumer until `reader` reaches EOF. The consumer's streams
    /// are cancelled when it goes away.
    pub async fn serve<R, W>(self: Arc<Self>, reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (consumer, mut outbound) = self.hub.connect();
        tracing::info!(consumer = consumer.0, "consumer connected");

        let writer_task = tokio::spawn(async move {
            while let Some(message) = outbound.recv().await {
                let mut line = match serde_json::to_vec(&message) {
                    Ok(line) => line,
                    Err(e) => {
                        tracing::warn!("failed to encode outbound message: {}", e);
                        continue;
                    }
                };
                line.push(b'\n');
                if writer.write_all(&line).await.is_err() || writer.flush().await.is_err() {
                    break;
                }
            }
        });

        let mut lines = BufReader::new(reader).lines();
        let read_result = loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break Ok(()),
                Err(e) => break Err(SidecarError::Io(e)),
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            self.accept_line(consumer, trimmed);
        };

        let cancelled = self.supervisor.streams().cancel_consumer(consumer);
        self.hub.disconnect(consumer);
        tracing::info!(consumer = consumer.0, cancelled, "consumer disconnected");
        let _ = writer_task.await;
        read_result
    }

    fn accept_line(self: &Arc<Self>, consumer: ConsumerId, line: &str) {
        let request: IpcRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("invalid ipc request: {}", e);
                self.hub.send(
                    consumer,
                    IpcMessage::reply(
                        Value::Null,
                        Err(SidecarError::InvalidParams(format!("Invalid request: {e}"))),
                    ),
                );
                return;
            }
        };

        if let Some(outcome) = self.handle_stream_op(consumer, &request.method, &request.params) {
            self.respond(consumer, &request.method, request.id, outcome);
            return;
        }

        let gateway = self.clone();
        tokio::spawn(async move {
            let outcome = gateway
                .dispatch(consumer, &request.method, request.params)
                .await;
            gateway.respond(consumer, &request.method, request.id, outcome);
        });
    }

    fn respond(&self, consumer: ConsumerId, method: &str, id: Option<Value>, outcome: Result<Value>) {
        match id {
            Some(id) => {
                self.hub.send(consumer, IpcMessage::reply(id, outcome));
            }
            None => {
                if let Err(e) = outcome {
                    tracing::warn!(method, "ipc notification failed: {}", e);
                }
            }
        }
    }
}
