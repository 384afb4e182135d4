//! Relays the sidecar's SSE chat responses to the consumer that asked.

use crate::client::build_stream_client;
use crate::config::{MISO_AUTH_HEADER, MISO_STREAM_ENDPOINT, MISO_STREAM_V2_ENDPOINT};
use crate::error::upstream_error_message;
use crate::registry::{AdmitError, ConsumerId, StreamLease, StreamTicket};
use crate::sse;
use crate::supervisor::{SidecarEndpoint, SidecarSupervisor};
use crate::workspace::validate_workspace_root;
use futures::StreamExt;
use pupu_observability::{emit_event, ObservabilityEvent, ProcessKind};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::Level;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamProtocol {
    /// `/chat/stream`: `done` and `error` events are terminal.
    V1,
    /// `/chat/stream/v2`: every event is a `frame`; the payload type decides.
    V2,
}

impl StreamProtocol {
    pub fn path(self) -> &'static str {
        match self {
            StreamProtocol::V1 => MISO_STREAM_ENDPOINT,
            StreamProtocol::V2 => MISO_STREAM_V2_ENDPOINT,
        }
    }

    fn frames(self) -> bool {
        self == StreamProtocol::V2
    }
}

#[derive(Debug)]
enum BridgeFailure {
    Cancelled,
    Upstream(String),
    Transport(String),
}

#[derive(Debug, PartialEq, Eq)]
enum BridgeEnd {
    Terminal,
    Closed,
}

/// A registered stream that has not contacted the sidecar yet.
pub struct PendingStream {
    lease: StreamLease,
    endpoint: SidecarEndpoint,
    payload: Value,
    protocol: StreamProtocol,
}

impl PendingStream {
    pub fn request_id(&self) -> &str {
        self.lease.request_id()
    }
}

pub struct StreamBridge {
    supervisor: Arc<SidecarSupervisor>,
    client: reqwest::Client,
}

impl StreamBridge {
    pub fn new(supervisor: Arc<SidecarSupervisor>) -> Self {
        Self {
            supervisor,
            client: build_stream_client(),
        }
    }

    pub fn supervisor(&self) -> &Arc<SidecarSupervisor> {
        &self.supervisor
    }

    /// Run one chat stream to completion, emitting every event to `consumer`.
    ///
    /// Exactly one terminal event (`done` or `error`) reaches the consumer for
    /// an admitted stream. Blank request ids are ignored.
    pub async fn start_stream(
        &self,
        request_id: &str,
        payload: Value,
        consumer: ConsumerId,
        protocol: StreamProtocol,
    ) {
        if let Some(pending) = self.admit(request_id, payload, consumer, protocol) {
            self.run(pending).await;
        }
    }

    /// Register a stream without doing any I/O. Rejections are emitted to
    /// `consumer` and yield `None`.
    pub fn admit(
        &self,
        request_id: &str,
        payload: Value,
        consumer: ConsumerId,
        protocol: StreamProtocol,
    ) -> Option<PendingStream> {
        if request_id.trim().is_empty() {
            tracing::debug!("ignoring stream start without request id");
            return None;
        }
        let registry = self.supervisor.streams();

        if !self.supervisor.is_ready() {
            registry.reject(
                consumer,
                request_id,
                "miso_not_ready",
                "Miso service is not ready",
            );
            return None;
        }

        match self.supervisor.admit_stream(request_id, consumer) {
            Ok((lease, endpoint)) => Some(PendingStream {
                lease,
                endpoint,
                payload,
                protocol,
            }),
            Err(AdmitError::Duplicate) => {
                registry.reject(
                    consumer,
                    request_id,
                    "duplicate_request",
                    "Request is already active",
                );
                None
            }
            Err(AdmitError::Closed) => {
                registry.reject(
                    consumer,
                    request_id,
                    "miso_not_ready",
                    "Miso service is not ready",
                );
                None
            }
        }
    }

    /// Drive an admitted stream. The registry entry is released when this
    /// returns or the future is dropped.
    pub async fn run(&self, pending: PendingStream) {
        let PendingStream {
            lease,
            endpoint,
            payload,
            protocol,
        } = pending;
        let request_id = lease.request_id().to_string();

        // workspace validation touches the filesystem
        let prepared = tokio::select! {
            biased;
            _ = lease.cancelled() => None,
            prepared = tokio::task::spawn_blocking(move || prepare_request_payload(payload)) => {
                Some(prepared)
            }
        };
        let body = match prepared {
            None => {
                lease.finish("done", json!({ "cancelled": true }));
                return;
            }
            Some(Ok(Ok(body))) => body,
            Some(Ok(Err(reason))) => {
                stream_event(
                    Level::WARN,
                    "stream.rejected",
                    &request_id,
                    Some("invalid_workspace_root"),
                    Some(reason.as_str()),
                );
                lease.finish(
                    "error",
                    json!({ "code": "invalid_workspace_root", "message": reason }),
                );
                return;
            }
            Some(Err(e)) => {
                let message = format!("request preparation failed: {e}");
                lease.finish(
                    "error",
                    json!({ "code": "stream_bridge_failed", "message": message }),
                );
                return;
            }
        };
        stream_event(Level::INFO, "stream.start", &request_id, None, None);

        let url = format!("{}{}", endpoint.base_url, protocol.path());
        let outcome = tokio::select! {
            biased;
            _ = lease.cancelled() => Err(BridgeFailure::Cancelled),
            result = self.pump(&lease, &url, &endpoint.auth_token, &body, protocol) => result,
        };

        match outcome {
            Ok(BridgeEnd::Terminal) => {}
            Ok(BridgeEnd::Closed) if lease.is_cancelled() => {
                lease.finish("done", json!({ "cancelled": true }));
            }
            Ok(BridgeEnd::Closed) => {
                lease.finish(
                    "done",
                    json!({ "cancelled": false, "reason": "stream_closed" }),
                );
            }
            Err(BridgeFailure::Cancelled) => {
                lease.finish("done", json!({ "cancelled": true }));
            }
            Err(BridgeFailure::Upstream(message)) => {
                stream_event(
                    Level::WARN,
                    "stream.upstream_error",
                    &request_id,
                    Some("upstream_http_error"),
                    Some(message.as_str()),
                );
                lease.finish(
                    "error",
                    json!({ "code": "upstream_http_error", "message": message }),
                );
            }
            Err(BridgeFailure::Transport(_)) if lease.is_cancelled() => {
                lease.finish("done", json!({ "cancelled": true }));
            }
            Err(BridgeFailure::Transport(message)) => {
                stream_event(
                    Level::WARN,
                    "stream.bridge_failed",
                    &request_id,
                    Some("stream_bridge_failed"),
                    Some(message.as_str()),
                );
                lease.finish(
                    "error",
                    json!({ "code": "stream_bridge_failed", "message": message }),
                );
            }
        }
        stream_event(Level::DEBUG, "stream.end", &request_id, None, None);
    }

    /// Cancel an active stream. False when `request_id` is not active.
    pub fn cancel_stream(&self, request_id: &str) -> bool {
        self.supervisor.streams().cancel(request_id)
    }

    /// End every active stream with `event`/`data`.
    pub fn terminate_all(&self, event: &str, data: Value) -> usize {
        self.supervisor.streams().terminate_all(event, data)
    }

    async fn pump(
        &self,
        ticket: &StreamTicket,
        url: &str,
        token: &str,
        body: &Value,
        protocol: StreamProtocol,
    ) -> Result<BridgeEnd, BridgeFailure> {
        let response = self
            .client
            .post(url)
            .header(MISO_AUTH_HEADER, token)
            .json(body)
            .send()
            .await
            .map_err(|e| BridgeFailure::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let fallback = format!("Miso stream request failed ({})", status.as_u16());
            return Err(BridgeFailure::Upstream(upstream_error_message(
                &text, fallback,
            )));
        }

        let events = sse::event_stream(response);
        futures::pin_mut!(events);
        while let Some(item) = events.next().await {
            let event = item.map_err(|e| BridgeFailure::Transport(e.to_string()))?;
            if event.is_terminal(protocol.frames()) {
                ticket.finish(&event.event, event.data);
                return Ok(BridgeEnd::Terminal);
            }
            ticket.forward(&event.event, event.data);
        }
        Ok(BridgeEnd::Closed)
    }
}

/// Normalise a chat payload: always an object with an `options` object, and
/// a workspace root (either spelling) replaced by its resolved absolute path.
/// Err carries the rejection reason.
pub fn prepare_request_payload(payload: Value) -> Result<Value, String> {
    let mut request = match payload {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    let mut options = match request.get("options") {
        Some(Value::Object(options)) => options.clone(),
        _ => Map::new(),
    };

    let candidate = ["workspaceRoot", "workspace_root"]
        .iter()
        .find_map(|key| {
            options
                .get(*key)
                .and_then(Value::as_str)
                .filter(|s| !s.trim().is_empty())
        })
        .map(str::to_string);

    if let Some(candidate) = candidate {
        let validation = validate_workspace_root(&candidate, false);
        if !validation.valid {
            let reason = if validation.reason.is_empty() {
                "Invalid workspace root".to_string()
            } else {
                validation.reason
            };
            return Err(reason);
        }
        options.insert(
            "workspaceRoot".to_string(),
            Value::String(validation.resolved_path.clone()),
        );
        options.insert(
            "workspace_root".to_string(),
            Value::String(validation.resolved_path),
        );
    }

    request.insert("options".to_string(), Value::Object(options));
    Ok(Value::Object(request))
}

fn stream_event(
    level: Level,
    event: &str,
    request_id: &str,
    error_code: Option<&str>,
    detail: Option<&str>,
) {
    emit_event(
        level,
        ProcessKind::Host,
        ObservabilityEvent {
            event,
            component: "stream_bridge",
            service: Some("miso"),
            request_id: Some(request_id),
            error_code,
            detail,
            ..Default::default()
        },
    );
}
