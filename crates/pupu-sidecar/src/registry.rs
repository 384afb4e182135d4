//! Active stream bookkeeping: one entry per request id, scoped to the
//! sidecar's ready window.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Identifies the UI connection a stream reports to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConsumerId(pub u64);

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    pub request_id: String,
    pub event: String,
    pub data: Value,
}

/// Delivery of stream events to consumers. Must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, consumer: ConsumerId, event: StreamEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AdmitError {
    #[error("Miso service is not ready")]
    Closed,
    #[error("Request is already active")]
    Duplicate,
}

pub struct StreamTicket {
    id: u64,
    request_id: String,
    consumer: ConsumerId,
    cancel: CancellationToken,
    // true once a terminal event went out; held while emitting
    finished: Mutex<bool>,
    sink: Arc<dyn EventSink>,
}

impl StreamTicket {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn consumer(&self) -> ConsumerId {
        self.consumer
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_finished(&self) -> bool {
        *self.finished.lock()
    }

    /// Emit a non-terminal event. Dropped once cancelled or finished.
    pub fn forward(&self, event: &str, data: Value) -> bool {
        let finished = self.finished.lock();
        if *finished || self.cancel.is_cancelled() {
            return false;
        }
        self.sink.emit(self.consumer, self.event(event, data));
        true
    }

    /// Emit the terminal event. Only the first call per stream goes out.
    pub fn finish(&self, event: &str, data: Value) -> bool {
        let mut finished = self.finished.lock();
        if *finished {
            return false;
        }
        *finished = true;
        self.sink.emit(self.consumer, self.event(event, data));
        true
    }

    fn event(&self, event: &str, data: Value) -> StreamEvent {
        StreamEvent {
            request_id: self.request_id.clone(),
            event: event.to_string(),
            data,
        }
    }
}

/// Removes the registry entry when dropped, whatever ended the stream.
pub struct StreamLease {
    registry: Arc<StreamRegistry>,
    ticket: Arc<StreamTicket>,
}

impl Deref for StreamLease {
    type Target = StreamTicket;

    fn deref(&self) -> &StreamTicket {
        &self.ticket
    }
}

impl Drop for StreamLease {
    fn drop(&mut self) {
        self.registry.release(&self.ticket);
    }
}

struct RegistryState {
    accepting: bool,
    next_id: u64,
    entries: HashMap<String, Arc<StreamTicket>>,
}

pub struct StreamRegistry {
    sink: Arc<dyn EventSink>,
    state: Mutex<RegistryState>,
}

impl StreamRegistry {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink,
            state: Mutex::new(RegistryState {
                accepting: false,
                next_id: 0,
                entries: HashMap::new(),
            }),
        }
    }

    /// Start admitting streams.
    pub fn open(&self) {
        self.state.lock().accepting = true;
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().accepting
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.state.lock().entries.contains_key(request_id)
    }

    pub fn admit(
        self: &Arc<Self>,
        request_id: &str,
        consumer: ConsumerId,
    ) -> Result<StreamLease, AdmitError> {
        let mut state = self.state.lock();
        if !state.accepting {
            return Err(AdmitError::Closed);
        }
        if state.entries.contains_key(request_id) {
            return Err(AdmitError::Duplicate);
        }
        state.next_id += 1;
        let ticket = Arc::new(StreamTicket {
            id: state.next_id,
            request_id: request_id.to_string(),
            consumer,
            cancel: CancellationToken::new(),
            finished: Mutex::new(false),
            sink: self.sink.clone(),
        });
        state
            .entries
            .insert(request_id.to_string(), ticket.clone());
        Ok(StreamLease {
            registry: self.clone(),
            ticket,
        })
    }

    /// Drop the entry for `ticket` if it is still the registered one.
    pub fn release(&self, ticket: &StreamTicket) -> bool {
        let mut state = self.state.lock();
        match state.entries.get(&ticket.request_id) {
            Some(current) if current.id == ticket.id => {
                state.entries.remove(&ticket.request_id);
                true
            }
            _ => false,
        }
    }

    /// Cancel one stream; its consumer gets `done {cancelled: true}`.
    pub fn cancel(&self, request_id: &str) -> bool {
        let ticket = self.state.lock().entries.get(request_id).cloned();
        let Some(ticket) = ticket else {
            return false;
        };
        ticket.finish("done", json!({ "cancelled": true }));
        ticket.cancel.cancel();
        true
    }

    /// Silently cancel every stream of a consumer that went away.
    pub fn cancel_consumer(&self, consumer: ConsumerId) -> usize {
        let tickets: Vec<_> = self
            .state
            .lock()
            .entries
            .values()
            .filter(|t| t.consumer == consumer)
            .cloned()
            .collect();
        for ticket in &tickets {
            ticket.cancel.cancel();
        }
        tickets.len()
    }

    /// Stop admitting, then cancel and finish every active stream with
    /// `event`/`data`. Returns how many streams were terminated.
    pub fn terminate_all(&self, event: &str, data: Value) -> usize {
        let drained: Vec<Arc<StreamTicket>> = {
            let mut state = self.state.lock();
            state.accepting = false;
            state.entries.drain().map(|(_, ticket)| ticket).collect()
        };
        for ticket in &drained {
            // finish first so the bridge task cannot race in its own terminal
            ticket.finish(event, data.clone());
            ticket.cancel.cancel();
        }
        drained.len()
    }

    /// Error event for a request that never got an entry.
    pub fn reject(&self, consumer: ConsumerId, request_id: &str, code: &str, message: &str) {
        self.sink.emit(
            consumer,
            StreamEvent {
                request_id: request_id.to_string(),
                event: "error".to_string(),
                data: json!({ "code": code, "message": message }),
            },
        );
    }
}
