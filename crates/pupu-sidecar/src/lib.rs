pub mod bridge;
pub mod catalog;
pub mod client;
pub mod config;
pub mod error;
pub mod gateway;
pub mod health;
pub mod launcher;
pub mod logs;
pub mod ollama;
pub mod port;
pub mod process;
pub mod registry;
pub mod runtime_dir;
pub mod sse;
pub mod supervisor;
pub mod workspace;

pub use bridge::{prepare_request_payload, StreamBridge, StreamProtocol};
pub use catalog::{fetch_catalog, CatalogKind};
pub use config::{HostConfig, LaunchConfig, OllamaConfig, SupervisorConfig};
pub use error::{Result, SidecarError};
pub use gateway::{ConsumerHub, IpcGateway, IpcMessage, IpcRequest, STREAM_EVENT_CHANNEL};
pub use launcher::{Entrypoint, EntrypointKind, EntrypointResolver, Launcher};
pub use logs::{LogRingBuffer, LogStream, RingLine};
pub use ollama::{OllamaAutoStarter, OllamaStatus};
pub use registry::{ConsumerId, EventSink, StreamEvent, StreamRegistry};
pub use supervisor::{SidecarEndpoint, SidecarState, SidecarStatus, SidecarSupervisor};
pub use workspace::{validate_workspace_root, WorkspaceValidation};
