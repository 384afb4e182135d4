// PuPu sidecar error types
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SidecarError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{0}")]
    NotReady(String),

    #[error("{0}")]
    Timeout(String),

    #[error("{message}")]
    Upstream { status: u16, message: String },

    #[error("{0}")]
    InvalidResponse(String),

    #[error("Sidecar error: {0}")]
    Sidecar(String),

    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),
}

impl SidecarError {
    pub fn not_ready() -> Self {
        SidecarError::NotReady("Miso service is not ready".to_string())
    }
}

// IPC replies carry errors as plain strings.
impl serde::Serialize for SidecarError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SidecarError>;

/// Pick the most useful message out of a failed sidecar response body.
///
/// JSON bodies contribute `error.message`, then `message`; anything that is not
/// JSON is truncated to its first 200 characters. Falls back to `fallback`.
pub fn upstream_error_message(body: &str, fallback: String) -> String {
    if body.is_empty() {
        return fallback;
    }
    match serde_json::from_str::<Value>(body) {
        Ok(parsed) => parsed
            .get("error")
            .and_then(|err| err.get("message"))
            .and_then(message_text)
            .or_else(|| parsed.get("message").and_then(message_text))
            .unwrap_or(fallback),
        Err(_) => body.chars().take(200).collect(),
    }
}

fn message_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) if n.as_f64() != Some(0.0) => Some(n.to_string()),
        Value::Bool(true) => Some("true".to_string()),
        Value::Array(_) | Value::Object(_) => Some(value.to_string()),
        _ => None,
    }
}
