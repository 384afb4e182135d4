use crate::error::{Result, SidecarError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const MISO_HOST: &str = "127.0.0.1";
pub const MISO_AUTH_HEADER: &str = "x-miso-auth";
pub const MISO_HEALTH_ENDPOINT: &str = "/health";
pub const MISO_STREAM_ENDPOINT: &str = "/chat/stream";
pub const MISO_STREAM_V2_ENDPOINT: &str = "/chat/stream/v2";
pub const MISO_MODELS_CATALOG_ENDPOINT: &str = "/models/catalog";
pub const MISO_TOOLKITS_CATALOG_ENDPOINT: &str = "/toolkits/catalog";

/// Lifecycle knobs for the Miso supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub host: String,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub boot_timeout_ms: u64,
    pub health_retry_ms: u64,
    pub restart_delay_ms: u64,
    pub kill_grace_ms: u64,
    /// Lines of child stdout/stderr kept in memory.
    pub log_ring_lines: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            host: MISO_HOST.to_string(),
            port_range_start: 5879,
            port_range_end: 5895,
            boot_timeout_ms: 10_000,
            health_retry_ms: 250,
            restart_delay_ms: 1_500,
            kill_grace_ms: 1_200,
            log_ring_lines: 2_000,
        }
    }
}

impl SupervisorConfig {
    pub fn boot_timeout(&self) -> Duration {
        Duration::from_millis(self.boot_timeout_ms)
    }

    pub fn health_retry(&self) -> Duration {
        Duration::from_millis(self.health_retry_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.port_range_start == 0 || self.port_range_start > self.port_range_end {
            return Err(SidecarError::InvalidConfig(format!(
                "port range {}..={} is empty",
                self.port_range_start, self.port_range_end
            )));
        }
        if self.health_retry_ms == 0 {
            return Err(SidecarError::InvalidConfig(
                "health_retry_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Where to look for the Miso server and what to hand it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    pub app_path: PathBuf,
    pub resources_path: PathBuf,
    pub packaged: bool,
    /// Interpreter override; wins over every detected candidate.
    pub python_bin: Option<String>,
    pub source_path: Option<PathBuf>,
    pub provider: String,
    pub model: String,
    pub required_module: String,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            app_path: cwd.clone(),
            resources_path: cwd,
            packaged: false,
            python_bin: None,
            source_path: None,
            provider: "ollama".to_string(),
            model: "deepseek-r1:14b".to_string(),
            required_module: "flask".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    pub url: String,
    pub command: String,
    pub args: Vec<String>,
    pub ping_timeout_ms: u64,
    pub settle_delay_ms: u64,
    pub kill_grace_ms: u64,
    /// Public model library search page.
    pub library_url: String,
    pub library_timeout_ms: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:11434".to_string(),
            command: "ollama".to_string(),
            args: vec!["serve".to_string()],
            ping_timeout_ms: 2_000,
            settle_delay_ms: 1_500,
            kill_grace_ms: 1_200,
            library_url: "https://ollama.com/search".to_string(),
            library_timeout_ms: 12_000,
        }
    }
}

impl OllamaConfig {
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn library_timeout(&self) -> Duration {
        Duration::from_millis(self.library_timeout_ms)
    }
}

/// Everything the host binary needs, loaded from an optional JSON file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub supervisor: SupervisorConfig,
    pub launch: LaunchConfig,
    pub ollama: OllamaConfig,
    pub logs_dir: Option<PathBuf>,
    pub log_retention_days: Option<u64>,
}

impl HostConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)?;
        let config: HostConfig = serde_json::from_str(&raw)?;
        config.supervisor.validate()?;
        Ok(config)
    }

    /// Apply `MISO_*` overrides. `lookup` is usually `std::env::var(..).ok()`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(bin) = non_empty("MISO_PYTHON_BIN") {
            self.launch.python_bin = Some(bin.trim().to_string());
        }
        if let Some(source) = non_empty("MISO_SOURCE_PATH") {
            self.launch.source_path = Some(PathBuf::from(source.trim()));
        }
        if let Some(provider) = non_empty("MISO_PROVIDER") {
            self.launch.provider = provider;
        }
        if let Some(model) = non_empty("MISO_MODEL") {
            self.launch.model = model;
        }
    }

    pub fn log_retention_days(&self) -> u64 {
        self.log_retention_days.unwrap_or(14)
    }
}
