use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::warn;

use crate::supervisor::ServiceDescriptor;

/// Default settings for the sidecar this application depends on.
///
/// Values come from the compiled-in defaults, each overridable through an
/// `OUTRIDER_*` environment variable. The calling layer owns where these
/// settings are persisted; this is only the lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SidecarConfig {
    /// Port the sidecar listens on; exported to it as PORT
    pub port: u16,

    /// Base URL callers use to reach the sidecar
    pub base_url: String,

    /// Path probed for readiness; any 2xx means healthy
    pub health_path: String,

    /// Shell command that starts the sidecar
    pub start_cmd: String,

    /// Budget for the whole start attempt in milliseconds
    pub start_timeout_ms: u64,

    /// Interval between health probes in milliseconds
    pub poll_interval_ms: u64,

    /// Per-probe request timeout in milliseconds
    pub probe_timeout_ms: u64,

    /// Cap on each process output buffer in bytes
    pub buffer_cap: usize,

    /// How long a buffer outlives its process, in milliseconds
    pub buffer_grace_ms: u64,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            port: 4100,
            base_url: "http://127.0.0.1:4100".to_string(),
            health_path: "/".to_string(),
            start_cmd: String::new(),
            start_timeout_ms: 12_000,
            poll_interval_ms: 300,
            probe_timeout_ms: 800,
            buffer_cap: 1024 * 1024, // 1MB of trailing output per process
            buffer_grace_ms: 10_000,
        }
    }
}

impl SidecarConfig {
    /// Defaults with any `OUTRIDER_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(port) = env_parsed::<u16>("OUTRIDER_PORT") {
            config.port = port;
            config.base_url = format!("http://127.0.0.1:{}", port);
        }
        if let Ok(url) = std::env::var("OUTRIDER_BASE_URL") {
            config.base_url = url;
        }
        if let Ok(path) = std::env::var("OUTRIDER_HEALTH_PATH") {
            config.health_path = path;
        }
        if let Ok(cmd) = std::env::var("OUTRIDER_START_CMD") {
            config.start_cmd = cmd;
        }
        if let Some(ms) = env_parsed::<u64>("OUTRIDER_START_TIMEOUT_MS") {
            config.start_timeout_ms = ms;
        }
        if let Some(ms) = env_parsed::<u64>("OUTRIDER_POLL_INTERVAL_MS") {
            config.poll_interval_ms = ms;
        }
        if let Some(ms) = env_parsed::<u64>("OUTRIDER_PROBE_TIMEOUT_MS") {
            config.probe_timeout_ms = ms;
        }
        if let Some(cap) = env_parsed::<usize>("OUTRIDER_BUFFER_CAP") {
            config.buffer_cap = cap;
        }
        if let Some(ms) = env_parsed::<u64>("OUTRIDER_BUFFER_GRACE_MS") {
            config.buffer_grace_ms = ms;
        }
        config
    }

    /// Load from a JSON settings file, falling back to from_env() when
    /// the file is missing or unreadable.
    pub fn load(path: &std::path::Path) -> Self {
        if let Ok(contents) = std::fs::read_to_string(path) {
            match serde_json::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded sidecar config from {:?}", path);
                    return config;
                }
                Err(e) => warn!("Ignoring malformed config {:?}: {}", path, e),
            }
        }
        Self::from_env()
    }

    /// Descriptor for the named service using these defaults.
    pub fn descriptor(&self, name: &str) -> ServiceDescriptor {
        ServiceDescriptor {
            name: name.to_string(),
            port: self.port,
            base_url: self.base_url.clone(),
            health_path: self.health_path.clone(),
            start_cmd: self.start_cmd.clone(),
            cwd: None,
            env: Default::default(),
            start_timeout: std::time::Duration::from_millis(self.start_timeout_ms),
        }
    }
}

fn env_parsed<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring unparseable {}={:?}", key, raw);
            None
        }
    }
}
