use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
pub struct VigilConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Single-process only; state is lost on exit.
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default = "default_message_ttl")]
    pub message_ttl_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            message_ttl_secs: default_message_ttl(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct NotifierConfig {
    /// Frames buffered per observer before it is dropped as unresponsive.
    #[serde(default = "default_buffer")]
    pub buffer: usize,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            buffer: default_buffer(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Deserialize, Default)]
pub struct LogConfig {
    #[serde(default)]
    pub format: LogFormat,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_message_ttl() -> u64 {
    24 * 60 * 60
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_buffer() -> usize {
    vigil_gateway::DEFAULT_BUFFER
}

impl VigilConfig {
    /// Read `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read config file '{}': {e}", path.display())
        })?;
        Ok(toml::from_str(&raw)?)
    }

    /// Apply `REDIS_URL`, `VIGIL_HOST` and `VIGIL_PORT`. Setting `REDIS_URL`
    /// also selects the Redis backend.
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("REDIS_URL") {
            self.store.redis_url = url;
            self.store.backend = StoreBackend::Redis;
        }
        if let Some(host) = lookup("VIGIL_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("VIGIL_PORT") {
            self.server.port = port
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid VIGIL_PORT '{port}': {e}"))?;
        }
        Ok(())
    }
}
