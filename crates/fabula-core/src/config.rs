use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

// Operation timeouts (milliseconds). End-to-end command handling gets 30 s;
// anything slower is surfaced as degraded rather than left hanging.
pub const TRANSPORT_PUBLISH_TIMEOUT_MS: u64 = 5_000;
pub const STORE_WRITE_TIMEOUT_MS: u64 = 10_000;
pub const STORE_READ_TIMEOUT_MS: u64 = 5_000;
pub const COMMAND_TIMEOUT_MS: u64 = 30_000;

/// Top-level config (fabula.toml + FABULA_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FabulaConfig {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub docstore: DocstoreConfig,
    #[serde(default)]
    pub relational: RelationalConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub gates: GatesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Telegram transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub mode: TransportMode,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            mode: TransportMode::Polling,
            webhook_url: None,
            webhook_secret: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TransportMode {
    Webhook,
    #[default]
    Polling,
}

/// Document store (mutable state: user documents, missions, content, journal).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocstoreConfig {
    #[serde(default = "default_docstore_path")]
    pub path: String,
    #[serde(default = "default_docstore_database")]
    pub database: String,
}

impl Default for DocstoreConfig {
    fn default() -> Self {
        Self {
            path: default_docstore_path(),
            database: default_docstore_database(),
        }
    }
}

/// Relational store (profiles + subscriptions).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationalConfig {
    #[serde(default = "default_relational_path")]
    pub path: String,
}

impl Default for RelationalConfig {
    fn default() -> Self {
        Self {
            path: default_relational_path(),
        }
    }
}

/// Event bus transport + local replay queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_bus_uri")]
    pub uri: String,
    pub password: Option<String>,
    #[serde(default = "default_queue_path")]
    pub queue_path: String,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            uri: default_bus_uri(),
            password: None,
            queue_path: default_queue_path(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Admin HTTP API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_bind")]
    pub bind: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
    #[serde(default)]
    pub jwt_secret: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: default_api_bind(),
            port: default_api_port(),
            jwt_secret: String::new(),
        }
    }
}

/// Reaction gating: which channels and emojis count for missions.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GatesConfig {
    #[serde(default)]
    pub channel_ids_allowed: Vec<i64>,
    #[serde(default)]
    pub reaction_emojis_allowed: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn default_docstore_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.fabula/documents.db", home)
}
fn default_docstore_database() -> String {
    "fabula".to_string()
}
fn default_relational_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.fabula/profiles.db", home)
}
fn default_bus_uri() -> String {
    "redis://127.0.0.1:6379/".to_string()
}
fn default_queue_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.fabula/replay.jsonl", home)
}
fn default_queue_capacity() -> usize {
    1000
}
fn default_api_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_api_port() -> u16 {
    8088
}
fn default_log_level() -> String {
    "info".to_string()
}

impl FabulaConfig {
    /// Load config from a TOML file with FABULA_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.fabula/fabula.toml
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: FabulaConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("FABULA_").split("_"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.fabula/fabula.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = FabulaConfig::default();
        assert_eq!(cfg.bus.queue_capacity, 1000);
        assert_eq!(cfg.transport.mode, TransportMode::Polling);
        assert_eq!(cfg.logging.format, LogFormat::Text);
        assert!(cfg.docstore.path.ends_with("documents.db"));
        assert!(cfg.relational.path.ends_with("profiles.db"));
    }

    #[test]
    fn mode_deserializes_kebab_case() {
        let cfg: TransportConfig =
            serde_json::from_str(r#"{"token":"t","mode":"webhook"}"#).unwrap();
        assert_eq!(cfg.mode, TransportMode::Webhook);
    }
}
