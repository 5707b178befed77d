use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_listen_addr() -> SocketAddr {
    "127.0.0.1:8089".parse().unwrap()
}

fn default_true() -> bool {
    true
}

fn default_pg_max_connections() -> u32 {
    10
}

fn default_outbox_batch_size() -> usize {
    50
}

fn default_outbox_poll_interval_secs() -> u64 {
    2
}

fn default_outbox_max_backoff_secs() -> i64 {
    300
}

fn default_health_probe_interval_secs() -> u64 {
    15
}

fn default_health_startup_deadline_secs() -> u64 {
    60
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_hybrid_alpha() -> f32 {
    0.5
}

fn default_max_context_chars() -> usize {
    200_000
}

fn default_default_context_document() -> String {
    "New memory created. No context yet.".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Which `Store` backend to construct (§10.2): in-memory or Postgres.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageConfig {
    Memory,
    Postgres {
        database_url: String,
        #[serde(default = "default_pg_max_connections")]
        max_connections: u32,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory
    }
}

/// Which `SearchIndex`/`Embedder` backend to construct. `Mock` never makes a
/// network call; `Http` talks to the real external services.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum CollaboratorConfig {
    Mock,
    Http { base_url: String },
}

impl Default for CollaboratorConfig {
    fn default() -> Self {
        CollaboratorConfig::Mock
    }
}

/// Server-level knobs (§10.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_true")]
    pub enable_outbox_worker: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            enable_outbox_worker: true,
        }
    }
}

/// Outbox worker knobs (§4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxWorkerConfig {
    #[serde(default = "default_outbox_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_outbox_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_outbox_max_backoff_secs")]
    pub max_backoff_secs: i64,
}

impl Default for OutboxWorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_outbox_batch_size(),
            poll_interval_secs: default_outbox_poll_interval_secs(),
            max_backoff_secs: default_outbox_max_backoff_secs(),
        }
    }
}

impl OutboxWorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Health aggregator knobs (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_probe_interval_secs")]
    pub probe_interval_secs: u64,
    #[serde(default = "default_health_startup_deadline_secs")]
    pub startup_deadline_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: default_health_probe_interval_secs(),
            startup_deadline_secs: default_health_startup_deadline_secs(),
        }
    }
}

impl HealthConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn startup_deadline(&self) -> Duration {
        Duration::from_secs(self.startup_deadline_secs)
    }
}

/// Use-case knobs passed through to `MemoryServiceConfig` (§4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainConfig {
    #[serde(default = "default_default_context_document")]
    pub default_context_document: String,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    #[serde(default = "default_hybrid_alpha")]
    pub hybrid_alpha: f32,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            default_context_document: default_default_context_document(),
            max_context_chars: default_max_context_chars(),
            hybrid_alpha: default_hybrid_alpha(),
        }
    }
}

/// Logging knobs (§10.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Full process configuration, assembled in `main` from CLI flags and env
/// vars and threaded through to every component.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub search_index: CollaboratorConfig,
    #[serde(default)]
    pub embedder: CollaboratorConfig,
    #[serde(default)]
    pub outbox_worker: OutboxWorkerConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub domain: DomainConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default = "default_request_timeout_secs")]
    pub http_request_timeout_secs: u64,
}

impl Config {
    pub fn http_request_timeout(&self) -> Duration {
        Duration::from_secs(self.http_request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_use_in_memory_backends() {
        let config = Config::default();
        assert!(matches!(config.storage, StorageConfig::Memory));
        assert!(matches!(config.search_index, CollaboratorConfig::Mock));
        assert!(matches!(config.embedder, CollaboratorConfig::Mock));
        assert_eq!(config.outbox_worker.batch_size, 50);
    }
}
