use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8787";
pub const DEFAULT_DEDUP_CACHE_SIZE: usize = 64_000;
pub const DEFAULT_DEDUP_CACHE_TTL: u64 = 30;

/// The persisted configuration document. Unknown fields are ignored and
/// missing fields fall back to the defaults, so hand-edited files stay
/// loadable across versions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub interface: String,
    pub listen_addr: String,
    pub peers: Vec<String>,
    pub tls_cert_path: String,
    pub tls_key_path: String,
    pub tls_ca_path: String,
    pub insecure_no_verify: bool,
    pub disable_ssl: bool,
    pub http_listen_addr: String,
    pub enable_http: bool,
    pub log_level: String,
    pub dedup_cache_size: usize,
    pub dedup_cache_ttl: u64,
    pub sort_field: String,
    pub sort_reverse: bool,
    pub banned_hosts: Vec<String>,
    pub banned_ids: Vec<String>,
    pub admin_user: String,
    pub admin_pass: String,
    pub max_children: usize,
    pub network_key: String,
    pub rebalance_enabled: bool,
    pub rebalance_interval: u64,
    pub jwt_secret: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interface: String::new(),
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            peers: Vec::new(),
            tls_cert_path: String::new(),
            tls_key_path: String::new(),
            tls_ca_path: String::new(),
            insecure_no_verify: false,
            disable_ssl: false,
            http_listen_addr: "0.0.0.0:8080".to_string(),
            enable_http: true,
            log_level: "info".to_string(),
            dedup_cache_size: DEFAULT_DEDUP_CACHE_SIZE,
            dedup_cache_ttl: DEFAULT_DEDUP_CACHE_TTL,
            sort_field: "id".to_string(),
            sort_reverse: false,
            banned_hosts: Vec::new(),
            banned_ids: Vec::new(),
            admin_user: "admin".to_string(),
            admin_pass: "admin".to_string(),
            max_children: 5,
            network_key: String::new(),
            rebalance_enabled: false,
            rebalance_interval: 300,
            jwt_secret: String::new(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let cfg: Config = serde_json::from_str(&content)?;
        Ok(cfg)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("dedup cache capacity must be positive")]
    InvalidDedupCapacity,
    #[error("TLS is enabled but tls_cert_path/tls_key_path are not set")]
    MissingTlsMaterial,
}
