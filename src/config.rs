use crate::error::{MailError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub communication: CommunicationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub thread_pool: ThreadPoolConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// FQDN identity, used as the local mail domain and in outbound HELO.
    pub name: String,
    /// Name shown in the 220 banner.
    pub display_name: String,
    pub listener_port: u16,
    pub ip_address: String,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CommunicationConfig {
    /// Idle timeout between reads, in seconds.
    pub socket_timeout: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub filename: Option<String>,
    pub log_level: String,
    pub flush: u8,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ThreadPoolConfig {
    pub max_working_threads: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Opaque URL handed to the database driver.
    pub database_url: String,
    pub pool_size: usize,
    /// When true, insert_mail goes through the write-behind writer.
    pub write_behind: bool,
    pub write_queue_size: usize,
    pub flush_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "localhost".to_string(),
            display_name: "DefaultServerDisplayName".to_string(),
            listener_port: 25000,
            ip_address: "127.0.0.1".to_string(),
            tls_cert_path: None,
            tls_key_path: None,
        }
    }
}

impl Default for CommunicationConfig {
    fn default() -> Self {
        Self { socket_timeout: 30 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filename: None,
            log_level: "info".to_string(),
            flush: 0,
        }
    }
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            max_working_threads: 10,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://mail.db?mode=rwc".to_string(),
            pool_size: 10,
            write_behind: false,
            write_queue_size: 100,
            flush_interval_ms: 2000,
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| MailError::Config(e.to_string()))?;

        serde_json::from_str(&content).map_err(|e| MailError::Config(e.to_string()))
    }

    /// Socket address string for the listener.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.ip_address, self.server.listener_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.listener_port, 25000);
        assert_eq!(config.server.display_name, "DefaultServerDisplayName");
        assert_eq!(config.communication.socket_timeout, 30);
        assert_eq!(config.thread_pool.max_working_threads, 10);
        assert_eq!(config.storage.pool_size, 10);
    }

    #[test]
    fn test_parse_partial_json() {
        let json = r#"{
            "server": { "name": "mail.example.com", "listener_port": 2525 },
            "communication": { "socket_timeout": 5 }
        }"#;

        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.server.name, "mail.example.com");
        assert_eq!(config.server.listener_port, 2525);
        // Missing keys fall back to defaults
        assert_eq!(config.server.ip_address, "127.0.0.1");
        assert_eq!(config.communication.socket_timeout, 5);
        assert_eq!(config.logging.log_level, "info");
    }

    #[test]
    fn test_listen_addr() {
        let config = Config::default();
        assert_eq!(config.listen_addr(), "127.0.0.1:25000");
    }
}
