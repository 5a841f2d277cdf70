//! Connection configuration.

use serde::Deserialize;

/// Default pull size for the async COPY reader.
pub const DEFAULT_COPY_CHUNK_SIZE: usize = 16 * 1024;

/// Per-connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Connection string, handed verbatim to the connector
    pub conninfo: String,
    /// Name prefix for the connection's worker threads
    pub worker_name: String,
    /// Bytes requested per egress pull by the async COPY reader
    pub copy_chunk_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            conninfo: String::new(),
            worker_name: "pgbridge-worker".to_string(),
            copy_chunk_size: DEFAULT_COPY_CHUNK_SIZE,
        }
    }
}

impl ConnectionConfig {
    /// Create a configuration for the given connection string.
    pub fn new(conninfo: &str) -> Self {
        Self {
            conninfo: conninfo.to_string(),
            ..Self::default()
        }
    }

    /// Set the worker thread name prefix.
    pub fn worker_name(mut self, name: &str) -> Self {
        self.worker_name = name.to_string();
        self
    }

    /// Set the egress pull size used by the async COPY reader.
    pub fn copy_chunk_size(mut self, size: usize) -> Self {
        self.copy_chunk_size = size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = ConnectionConfig::new("host=/tmp dbname=test")
            .worker_name("db")
            .copy_chunk_size(512);
        assert_eq!(config.conninfo, "host=/tmp dbname=test");
        assert_eq!(config.worker_name, "db");
        assert_eq!(config.copy_chunk_size, 512);
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let config: ConnectionConfig =
            serde_json::from_str(r#"{"conninfo": "dbname=app"}"#).unwrap();
        assert_eq!(config.conninfo, "dbname=app");
        assert_eq!(config.worker_name, "pgbridge-worker");
        assert_eq!(config.copy_chunk_size, DEFAULT_COPY_CHUNK_SIZE);
    }
}
