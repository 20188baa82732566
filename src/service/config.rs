use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{WireError, WireResult};

/// Transport-facing settings for listeners and dialers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    /// Upper bound on concurrently open connections accepted by a listener.
    pub max_connections: usize,
    /// Size of the per-connection socket read staging buffer.
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    /// Dial timeout in milliseconds; 0 disables the timeout.
    pub connect_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            ip: "127.0.0.1".to_string(),
            port: 9090,
            max_connections: 1024,
            read_buffer_size: 16 * 1024,
            write_buffer_size: 16 * 1024,
            connect_timeout_ms: 0,
        }
    }
}

/// Per-session queueing and ordering defaults, applied to every new session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub orderly_read: bool,
    pub orderly_write: bool,
    /// Max frames waiting in the incoming queue; 0 means unbounded.
    pub max_read_queue: usize,
    /// Max frames waiting in the outgoing queue; 0 means unbounded.
    pub max_write_queue: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            orderly_read: false,
            orderly_write: false,
            max_read_queue: 1024,
            max_write_queue: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferPoolConfig {
    /// Buffers preallocated at pool construction.
    pub initial_buffers: usize,
    /// Allocation granularity; requests round up to a multiple of this.
    pub chunk_size: usize,
    /// Hard cap on a single buffer; larger requests fail.
    pub max_buffer_size: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        BufferPoolConfig {
            initial_buffers: 0,
            chunk_size: 2048,
            max_buffer_size: 256 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Workers created up front; 0 picks the number of CPU cores.
    pub min_workers: usize,
    /// Growth ceiling; 0 picks twice the number of CPU cores.
    pub max_workers: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub network: NetworkConfig,
    pub session: SessionConfig,
    pub buffer_pool: BufferPoolConfig,
    pub worker_pool: WorkerPoolConfig,
}

impl EngineConfig {
    /// Load a config file (TOML/YAML/JSON, resolved by extension).
    pub fn from_file<P: AsRef<Path>>(path: P) -> WireResult<EngineConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or_else(|| WireError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;

        let engine_config: EngineConfig = config.try_deserialize()?;

        Ok(engine_config)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_are_usable() {
        let config = EngineConfig::default();
        assert_eq!(config.session.max_read_queue, 1024);
        assert_eq!(config.session.max_write_queue, 0);
        assert_eq!(config.buffer_pool.chunk_size, 2048);
        assert!(!config.session.orderly_read);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "[network]\nport = 7000\n\n[session]\norderly_read = true\nmax_read_queue = 8"
        )
        .unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.network.port, 7000);
        assert_eq!(config.network.ip, "127.0.0.1");
        assert!(config.session.orderly_read);
        assert_eq!(config.session.max_read_queue, 8);
        assert_eq!(config.worker_pool.min_workers, 0);
    }
}
