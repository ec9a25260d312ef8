mod client;
mod pool;

pub use client::DockerClient;
pub use pool::{ContainerInfo, ContainerPool, ContainerStatus};

use serde::{Deserialize, Serialize};

/// Static pool configuration. The pool *size* is deliberately not part of
/// this struct: it is runtime-mutable and lives on the pool as an atomic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub image: String,
    pub network_name: String,
    pub port_range_start: u16,
    pub port_range_end: u16,
    /// Shared-memory size for the browser renderer, in bytes.
    pub shm_size_bytes: i64,
    pub memory_limit_bytes: i64,
    /// Number of CPUs (e.g. 2.0 for two cores).
    pub cpu_limit: f64,
    /// Port the streaming server listens on inside the container.
    pub stream_port: u16,
    /// Host directory with policies/, scripts/ and assets/ subdirectories
    /// mounted read-only into every container.
    pub mounts_dir: Option<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            image: "cloudbrowser-kiosk:latest".to_string(),
            network_name: "cloudbrowser-net".to_string(),
            port_range_start: 4000,
            port_range_end: 4100,
            shm_size_bytes: 2 * 1024 * 1024 * 1024,
            memory_limit_bytes: 2 * 1024 * 1024 * 1024,
            cpu_limit: 2.0,
            stream_port: 8080,
            mounts_dir: None,
        }
    }
}

impl From<&crate::config::Config> for PoolConfig {
    fn from(cfg: &crate::config::Config) -> Self {
        Self {
            image: cfg.container_image.clone(),
            network_name: "cloudbrowser-net".to_string(),
            port_range_start: cfg.port_range_start,
            port_range_end: cfg.port_range_end,
            shm_size_bytes: cfg.shm_size_bytes,
            memory_limit_bytes: cfg.memory_limit_bytes,
            cpu_limit: cfg.cpu_limit,
            stream_port: cfg.stream_port,
            mounts_dir: cfg.mounts_dir.clone(),
        }
    }
}
