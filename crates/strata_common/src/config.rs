use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{StrataError, StrataResult};

/// Top-level configuration, usually loaded from `strata.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StrataConfig {
    pub database: DatabaseConfig,
    pub worker_pool: WorkerPoolConfig,
    pub append_worker: AppendWorkerConfig,
    pub rpc: RpcConfig,
    pub watcher: WatcherConfig,
    pub observability: ObservabilityConfig,
}

impl StrataConfig {
    pub fn from_toml_str(text: &str) -> StrataResult<Self> {
        toml::from_str(text).map_err(|e| StrataError::Config(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> StrataResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| StrataError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> StrataResult<String> {
        toml::to_string_pretty(self).map_err(|e| StrataError::Config(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Engine home directory handed to `initialize`.
    pub home: String,
    /// Max live engine connections. −1 = unlimited, 0 = NumCPU × `max_open_conns_factor`.
    pub max_open_conns: i32,
    /// Multiplier applied to the CPU count when `max_open_conns` is 0.
    pub max_open_conns_factor: f64,
    /// Max concurrently detained query cursors. −1 = unlimited, 0 = NumCPU × factor.
    pub max_open_query: i32,
    pub max_open_query_factor: f64,
    /// Default connect timeout in milliseconds (0 = wait until canceled).
    pub connect_timeout_ms: u64,
    /// Identity used for trusted internal connections (schema lookups, append workers).
    pub trusted_user: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            home: String::new(),
            max_open_conns: 0,
            max_open_conns_factor: 1.5,
            max_open_query: 0,
            max_open_query_factor: 2.0,
            connect_timeout_ms: 0,
            trusted_user: "sys".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Route engine calls through OS-thread-pinned workers.
    pub enabled: bool,
    /// Number of workers (0 = NumCPU). Clamped to 2 × NumCPU.
    pub size: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            size: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppendWorkerConfig {
    /// Buffered value-vectors per table before `append` blocks.
    pub queue_capacity: usize,
    /// Idle sweeper tick (ms).
    pub sweep_interval_ms: u64,
    /// A worker with no references idle longer than this is evicted (ms).
    pub idle_timeout_ms: u64,
}

impl Default for AppendWorkerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            sweep_interval_ms: 15_000,
            idle_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Detained rows/appenders untouched for longer than this are released (0 = never).
    pub inflight_ttl_ms: u64,
    pub inflight_sweep_interval_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            inflight_ttl_ms: 0,
            inflight_sweep_interval_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub buffer_size: usize,
    /// Rows per poll in log mode; capped at 100.
    pub max_row_num: usize,
    /// Tag-mode parallelism (0 = one per tag).
    pub parallelism: usize,
    /// `ns`, `us`, `ms`, `s`, `rfc3339` or a strftime pattern.
    pub time_format: String,
    /// `UTC`, `Local` or a fixed offset like `+09:00`.
    pub timezone: String,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            buffer_size: 100,
            max_row_num: 20,
            parallelism: 0,
            time_format: "ns".to_string(),
            timezone: "UTC".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default `EnvFilter` directive when `RUST_LOG` is unset.
    pub log_filter: String,
    /// Prometheus listen address; empty disables the exporter.
    pub metrics_listen_addr: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_filter: "info,strata=debug".to_string(),
            metrics_listen_addr: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = StrataConfig::default();
        assert_eq!(cfg.database.max_open_conns, 0);
        assert_eq!(cfg.database.max_open_conns_factor, 1.5);
        assert_eq!(cfg.append_worker.queue_capacity, 1000);
        assert_eq!(cfg.append_worker.sweep_interval_ms, 15_000);
        assert_eq!(cfg.append_worker.idle_timeout_ms, 30_000);
        assert_eq!(cfg.watcher.buffer_size, 100);
        assert_eq!(cfg.watcher.max_row_num, 20);
        assert!(!cfg.worker_pool.enabled);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let cfg = StrataConfig::from_toml_str(
            r#"
            [database]
            max_open_conns = 2

            [rpc]
            inflight_ttl_ms = 5000
            "#,
        )
        .unwrap();
        assert_eq!(cfg.database.max_open_conns, 2);
        assert_eq!(cfg.database.trusted_user, "sys");
        assert_eq!(cfg.rpc.inflight_ttl_ms, 5000);
        assert_eq!(cfg.rpc.inflight_sweep_interval_ms, 10_000);
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        let err = StrataConfig::from_toml_str("[database\nmax_open_conns = 1").unwrap_err();
        assert!(matches!(err, StrataError::Config(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "[worker_pool]\nenabled = true\nsize = 3").unwrap();
        let cfg = StrataConfig::load(f.path()).unwrap();
        assert!(cfg.worker_pool.enabled);
        assert_eq!(cfg.worker_pool.size, 3);
    }

    #[test]
    fn test_round_trip_through_toml() {
        let cfg = StrataConfig::default();
        let text = cfg.to_toml_string().unwrap();
        let back = StrataConfig::from_toml_str(&text).unwrap();
        assert_eq!(back.watcher.timezone, "UTC");
    }
}
