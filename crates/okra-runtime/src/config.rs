//! Runtime-wide and per-pool configuration.

use std::{collections::HashMap, path::PathBuf, time::Duration};

use crate::error::{ConfigError, Error, Result};

/// Bounds for a [`crate::pool::WorkerPool`].
#[derive(Clone, Copy, Debug)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
}

impl PoolConfig {
    /// Validates `min_workers <= max_workers` and `max_workers >= 1`.
    pub fn new(min_workers: usize, max_workers: usize) -> Result<Self> {
        if max_workers == 0 {
            return Err(Error::Configuration(ConfigError::ZeroMaxWorkers));
        }
        if min_workers > max_workers {
            return Err(Error::Configuration(ConfigError::InvalidWorkerBounds {
                min: min_workers,
                max: max_workers,
            }));
        }
        Ok(Self {
            min_workers,
            max_workers,
        })
    }
}

/// Compile-time / engine-level settings for a [`crate::engine::CompiledModule`].
#[derive(Clone, Debug)]
pub struct ModuleConfig {
    /// Directory to cache compiled (`.cwasm`) artifacts in. `None` disables caching.
    pub cache_dir: Option<PathBuf>,
    /// Hard cap on guest linear memory, in bytes.
    pub max_memory: usize,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            cache_dir: std::env::var_os("OKRA_MODULE_CACHE_DIR").map(PathBuf::from),
            max_memory: std::env::var("OKRA_MAX_MEMORY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(64 * 1024 * 1024),
        }
    }
}

/// Runtime-assigned per-service context, captured at pool-instantiation time
/// and injected into each worker's [`crate::host::HostApiSet`].
#[derive(Clone, Debug, Default)]
pub struct HostApiConfig {
    pub service_name: String,
    pub namespace: String,
    /// Environment variables exposed to the `env` capability. Never the
    /// process environment unless explicitly populated by the deployer.
    pub env: HashMap<String, String>,
    /// Secret values exposed to the `secrets` capability.
    pub secrets: HashMap<String, String>,
    /// Opaque auth claims forwarded to the dynamic policy evaluator.
    pub auth_claims: HashMap<String, String>,
    /// Idle threshold after which an unread iterator is swept and closed.
    pub iterator_idle_timeout: Duration,
}

impl HostApiConfig {
    #[must_use]
    pub fn new(service_name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            namespace: namespace.into(),
            env: HashMap::new(),
            secrets: HashMap::new(),
            auth_claims: HashMap::new(),
            iterator_idle_timeout: Duration::from_secs(60),
        }
    }
}

/// Timeout used by [`crate::actor::ServiceActor::post_stop`] when none is
/// supplied by the caller.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
