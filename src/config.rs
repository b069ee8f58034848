// SPDX-License-Identifier: Apache-2.0

//! Engine configuration.
//!
//! Defaults are overlaid with `TESSERA_*` environment variables. TLS material
//! is configured through a separate property map (see `transport::tls`).

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use tessera_core::{EngineError, EngineResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cluster_name: String,
    pub product_name: String,
    /// Distinguishes session ids minted by different nodes of a cluster.
    pub node_id: u16,
    pub session: SessionConfig,
    pub dispatch: DispatchConfig,
    pub transport: TransportConfig,
    pub log: LogConfig,
    /// Raw TLS properties (`tessera.ssl.*` and generic keys).
    pub tls_properties: HashMap<String, String>,
    /// Directory searched for bundled default key/trust stores.
    pub resource_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cluster_name: "tessera".to_string(),
            product_name: "Tessera".to_string(),
            node_id: 0,
            session: SessionConfig::default(),
            dispatch: DispatchConfig::default(),
            transport: TransportConfig::default(),
            log: LogConfig::default(),
            tls_properties: HashMap::new(),
            resource_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Live sessions allowed per user; `0` disables the quota.
    pub max_sessions_per_user: usize,
    pub ping_interval_ms: u64,
    /// A session expires after this many missed ping intervals.
    pub expiry_multiplier: u32,
    /// Time zone reported at logon; the server's local offset when unset.
    pub time_zone: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_user: 0,
            ping_interval_ms: 60_000,
            expiry_multiplier: 3,
            time_zone: None,
        }
    }
}

impl SessionConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn expiry_after(&self) -> Duration {
        self.ping_interval() * self.expiry_multiplier.max(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Time-to-live for a single batch pull from a connector.
    pub fetch_timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub bind_addr: String,
    pub max_frame_bytes: usize,
    /// Upper bound on concurrently outstanding calls per client connection.
    pub max_reader_threads: usize,
    pub sync_call_ttl_ms: u64,
    pub async_call_ttl_ms: u64,
    pub use_tls: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:31000".to_string(),
            max_frame_bytes: 16 * 1024 * 1024,
            max_reader_threads: 15,
            sync_call_ttl_ms: 120_000,
            async_call_ttl_ms: 30_000,
            use_tls: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Directory for rolling log files; a per-user default when unset.
    pub directory: Option<PathBuf>,
    pub retention_days: u64,
    /// `EnvFilter` directive used when `RUST_LOG` is not set.
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            directory: None,
            retention_days: 14,
            filter: "tessera=info,tessera_core=info".to_string(),
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with process environment variables.
    pub fn from_env() -> EngineResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup` (keys are `TESSERA_*`).
    pub fn from_lookup<F>(lookup: F) -> EngineResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("TESSERA_CLUSTER_NAME") {
            config.cluster_name = v;
        }
        if let Some(v) = parse(&lookup, "TESSERA_NODE_ID")? {
            config.node_id = v;
        }
        if let Some(v) = parse(&lookup, "TESSERA_MAX_SESSIONS_PER_USER")? {
            config.session.max_sessions_per_user = v;
        }
        if let Some(v) = parse(&lookup, "TESSERA_PING_INTERVAL_MS")? {
            config.session.ping_interval_ms = v;
        }
        if let Some(v) = parse(&lookup, "TESSERA_SESSION_EXPIRY_MULTIPLIER")? {
            config.session.expiry_multiplier = v;
        }
        if let Some(v) = lookup("TESSERA_TIME_ZONE") {
            config.session.time_zone = Some(v);
        }
        if let Some(v) = parse(&lookup, "TESSERA_FETCH_TIMEOUT_MS")? {
            config.dispatch.fetch_timeout_ms = v;
        }
        if let Some(v) = lookup("TESSERA_BIND_ADDR") {
            config.transport.bind_addr = v;
        }
        if let Some(v) = parse(&lookup, "TESSERA_MAX_FRAME_BYTES")? {
            config.transport.max_frame_bytes = v;
        }
        if let Some(v) = parse(&lookup, "TESSERA_MAX_READER_THREADS")? {
            config.transport.max_reader_threads = v;
        }
        if let Some(v) = parse(&lookup, "TESSERA_SYNC_CALL_TTL_MS")? {
            config.transport.sync_call_ttl_ms = v;
        }
        if let Some(v) = parse(&lookup, "TESSERA_ASYNC_CALL_TTL_MS")? {
            config.transport.async_call_ttl_ms = v;
        }
        if let Some(v) = parse(&lookup, "TESSERA_USE_TLS")? {
            config.transport.use_tls = v;
        }
        if let Some(v) = lookup("TESSERA_LOG_DIR") {
            config.log.directory = Some(PathBuf::from(v));
        }
        if let Some(v) = parse(&lookup, "TESSERA_LOG_RETENTION_DAYS")? {
            config.log.retention_days = v;
        }
        if let Some(v) = lookup("TESSERA_RESOURCE_DIR") {
            config.resource_dir = Some(PathBuf::from(v));
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.session.ping_interval_ms == 0 {
            return Err(EngineError::invalid_argument("ping interval must be positive"));
        }
        if self.transport.max_reader_threads == 0 {
            return Err(EngineError::invalid_argument(
                "max reader threads must be at least 1",
            ));
        }
        if self.transport.max_frame_bytes < 1024 {
            return Err(EngineError::invalid_argument(
                "max frame size must be at least 1024 bytes",
            ));
        }
        Ok(())
    }
}

fn parse<F, T>(lookup: &F, key: &str) -> EngineResult<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| EngineError::invalid_argument(format!("{key} has invalid value '{raw}'"))),
        None => Ok(None),
    }
}
