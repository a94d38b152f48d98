//! Configuration handling for the pool registry.
//!
//! Two layers live here:
//! - [`PoolConfig`] / [`ProviderOptions`]: the library-side pool sizing that a
//!   registry applies to every pool it creates.
//! - [`Config`]: CLI arguments and environment variables for the probe binary.

use clap::Parser;
use std::time::Duration;

// Pool configuration defaults
pub const DEFAULT_MAX_CONNECTIONS: i32 = 10;
pub const DEFAULT_MAX_CONNECTIONS_SQLITE: i32 = 1;
pub const DEFAULT_MIN_CONNECTIONS: i32 = 0;
pub const DEFAULT_MAX_LIFETIME_SECS: u64 = 30 * 60;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Engine-level pool configuration.
///
/// A zero `max_conn_lifetime` or `max_conn_idle_time` means "no limit".
/// Values are not validated here; invalid sizing is rejected when the pool
/// is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_conns: i32,
    pub min_conns: i32,
    pub max_conn_lifetime: Duration,
    pub max_conn_idle_time: Duration,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_conns: DEFAULT_MAX_CONNECTIONS,
            min_conns: DEFAULT_MIN_CONNECTIONS,
            max_conn_lifetime: Duration::from_secs(DEFAULT_MAX_LIFETIME_SECS),
            max_conn_idle_time: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
        }
    }
}

impl PoolConfig {
    /// Defaults for an engine; SQLite gets a single writer connection.
    pub fn default_for_sqlite(is_sqlite: bool) -> Self {
        Self {
            max_conns: if is_sqlite {
                DEFAULT_MAX_CONNECTIONS_SQLITE
            } else {
                DEFAULT_MAX_CONNECTIONS
            },
            ..Self::default()
        }
    }

    /// Check sizing before a pool is built from this configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_conns < 1 {
            return Err(format!(
                "max_conns must be greater than 0 (got {})",
                self.max_conns
            ));
        }
        if self.min_conns < 0 {
            return Err(format!(
                "min_conns cannot be negative (got {})",
                self.min_conns
            ));
        }
        if self.min_conns > self.max_conns {
            return Err(format!(
                "min_conns ({}) cannot exceed max_conns ({})",
                self.min_conns, self.max_conns
            ));
        }
        if self.acquire_timeout.is_zero() {
            return Err("acquire_timeout must be greater than 0".to_string());
        }
        Ok(())
    }

    /// Lifetime limit as the engine expects it: zero becomes "unlimited".
    pub fn max_lifetime_limit(&self) -> Option<Duration> {
        non_zero(self.max_conn_lifetime)
    }

    /// Idle limit as the engine expects it: zero becomes "unlimited".
    pub fn idle_timeout_limit(&self) -> Option<Duration> {
        non_zero(self.max_conn_idle_time)
    }
}

fn non_zero(duration: Duration) -> Option<Duration> {
    (!duration.is_zero()).then_some(duration)
}

/// Order-sensitive pool options applied by a registry to every pool it creates.
///
/// Each call overwrites what earlier calls set for the same field, so the
/// last call wins. [`ProviderOptions::pool_config`] replaces the whole base
/// configuration, discarding individual overrides made before it.
///
/// ```
/// use db_pool_registry::config::{PoolConfig, ProviderOptions};
///
/// let options = ProviderOptions::new()
///     .pool_config(PoolConfig { max_conns: 3, ..PoolConfig::default() })
///     .max_conns(7);
/// assert_eq!(options.resolve(PoolConfig::default()).max_conns, 7);
/// ```
#[derive(Debug, Clone)]
pub struct ProviderOptions {
    base: Option<PoolConfig>,
    max_conns: Option<i32>,
    min_conns: Option<i32>,
    max_conn_lifetime: Option<Duration>,
    max_conn_idle_time: Option<Duration>,
    shutdown_timeout: Duration,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            base: None,
            max_conns: None,
            min_conns: None,
            max_conn_lifetime: None,
            max_conn_idle_time: None,
            shutdown_timeout: Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
        }
    }
}

impl ProviderOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a fully custom pool configuration instead of the one parsed from
    /// the connection string.
    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.base = Some(config);
        self.max_conns = None;
        self.min_conns = None;
        self.max_conn_lifetime = None;
        self.max_conn_idle_time = None;
        self
    }

    pub fn max_conns(mut self, max_conns: i32) -> Self {
        self.max_conns = Some(max_conns);
        self
    }

    pub fn min_conns(mut self, min_conns: i32) -> Self {
        self.min_conns = Some(min_conns);
        self
    }

    /// Zero means connections are never retired for age.
    pub fn max_conn_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_conn_lifetime = Some(lifetime);
        self
    }

    /// Zero means idle connections are never reaped.
    pub fn max_conn_idle_time(mut self, idle_time: Duration) -> Self {
        self.max_conn_idle_time = Some(idle_time);
        self
    }

    /// Upper bound on waiting for checked-out connections when a pool closes.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn get_shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    /// Merge these options into the configuration parsed from a connection
    /// string.
    ///
    /// A custom base replaces `parsed` outright; individual overrides then
    /// take precedence over whichever base is in effect.
    pub fn resolve(&self, parsed: PoolConfig) -> PoolConfig {
        let mut config = self.base.clone().unwrap_or(parsed);
        if let Some(max_conns) = self.max_conns {
            config.max_conns = max_conns;
        }
        if let Some(min_conns) = self.min_conns {
            config.min_conns = min_conns;
        }
        if let Some(lifetime) = self.max_conn_lifetime {
            config.max_conn_lifetime = lifetime;
        }
        if let Some(idle_time) = self.max_conn_idle_time {
            config.max_conn_idle_time = idle_time;
        }
        config
    }
}

/// Configuration for the probe binary.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "db-pool-probe",
    about = "Open one pooled connection per database through a shared registry and run a query",
    version,
    author
)]
pub struct Config {
    /// Base connection string. The database part is replaced by each --database name.
    #[arg(long, value_name = "URL", env = "POOL_REGISTRY_URL")]
    pub url: String,

    /// Database names to probe. Can be specified multiple times.
    #[arg(
        short = 'd',
        long = "database",
        value_name = "NAME",
        env = "POOL_REGISTRY_DATABASES",
        value_delimiter = ','
    )]
    pub databases: Vec<String>,

    /// Query to run against each database
    #[arg(long, default_value = "SELECT 1", env = "POOL_REGISTRY_QUERY")]
    pub query: String,

    /// Maximum connections per pool
    #[arg(long, env = "POOL_REGISTRY_MAX_CONNECTIONS")]
    pub max_connections: Option<i32>,

    /// Minimum connections per pool
    #[arg(long, env = "POOL_REGISTRY_MIN_CONNECTIONS")]
    pub min_connections: Option<i32>,

    /// Maximum connection lifetime in seconds (0 = no limit)
    #[arg(long, env = "POOL_REGISTRY_MAX_LIFETIME")]
    pub max_lifetime: Option<u64>,

    /// Maximum connection idle time in seconds (0 = no limit)
    #[arg(long, env = "POOL_REGISTRY_IDLE_TIMEOUT")]
    pub idle_timeout: Option<u64>,

    /// Connect (ping) timeout in seconds
    #[arg(
        long,
        default_value_t = DEFAULT_CONNECT_TIMEOUT_SECS,
        env = "POOL_REGISTRY_CONNECT_TIMEOUT"
    )]
    pub connect_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "POOL_REGISTRY_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "POOL_REGISTRY_JSON_LOGS")]
    pub json_logs: bool,
}

impl Config {
    /// Get connect timeout as Duration.
    pub fn connect_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    /// Pool options for the registry, in flag order.
    pub fn provider_options(&self) -> ProviderOptions {
        let mut options = ProviderOptions::new();
        if let Some(max) = self.max_connections {
            options = options.max_conns(max);
        }
        if let Some(min) = self.min_connections {
            options = options.min_conns(min);
        }
        if let Some(secs) = self.max_lifetime {
            options = options.max_conn_lifetime(Duration::from_secs(secs));
        }
        if let Some(secs) = self.idle_timeout {
            options = options.max_conn_idle_time(Duration::from_secs(secs));
        }
        options
    }
}
