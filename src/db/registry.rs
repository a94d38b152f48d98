//! Per-database pool registry.
//!
//! The registry lazily creates one pool per logical database name, hands out
//! [`RegistryConnection`] handles that alias it, and tears pools down again
//! when a handle (or the registry itself) is closed.
//!
//! # Concurrency
//!
//! - Lookups take the shared read lock first; a warm pool never touches the
//!   write lock.
//! - Creation uses double-checked locking. After a miss on the read lock the
//!   caller takes the write lock and looks again before building anything.
//!   That second look is what guarantees at most one pool per name: callers
//!   that lost the race find the winner's entry and reuse it.
//! - A pool is parsed, built and pinged while the write lock is held, and is
//!   only inserted once the ping succeeds. No other caller can observe an
//!   unverified pool. A pool that fails its ping is closed before the error
//!   is returned.
//! - Shutdown is guarded per entry (see [`PoolEntry::shutdown`]), so handle
//!   closes and a registry-wide close may race in any order.

use crate::config::ProviderOptions;
use crate::context::Context;
use crate::db::connection::RegistryConnection;
use crate::db::pool::{DbPool, PoolEntry};
use crate::db::settings::ConnectSettings;
use crate::error::{DbError, DbResult};
use crate::provider::ConnectionProvider;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Maps a database name to its connection string. Must be deterministic.
pub type ConnStringFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// State shared between a registry and the handles it hands out.
pub(crate) struct RegistryShared {
    pools: RwLock<HashMap<String, Arc<PoolEntry>>>,
    options: ProviderOptions,
    conn_string: ConnStringFn,
    /// Last generation handed out; doubles as the count of pools created.
    generation: AtomicU64,
}

impl RegistryShared {
    /// Remove `entry` from the map if it is still the registered pool for its name.
    ///
    /// A newer pool registered under the same name is left alone.
    pub(crate) async fn evict(&self, entry: &Arc<PoolEntry>) -> bool {
        let mut pools = self.pools.write().await;
        let is_current = pools
            .get(entry.database())
            .is_some_and(|current| Arc::ptr_eq(current, entry));
        if !is_current {
            return false;
        }

        pools.remove(entry.database());
        debug!(
            database = %entry.database(),
            generation = entry.generation(),
            "Evicted pool from registry"
        );
        true
    }
}

#[derive(Clone)]
pub struct PoolRegistry {
    shared: Arc<RegistryShared>,
}

impl PoolRegistry {
    /// Create a registry with default pool options.
    pub fn new<F>(conn_string: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        Self::with_options(conn_string, ProviderOptions::default())
    }

    /// Create a registry whose pools all use `options`.
    pub fn with_options<F>(conn_string: F, options: ProviderOptions) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(RegistryShared {
                pools: RwLock::new(HashMap::new()),
                options,
                conn_string: Arc::new(conn_string),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Get a connection to `database`, creating and verifying its pool on first use.
    ///
    /// Failures are reported by phase: an unparsable connection string is a
    /// configuration error, invalid sizing a pool creation error, and a
    /// failed ping (unreachable server, missing database, or a `cx` that is
    /// already cancelled) a connectivity error. Nothing is registered on
    /// failure, and failed calls are not retried.
    pub async fn connect(&self, cx: &Context, database: &str) -> DbResult<RegistryConnection> {
        // Fast path
        {
            let pools = self.shared.pools.read().await;
            if let Some(entry) = pools.get(database).filter(|e| !e.is_closed()) {
                debug!(
                    database = %database,
                    generation = entry.generation(),
                    "Reusing existing pool"
                );
                return Ok(self.handle(Arc::clone(entry)));
            }
        } // Read lock released here

        let mut pools = self.shared.pools.write().await;

        // Mandatory re-check: another caller may have registered the pool
        // between releasing the read lock and acquiring the write lock.
        if let Some(entry) = pools.get(database).filter(|e| !e.is_closed()) {
            debug!(
                database = %database,
                generation = entry.generation(),
                "Pool created concurrently, reusing it"
            );
            return Ok(self.handle(Arc::clone(entry)));
        }

        let entry = self.create_entry(cx, database).await?;
        // Replaces a closed entry that has not been evicted yet, if any.
        pools.insert(database.to_string(), Arc::clone(&entry));
        drop(pools);

        Ok(self.handle(entry))
    }

    /// Parse, build and ping a new pool. The caller holds the write lock.
    async fn create_entry(&self, cx: &Context, database: &str) -> DbResult<Arc<PoolEntry>> {
        let connection_string = (self.shared.conn_string)(database);
        let settings = ConnectSettings::parse(&connection_string)?;
        let config = self.shared.options.resolve(settings.pool.clone());

        debug!(
            database = %database,
            db_type = %settings.db_type,
            max_conns = config.max_conns,
            min_conns = config.min_conns,
            "Creating new database pool"
        );

        let pool = DbPool::build(&settings, &config)?;

        if let Err(e) = pool.ping(cx).await {
            warn!(
                database = %database,
                error = %e,
                "Liveness check failed, discarding new pool"
            );
            self.discard(database, &pool).await;
            return Err(e);
        }

        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        info!(
            database = %database,
            db_type = %settings.db_type,
            generation,
            "Created database pool"
        );
        Ok(Arc::new(PoolEntry::new(pool, database, generation)))
    }

    /// Close a pool that never got registered.
    async fn discard(&self, database: &str, pool: &DbPool) {
        let timeout = self.shared.options.get_shutdown_timeout();
        if tokio::time::timeout(timeout, pool.close()).await.is_err() {
            warn!(
                database = %database,
                timeout_secs = timeout.as_secs(),
                "Timed out closing discarded pool"
            );
        }
    }

    fn handle(&self, entry: Arc<PoolEntry>) -> RegistryConnection {
        RegistryConnection::new(
            entry,
            Arc::downgrade(&self.shared),
            self.shared.options.get_shutdown_timeout(),
        )
    }

    /// Close every pool still registered and clear the registry.
    ///
    /// Pools already torn down through a handle are skipped. Every pool is
    /// attempted even if some fail; failures come back as one aggregated
    /// shutdown error. The registry stays usable afterwards.
    pub async fn close(&self) -> DbResult<()> {
        // Drain pools under lock, close outside lock
        let pools_to_close: Vec<(String, Arc<PoolEntry>)> = {
            let mut pools = self.shared.pools.write().await;
            pools.drain().collect()
        }; // Lock released here

        let timeout = self.shared.options.get_shutdown_timeout();
        let count = pools_to_close.len();
        let mut errors = Vec::new();
        for (database, entry) in pools_to_close {
            if let Err(e) = entry.shutdown(timeout).await {
                warn!(database = %database, error = %e, "Failed to close pool");
                errors.push(e);
            }
        }

        info!(count, failed = errors.len(), "Registry closed");
        match DbError::aggregate_shutdown(errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Number of pools currently registered.
    pub async fn pool_count(&self) -> usize {
        self.shared.pools.read().await.len()
    }

    /// Names of databases with a registered pool.
    pub async fn database_names(&self) -> Vec<String> {
        let pools = self.shared.pools.read().await;
        let mut names: Vec<String> = pools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check if a pool is registered for `database`.
    pub async fn contains(&self, database: &str) -> bool {
        self.shared.pools.read().await.contains_key(database)
    }

    /// Total pools this registry has created and registered over its lifetime.
    pub fn pools_created(&self) -> u64 {
        self.shared.generation.load(Ordering::Acquire)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shared.options.get_shutdown_timeout()
    }
}

impl std::fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("options", &self.shared.options)
            .field("pools_created", &self.pools_created())
            .finish_non_exhaustive()
    }
}

impl ConnectionProvider for PoolRegistry {
    type Connection = RegistryConnection;

    fn connect(
        &self,
        cx: &Context,
        database: &str,
    ) -> impl std::future::Future<Output = DbResult<RegistryConnection>> + Send {
        PoolRegistry::connect(self, cx, database)
    }

    fn close(&self) -> impl std::future::Future<Output = DbResult<()>> + Send {
        PoolRegistry::close(self)
    }
}
