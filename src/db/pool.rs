//! Pool construction and one-shot shutdown.
//!
//! This module builds database-specific pools (MySqlPool, PgPool, SqlitePool)
//! from parsed [`ConnectSettings`] and wraps each in a [`PoolEntry`] whose
//! shutdown runs at most once no matter how many handles ask for it.

use crate::config::PoolConfig;
use crate::context::Context;
use crate::db::settings::{ConnectSettings, ConnectTarget, DatabaseType};
use crate::error::{DbError, DbResult, Operation};
use sqlx::pool::PoolOptions;
use sqlx::{Connection, MySqlPool, PgPool, SqlitePool};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Database-specific connection pool (avoids AnyPool limitations).
#[derive(Debug, Clone)]
pub enum DbPool {
    MySql(MySqlPool),
    Postgres(PgPool),
    SQLite(SqlitePool),
}

impl DbPool {
    /// Build a pool without opening any connection.
    ///
    /// Sizing is validated here; a rejected configuration never produces a pool.
    pub fn build(settings: &ConnectSettings, config: &PoolConfig) -> DbResult<Self> {
        config.validate().map_err(DbError::pool_creation)?;

        let pool = match &settings.target {
            ConnectTarget::MySql(options) => {
                DbPool::MySql(pool_options(config).connect_lazy_with(options.clone()))
            }
            ConnectTarget::Postgres(options) => {
                DbPool::Postgres(pool_options(config).connect_lazy_with(options.clone()))
            }
            ConnectTarget::SQLite(options) => {
                DbPool::SQLite(pool_options(config).connect_lazy_with(options.clone()))
            }
        };
        Ok(pool)
    }

    /// Acquire one connection and ping it, bounded by `cx`.
    pub async fn ping(&self, cx: &Context) -> DbResult<()> {
        let result = cx
            .run(async {
                match self {
                    DbPool::MySql(pool) => {
                        let mut conn = pool.acquire().await?;
                        conn.ping().await
                    }
                    DbPool::Postgres(pool) => {
                        let mut conn = pool.acquire().await?;
                        conn.ping().await
                    }
                    DbPool::SQLite(pool) => {
                        let mut conn = pool.acquire().await?;
                        conn.ping().await
                    }
                }
            })
            .await;

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(DbError::connectivity(Operation::Ping, e)),
            Err(e) => Err(DbError::connectivity(Operation::Ping, e)),
        }
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        impl_db_dispatch!(self, {
            MySql(pool) => pool.close().await,
            Postgres(pool) => pool.close().await,
            SQLite(pool) => pool.close().await,
        })
    }

    pub fn is_closed(&self) -> bool {
        impl_db_dispatch!(self, {
            MySql(pool) => pool.is_closed(),
            Postgres(pool) => pool.is_closed(),
            SQLite(pool) => pool.is_closed(),
        })
    }

    /// How long an acquire waits for a free connection before giving up.
    pub fn acquire_timeout(&self) -> Duration {
        impl_db_dispatch!(self, {
            MySql(pool) => pool.options().get_acquire_timeout(),
            Postgres(pool) => pool.options().get_acquire_timeout(),
            SQLite(pool) => pool.options().get_acquire_timeout(),
        })
    }

    /// Get the database type for this pool.
    pub fn db_type(&self) -> DatabaseType {
        match self {
            DbPool::MySql(_) => DatabaseType::MySQL,
            DbPool::Postgres(_) => DatabaseType::PostgreSQL,
            DbPool::SQLite(_) => DatabaseType::SQLite,
        }
    }
}

fn pool_options<DB: sqlx::Database>(config: &PoolConfig) -> PoolOptions<DB> {
    // validate() has already rejected negative counts
    PoolOptions::<DB>::new()
        .max_connections(config.max_conns as u32)
        .min_connections(config.min_conns as u32)
        .max_lifetime(config.max_lifetime_limit())
        .idle_timeout(config.idle_timeout_limit())
        .acquire_timeout(config.acquire_timeout)
}

/// A registered pool: one logical handle over many physical connections.
///
/// Owned by the registry; connection handles borrow it through an `Arc`
/// and never close it except through [`PoolEntry::shutdown`].
pub struct PoolEntry {
    pool: DbPool,
    database: String,
    /// Unique within the owning registry; a re-created pool gets a new one.
    generation: u64,
    created_at: Instant,
    /// One-shot shutdown guard shared by every handle aliasing this entry.
    closed: AtomicBool,
}

impl PoolEntry {
    pub fn new(pool: DbPool, database: impl Into<String>, generation: u64) -> Self {
        Self {
            pool,
            database: database.into(),
            generation,
            created_at: Instant::now(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True once any caller has started shutting this pool down.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the underlying pool, once.
    ///
    /// The first caller closes the pool, waiting up to `timeout` for
    /// checked-out connections to come back. Every later call returns
    /// `Ok(())` immediately. The entry counts as closed even when the wait
    /// times out.
    pub async fn shutdown(&self, timeout: Duration) -> DbResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!(
                database = %self.database,
                generation = self.generation,
                "Pool already shut down"
            );
            return Ok(());
        }

        info!(
            database = %self.database,
            generation = self.generation,
            age_secs = self.created_at.elapsed().as_secs(),
            "Closing database pool"
        );

        if tokio::time::timeout(timeout, self.pool.close()).await.is_err() {
            warn!(
                database = %self.database,
                generation = self.generation,
                timeout_secs = timeout.as_secs(),
                "Timed out waiting for connections to be returned"
            );
            return Err(DbError::shutdown(
                &self.database,
                format!(
                    "timed out after {:?} waiting for checked-out connections",
                    timeout
                ),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for PoolEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolEntry")
            .field("pool", &self.pool)
            .field("database", &self.database)
            .field("generation", &self.generation)
            .field("created_at", &self.created_at)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}
