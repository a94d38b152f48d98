//! Connection handles handed out by the registry.
//!
//! A handle is a thin facade over a registry-owned pool. Handles obtained for
//! the same database name alias the same pool, and closing any one of them
//! tears down that whole pool and evicts it from the registry. Sibling
//! handles become unusable for new queries; their own `close` is a no-op.

use crate::context::Context;
use crate::db::params::{QueryParam, bind_mysql_param, bind_postgres_param, bind_sqlite_param};
use crate::db::pool::{DbPool, PoolEntry};
use crate::db::registry::RegistryShared;
use crate::db::types::{JsonRow, RowToJson};
use crate::error::{DbError, DbResult, Operation};
use crate::provider::DatabaseConnection;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub struct RegistryConnection {
    entry: Arc<PoolEntry>,
    /// Eviction is best-effort: if the registry is gone there is nothing to evict.
    registry: Weak<RegistryShared>,
    shutdown_timeout: Duration,
    closed: Mutex<bool>,
}

impl RegistryConnection {
    pub(crate) fn new(
        entry: Arc<PoolEntry>,
        registry: Weak<RegistryShared>,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            entry,
            registry,
            shutdown_timeout,
            closed: Mutex::new(false),
        }
    }

    /// Name of the database this handle was obtained for.
    pub fn database_name(&self) -> &str {
        self.entry.database()
    }

    /// Generation of the backing pool; handles that share a pool share it.
    pub fn pool_generation(&self) -> u64 {
        self.entry.generation()
    }

    /// The underlying pool, for callers that want to use sqlx directly.
    pub fn pool(&self) -> &DbPool {
        self.entry.pool()
    }

    /// True once this handle, or any handle sharing its pool, was closed.
    pub fn is_closed(&self) -> bool {
        self.entry.is_closed()
    }

    /// Run a query and return its first row.
    ///
    /// An empty result is a database error ("No rows returned").
    pub async fn query_row(
        &self,
        cx: &Context,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<JsonRow> {
        debug!(database = %self.database_name(), sql = %sql, params = params.len(), "Query row");

        let row = cx
            .run(async {
                match self.pool() {
                    DbPool::MySql(pool) => {
                        let query = params
                            .iter()
                            .fold(sqlx::query(sql), |q, p| bind_mysql_param(q, p));
                        query.fetch_one(pool).await.map(|row| row.to_json_map())
                    }
                    DbPool::Postgres(pool) => {
                        let query = params
                            .iter()
                            .fold(sqlx::query(sql), |q, p| bind_postgres_param(q, p));
                        query.fetch_one(pool).await.map(|row| row.to_json_map())
                    }
                    DbPool::SQLite(pool) => {
                        let query = params
                            .iter()
                            .fold(sqlx::query(sql), |q, p| bind_sqlite_param(q, p));
                        query.fetch_one(pool).await.map(|row| row.to_json_map())
                    }
                }
            })
            .await
            .map_err(|e| DbError::connectivity(Operation::Query, e))?;

        row.map_err(|e| self.driver_error(e))
    }

    /// Run a query and return every row.
    pub async fn query(
        &self,
        cx: &Context,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Vec<JsonRow>> {
        debug!(database = %self.database_name(), sql = %sql, params = params.len(), "Query");

        let rows = cx
            .run(async {
                match self.pool() {
                    DbPool::MySql(pool) => {
                        let query = params
                            .iter()
                            .fold(sqlx::query(sql), |q, p| bind_mysql_param(q, p));
                        let rows = query.fetch_all(pool).await?;
                        Ok::<Vec<JsonRow>, sqlx::Error>(
                            rows.iter().map(RowToJson::to_json_map).collect(),
                        )
                    }
                    DbPool::Postgres(pool) => {
                        let query = params
                            .iter()
                            .fold(sqlx::query(sql), |q, p| bind_postgres_param(q, p));
                        let rows = query.fetch_all(pool).await?;
                        Ok(rows.iter().map(RowToJson::to_json_map).collect())
                    }
                    DbPool::SQLite(pool) => {
                        let query = params
                            .iter()
                            .fold(sqlx::query(sql), |q, p| bind_sqlite_param(q, p));
                        let rows = query.fetch_all(pool).await?;
                        Ok(rows.iter().map(RowToJson::to_json_map).collect())
                    }
                }
            })
            .await
            .map_err(|e| DbError::connectivity(Operation::Query, e))?;

        rows.map_err(|e| self.driver_error(e))
    }

    /// Run a statement and return the number of rows affected.
    pub async fn exec(&self, cx: &Context, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        debug!(database = %self.database_name(), sql = %sql, params = params.len(), "Exec");

        let affected = cx
            .run(async {
                match self.pool() {
                    DbPool::MySql(pool) => params
                        .iter()
                        .fold(sqlx::query(sql), |q, p| bind_mysql_param(q, p))
                        .execute(pool)
                        .await
                        .map(|r| r.rows_affected()),
                    DbPool::Postgres(pool) => params
                        .iter()
                        .fold(sqlx::query(sql), |q, p| bind_postgres_param(q, p))
                        .execute(pool)
                        .await
                        .map(|r| r.rows_affected()),
                    DbPool::SQLite(pool) => params
                        .iter()
                        .fold(sqlx::query(sql), |q, p| bind_sqlite_param(q, p))
                        .execute(pool)
                        .await
                        .map(|r| r.rows_affected()),
                }
            })
            .await
            .map_err(|e| DbError::connectivity(Operation::Execute, e))?;

        affected.map_err(|e| self.driver_error(e))
    }

    /// Acquire timeouts report the limit this pool was built with.
    fn driver_error(&self, err: sqlx::Error) -> DbError {
        match err {
            sqlx::Error::PoolTimedOut => DbError::timeout(
                "connection pool acquire",
                self.pool().acquire_timeout().as_secs(),
            ),
            other => other.into(),
        }
    }

    /// Close this handle, tearing down the whole shared pool.
    ///
    /// The first call evicts the pool from the registry and shuts it down.
    /// Later calls on this handle return `Ok(())` without side effects; so do
    /// calls on sibling handles, because the pool's own shutdown guard has
    /// already fired. A shutdown error is returned, but the handle still
    /// counts as closed.
    pub async fn close(&self) -> DbResult<()> {
        let mut closed = self.closed.lock().await;
        if *closed {
            return Ok(());
        }
        *closed = true;

        // Evict before shutting down so no new caller is handed a dying pool.
        if let Some(registry) = self.registry.upgrade() {
            registry.evict(&self.entry).await;
        }

        if !self.entry.is_closed() {
            info!(
                database = %self.database_name(),
                generation = self.pool_generation(),
                "Connection closed; tearing down shared pool"
            );
        }

        self.entry.shutdown(self.shutdown_timeout).await
    }
}

impl std::fmt::Debug for RegistryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryConnection")
            .field("database", &self.entry.database())
            .field("generation", &self.entry.generation())
            .field("pool_closed", &self.entry.is_closed())
            .finish_non_exhaustive()
    }
}

impl DatabaseConnection for RegistryConnection {
    fn query_row(
        &self,
        cx: &Context,
        sql: &str,
        params: &[QueryParam],
    ) -> impl std::future::Future<Output = DbResult<JsonRow>> + Send {
        RegistryConnection::query_row(self, cx, sql, params)
    }

    fn exec(
        &self,
        cx: &Context,
        sql: &str,
        params: &[QueryParam],
    ) -> impl std::future::Future<Output = DbResult<u64>> + Send {
        RegistryConnection::exec(self, cx, sql, params)
    }

    fn close(&self) -> impl std::future::Future<Output = DbResult<()>> + Send {
        RegistryConnection::close(self)
    }
}
