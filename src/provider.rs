//! Connection provider abstraction.
//!
//! Higher-level tooling (for example a template-database manager that runs
//! migrations and clones test databases) depends only on these two traits,
//! not on the registry or the pool engine behind them.

use crate::context::Context;
use crate::db::params::QueryParam;
use crate::db::types::JsonRow;
use crate::error::DbResult;
use std::future::Future;

/// Hands out connections to logical databases by name.
pub trait ConnectionProvider: Send + Sync {
    type Connection: DatabaseConnection;

    /// Get a connection to `database`, creating its pool on first use.
    fn connect(
        &self,
        cx: &Context,
        database: &str,
    ) -> impl Future<Output = DbResult<Self::Connection>> + Send;

    /// Shut down every pool this provider still holds.
    fn close(&self) -> impl Future<Output = DbResult<()>> + Send;
}

/// A connection handle to one logical database.
pub trait DatabaseConnection: Send + Sync {
    /// Run a query and return its first row.
    fn query_row(
        &self,
        cx: &Context,
        sql: &str,
        params: &[QueryParam],
    ) -> impl Future<Output = DbResult<JsonRow>> + Send;

    /// Run a statement and return the number of rows affected.
    fn exec(
        &self,
        cx: &Context,
        sql: &str,
        params: &[QueryParam],
    ) -> impl Future<Output = DbResult<u64>> + Send;

    /// Release the connection. Safe to call more than once.
    fn close(&self) -> impl Future<Output = DbResult<()>> + Send;
}
