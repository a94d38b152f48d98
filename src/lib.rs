//! Per-database connection pool registry.
//!
//! This library lazily creates and caches one connection pool per logical
//! database name on a shared server (PostgreSQL, MySQL, SQLite), hands out
//! lightweight handles over those pools, and tears pools down when a handle
//! or the registry is closed.

pub mod config;
pub mod connection_string;
pub mod context;
pub mod db;
pub mod error;
pub mod provider;

pub use config::{PoolConfig, ProviderOptions};
pub use context::{Context, ContextError};
pub use db::{PoolRegistry, QueryParam, RegistryConnection};
pub use error::{DbError, DbResult};
pub use provider::{ConnectionProvider, DatabaseConnection};
