//! Database layer.
//!
//! - Connection string parsing into per-engine connect options
//! - Pool construction, liveness checks and guarded shutdown
//! - The per-database pool registry and the handles it hands out
//! - Parameter binding and row-to-JSON conversion
//! - Database dispatch macros for reducing code duplication

#[macro_use]
pub mod macros;
pub mod connection;
pub mod params;
pub mod pool;
pub mod registry;
pub mod settings;
pub mod types;

pub use connection::RegistryConnection;
pub use params::QueryParam;
pub use pool::{DbPool, PoolEntry};
pub use registry::{ConnStringFn, PoolRegistry};
pub use settings::{ConnectSettings, DatabaseType};
pub use types::JsonRow;
