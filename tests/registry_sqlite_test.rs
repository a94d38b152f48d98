//! Integration tests for the pool registry against SQLite files.
//!
//! Every test gets its own temporary directory; each logical database name
//! maps to `<dir>/<name>.db`.

use db_pool_registry::config::PoolConfig;
use db_pool_registry::db::DbPool;
use db_pool_registry::{
    ConnectionProvider, Context, DatabaseConnection, DbError, PoolRegistry, ProviderOptions,
    QueryParam,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Registry creating databases on demand, with optional extra query options.
fn setup_registry(dir: &TempDir, extra: &str, options: ProviderOptions) -> PoolRegistry {
    let root = dir.path().to_path_buf();
    let extra = extra.to_string();
    PoolRegistry::with_options(
        move |name| format!("sqlite:{}/{}.db?mode=rwc{}", root.display(), name, extra),
        options,
    )
}

fn sqlite_pool(pool: &DbPool) -> &sqlx::SqlitePool {
    match pool {
        DbPool::SQLite(p) => p,
        other => panic!("expected SQLite pool, got {:?}", other.db_type()),
    }
}

#[tokio::test]
async fn test_basic_connection_and_query() {
    let dir = TempDir::new().unwrap();
    let registry = setup_registry(&dir, "", ProviderOptions::default());
    let cx = Context::background();

    let conn = registry.connect(&cx, "app").await.unwrap();
    let row = conn.query_row(&cx, "SELECT 1 AS value", &[]).await.unwrap();
    assert_eq!(row.get("value"), Some(&serde_json::json!(1)));
    assert_eq!(conn.database_name(), "app");

    conn.close().await.unwrap();
    registry.close().await.unwrap();
}

#[tokio::test]
async fn test_exec_and_query_with_params() {
    let dir = TempDir::new().unwrap();
    let registry = setup_registry(&dir, "", ProviderOptions::default());
    let cx = Context::background();
    let conn = registry.connect(&cx, "app").await.unwrap();

    conn.exec(
        &cx,
        "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, score REAL, active INTEGER)",
        &[],
    )
    .await
    .unwrap();

    let inserted = conn
        .exec(
            &cx,
            "INSERT INTO users (name, score, active) VALUES (?, ?, ?), (?, ?, ?)",
            &[
                "Alice".into(),
                QueryParam::Float(9.5),
                true.into(),
                "Bob".into(),
                QueryParam::Null,
                false.into(),
            ],
        )
        .await
        .unwrap();
    assert_eq!(inserted, 2);

    let rows = conn
        .query(&cx, "SELECT name, score FROM users ORDER BY id", &[])
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["name"], serde_json::json!("Alice"));
    assert_eq!(rows[0]["score"], serde_json::json!(9.5));
    assert!(rows[1]["score"].is_null());

    let row = conn
        .query_row(&cx, "SELECT COUNT(*) AS n FROM users WHERE active = ?", &[true.into()])
        .await
        .unwrap();
    assert_eq!(row["n"], serde_json::json!(1));

    let err = conn
        .query_row(&cx, "SELECT name FROM users WHERE id = ?", &[QueryParam::Int(99)])
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Database { .. }));

    conn.close().await.unwrap();
    registry.close().await.unwrap();
}

#[tokio::test]
async fn test_pool_options_from_connection_string() {
    let dir = TempDir::new().unwrap();
    let registry = setup_registry(
        &dir,
        "&max_connections=3&max_lifetime=120&idle_timeout=0",
        ProviderOptions::default(),
    );
    let cx = Context::background();

    let conn = registry.connect(&cx, "app").await.unwrap();
    let options = sqlite_pool(conn.pool()).options();
    assert_eq!(options.get_max_connections(), 3);
    assert_eq!(options.get_max_lifetime(), Some(Duration::from_secs(120)));
    assert_eq!(options.get_idle_timeout(), None);

    registry.close().await.unwrap();
}

#[tokio::test]
async fn test_provider_options_override_connection_string() {
    let dir = TempDir::new().unwrap();
    let options = ProviderOptions::new()
        .max_conns(5)
        .min_conns(1)
        .max_conn_lifetime(Duration::ZERO)
        .max_conn_idle_time(Duration::from_secs(45));
    let registry = setup_registry(&dir, "&max_connections=2", options);
    let cx = Context::background();

    let conn = registry.connect(&cx, "app").await.unwrap();
    let options = sqlite_pool(conn.pool()).options();
    assert_eq!(options.get_max_connections(), 5);
    assert_eq!(options.get_min_connections(), 1);
    assert_eq!(options.get_max_lifetime(), None);
    assert_eq!(options.get_idle_timeout(), Some(Duration::from_secs(45)));

    registry.close().await.unwrap();
}

#[tokio::test]
async fn test_custom_pool_config_replaces_parsed_settings() {
    let dir = TempDir::new().unwrap();
    let config = PoolConfig {
        max_conns: 4,
        min_conns: 0,
        max_conn_lifetime: Duration::from_secs(60),
        max_conn_idle_time: Duration::from_secs(30),
        acquire_timeout: Duration::from_secs(5),
    };
    let registry = setup_registry(
        &dir,
        "&max_connections=9",
        ProviderOptions::new().pool_config(config),
    );
    let cx = Context::background();

    let conn = registry.connect(&cx, "app").await.unwrap();
    let options = sqlite_pool(conn.pool()).options();
    assert_eq!(options.get_max_connections(), 4);
    assert_eq!(options.get_acquire_timeout(), Duration::from_secs(5));

    registry.close().await.unwrap();
}

#[tokio::test]
async fn test_unparsable_connection_string() {
    let registry = PoolRegistry::new(|_| "invalid://connection/string".to_string());
    let err = registry
        .connect(&Context::background(), "testdb")
        .await
        .unwrap_err();

    assert!(matches!(err, DbError::Configuration { .. }));
    assert!(
        err.to_string()
            .starts_with("failed to parse connection string:"),
        "unexpected error: {}",
        err
    );
    assert_eq!(registry.pool_count().await, 0);
}

#[tokio::test]
async fn test_invalid_pool_option_value() {
    let dir = TempDir::new().unwrap();
    let registry = setup_registry(&dir, "&max_connections=lots", ProviderOptions::default());
    let err = registry
        .connect(&Context::background(), "app")
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Configuration { .. }));
}

#[tokio::test]
async fn test_negative_max_conns() {
    let dir = TempDir::new().unwrap();
    let registry = setup_registry(&dir, "", ProviderOptions::new().max_conns(-1));
    let err = registry
        .connect(&Context::background(), "app")
        .await
        .unwrap_err();

    assert!(matches!(err, DbError::PoolCreation { .. }));
    assert!(
        err.to_string()
            .starts_with("failed to create connection pool:")
    );
    assert!(!registry.contains("app").await);
}

#[tokio::test]
async fn test_min_conns_above_max_conns() {
    let dir = TempDir::new().unwrap();
    // SQLite defaults to a single connection
    let registry = setup_registry(&dir, "", ProviderOptions::new().min_conns(2));
    let err = registry
        .connect(&Context::background(), "app")
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::PoolCreation { .. }));
}

#[tokio::test]
async fn test_nonexistent_database() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().to_path_buf();
    let registry =
        PoolRegistry::new(move |name| format!("sqlite:{}/{}.db?mode=ro", root.display(), name));

    let err = registry
        .connect(&Context::background(), "missing")
        .await
        .unwrap_err();

    assert!(matches!(err, DbError::Connectivity { .. }));
    assert!(err.to_string().starts_with("failed to ping database:"));
    assert!(err.is_retryable());
    assert_eq!(registry.pool_count().await, 0);
    assert_eq!(registry.pools_created(), 0);
}

#[tokio::test]
async fn test_cancelled_context() {
    let dir = TempDir::new().unwrap();
    let registry = setup_registry(&dir, "", ProviderOptions::default());

    let cx = Context::background().with_cancel();
    cx.cancel();

    let err = registry.connect(&cx, "app").await.unwrap_err();
    assert!(matches!(err, DbError::Connectivity { .. }));
    assert_eq!(registry.pool_count().await, 0);

    // A fresh context succeeds; nothing was cached by the failed attempt.
    let conn = registry
        .connect(&Context::background(), "app")
        .await
        .unwrap();
    assert_eq!(conn.pool_generation(), 1);
    registry.close().await.unwrap();
}

#[tokio::test]
async fn test_cancelled_query() {
    let dir = TempDir::new().unwrap();
    let registry = setup_registry(&dir, "", ProviderOptions::default());
    let conn = registry
        .connect(&Context::background(), "app")
        .await
        .unwrap();

    let cx = Context::background().with_cancel();
    cx.cancel();
    let err = conn.query_row(&cx, "SELECT 1", &[]).await.unwrap_err();
    assert!(err.to_string().starts_with("failed to query database:"));

    let err = conn.exec(&cx, "SELECT 1", &[]).await.unwrap_err();
    assert!(err.to_string().starts_with("failed to execute statement:"));

    registry.close().await.unwrap();
}

#[tokio::test]
async fn test_pool_reuse() {
    let dir = TempDir::new().unwrap();
    let registry = setup_registry(&dir, "", ProviderOptions::default());
    let cx = Context::background();

    let first = registry.connect(&cx, "app").await.unwrap();
    let second = registry.connect(&cx, "app").await.unwrap();
    let other = registry.connect(&cx, "reports").await.unwrap();

    assert_eq!(first.pool_generation(), second.pool_generation());
    assert_ne!(first.pool_generation(), other.pool_generation());

    let (a, b) = tokio::join!(
        first.query_row(&cx, "SELECT 1 AS v", &[]),
        second.query_row(&cx, "SELECT 2 AS v", &[]),
    );
    assert_eq!(a.unwrap()["v"], serde_json::json!(1));
    assert_eq!(b.unwrap()["v"], serde_json::json!(2));
    assert_eq!(registry.pool_count().await, 2);
    assert_eq!(registry.pools_created(), 2);
    assert_eq!(
        registry.database_names().await,
        vec!["app".to_string(), "reports".to_string()]
    );

    registry.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_connects_create_one_pool() {
    let dir = TempDir::new().unwrap();
    let registry = setup_registry(&dir, "", ProviderOptions::default());

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let registry = registry.clone();
        tasks.push(tokio::spawn(async move {
            registry
                .connect(&Context::background(), "shared")
                .await
                .map(|conn| conn.pool_generation())
        }));
    }

    let mut generations = Vec::new();
    for task in tasks {
        generations.push(task.await.unwrap().unwrap());
    }

    assert_eq!(registry.pools_created(), 1);
    assert!(generations.iter().all(|g| *g == generations[0]));
    assert_eq!(registry.pool_count().await, 1);

    registry.close().await.unwrap();
}

#[tokio::test]
async fn test_close_removes_pool() {
    let dir = TempDir::new().unwrap();
    let registry = setup_registry(&dir, "", ProviderOptions::default());
    let cx = Context::background();

    let conn = registry.connect(&cx, "app").await.unwrap();
    let generation = conn.pool_generation();
    conn.close().await.unwrap();

    assert!(conn.is_closed());
    assert!(!registry.contains("app").await);

    let fresh = registry.connect(&cx, "app").await.unwrap();
    assert_ne!(fresh.pool_generation(), generation);
    let row = fresh.query_row(&cx, "SELECT 2 AS v", &[]).await.unwrap();
    assert_eq!(row["v"], serde_json::json!(2));

    registry.close().await.unwrap();
}

#[tokio::test]
async fn test_double_close_is_safe() {
    let dir = TempDir::new().unwrap();
    let registry = setup_registry(&dir, "", ProviderOptions::default());
    let conn = registry
        .connect(&Context::background(), "app")
        .await
        .unwrap();

    conn.close().await.unwrap();
    conn.close().await.unwrap();
    registry.close().await.unwrap();
    registry.close().await.unwrap();
}

#[tokio::test]
async fn test_handles_closed_in_any_order() {
    let dir = TempDir::new().unwrap();
    let registry = setup_registry(&dir, "", ProviderOptions::default());
    let cx = Context::background();

    let a = registry.connect(&cx, "app").await.unwrap();
    let b = registry.connect(&cx, "app").await.unwrap();
    let c = registry.connect(&cx, "app").await.unwrap();

    b.close().await.unwrap();
    c.close().await.unwrap();
    a.close().await.unwrap();

    assert!(a.is_closed() && b.is_closed() && c.is_closed());
    assert_eq!(registry.pool_count().await, 0);
    registry.close().await.unwrap();
}

#[tokio::test]
async fn test_sibling_unusable_after_close() {
    let dir = TempDir::new().unwrap();
    let registry = setup_registry(&dir, "", ProviderOptions::default());
    let cx = Context::background();

    let first = registry.connect(&cx, "app").await.unwrap();
    let sibling = registry.connect(&cx, "app").await.unwrap();
    first.close().await.unwrap();

    assert!(sibling.is_closed());
    let err = sibling.query_row(&cx, "SELECT 1", &[]).await.unwrap_err();
    assert!(matches!(err, DbError::Connection { .. }));
    assert!(err.suggestion().is_some_and(|s| s.contains("connect again")));

    sibling.close().await.unwrap();
    registry.close().await.unwrap();
}

#[tokio::test]
async fn test_registry_close_closes_all_pools() {
    let dir = TempDir::new().unwrap();
    let registry = setup_registry(&dir, "", ProviderOptions::default());
    let cx = Context::background();

    let app = registry.connect(&cx, "app").await.unwrap();
    let reports = registry.connect(&cx, "reports").await.unwrap();
    // Already torn down through its handle; registry close must skip it
    reports.close().await.unwrap();

    registry.close().await.unwrap();
    assert!(app.is_closed());
    assert_eq!(registry.pool_count().await, 0);

    // Closing a handle after its registry was closed is harmless
    app.close().await.unwrap();

    // The registry stays usable
    let again = registry.connect(&cx, "app").await.unwrap();
    assert_eq!(registry.pools_created(), 3);
    again.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_handle_and_registry_close() {
    let dir = TempDir::new().unwrap();
    let registry = setup_registry(&dir, "", ProviderOptions::default());
    let cx = Context::background();

    for _ in 0..20 {
        let first = Arc::new(registry.connect(&cx, "app").await.unwrap());
        let sibling = Arc::new(registry.connect(&cx, "app").await.unwrap());

        let mut tasks = Vec::new();
        for conn in [&first, &sibling, &first] {
            let conn = Arc::clone(conn);
            tasks.push(tokio::spawn(async move { conn.close().await }));
        }
        let shared = registry.clone();
        tasks.push(tokio::spawn(async move { shared.close().await }));

        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert!(first.is_closed() && sibling.is_closed());
        assert_eq!(registry.pool_count().await, 0);
    }

    let fresh = registry.connect(&cx, "app").await.unwrap();
    let row = fresh.query_row(&cx, "SELECT 1 AS v", &[]).await.unwrap();
    assert_eq!(row["v"], serde_json::json!(1));
    assert_eq!(registry.pools_created(), 21);
    registry.close().await.unwrap();
}

#[tokio::test]
async fn test_acquire_timeout_reports_configured_limit() {
    let dir = TempDir::new().unwrap();
    let registry = setup_registry(&dir, "&acquire_timeout=1", ProviderOptions::default());
    let cx = Context::background();
    let conn = registry.connect(&cx, "busy").await.unwrap();

    // SQLite pools hold a single connection by default
    let held = sqlite_pool(conn.pool()).acquire().await.unwrap();
    let err = conn.query_row(&cx, "SELECT 1", &[]).await.unwrap_err();
    assert!(matches!(err, DbError::Timeout { elapsed_secs: 1, .. }));
    assert_eq!(
        err.to_string(),
        "Timeout: connection pool acquire exceeded 1s"
    );
    assert!(err.is_retryable());

    drop(held);
    registry.close().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_timeout_reported() {
    let dir = TempDir::new().unwrap();
    let registry = setup_registry(
        &dir,
        "",
        ProviderOptions::new().shutdown_timeout(Duration::from_millis(100)),
    );
    let conn = registry
        .connect(&Context::background(), "busy")
        .await
        .unwrap();

    let held = sqlite_pool(conn.pool()).acquire().await.unwrap();
    let err = conn.close().await.unwrap_err();
    assert!(matches!(err, DbError::Shutdown { .. }));
    assert!(err.to_string().contains("busy"));

    // Evicted even though shutdown did not finish in time
    assert!(!registry.contains("busy").await);
    drop(held);

    // Handle still counts as closed
    conn.close().await.unwrap();
}

/// Generic code written against the provider traits works with the registry.
async fn count_rows<P: ConnectionProvider>(provider: &P, database: &str) -> i64 {
    let cx = Context::background();
    let conn = provider.connect(&cx, database).await.unwrap();
    conn.exec(&cx, "CREATE TABLE IF NOT EXISTS t (x INTEGER)", &[])
        .await
        .unwrap();
    conn.exec(&cx, "INSERT INTO t (x) VALUES (?)", &[QueryParam::Int(7)])
        .await
        .unwrap();
    let row = conn
        .query_row(&cx, "SELECT COUNT(*) AS n FROM t", &[])
        .await
        .unwrap();
    conn.close().await.unwrap();
    row["n"].as_i64().unwrap()
}

#[tokio::test]
async fn test_provider_traits() {
    let dir = TempDir::new().unwrap();
    let registry = setup_registry(&dir, "", ProviderOptions::default());

    assert_eq!(count_rows(&registry, "app").await, 1);
    // Data lives in the file, not the pool
    assert_eq!(count_rows(&registry, "app").await, 2);

    ConnectionProvider::close(&registry).await.unwrap();
}
