//! Connection string helpers.
//!
//! A registry only knows database names; callers map each name to a
//! connection string. The usual mapping is "same server, different
//! database", which is what [`replace_database`] builds.

use crate::db::settings::DatabaseType;
use crate::error::{DbError, DbResult};

/// Point `base` at `database`.
///
/// - PostgreSQL and MySQL URLs: the path becomes `/<database>`; credentials,
///   host and query options are kept.
/// - SQLite files: the file stem becomes `<database>`; directory, extension
///   and query options are kept. In-memory SQLite strings are returned as-is.
///
/// ```
/// use db_pool_registry::connection_string::replace_database;
///
/// let url = replace_database("postgres://app@localhost:5432/template?sslmode=disable", "orders").unwrap();
/// assert_eq!(url, "postgres://app@localhost:5432/orders?sslmode=disable");
///
/// let file = replace_database("sqlite:/var/data/template.db?mode=rwc", "orders").unwrap();
/// assert_eq!(file, "sqlite:/var/data/orders.db?mode=rwc");
/// ```
pub fn replace_database(base: &str, database: &str) -> DbResult<String> {
    if database.is_empty() || database.contains(['/', '\\', '?', '#']) {
        return Err(DbError::configuration(format!(
            "invalid database name '{}'",
            database
        )));
    }

    match DatabaseType::from_connection_string(base) {
        Some(DatabaseType::SQLite) => Ok(replace_sqlite_file(base, database)),
        Some(_) => {
            let mut url = url::Url::parse(base)
                .map_err(|e| DbError::configuration(format!("invalid base URL: {}", e)))?;

            // Strip existing path and set only the new database
            url.set_path(&format!("/{}", database));
            Ok(url.to_string())
        }
        None => {
            let scheme = base.split_once(':').map_or(base, |(scheme, _)| scheme);
            Err(DbError::configuration(format!(
                "unsupported database scheme '{}'",
                scheme
            )))
        }
    }
}

fn replace_sqlite_file(base: &str, database: &str) -> String {
    let (prefix, rest) = if let Some(rest) = base.strip_prefix("sqlite://") {
        ("sqlite://", rest)
    } else {
        // from_connection_string guarantees the prefix (case-insensitive)
        base.split_at("sqlite:".len())
    };

    let (path, query) = match rest.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (rest, None),
    };

    if path.is_empty() || path == ":memory:" {
        return base.to_string();
    }

    let (dir, file) = match path.rfind('/') {
        Some(idx) => path.split_at(idx + 1),
        None => ("", path),
    };
    let extension = match file.rfind('.') {
        Some(idx) if idx > 0 => &file[idx..],
        _ => "",
    };

    let mut out = format!("{}{}{}{}", prefix, dir, database, extension);
    if let Some(query) = query {
        out.push('?');
        out.push_str(query);
    }
    out
}
