//! SQL health query probe.

use std::sync::Once;
use std::time::{Duration, Instant};

use sqlx::AnyConnection;
use sqlx::Connection;

use super::RawResult;
use crate::db::SqlSettings;

static INSTALL_DRIVERS: Once = Once::new();

/// Execute the monitor's health query and report whether it succeeded.
///
/// `sqlite://` targets go through rusqlite on the blocking pool; everything
/// else uses sqlx's runtime-selected driver.
pub async fn run_sql_check(settings: &SqlSettings, timeout: Duration) -> RawResult {
    let start = Instant::now();

    let outcome = tokio::time::timeout(timeout, execute(settings)).await;
    let response_time = start.elapsed().as_secs_f64() * 1000.0;

    match outcome {
        Ok(Ok(rows)) => RawResult::Sql { ok: true, rows, response_time, error: None },
        Ok(Err(e)) => {
            tracing::debug!(query = %settings.query, "sql check failed: {}", e);
            RawResult::Sql { ok: false, rows: 0, response_time, error: Some(e) }
        }
        Err(_) => RawResult::Sql {
            ok: false,
            rows: 0,
            response_time,
            error: Some(format!("query timed out after {:?}", timeout)),
        },
    }
}

async fn execute(settings: &SqlSettings) -> Result<usize, String> {
    if let Some(path) = sqlite_path(&settings.connection) {
        let path = path.to_string();
        let query = settings.query.clone();
        return tokio::task::spawn_blocking(move || query_sqlite(&path, &query))
            .await
            .map_err(|e| e.to_string())?;
    }

    INSTALL_DRIVERS.call_once(sqlx::any::install_default_drivers);

    let mut conn = AnyConnection::connect(&settings.connection)
        .await
        .map_err(|e| e.to_string())?;
    let rows = sqlx::query(&settings.query)
        .fetch_all(&mut conn)
        .await
        .map_err(|e| e.to_string())?;
    let _ = conn.close().await;

    Ok(rows.len())
}

fn sqlite_path(connection: &str) -> Option<&str> {
    connection
        .strip_prefix("sqlite://")
        .or_else(|| connection.strip_prefix("sqlite:"))
}

fn query_sqlite(path: &str, query: &str) -> Result<usize, String> {
    let conn = rusqlite::Connection::open(path).map_err(|e| e.to_string())?;
    let mut stmt = conn.prepare(query).map_err(|e| e.to_string())?;
    let mut rows = stmt.query([]).map_err(|e| e.to_string())?;

    let mut count = 0;
    while rows.next().map_err(|e| e.to_string())?.is_some() {
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(connection: String, query: &str) -> SqlSettings {
        SqlSettings {
            connection,
            query: query.to_string(),
            timeout_ms: None,
        }
    }

    #[tokio::test]
    async fn test_sql_check_sqlite_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("health.db");
        {
            let conn = rusqlite::Connection::open(&path).unwrap();
            conn.execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (1), (2);")
                .unwrap();
        }

        let s = settings(format!("sqlite://{}", path.display()), "SELECT x FROM t");
        match run_sql_check(&s, Duration::from_secs(5)).await {
            RawResult::Sql { ok, rows, error, .. } => {
                assert!(ok, "unexpected error {:?}", error);
                assert_eq!(rows, 2);
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sql_check_bad_query() {
        let s = settings("sqlite://:memory:".to_string(), "SELECT FROM nowhere");
        match run_sql_check(&s, Duration::from_secs(5)).await {
            RawResult::Sql { ok, error, .. } => {
                assert!(!ok);
                assert!(error.is_some());
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_sqlite_path() {
        assert_eq!(sqlite_path("sqlite:///tmp/a.db"), Some("/tmp/a.db"));
        assert_eq!(sqlite_path("sqlite::memory:"), Some(":memory:"));
        assert_eq!(sqlite_path("postgres://localhost/db"), None);
    }
}
