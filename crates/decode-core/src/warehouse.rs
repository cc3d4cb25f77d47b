use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, Connection, OpenFlags};
use tracing::info;

use crate::config::PoolConfig;
use crate::pool::{ConnectionPool, Connector, PoolError, PoolSettings, PooledConnection};
use crate::workspace::is_safe_token;

/// Opens sessions against the local SQLite warehouse file.
pub struct SqliteConnector {
    path: PathBuf,
}

impl SqliteConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Each user schema is a database file beside the main one.
    pub fn schema_path(&self, schema: &str) -> PathBuf {
        let dir = self.path.parent().unwrap_or_else(|| Path::new(""));
        dir.join(format!("{schema}.db"))
    }
}

impl Connector for SqliteConnector {
    type Connection = Connection;
    type Error = rusqlite::Error;

    fn connect(&self) -> Result<Connection, rusqlite::Error> {
        Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
    }

    fn set_statement_timeout(
        &self,
        conn: &mut Connection,
        timeout: Duration,
    ) -> Result<(), rusqlite::Error> {
        conn.busy_timeout(timeout)
    }

    fn close(&self, conn: Connection) -> Result<(), rusqlite::Error> {
        conn.close().map_err(|(_, err)| err)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WarehouseError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("warehouse query failed: {0}")]
    Query(#[from] rusqlite::Error),
    #[error("invalid schema name: {0}")]
    InvalidSchema(String),
}

/// Pooled read access to the warehouse.
pub struct Warehouse {
    pool: ConnectionPool<SqliteConnector>,
}

impl Warehouse {
    pub fn open(cfg: &PoolConfig) -> Self {
        Self::with_pool(ConnectionPool::new(
            SqliteConnector::new(&cfg.database),
            PoolSettings::from(cfg),
        ))
    }

    pub fn with_pool(pool: ConnectionPool<SqliteConnector>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &ConnectionPool<SqliteConnector> {
        &self.pool
    }

    pub fn ping(&self) -> Result<(), WarehouseError> {
        let conn = self.pool.acquire()?;
        let result = conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0));
        settle(conn, result).map(|_| ())
    }

    /// Create the user's schema if it does not exist yet.
    pub fn ensure_schema(&self, schema: &str) -> Result<(), WarehouseError> {
        let path = self.schema_path(schema)?;
        let existed = path.is_file();
        let conn = self.pool.acquire()?;
        // Writing the header is what puts the file on disk.
        let result = attached(&conn, schema, &path, |conn| {
            conn.execute_batch(&format!("PRAGMA \"{schema}\".user_version = 1"))
        });
        settle(conn, result)?;
        if !existed {
            info!(target: "decode::warehouse", schema, "schema created");
        }
        Ok(())
    }

    /// Tables and views in one user's schema, sorted by name.
    pub fn list_tables(&self, schema: &str) -> Result<Vec<String>, WarehouseError> {
        let path = self.schema_path(schema)?;
        if !path.is_file() {
            return Ok(Vec::new());
        }
        let conn = self.pool.acquire()?;
        let result = attached(&conn, schema, &path, |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT name FROM \"{schema}\".sqlite_master WHERE type IN ('table', 'view') \
                 AND name NOT LIKE 'sqlite_%' ORDER BY name"
            ))?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<Vec<_>, _>>()
        });
        settle(conn, result)
    }

    fn schema_path(&self, schema: &str) -> Result<PathBuf, WarehouseError> {
        if !is_safe_token(schema) {
            return Err(WarehouseError::InvalidSchema(schema.to_string()));
        }
        Ok(self.pool.connector().schema_path(schema))
    }

    pub fn close(&self) {
        self.pool.close_all();
    }
}

/// Run `f` with `schema` attached, detaching again so pooled sessions stay clean.
fn attached<T>(
    conn: &Connection,
    schema: &str,
    path: &Path,
    f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
) -> rusqlite::Result<T> {
    let file = path.to_string_lossy();
    conn.execute("ATTACH DATABASE ?1 AS ?2", params![&*file, schema])?;
    let result = f(conn);
    let detached = conn.execute("DETACH DATABASE ?1", params![schema]);
    let value = result?;
    detached?;
    Ok(value)
}

/// Return the session to the pool on success, close it on failure.
fn settle<T>(
    conn: PooledConnection<'_, SqliteConnector>,
    result: rusqlite::Result<T>,
) -> Result<T, WarehouseError> {
    match result {
        Ok(value) => Ok(value),
        Err(err) => {
            conn.discard();
            Err(err.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn warehouse(dir: &std::path::Path) -> Warehouse {
        let cfg = PoolConfig {
            database: dir.join("warehouse.db"),
            max_idle: 2,
            ..PoolConfig::default()
        };
        Warehouse::open(&cfg)
    }

    #[test]
    fn tables_are_listed_per_schema() {
        let dir = tempfile::tempdir().expect("tempdir");
        let wh = warehouse(dir.path());
        wh.ping().expect("ping");
        assert!(wh.list_tables("user_7").expect("tables").is_empty());
        assert!(!dir.path().join("user_7.db").exists());

        wh.ensure_schema("user_7").expect("schema");
        wh.ensure_schema("user_7").expect("idempotent");
        assert!(dir.path().join("user_7.db").is_file());
        assert!(wh.list_tables("user_7").expect("tables").is_empty());

        let user = Connection::open(dir.path().join("user_7.db")).expect("open schema");
        user.execute_batch(
            "CREATE TABLE orders (id INTEGER); CREATE VIEW recent AS SELECT * FROM orders;",
        )
        .expect("ddl");
        drop(user);
        {
            let conn = wh.pool().acquire().expect("acquire");
            conn.execute_batch("CREATE TABLE shared_only (id INTEGER);")
                .expect("main ddl");
        }
        wh.ensure_schema("user_8").expect("other schema");

        assert_eq!(
            wh.list_tables("user_7").expect("tables"),
            vec!["orders".to_string(), "recent".to_string()]
        );
        assert!(wh.list_tables("user_8").expect("tables").is_empty());
        assert_eq!(wh.pool().idle_len(), 1);

        let conn = wh.pool().acquire().expect("acquire");
        let attached: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM pragma_database_list WHERE name LIKE 'user_%'",
                [],
                |row| row.get(0),
            )
            .expect("database list");
        assert_eq!(attached, 0);
        drop(conn);

        wh.close();
        assert_eq!(wh.pool().idle_len(), 0);
    }

    #[test]
    fn unsafe_schema_names_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let wh = warehouse(dir.path());
        for bad in ["", "x\"; DROP TABLE t; --", "../escape"] {
            assert!(matches!(
                wh.list_tables(bad),
                Err(WarehouseError::InvalidSchema(_))
            ));
            assert!(matches!(
                wh.ensure_schema(bad),
                Err(WarehouseError::InvalidSchema(_))
            ));
        }
    }
}
