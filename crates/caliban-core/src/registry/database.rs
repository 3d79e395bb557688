//! Database connection and schema management for the registry.

use std::path::Path;
use std::time::Duration;

use rusqlite::Connection;
use tracing::debug;

use crate::registry::error::RegistryResult;

/// How long a second process waits on the SQLite file lock before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Registry database wrapper.
///
/// Manages the SQLite connection and schema initialization. Concurrent
/// mutators on the same host serialize on SQLite's file lock; the busy
/// timeout makes the second writer wait rather than fail fast.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens the registry database at the given path, creating parent
    /// directories and the schema as needed.
    ///
    /// # Errors
    /// * `RegistryError::Io` - if the parent directory cannot be created
    /// * `RegistryError::Connection` - if the connection or schema fails
    pub fn open(path: &Path) -> RegistryResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.configure()?;
        db.init_schema()?;
        Ok(db)
    }

    /// Opens an in-memory database for testing.
    pub fn open_in_memory() -> RegistryResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.configure()?;
        db.init_schema()?;
        Ok(db)
    }

    /// Gets a reference to the underlying connection.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Gets a mutable reference to the underlying connection.
    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    fn configure(&self) -> RegistryResult<()> {
        self.conn.busy_timeout(BUSY_TIMEOUT)?;
        self.conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(())
    }

    /// Initializes the registry schema. Idempotent; existing tables are
    /// untouched, so reopening a populated database is safe.
    fn init_schema(&self) -> RegistryResult<()> {
        debug!("Initializing registry schema");

        self.conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS experiment_groups (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user TEXT NOT NULL,
                name TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (user, name)
            )
            "#,
            [],
        )?;

        self.conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS containers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                image_reference TEXT NOT NULL UNIQUE,
                mode TEXT NOT NULL,
                build_context_path TEXT NOT NULL,
                extra_dirs_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
            [],
        )?;

        self.conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS experiments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                group_id INTEGER NOT NULL,
                container_id INTEGER NOT NULL,
                entrypoint_json TEXT NOT NULL,
                args_json TEXT NOT NULL,
                kwargs_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (group_id, container_id, entrypoint_json, args_json, kwargs_json),
                FOREIGN KEY (group_id) REFERENCES experiment_groups(id),
                FOREIGN KEY (container_id) REFERENCES containers(id)
            )
            "#,
            [],
        )?;

        self.conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                experiment_id INTEGER NOT NULL,
                backend TEXT NOT NULL,
                backend_handle TEXT NOT NULL,
                details_json TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (experiment_id) REFERENCES experiments(id)
            )
            "#,
            [],
        )?;

        self.conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS job_status_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id INTEGER NOT NULL,
                status TEXT NOT NULL,
                observed_at TEXT NOT NULL,
                message TEXT,
                FOREIGN KEY (job_id) REFERENCES jobs(id)
            )
            "#,
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_experiments_group_id ON experiments(group_id)",
            [],
        )?;
        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_jobs_experiment_id ON jobs(experiment_id)",
            [],
        )?;
        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_job_status_history_job_id ON job_status_history(job_id)",
            [],
        )?;

        Ok(())
    }

    /// Runs a transaction with the provided closure, committing on `Ok` and
    /// rolling back on `Err` so no partial writes survive a failure.
    pub fn transaction<F, R>(&mut self, f: F) -> RegistryResult<R>
    where
        F: FnOnce(&rusqlite::Transaction) -> RegistryResult<R>,
    {
        let tx = self.conn.transaction()?;
        match f(&tx) {
            Ok(result) => {
                tx.commit()?;
                Ok(result)
            }
            Err(e) => {
                tx.rollback()?;
                Err(e)
            }
        }
    }
}
