// Database connection and pool management
// This module handles SQLite database connections using sqlx

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use tracing::info;

pub struct DatabaseConnection {
    pool: SqlitePool,
}

impl DatabaseConnection {
    /// Opens (creating if needed) the database file in WAL mode.
    pub async fn new(db_path: &Path, max_connections: u32) -> Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create database directory {}", parent.display()))?;
        }

        // WAL lets readers proceed while one worker writes
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(10))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open database {}", db_path.display()))?;

        info!("🗄️ Database opened: {}", db_path.display());
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn into_pool(self) -> SqlitePool {
        self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        let create_runs_sql = r"
            CREATE TABLE IF NOT EXISTS runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                status TEXT NOT NULL DEFAULT 'running'
                    CHECK (status IN ('running', 'completed', 'stopped', 'failed')),
                started_at DATETIME NOT NULL,
                completed_at DATETIME,
                total_phone_observations INTEGER NOT NULL DEFAULT 0,
                new_phones INTEGER NOT NULL DEFAULT 0,
                error_count INTEGER NOT NULL DEFAULT 0,
                projects_count INTEGER NOT NULL DEFAULT 0
            )
        ";

        let create_clients_sql = r"
            CREATE TABLE IF NOT EXISTS clients (
                id INTEGER PRIMARY KEY,
                display_name TEXT NOT NULL,
                updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
        ";

        let create_projects_sql = r"
            CREATE TABLE IF NOT EXISTS projects (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                client_id INTEGER NOT NULL,
                updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY (client_id) REFERENCES clients (id)
            )
        ";

        let create_phones_sql = r"
            CREATE TABLE IF NOT EXISTS phones (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                phone TEXT NOT NULL UNIQUE,
                original_format TEXT NOT NULL,
                first_run_id INTEGER NOT NULL,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY (first_run_id) REFERENCES runs (id)
            )
        ";

        let create_project_phones_sql = r"
            CREATE TABLE IF NOT EXISTS project_phones (
                project_id INTEGER NOT NULL,
                phone_id INTEGER NOT NULL,
                run_id INTEGER NOT NULL,
                created_at_api TEXT NOT NULL DEFAULT '',
                PRIMARY KEY (project_id, phone_id, run_id),
                FOREIGN KEY (project_id) REFERENCES projects (id),
                FOREIGN KEY (phone_id) REFERENCES phones (id),
                FOREIGN KEY (run_id) REFERENCES runs (id)
            )
        ";

        let create_indexes_sql = r"
            CREATE INDEX IF NOT EXISTS idx_projects_client_id ON projects (client_id);
            CREATE INDEX IF NOT EXISTS idx_project_phones_phone_id ON project_phones (phone_id);
            CREATE INDEX IF NOT EXISTS idx_project_phones_run_id ON project_phones (run_id);
            CREATE INDEX IF NOT EXISTS idx_runs_status ON runs (status);
        ";

        for statement in [
            create_runs_sql,
            create_clients_sql,
            create_projects_sql,
            create_phones_sql,
            create_project_phones_sql,
            create_indexes_sql,
        ] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("Failed to apply schema")?;
        }

        Ok(())
    }
}
