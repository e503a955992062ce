//! SQLite implementation of the collection store
//!
//! Every method is a single statement (or a statement followed by a lookup),
//! so each write commits on its own and a crash loses at most the write in
//! flight. Phone uniqueness is enforced by the `UNIQUE (phone)` constraint;
//! racing inserts of the same number resolve to one row.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::domain::{
    CanonicalPhone, Client, CollectionStore, NewPhone, PhoneInsert, Project, ProjectPhoneLink,
    RunRecord, RunStats, RunStatus, StoreProvider, StoreSummary,
};
use crate::infrastructure::database_connection::DatabaseConnection;

const RUN_COLUMNS: &str = "id, status, started_at, completed_at, total_phone_observations, new_phones, error_count";

#[derive(Clone)]
pub struct SqlitePhoneStore {
    pool: SqlitePool,
}

impl SqlitePhoneStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Opens the database file and applies the schema.
    pub async fn open(db_path: &Path, max_connections: u32) -> Result<Self> {
        let connection = DatabaseConnection::new(db_path, max_connections).await?;
        connection.migrate().await?;
        Ok(Self::new(connection.into_pool()))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn count(&self, table: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("Failed to count {table}"))?;
        Ok(to_u64(count))
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn run_from_row(row: &SqliteRow) -> Result<RunRecord> {
    let status: String = row.try_get("status")?;
    Ok(RunRecord {
        id: row.try_get("id")?,
        status: status.parse()?,
        started_at: row.try_get::<DateTime<Utc>, _>("started_at")?,
        completed_at: row.try_get::<Option<DateTime<Utc>>, _>("completed_at")?,
        total_phone_observations: to_u64(row.try_get("total_phone_observations")?),
        new_phones: to_u64(row.try_get("new_phones")?),
        error_count: to_u64(row.try_get("error_count")?),
    })
}

#[async_trait]
impl CollectionStore for SqlitePhoneStore {
    async fn upsert_client(&self, client: &Client) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO clients (id, display_name) VALUES (?, ?)
            ON CONFLICT (id) DO UPDATE SET
                display_name = excluded.display_name,
                updated_at = CURRENT_TIMESTAMP
            ",
        )
        .bind(client.id)
        .bind(&client.display_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_project(&self, project: &Project) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO projects (id, name, client_id) VALUES (?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                name = excluded.name,
                client_id = excluded.client_id,
                updated_at = CURRENT_TIMESTAMP
            ",
        )
        .bind(project.id)
        .bind(&project.name)
        .bind(project.client_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_phone_by_canonical(&self, e164: &str) -> Result<Option<CanonicalPhone>> {
        let row = sqlx::query("SELECT id, phone, original_format, first_run_id FROM phones WHERE phone = ?")
            .bind(e164)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| {
            Ok(CanonicalPhone {
                id: row.try_get("id")?,
                e164: row.try_get("phone")?,
                original_text: row.try_get("original_format")?,
                first_seen_run_id: row.try_get("first_run_id")?,
            })
        })
        .transpose()
    }

    async fn insert_phone(&self, phone: &NewPhone<'_>) -> Result<PhoneInsert> {
        let result = sqlx::query(
            r"
            INSERT INTO phones (phone, original_format, first_run_id) VALUES (?, ?, ?)
            ON CONFLICT (phone) DO NOTHING
            ",
        )
        .bind(phone.e164)
        .bind(phone.original_text)
        .bind(phone.run_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(PhoneInsert {
                id: result.last_insert_rowid(),
                created: true,
            });
        }

        // Lost the race to another writer
        let id: i64 = sqlx::query_scalar("SELECT id FROM phones WHERE phone = ?")
            .bind(phone.e164)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("Phone {} vanished after a conflicting insert", phone.e164))?;
        debug!("Phone {} already stored as {}", phone.e164, id);
        Ok(PhoneInsert { id, created: false })
    }

    async fn link_project_phone(&self, link: &ProjectPhoneLink) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO project_phones (project_id, phone_id, run_id, created_at_api)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (project_id, phone_id, run_id) DO NOTHING
            ",
        )
        .bind(link.project_id)
        .bind(link.phone_id)
        .bind(link.run_id)
        .bind(&link.api_created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_run(&self) -> Result<i64> {
        let result = sqlx::query("INSERT INTO runs (status, started_at) VALUES (?, ?)")
            .bind(RunStatus::Running.as_str())
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .context("Failed to insert run")?;
        Ok(result.last_insert_rowid())
    }

    async fn resume_run(&self, run_id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE runs SET status = ?, completed_at = NULL WHERE id = ? AND status != ?",
        )
        .bind(RunStatus::Running.as_str())
        .bind(run_id)
        .bind(RunStatus::Completed.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_run_status(&self, run_id: i64, stats: &RunStats, status: RunStatus) -> Result<()> {
        let completed_at = status.is_terminal().then(Utc::now);
        let result = sqlx::query(
            r"
            UPDATE runs SET
                status = ?,
                completed_at = ?,
                total_phone_observations = ?,
                new_phones = ?,
                error_count = ?,
                projects_count = ?
            WHERE id = ? AND status = 'running'
            ",
        )
        .bind(status.as_str())
        .bind(completed_at)
        .bind(to_i64(stats.total_phone_observations))
        .bind(to_i64(stats.new_phones))
        .bind(to_i64(stats.error_count))
        .bind(to_i64(stats.projects_count))
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!("Run {} is not running; status {} ignored", run_id, status);
        }
        Ok(())
    }

    async fn store_summary(&self) -> Result<StoreSummary> {
        let last_run = self.recent_runs(1).await?.into_iter().next();
        Ok(StoreSummary {
            clients: self.count("clients").await?,
            projects: self.count("projects").await?,
            phones: self.count("phones").await?,
            links: self.count("project_phones").await?,
            last_run,
        })
    }

    async fn recent_runs(&self, limit: u32) -> Result<Vec<RunRecord>> {
        let rows = sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM runs ORDER BY id DESC LIMIT ?"))
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(run_from_row).collect()
    }
}

#[async_trait]
impl StoreProvider for SqlitePhoneStore {
    /// Handles share the pool; each statement checks out its own connection.
    async fn open_handle(&self) -> Result<Arc<dyn CollectionStore>> {
        Ok(Arc::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{TempDir, tempdir};

    async fn open_store() -> (TempDir, SqlitePhoneStore) {
        let dir = tempdir().unwrap();
        let store = SqlitePhoneStore::open(&dir.path().join("phones.db"), 4).await.unwrap();
        (dir, store)
    }

    async fn seed_project(store: &SqlitePhoneStore) {
        store
            .upsert_client(&Client { id: 1, display_name: "alpha".into() })
            .await
            .unwrap();
        store
            .upsert_project(&Project { id: 10, name: "landing".into(), client_id: 1 })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn upserts_are_idempotent() {
        let (_dir, store) = open_store().await;
        seed_project(&store).await;
        seed_project(&store).await;
        store
            .upsert_client(&Client { id: 1, display_name: "renamed".into() })
            .await
            .unwrap();

        let summary = store.store_summary().await.unwrap();
        assert_eq!(summary.clients, 1);
        assert_eq!(summary.projects, 1);

        let name: String = sqlx::query_scalar("SELECT display_name FROM clients WHERE id = 1")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(name, "renamed");
    }

    #[tokio::test]
    async fn phone_insert_reports_creation_once() {
        let (_dir, store) = open_store().await;
        let run_id = store.create_run().await.unwrap();
        let phone = NewPhone { e164: "+79161234567", original_text: "8 916 123 45 67", run_id };

        let first = store.insert_phone(&phone).await.unwrap();
        let second = store.insert_phone(&phone).await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.id, second.id);

        let found = store.find_phone_by_canonical("+79161234567").await.unwrap().unwrap();
        assert_eq!(found.id, first.id);
        assert_eq!(found.original_text, "8 916 123 45 67");
        assert_eq!(found.first_seen_run_id, run_id);
        assert!(store.find_phone_by_canonical("+70000000000").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_inserts_of_one_number_create_one_row() {
        let (_dir, store) = open_store().await;
        let run_id = store.create_run().await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .insert_phone(&NewPhone { e164: "+79031234567", original_text: "x", run_id })
                    .await
                    .unwrap()
            }));
        }

        let mut created = 0;
        let mut ids = Vec::new();
        for handle in handles {
            let insert = handle.await.unwrap();
            created += usize::from(insert.created);
            ids.push(insert.id);
        }

        assert_eq!(created, 1);
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(store.store_summary().await.unwrap().phones, 1);
    }

    #[tokio::test]
    async fn links_are_unique_per_project_phone_and_run() {
        let (_dir, store) = open_store().await;
        seed_project(&store).await;
        let run_id = store.create_run().await.unwrap();
        let phone = store
            .insert_phone(&NewPhone { e164: "+79161234567", original_text: "x", run_id })
            .await
            .unwrap();

        let link = ProjectPhoneLink {
            project_id: 10,
            phone_id: phone.id,
            run_id,
            api_created_at: "2024-01-01 10:00:00".into(),
        };
        store.link_project_phone(&link).await.unwrap();
        store.link_project_phone(&link).await.unwrap();
        assert_eq!(store.store_summary().await.unwrap().links, 1);

        let next_run = store.create_run().await.unwrap();
        store
            .link_project_phone(&ProjectPhoneLink { run_id: next_run, ..link })
            .await
            .unwrap();
        assert_eq!(store.store_summary().await.unwrap().links, 2);
    }

    #[tokio::test]
    async fn terminal_status_is_never_overwritten() {
        let (_dir, store) = open_store().await;
        let run_id = store.create_run().await.unwrap();
        let stats = RunStats { total_phone_observations: 5, new_phones: 2, error_count: 1, projects_count: 3 };

        store.update_run_status(run_id, &stats, RunStatus::Completed).await.unwrap();
        store
            .update_run_status(run_id, &RunStats::default(), RunStatus::Failed)
            .await
            .unwrap();

        let run = store.recent_runs(1).await.unwrap().remove(0);
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.total_phone_observations, 5);
        assert_eq!(run.error_count, 1);
        assert!(run.completed_at.is_some());

        assert!(!store.resume_run(run_id).await.unwrap());
    }

    #[tokio::test]
    async fn stopped_run_can_be_resumed_and_completed() {
        let (_dir, store) = open_store().await;
        let run_id = store.create_run().await.unwrap();
        store
            .update_run_status(run_id, &RunStats::default(), RunStatus::Stopped)
            .await
            .unwrap();

        assert!(store.resume_run(run_id).await.unwrap());
        let reopened = store.recent_runs(1).await.unwrap().remove(0);
        assert_eq!(reopened.status, RunStatus::Running);
        assert!(reopened.completed_at.is_none());

        store
            .update_run_status(run_id, &RunStats::default(), RunStatus::Completed)
            .await
            .unwrap();
        assert_eq!(store.recent_runs(1).await.unwrap()[0].status, RunStatus::Completed);
        assert!(!store.resume_run(9999).await.unwrap());
    }

    #[tokio::test]
    async fn recent_runs_are_newest_first() {
        let (_dir, store) = open_store().await;
        let first = store.create_run().await.unwrap();
        let second = store.create_run().await.unwrap();

        let runs = store.recent_runs(10).await.unwrap();
        assert_eq!(runs.iter().map(|r| r.id).collect::<Vec<_>>(), vec![second, first]);

        let summary = store.store_summary().await.unwrap();
        assert_eq!(summary.last_run.map(|r| r.id), Some(second));
    }

    #[tokio::test]
    async fn handles_share_the_same_database() {
        let (_dir, store) = open_store().await;
        let handle = store.open_handle().await.unwrap();
        handle
            .upsert_client(&Client { id: 7, display_name: "via handle".into() })
            .await
            .unwrap();
        assert_eq!(store.store_summary().await.unwrap().clients, 1);
    }
}
