//! In-memory collection store
//!
//! Same contract as the SQLite store, kept in process memory. Backs
//! `collect --dry-run` and the collection scenario tests. Clones share state.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::domain::{
    CanonicalPhone, Client, CollectionStore, NewPhone, PhoneInsert, Project, ProjectPhoneLink,
    RunRecord, RunStats, RunStatus, StoreProvider, StoreSummary,
};

type LinkKey = (i64, i64, i64);

#[derive(Debug, Default)]
struct MemoryState {
    clients: BTreeMap<i64, Client>,
    projects: BTreeMap<i64, Project>,
    phones: BTreeMap<i64, CanonicalPhone>,
    phone_ids: HashMap<String, i64>,
    links: BTreeMap<LinkKey, String>,
    runs: BTreeMap<i64, RunRecord>,
    next_phone_id: i64,
    next_run_id: i64,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn clients(&self) -> Vec<Client> {
        self.state.lock().await.clients.values().cloned().collect()
    }

    pub async fn projects(&self) -> Vec<Project> {
        self.state.lock().await.projects.values().cloned().collect()
    }

    /// Stored phones in insertion order.
    pub async fn phones(&self) -> Vec<CanonicalPhone> {
        self.state.lock().await.phones.values().cloned().collect()
    }

    pub async fn links(&self) -> Vec<ProjectPhoneLink> {
        self.state
            .lock()
            .await
            .links
            .iter()
            .map(|(&(project_id, phone_id, run_id), created)| ProjectPhoneLink {
                project_id,
                phone_id,
                run_id,
                api_created_at: created.clone(),
            })
            .collect()
    }

    pub async fn run(&self, run_id: i64) -> Option<RunRecord> {
        self.state.lock().await.runs.get(&run_id).cloned()
    }
}

#[async_trait]
impl CollectionStore for MemoryStore {
    async fn upsert_client(&self, client: &Client) -> Result<()> {
        self.state.lock().await.clients.insert(client.id, client.clone());
        Ok(())
    }

    async fn upsert_project(&self, project: &Project) -> Result<()> {
        self.state.lock().await.projects.insert(project.id, project.clone());
        Ok(())
    }

    async fn find_phone_by_canonical(&self, e164: &str) -> Result<Option<CanonicalPhone>> {
        let state = self.state.lock().await;
        Ok(state
            .phone_ids
            .get(e164)
            .and_then(|id| state.phones.get(id))
            .cloned())
    }

    async fn insert_phone(&self, phone: &NewPhone<'_>) -> Result<PhoneInsert> {
        let mut state = self.state.lock().await;
        if let Some(&id) = state.phone_ids.get(phone.e164) {
            return Ok(PhoneInsert { id, created: false });
        }

        state.next_phone_id += 1;
        let id = state.next_phone_id;
        state.phone_ids.insert(phone.e164.to_string(), id);
        state.phones.insert(
            id,
            CanonicalPhone {
                id,
                e164: phone.e164.to_string(),
                original_text: phone.original_text.to_string(),
                first_seen_run_id: phone.run_id,
            },
        );
        Ok(PhoneInsert { id, created: true })
    }

    async fn link_project_phone(&self, link: &ProjectPhoneLink) -> Result<()> {
        self.state
            .lock()
            .await
            .links
            .entry((link.project_id, link.phone_id, link.run_id))
            .or_insert_with(|| link.api_created_at.clone());
        Ok(())
    }

    async fn create_run(&self) -> Result<i64> {
        let mut state = self.state.lock().await;
        state.next_run_id += 1;
        let id = state.next_run_id;
        state.runs.insert(
            id,
            RunRecord {
                id,
                status: RunStatus::Running,
                started_at: Utc::now(),
                completed_at: None,
                total_phone_observations: 0,
                new_phones: 0,
                error_count: 0,
            },
        );
        Ok(id)
    }

    async fn resume_run(&self, run_id: i64) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.runs.get_mut(&run_id) {
            Some(run) if run.status.is_resumable() => {
                run.status = RunStatus::Running;
                run.completed_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_run_status(&self, run_id: i64, stats: &RunStats, status: RunStatus) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(run) = state.runs.get_mut(&run_id).filter(|run| run.status == RunStatus::Running) {
            run.status = status;
            run.completed_at = status.is_terminal().then(Utc::now);
            run.total_phone_observations = stats.total_phone_observations;
            run.new_phones = stats.new_phones;
            run.error_count = stats.error_count;
        }
        Ok(())
    }

    async fn store_summary(&self) -> Result<StoreSummary> {
        let state = self.state.lock().await;
        Ok(StoreSummary {
            clients: state.clients.len() as u64,
            projects: state.projects.len() as u64,
            phones: state.phones.len() as u64,
            links: state.links.len() as u64,
            last_run: state.runs.values().next_back().cloned(),
        })
    }

    async fn recent_runs(&self, limit: u32) -> Result<Vec<RunRecord>> {
        let state = self.state.lock().await;
        Ok(state.runs.values().rev().take(limit as usize).cloned().collect())
    }
}

#[async_trait]
impl StoreProvider for MemoryStore {
    async fn open_handle(&self) -> Result<Arc<dyn CollectionStore>> {
        Ok(Arc::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn phone_dedup_is_global() {
        let store = MemoryStore::new();
        let first = store
            .insert_phone(&NewPhone { e164: "+79161234567", original_text: "a", run_id: 1 })
            .await
            .unwrap();
        let again = store
            .insert_phone(&NewPhone { e164: "+79161234567", original_text: "b", run_id: 2 })
            .await
            .unwrap();

        assert!(first.created);
        assert_eq!(again, PhoneInsert { id: first.id, created: false });
        assert_eq!(store.phones().await.len(), 1);
        assert_eq!(store.phones().await[0].original_text, "a");
    }

    #[tokio::test]
    async fn run_status_is_monotonic() {
        let store = MemoryStore::new();
        let run_id = store.create_run().await.unwrap();

        store.update_run_status(run_id, &RunStats::default(), RunStatus::Stopped).await.unwrap();
        store.update_run_status(run_id, &RunStats::default(), RunStatus::Completed).await.unwrap();
        assert_eq!(store.run(run_id).await.unwrap().status, RunStatus::Stopped);

        assert!(store.resume_run(run_id).await.unwrap());
        store.update_run_status(run_id, &RunStats::default(), RunStatus::Completed).await.unwrap();
        assert_eq!(store.run(run_id).await.unwrap().status, RunStatus::Completed);
        assert!(!store.resume_run(run_id).await.unwrap());
    }

    #[tokio::test]
    async fn clones_share_state() {
        let store = MemoryStore::new();
        let handle = store.open_handle().await.unwrap();
        handle.create_run().await.unwrap();
        assert_eq!(store.recent_runs(5).await.unwrap().len(), 1);
    }
}
