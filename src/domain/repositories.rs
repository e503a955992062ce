//! Collaborator interfaces for phone collection
//!
//! Contains the trait definitions the orchestrators are written against:
//! the remote source, the persistent store and the store handle provider.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::domain::entities::{
    CanonicalPhone, Client, NewPhone, PhoneInsert, Project, ProjectPhoneLink, RawPhoneRecord,
    RunRecord, RunStatus, StoreSummary,
};
use crate::domain::run_stats::RunStats;

/// Remote API the dataset is pulled from.
///
/// Implementations own their retry/backoff; an error surfacing from any of
/// these calls is treated as one failure of the current unit of work.
#[async_trait]
pub trait PhoneSource: Send + Sync {
    async fn list_clients(&self) -> Result<Vec<Client>>;
    async fn list_projects(&self, client_id: i64) -> Result<Vec<Project>>;

    /// Pages start at 1. An empty page is the only end-of-data signal.
    async fn list_phone_page(&self, project_id: i64, page: u32) -> Result<Vec<RawPhoneRecord>>;
}

/// Persistent store. Every operation is individually transactional and the
/// upserts/links are idempotent.
#[async_trait]
pub trait CollectionStore: Send + Sync {
    // Collected data
    async fn upsert_client(&self, client: &Client) -> Result<()>;
    async fn upsert_project(&self, project: &Project) -> Result<()>;
    async fn find_phone_by_canonical(&self, e164: &str) -> Result<Option<CanonicalPhone>>;
    async fn insert_phone(&self, phone: &NewPhone<'_>) -> Result<PhoneInsert>;
    async fn link_project_phone(&self, link: &ProjectPhoneLink) -> Result<()>;

    // Run lifecycle
    async fn create_run(&self) -> Result<i64>;

    /// Puts a previously interrupted run back into `running`.
    /// Returns false when the run is unknown or already completed.
    async fn resume_run(&self, run_id: i64) -> Result<bool>;

    /// Writes stats and status. A run that already left `running` is not modified.
    async fn update_run_status(&self, run_id: i64, stats: &RunStats, status: RunStatus) -> Result<()>;

    // Reporting
    async fn store_summary(&self) -> Result<StoreSummary>;
    async fn recent_runs(&self, limit: u32) -> Result<Vec<RunRecord>>;
}

/// Hands out store handles to parallel workers. A single handle is not
/// assumed to be safe to share between workers.
#[async_trait]
pub trait StoreProvider: Send + Sync {
    async fn open_handle(&self) -> Result<Arc<dyn CollectionStore>>;
}
