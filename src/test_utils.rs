//! Test utilities for the phone collector
//!
//! Provides a scripted in-memory [`PhoneSource`] plus recording observers so
//! orchestrator tests can run whole collections without a network.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::collector::{CollectionProgress, Notifier, ProgressObserver, RunSummary};
use crate::domain::{Client, PhoneSource, Project, RawPhoneRecord};

/// One recorded call against a [`ScriptedSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceCall {
    Clients,
    Projects(i64),
    Page { project_id: i64, page: u32 },
}

/// Deterministic source: clients, projects and phone pages are declared up
/// front. Pages past the last scripted one are empty.
#[derive(Default)]
pub struct ScriptedSource {
    clients: Vec<Client>,
    projects: HashMap<i64, Vec<Project>>,
    pages: HashMap<i64, Vec<Vec<RawPhoneRecord>>>,
    failing_clients: HashSet<i64>,
    failing_pages: HashSet<(i64, u32)>,
    fail_client_listing: bool,
    latency: Option<Duration>,
    cancel_after_pages: Option<(usize, CancellationToken)>,
    calls: Mutex<Vec<SourceCall>>,
    page_fetches: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn client(mut self, id: i64, name: &str) -> Self {
        self.clients.push(Client {
            id,
            display_name: name.to_string(),
        });
        self
    }

    #[must_use]
    pub fn project(mut self, client_id: i64, project_id: i64, name: &str) -> Self {
        self.projects.entry(client_id).or_default().push(Project {
            id: project_id,
            name: name.to_string(),
            client_id,
        });
        self
    }

    /// Scripts the phone pages of a project; page 1 is the first inner list.
    #[must_use]
    pub fn pages(mut self, project_id: i64, pages: &[&[&str]]) -> Self {
        let pages = pages
            .iter()
            .enumerate()
            .map(|(page_index, phones)| {
                phones
                    .iter()
                    .map(|phone| RawPhoneRecord::new(*phone, format!("2024-01-{:02} 12:00:00", page_index + 1)))
                    .collect()
            })
            .collect();
        self.pages.insert(project_id, pages);
        self
    }

    /// `list_projects` fails for this client.
    #[must_use]
    pub fn failing_client(mut self, client_id: i64) -> Self {
        self.failing_clients.insert(client_id);
        self
    }

    #[must_use]
    pub fn failing_page(mut self, project_id: i64, page: u32) -> Self {
        self.failing_pages.insert((project_id, page));
        self
    }

    #[must_use]
    pub fn failing_client_listing(mut self) -> Self {
        self.fail_client_listing = true;
        self
    }

    /// Every project and page call sleeps this long.
    #[must_use]
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Cancels `token` once `count` phone pages have been served.
    #[must_use]
    pub fn cancel_after_pages(mut self, count: usize, token: CancellationToken) -> Self {
        self.cancel_after_pages = Some((count, token));
        self
    }

    pub fn client_ids(&self) -> Vec<i64> {
        self.clients.iter().map(|c| c.id).collect()
    }

    pub async fn calls(&self) -> Vec<SourceCall> {
        self.calls.lock().await.clone()
    }

    pub async fn page_calls(&self) -> Vec<(i64, u32)> {
        self.calls
            .lock()
            .await
            .iter()
            .filter_map(|call| match call {
                SourceCall::Page { project_id, page } => Some((*project_id, *page)),
                _ => None,
            })
            .collect()
    }

    /// Clients whose projects were requested, in request order.
    pub async fn project_calls(&self) -> Vec<i64> {
        self.calls
            .lock()
            .await
            .iter()
            .filter_map(|call| match call {
                SourceCall::Projects(client_id) => Some(*client_id),
                _ => None,
            })
            .collect()
    }

    /// Highest number of project/page calls observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self, call: SourceCall) -> InFlight<'_> {
        self.calls.lock().await.push(call);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        InFlight { counter: &self.in_flight }
    }
}

struct InFlight<'a> {
    counter: &'a AtomicUsize,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl PhoneSource for ScriptedSource {
    async fn list_clients(&self) -> Result<Vec<Client>> {
        self.calls.lock().await.push(SourceCall::Clients);
        if self.fail_client_listing {
            return Err(anyhow!("scripted client listing failure"));
        }
        Ok(self.clients.clone())
    }

    async fn list_projects(&self, client_id: i64) -> Result<Vec<Project>> {
        let _in_flight = self.enter(SourceCall::Projects(client_id)).await;
        if self.failing_clients.contains(&client_id) {
            return Err(anyhow!("scripted project failure for client {client_id}"));
        }
        Ok(self.projects.get(&client_id).cloned().unwrap_or_default())
    }

    async fn list_phone_page(&self, project_id: i64, page: u32) -> Result<Vec<RawPhoneRecord>> {
        let _in_flight = self.enter(SourceCall::Page { project_id, page }).await;
        if self.failing_pages.contains(&(project_id, page)) {
            return Err(anyhow!("scripted page failure for project {project_id} page {page}"));
        }

        let served = self.page_fetches.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((after, token)) = &self.cancel_after_pages {
            if served >= *after {
                token.cancel();
            }
        }

        let records = page
            .checked_sub(1)
            .and_then(|index| self.pages.get(&project_id)?.get(index as usize).cloned())
            .unwrap_or_default();
        Ok(records)
    }
}

/// Observer that keeps every progress report.
#[derive(Default)]
pub struct RecordingObserver {
    reports: std::sync::Mutex<Vec<CollectionProgress>>,
}

impl RecordingObserver {
    pub fn reports(&self) -> Vec<CollectionProgress> {
        self.reports.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl ProgressObserver for RecordingObserver {
    fn on_progress(&self, progress: &CollectionProgress) {
        if let Ok(mut reports) = self.reports.lock() {
            reports.push(progress.clone());
        }
    }
}

/// Notification kinds as seen by [`RecordingNotifier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Start { run_id: i64, clients: usize },
    Progress { processed: usize },
    Error { client_id: Option<i64> },
    Finish(RunSummary),
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub async fn sent(&self) -> Vec<Notification> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify_start(&self, run_id: i64, clients_in_scope: usize) {
        self.sent.lock().await.push(Notification::Start {
            run_id,
            clients: clients_in_scope,
        });
    }

    async fn notify_progress(&self, progress: &CollectionProgress) {
        self.sent.lock().await.push(Notification::Progress {
            processed: progress.processed,
        });
    }

    async fn notify_error(&self, _run_id: i64, client_id: Option<i64>, _message: &str) {
        self.sent.lock().await.push(Notification::Error { client_id });
    }

    async fn notify_finish(&self, summary: &RunSummary) {
        self.sent.lock().await.push(Notification::Finish(summary.clone()));
    }
}

/// Wraps a source so it can be shared with an orchestrator and inspected afterwards.
pub fn shared(source: ScriptedSource) -> (Arc<ScriptedSource>, Arc<dyn PhoneSource>) {
    let source = Arc::new(source);
    let as_dyn: Arc<dyn PhoneSource> = source.clone();
    (source, as_dyn)
}
