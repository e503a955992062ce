//! Scenarios for the worker-pool orchestrator.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use datamaster_collector_lib::collector::{
    CheckpointStore, CollectOptions, CollectionCheckpoint, CollectionError, CollectionPolicy, CollectionProgress,
    ParallelOrchestrator, ProgressObserver, RateLimiter,
};
use datamaster_collector_lib::domain::{CollectionStore, PhoneSource, RunStatus, StoreProvider};
use datamaster_collector_lib::infrastructure::{MemoryStore, SqlitePhoneStore};
use datamaster_collector_lib::test_utils::{RecordingObserver, ScriptedSource, shared};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn clients(count: i64) -> ScriptedSource {
    (1..=count).fold(ScriptedSource::new(), |source, id| {
        let phone = format!("+7916200{id:04}");
        source
            .client(id, &format!("client-{id}"))
            .project(id, id * 10, "main")
            .pages(id * 10, &[&[phone.as_str()]])
    })
}

/// Records how many processed clients the checkpoint on disk held at each
/// progress report.
struct CheckpointWatcher {
    path: PathBuf,
    seen: Mutex<Vec<Option<usize>>>,
}

impl CheckpointWatcher {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            seen: Mutex::new(Vec::new()),
        }
    }

    fn seen(&self) -> Vec<Option<usize>> {
        self.seen.lock().unwrap().clone()
    }
}

impl ProgressObserver for CheckpointWatcher {
    fn on_progress(&self, _progress: &CollectionProgress) {
        let on_disk = std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|json| serde_json::from_str::<CollectionCheckpoint>(&json).ok())
            .map(|checkpoint| checkpoint.processed_client_ids.len());
        self.seen.lock().unwrap().push(on_disk);
    }
}

fn pool(
    source: Arc<dyn PhoneSource>,
    stores: Arc<dyn StoreProvider>,
    dir: &TempDir,
    workers: usize,
) -> ParallelOrchestrator {
    ParallelOrchestrator::new(
        source,
        stores,
        CheckpointStore::new(dir.path().join("state.json")),
        Arc::new(RateLimiter::unlimited()),
        workers,
    )
}

#[tokio::test(start_paused = true)]
async fn every_client_is_collected_within_the_worker_bound() {
    let dir = TempDir::new().unwrap();
    let store = MemoryStore::new();
    let (source, source_dyn) = shared(clients(6).latency(Duration::from_millis(20)));

    let outcome = pool(source_dyn, Arc::new(store.clone()), &dir, 3)
        .collect(&CollectOptions::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.clients_processed(), 6);
    assert_eq!(outcome.stats.total_phone_observations, 6);
    assert_eq!(outcome.stats.new_phones, 6);
    assert_eq!(store.phones().await.len(), 6);

    let in_flight = source.max_in_flight();
    assert!(in_flight <= 3, "{in_flight} calls ran at once with 3 workers");
    assert!(in_flight > 1, "workers never overlapped");
}

#[tokio::test]
async fn zero_workers_falls_back_to_one() {
    let dir = TempDir::new().unwrap();
    let (_, source_dyn) = shared(clients(1));
    let orchestrator = pool(source_dyn, Arc::new(MemoryStore::new()), &dir, 0);
    assert_eq!(orchestrator.workers(), 1);
    assert_eq!(orchestrator.active_workers(), 0);
}

#[tokio::test]
async fn one_failing_client_does_not_affect_the_others() {
    let dir = TempDir::new().unwrap();
    let store = MemoryStore::new();
    let (_, source_dyn) = shared(clients(4).failing_client(3));

    let outcome = pool(source_dyn, Arc::new(store.clone()), &dir, 2)
        .collect(&CollectOptions::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.stats.error_count, 1);
    assert_eq!(outcome.processed_client_ids.iter().copied().collect::<Vec<_>>(), vec![1, 2, 4]);
    assert_eq!(outcome.stats.total_phone_observations, 3);
}

#[tokio::test(start_paused = true)]
async fn progress_reports_carry_the_active_worker_count() {
    let dir = TempDir::new().unwrap();
    let observer = Arc::new(RecordingObserver::default());
    let (_, source_dyn) = shared(clients(4).latency(Duration::from_millis(5)));

    pool(source_dyn, Arc::new(MemoryStore::new()), &dir, 2)
        .with_progress_observer(observer.clone())
        .collect(&CollectOptions::default(), &CancellationToken::new())
        .await
        .unwrap();

    let reports = observer.reports();
    assert_eq!(reports.len(), 4);
    assert!(reports.iter().all(|r| r.active_workers.is_some_and(|n| n <= 2)));
    assert!(reports.windows(2).all(|pair| pair[0].processed < pair[1].processed));
    assert_eq!(reports.last().map(|r| r.total), Some(4));
}

#[tokio::test(start_paused = true)]
async fn stop_drains_running_units_and_resume_finishes_the_rest() {
    let dir = TempDir::new().unwrap();
    let store = MemoryStore::new();
    let checkpoints = CheckpointStore::new(dir.path().join("state.json"));
    let cancel = CancellationToken::new();
    let (source, source_dyn) = shared(
        clients(5)
            .latency(Duration::from_millis(10))
            .cancel_after_pages(1, cancel.clone()),
    );

    let orchestrator = ParallelOrchestrator::new(
        source_dyn,
        Arc::new(store.clone()),
        checkpoints.clone(),
        Arc::new(RateLimiter::unlimited()),
        2,
    )
    .with_policy(CollectionPolicy::parallel());

    let first = orchestrator.collect(&CollectOptions::default(), &cancel).await.unwrap();

    // The two units holding permits when the stop arrived ran to completion.
    assert_eq!(first.status, RunStatus::Stopped);
    assert_eq!(first.clients_processed(), 2);
    assert_eq!(first.stats.total_phone_observations, 2);
    assert_eq!(store.run(first.run_id).await.unwrap().status, RunStatus::Stopped);
    assert_eq!(checkpoints.load().await.unwrap().processed_clients, 2);

    let resume = CollectOptions {
        resume: true,
        ..CollectOptions::default()
    };
    let second = orchestrator.collect(&resume, &CancellationToken::new()).await.unwrap();

    assert!(second.resumed);
    assert_eq!(second.run_id, first.run_id);
    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(second.clients_processed(), 5);
    assert_eq!(second.stats.total_phone_observations, 5);

    let mut visited = source.project_calls().await;
    visited.sort_unstable();
    assert_eq!(visited, vec![1, 2, 3, 4, 5]);
    assert!(!checkpoints.exists().await);
}

#[tokio::test]
async fn client_listing_failure_is_fatal() {
    let dir = TempDir::new().unwrap();
    let store = MemoryStore::new();
    let (_, source_dyn) = shared(clients(2).failing_client_listing());

    let result = pool(source_dyn, Arc::new(store.clone()), &dir, 4)
        .collect(&CollectOptions::default(), &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(CollectionError::ClientListing(_))));
    assert_eq!(store.run(1).await.unwrap().status, RunStatus::Failed);
    assert!(CheckpointStore::new(dir.path().join("state.json")).exists().await);
}

#[tokio::test]
async fn concurrent_units_share_one_canonical_phone_in_sqlite() {
    let dir = TempDir::new().unwrap();
    let store = SqlitePhoneStore::open(&dir.path().join("phones.db"), 4).await.unwrap();
    let (_, source_dyn) = shared(
        ScriptedSource::new()
            .client(1, "a")
            .client(2, "b")
            .client(3, "c")
            .project(1, 10, "a-main")
            .project(2, 20, "b-main")
            .project(3, 30, "c-main")
            .pages(10, &[&["+7 916 300-00-00"]])
            .pages(20, &[&["8 916 300 00 00"]])
            .pages(30, &[&["79163000000"]]),
    );

    let outcome = pool(source_dyn, Arc::new(store.clone()), &dir, 3)
        .collect(&CollectOptions::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.stats.total_phone_observations, 3);
    assert_eq!(outcome.stats.new_phones, 1);

    let summary = store.store_summary().await.unwrap();
    assert_eq!(summary.phones, 1);
    assert_eq!(summary.links, 3);
    store.close().await;
}

#[tokio::test]
async fn checkpoint_is_saved_every_n_completed_units_during_the_run() {
    let dir = TempDir::new().unwrap();
    let state = dir.path().join("state.json");
    let watcher = Arc::new(CheckpointWatcher::new(state.clone()));
    let checkpoints = CheckpointStore::new(&state);
    let (_, source_dyn) = shared(clients(5));

    let outcome = ParallelOrchestrator::new(
        source_dyn,
        Arc::new(MemoryStore::new()),
        checkpoints.clone(),
        Arc::new(RateLimiter::unlimited()),
        1,
    )
    .with_policy(CollectionPolicy {
        checkpoint_interval: 2,
        notify_interval: 50,
    })
    .with_progress_observer(watcher.clone())
    .collect(&CollectOptions::default(), &CancellationToken::new())
    .await
    .unwrap();

    // A report is emitted before that completion's checkpoint is written.
    assert_eq!(watcher.seen(), vec![None, None, Some(2), Some(2), Some(4)]);
    assert_eq!(outcome.status, RunStatus::Completed);
    assert!(!checkpoints.exists().await);
}

#[tokio::test(start_paused = true)]
async fn stop_after_every_unit_started_still_completes_the_run() {
    let dir = TempDir::new().unwrap();
    let store = MemoryStore::new();
    let checkpoints = CheckpointStore::new(dir.path().join("state.json"));
    let cancel = CancellationToken::new();
    let (_, source_dyn) = shared(
        clients(2)
            .latency(Duration::from_millis(10))
            .cancel_after_pages(1, cancel.clone()),
    );

    let outcome = ParallelOrchestrator::new(
        source_dyn,
        Arc::new(store.clone()),
        checkpoints.clone(),
        Arc::new(RateLimiter::unlimited()),
        2,
    )
    .collect(&CollectOptions::default(), &cancel)
    .await
    .unwrap();

    assert!(cancel.is_cancelled());
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.clients_processed(), 2);
    assert_eq!(store.run(outcome.run_id).await.unwrap().status, RunStatus::Completed);
    assert!(!checkpoints.exists().await);
}

#[tokio::test]
async fn failed_unit_still_counts_the_phones_it_stored() {
    let dir = TempDir::new().unwrap();
    let store = MemoryStore::new();
    let (_, source_dyn) = shared(
        clients(2)
            .client(3, "client-3")
            .project(3, 30, "main")
            .pages(30, &[&["+79162000003"], &["+79162000004"]])
            .failing_page(30, 2),
    );

    let outcome = pool(source_dyn, Arc::new(store.clone()), &dir, 2)
        .collect(&CollectOptions::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.stats.error_count, 1);
    assert_eq!(outcome.processed_client_ids.iter().copied().collect::<Vec<_>>(), vec![1, 2]);
    assert_eq!(outcome.stats.total_phone_observations, 3);
    assert_eq!(outcome.stats.new_phones, 3);
    assert_eq!(store.phones().await.len(), 3);
}
