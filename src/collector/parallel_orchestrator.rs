//! # Parallel Collection Orchestrator
//!
//! Each client is one unit of work. Units run on a `JoinSet` bounded by a
//! semaphore of `workers` permits and share one [`RateLimiter`], so the
//! outbound request rate is the same as the sequential path.
//!
//! A unit that started always runs to completion. On cancellation the
//! semaphore is closed: queued units are abandoned, running ones are
//! drained and merged, then the run is checkpointed as stopped. A stop that
//! arrives after every unit already had a slot leaves nothing behind, so that
//! run still completes.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::collector::checkpoint::CheckpointStore;
use crate::collector::lifecycle::{self, RunSnapshot};
use crate::collector::normalizer::PhoneNormalizer;
use crate::collector::observers::{CollectionProgress, Notifier, ProgressObserver, RunSummary};
use crate::collector::rate_limiter::RateLimiter;
use crate::collector::stats::{ActiveWorkerGauge, ProcessedClients, SharedRunStats};
use crate::collector::traversal::{self, UnitContext, UnitOutcome, UnitReport};
use crate::collector::{CollectOptions, CollectionError, CollectionOutcome, CollectionPolicy};
use crate::domain::{Client, PhoneSource, RunStatus, StoreProvider, UnitTally};

/// Result of one spawned unit as seen by the driver.
enum UnitRun {
    /// Never got a worker slot before the run was stopped
    Abandoned,
    Ran(UnitReport),
}

pub struct ParallelOrchestrator {
    source: Arc<dyn PhoneSource>,
    stores: Arc<dyn StoreProvider>,
    checkpoints: CheckpointStore,
    rate_limiter: Arc<RateLimiter>,
    workers: usize,
    policy: CollectionPolicy,
    gauge: ActiveWorkerGauge,
    progress: Option<Arc<dyn ProgressObserver>>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl ParallelOrchestrator {
    pub fn new(
        source: Arc<dyn PhoneSource>,
        stores: Arc<dyn StoreProvider>,
        checkpoints: CheckpointStore,
        rate_limiter: Arc<RateLimiter>,
        workers: usize,
    ) -> Self {
        if workers == 0 {
            warn!("Worker count 0 requested; using 1");
        }
        Self {
            source,
            stores,
            checkpoints,
            rate_limiter,
            workers: workers.max(1),
            policy: CollectionPolicy::parallel(),
            gauge: ActiveWorkerGauge::new(),
            progress: None,
            notifier: None,
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: CollectionPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_progress_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.progress = Some(observer);
        self
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Live count of units holding a worker slot.
    #[must_use]
    pub fn active_workers(&self) -> usize {
        self.gauge.current()
    }

    pub async fn collect(
        &self,
        options: &CollectOptions,
        cancel: &CancellationToken,
    ) -> Result<CollectionOutcome, CollectionError> {
        let started = Instant::now();
        let store = self
            .stores
            .open_handle()
            .await
            .context("Failed to open store handle for run bookkeeping")
            .map_err(CollectionError::RunLifecycle)?;
        let start = lifecycle::begin_run(store.as_ref(), &self.checkpoints, options.resume).await?;
        let run_id = start.run_id;
        let resumed = start.resumed;

        self.rate_limiter.wait().await;
        let clients = match self.source.list_clients().await {
            Ok(clients) => lifecycle::scope_clients(clients, options.limit_clients),
            Err(e) => {
                error!("❌ Run {} failed to list clients: {:#}", run_id, e);
                let snapshot = RunSnapshot {
                    run_id,
                    stats: start.stats,
                    processed: start.processed,
                    clients_in_scope: 0,
                };
                lifecycle::conclude(store.as_ref(), &self.checkpoints, &snapshot, RunStatus::Failed).await;
                let outcome = snapshot.into_outcome(RunStatus::Failed, resumed, started);
                if let Some(notifier) = &self.notifier {
                    notifier.notify_error(run_id, None, &format!("{e:#}")).await;
                    notifier.notify_finish(&RunSummary::from(&outcome)).await;
                }
                return Err(CollectionError::ClientListing(e));
            }
        };

        let clients_in_scope = clients.len();
        let stats = SharedRunStats::new(start.stats);
        let processed = ProcessedClients::new(start.processed.iter().copied());
        let pending: Vec<Client> = clients
            .into_iter()
            .filter(|client| !start.processed.contains(&client.id))
            .collect();

        info!(
            "📋 Run {}: {} clients in scope, {} pending, {} workers",
            run_id,
            clients_in_scope,
            pending.len(),
            self.workers
        );
        if let Some(notifier) = &self.notifier {
            notifier.notify_start(run_id, clients_in_scope).await;
        }

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut units = JoinSet::new();
        for client in pending {
            units.spawn(self.spawn_unit(client, run_id, options, &semaphore, cancel));
        }

        let mut stopping = false;
        let mut completed = 0usize;
        let mut left_behind = 0usize;
        loop {
            let joined = tokio::select! {
                joined = units.join_next() => joined,
                () = cancel.cancelled(), if !stopping => {
                    stopping = true;
                    semaphore.close();
                    info!("🛑 Stop requested: waiting for {} active units", self.gauge.current());
                    continue;
                }
            };
            let Some(joined) = joined else { break };

            let (client, report) = match joined {
                Ok((client, UnitRun::Ran(report))) => (client, report),
                Ok((client, UnitRun::Abandoned)) => {
                    debug!("Client {} left for a later run", client.id);
                    left_behind += 1;
                    continue;
                }
                Err(join_error) => {
                    error!("Collection unit crashed: {}", join_error);
                    stats.record_error().await;
                    if let Some(notifier) = &self.notifier {
                        notifier.notify_error(run_id, None, &join_error.to_string()).await;
                    }
                    continue;
                }
            };

            // Phones a unit stored count even when it did not finish.
            stats.merge_unit(&report.tally).await;
            match report.result {
                Ok(UnitOutcome::Finished) => {
                    processed.mark(client.id).await;
                    completed += 1;
                    debug!("Client {} collected: {} phones", client.id, report.tally.phones);
                }
                Ok(UnitOutcome::Cancelled) => {
                    debug!("Client {} interrupted; left for a later run", client.id);
                    left_behind += 1;
                    continue;
                }
                Err(e) => {
                    warn!("Client {} failed: {:#}", client.id, e);
                    stats.record_error().await;
                    if let Some(notifier) = &self.notifier {
                        notifier.notify_error(run_id, Some(client.id), &format!("{e:#}")).await;
                    }
                    continue;
                }
            }

            let progress = CollectionProgress {
                run_id,
                processed: processed.len().await,
                total: clients_in_scope,
                stats: stats.snapshot().await,
                active_workers: Some(self.gauge.current()),
            };
            if let Some(observer) = &self.progress {
                observer.on_progress(&progress);
            }
            if self.policy.is_checkpoint_due(completed) {
                let snapshot = RunSnapshot {
                    run_id,
                    stats: progress.stats,
                    processed: processed.snapshot().await,
                    clients_in_scope,
                };
                lifecycle::save_checkpoint(&self.checkpoints, &snapshot).await;
            }
            if self.policy.is_notification_due(completed) {
                if let Some(notifier) = &self.notifier {
                    notifier.notify_progress(&progress).await;
                }
            }
        }

        let status = if stopping && left_behind > 0 {
            info!("🛑 Run {} stopped on request; {} clients left for a later run", run_id, left_behind);
            RunStatus::Stopped
        } else {
            if stopping {
                info!("Stop for run {} arrived after every client had started", run_id);
            }
            RunStatus::Completed
        };

        let snapshot = RunSnapshot {
            run_id,
            stats: stats.snapshot().await,
            processed: processed.snapshot().await,
            clients_in_scope,
        };
        lifecycle::conclude(store.as_ref(), &self.checkpoints, &snapshot, status).await;
        let outcome = snapshot.into_outcome(status, resumed, started);

        if let Some(notifier) = &self.notifier {
            notifier.notify_finish(&RunSummary::from(&outcome)).await;
        }
        Ok(outcome)
    }

    fn spawn_unit(
        &self,
        client: Client,
        run_id: i64,
        options: &CollectOptions,
        semaphore: &Arc<Semaphore>,
        cancel: &CancellationToken,
    ) -> impl Future<Output = (Client, UnitRun)> + Send + 'static {
        let source = Arc::clone(&self.source);
        let stores = Arc::clone(&self.stores);
        let rate_limiter = Arc::clone(&self.rate_limiter);
        let gauge = self.gauge.clone();
        let semaphore = Arc::clone(semaphore);
        let cancel = cancel.clone();
        let limit_projects = options.limit_projects;
        let max_pages = options.max_pages;

        async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return (client, UnitRun::Abandoned);
            };
            if cancel.is_cancelled() {
                return (client, UnitRun::Abandoned);
            }
            let _active = gauge.enter();

            let store = match stores.open_handle().await.context("Failed to open store handle") {
                Ok(store) => store,
                Err(e) => {
                    return (
                        client,
                        UnitRun::Ran(UnitReport {
                            tally: UnitTally::default(),
                            result: Err(e),
                        }),
                    );
                }
            };
            let ctx = UnitContext {
                source: source.as_ref(),
                store: store.as_ref(),
                rate_limiter: &rate_limiter,
                normalizer: PhoneNormalizer::new(),
                run_id,
                limit_projects,
                max_pages,
                cancel: None,
            };
            let report = traversal::collect_client(&ctx, &client).await;

            (client, UnitRun::Ran(report))
        }
    }
}
