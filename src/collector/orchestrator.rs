//! # Sequential Collection Orchestrator
//!
//! Walks every in-scope client on a single task. Cancellation is observed
//! between clients, projects and pages; a client interrupted mid-way is not
//! marked processed and is collected again on resume. Phones it stored before
//! the interruption stay counted in the run stats.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::collector::checkpoint::CheckpointStore;
use crate::collector::lifecycle::{self, RunSnapshot};
use crate::collector::normalizer::PhoneNormalizer;
use crate::collector::observers::{CollectionProgress, Notifier, ProgressObserver, RunSummary};
use crate::collector::rate_limiter::RateLimiter;
use crate::collector::traversal::{self, UnitContext, UnitOutcome};
use crate::collector::{CollectOptions, CollectionError, CollectionOutcome, CollectionPolicy};
use crate::domain::{Client, CollectionStore, PhoneSource, RunStatus};

pub struct CollectionOrchestrator {
    source: Arc<dyn PhoneSource>,
    store: Arc<dyn CollectionStore>,
    checkpoints: CheckpointStore,
    rate_limiter: Arc<RateLimiter>,
    normalizer: PhoneNormalizer,
    policy: CollectionPolicy,
    progress: Option<Arc<dyn ProgressObserver>>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl CollectionOrchestrator {
    pub fn new(
        source: Arc<dyn PhoneSource>,
        store: Arc<dyn CollectionStore>,
        checkpoints: CheckpointStore,
        rate_limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            source,
            store,
            checkpoints,
            rate_limiter,
            normalizer: PhoneNormalizer::new(),
            policy: CollectionPolicy::sequential(),
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

    /// Runs one collection invocation.
    ///
    /// Per-client failures are counted and skipped. Only failing to start a
    /// run or to list clients is fatal; the latter still records the run as
    /// failed and leaves a checkpoint behind.
    pub async fn collect(
        &self,
        options: &CollectOptions,
        cancel: &CancellationToken,
    ) -> Result<CollectionOutcome, CollectionError> {
        let started = Instant::now();
        let start = lifecycle::begin_run(self.store.as_ref(), &self.checkpoints, options.resume).await?;
        let run_id = start.run_id;
        let resumed = start.resumed;
        let mut stats = start.stats;
        let mut processed = start.processed;

        self.rate_limiter.wait().await;
        let clients = match self.source.list_clients().await {
            Ok(clients) => lifecycle::scope_clients(clients, options.limit_clients),
            Err(e) => {
                error!("❌ Run {} failed to list clients: {:#}", run_id, e);
                let snapshot = RunSnapshot {
                    run_id,
                    stats,
                    processed,
                    clients_in_scope: 0,
                };
                lifecycle::conclude(self.store.as_ref(), &self.checkpoints, &snapshot, RunStatus::Failed).await;
                let outcome = snapshot.into_outcome(RunStatus::Failed, resumed, started);
                if let Some(notifier) = &self.notifier {
                    notifier.notify_error(run_id, None, &format!("{e:#}")).await;
                    notifier.notify_finish(&RunSummary::from(&outcome)).await;
                }
                return Err(CollectionError::ClientListing(e));
            }
        };

        let clients_in_scope = clients.len();
        let pending: Vec<Client> = clients
            .into_iter()
            .filter(|client| !processed.contains(&client.id))
            .collect();
        info!(
            "📋 Run {}: {} clients in scope, {} pending",
            run_id,
            clients_in_scope,
            pending.len()
        );
        if let Some(notifier) = &self.notifier {
            notifier.notify_start(run_id, clients_in_scope).await;
        }

        let ctx = UnitContext {
            source: self.source.as_ref(),
            store: self.store.as_ref(),
            rate_limiter: &self.rate_limiter,
            normalizer: self.normalizer,
            run_id,
            limit_projects: options.limit_projects,
            max_pages: options.max_pages,
            cancel: Some(cancel),
        };

        let mut status = RunStatus::Completed;
        for (index, client) in pending.iter().enumerate() {
            if cancel.is_cancelled() {
                status = RunStatus::Stopped;
                break;
            }

            let report = traversal::collect_client(&ctx, client).await;
            // Rows already written count even when the client is unfinished.
            stats.merge_unit(&report.tally);
            match report.result {
                Ok(UnitOutcome::Finished) => {
                    processed.insert(client.id);
                }
                Ok(UnitOutcome::Cancelled) => {
                    info!("⏸️ Client {} interrupted; it will be collected again on resume", client.id);
                    status = RunStatus::Stopped;
                    break;
                }
                Err(e) => {
                    warn!("Client {} failed: {:#}", client.id, e);
                    stats.record_error();
                    if let Some(notifier) = &self.notifier {
                        notifier.notify_error(run_id, Some(client.id), &format!("{e:#}")).await;
                    }
                }
            }

            let progress = CollectionProgress {
                run_id,
                processed: processed.len(),
                total: clients_in_scope,
                stats,
                active_workers: None,
            };
            if let Some(observer) = &self.progress {
                observer.on_progress(&progress);
            }

            let attempted = index + 1;
            if self.policy.is_checkpoint_due(attempted) {
                let snapshot = RunSnapshot {
                    run_id,
                    stats,
                    processed: processed.clone(),
                    clients_in_scope,
                };
                lifecycle::save_checkpoint(&self.checkpoints, &snapshot).await;
            }
            if self.policy.is_notification_due(attempted) {
                if let Some(notifier) = &self.notifier {
                    notifier.notify_progress(&progress).await;
                }
            }
        }

        if status == RunStatus::Stopped {
            info!("🛑 Run {} stopped on request", run_id);
        }

        let snapshot = RunSnapshot {
            run_id,
            stats,
            processed,
            clients_in_scope,
        };
        lifecycle::conclude(self.store.as_ref(), &self.checkpoints, &snapshot, status).await;
        let outcome = snapshot.into_outcome(status, resumed, started);

        if let Some(notifier) = &self.notifier {
            notifier.notify_finish(&RunSummary::from(&outcome)).await;
        }
        Ok(outcome)
    }
}
