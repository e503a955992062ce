//! Run start, checkpoint and conclusion steps shared by both orchestrators.

use std::collections::BTreeSet;
use std::time::Instant;

use tracing::{error, info, warn};

use crate::collector::checkpoint::{CheckpointStore, CollectionCheckpoint};
use crate::collector::observers::RunSummary;
use crate::collector::{CollectionError, CollectionOutcome};
use crate::domain::{Client, CollectionStore, RunStats, RunStatus};

/// Where a run begins: fresh, or from a checkpoint.
#[derive(Debug, Clone)]
pub(crate) struct RunStart {
    pub run_id: i64,
    pub stats: RunStats,
    pub processed: BTreeSet<i64>,
    pub resumed: bool,
}

/// Progress of a run at some instant.
#[derive(Debug, Clone)]
pub(crate) struct RunSnapshot {
    pub run_id: i64,
    pub stats: RunStats,
    pub processed: BTreeSet<i64>,
    pub clients_in_scope: usize,
}

impl RunSnapshot {
    pub fn into_outcome(self, status: RunStatus, resumed: bool, started: Instant) -> CollectionOutcome {
        CollectionOutcome {
            run_id: self.run_id,
            status,
            stats: self.stats,
            processed_client_ids: self.processed,
            clients_in_scope: self.clients_in_scope,
            resumed,
            elapsed: started.elapsed(),
        }
    }

    fn to_checkpoint(&self) -> CollectionCheckpoint {
        CollectionCheckpoint::new(
            self.run_id,
            self.clients_in_scope,
            self.processed.iter().copied(),
            self.stats,
        )
    }
}

/// Adopts the checkpointed run when resuming is requested and possible,
/// otherwise creates a new run.
pub(crate) async fn begin_run(
    store: &dyn CollectionStore,
    checkpoints: &CheckpointStore,
    resume: bool,
) -> Result<RunStart, CollectionError> {
    if resume {
        match checkpoints.load().await {
            Some(checkpoint) => match store.resume_run(checkpoint.run_id).await {
                Ok(true) => {
                    info!(
                        "🔄 Resuming run {}: {} clients already processed",
                        checkpoint.run_id, checkpoint.processed_clients
                    );
                    return Ok(RunStart {
                        run_id: checkpoint.run_id,
                        stats: checkpoint.stats,
                        processed: checkpoint.processed_client_ids,
                        resumed: true,
                    });
                }
                Ok(false) => warn!(
                    "Checkpointed run {} cannot be resumed; starting a new run",
                    checkpoint.run_id
                ),
                Err(e) => warn!(
                    "Failed to reopen run {}: {:#}; starting a new run",
                    checkpoint.run_id, e
                ),
            },
            None => warn!("Resume requested but no checkpoint found; starting a new run"),
        }
    }

    let run_id = store.create_run().await.map_err(CollectionError::RunLifecycle)?;
    info!("🆕 Started collection run {}", run_id);
    Ok(RunStart {
        run_id,
        stats: RunStats::default(),
        processed: BTreeSet::new(),
        resumed: false,
    })
}

/// Periodic checkpoint. Failures are logged; the run goes on.
pub(crate) async fn save_checkpoint(checkpoints: &CheckpointStore, snapshot: &RunSnapshot) {
    if let Err(e) = checkpoints.save(&snapshot.to_checkpoint()).await {
        error!("Failed to save checkpoint for run {}: {:#}", snapshot.run_id, e);
    }
}

/// Records the terminal status. Completed runs drop their checkpoint;
/// stopped and failed runs keep one so `--continue` can pick them up.
pub(crate) async fn conclude(
    store: &dyn CollectionStore,
    checkpoints: &CheckpointStore,
    snapshot: &RunSnapshot,
    status: RunStatus,
) {
    if status != RunStatus::Completed {
        save_checkpoint(checkpoints, snapshot).await;
    }

    if let Err(e) = store.update_run_status(snapshot.run_id, &snapshot.stats, status).await {
        error!("Failed to mark run {} as {}: {:#}", snapshot.run_id, status, e);
        if status == RunStatus::Completed {
            // Run row still says running; keep the resume point.
            save_checkpoint(checkpoints, snapshot).await;
        }
        return;
    }

    if status == RunStatus::Completed {
        if let Err(e) = checkpoints.clear().await {
            warn!("Failed to clear checkpoint after run {}: {:#}", snapshot.run_id, e);
        }
    }
}

/// Applies `--limit-clients`. The scope is the first N clients in source order.
pub(crate) fn scope_clients(mut clients: Vec<Client>, limit: Option<usize>) -> Vec<Client> {
    if let Some(limit) = limit {
        clients.truncate(limit);
    }
    clients
}

impl From<&CollectionOutcome> for RunSummary {
    fn from(outcome: &CollectionOutcome) -> Self {
        Self {
            run_id: outcome.run_id,
            status: outcome.status,
            stats: outcome.stats,
            clients_processed: outcome.clients_processed(),
            clients_in_scope: outcome.clients_in_scope,
            elapsed: outcome.elapsed,
        }
    }
}
