//! # Collection Orchestration Module
//!
//! The resumable, rate-limited traversal engine that pulls
//! clients → projects → phone pages from a [`PhoneSource`] into a
//! [`CollectionStore`].
//!
//! - `orchestrator`: single-task traversal
//! - `parallel_orchestrator`: client-level units over a bounded worker pool
//! - `checkpoint`: durable progress record for `--continue`
//! - `rate_limiter`: one global request cadence for every worker
//! - `normalizer`: raw phone text → canonical E.164
//!
//! [`PhoneSource`]: crate::domain::PhoneSource
//! [`CollectionStore`]: crate::domain::CollectionStore

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{RunStats, RunStatus};

// 명시적 모듈 선언 (mod.rs 비사용)
pub mod checkpoint;
pub mod normalizer;
pub mod observers;
pub mod orchestrator;
pub mod parallel_orchestrator;
pub mod rate_limiter;
pub mod stats;

mod lifecycle;
mod traversal;

pub use checkpoint::{CheckpointStore, CollectionCheckpoint};
pub use normalizer::PhoneNormalizer;
pub use observers::{
    CollectionProgress, LoggingNotifier, LoggingProgressObserver, Notifier, ProgressObserver,
    RunSummary,
};
pub use orchestrator::CollectionOrchestrator;
pub use parallel_orchestrator::ParallelOrchestrator;
pub use rate_limiter::RateLimiter;
pub use stats::{ActiveWorkerGauge, ProcessedClients, SharedRunStats};

/// Per-invocation limits and mode of a `collect` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectOptions {
    /// Only the first N clients returned by the source are in scope
    pub limit_clients: Option<usize>,

    /// Only the first N projects of each client are visited
    pub limit_projects: Option<usize>,

    /// Highest phone page fetched per project
    pub max_pages: Option<u32>,

    /// Continue the run recorded in the checkpoint, if any
    pub resume: bool,
}

/// Checkpoint and notification cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionPolicy {
    /// Persist a checkpoint every N clients
    pub checkpoint_interval: usize,

    /// Send a progress notification every N completed clients
    pub notify_interval: usize,
}

impl CollectionPolicy {
    /// Defaults for the single-task traversal.
    #[must_use]
    pub const fn sequential() -> Self {
        Self {
            checkpoint_interval: 5,
            notify_interval: 50,
        }
    }

    /// Defaults for the worker pool; completion order is not submission order,
    /// so checkpoints are coarser.
    #[must_use]
    pub const fn parallel() -> Self {
        Self {
            checkpoint_interval: 10,
            notify_interval: 50,
        }
    }

    pub(crate) const fn is_checkpoint_due(&self, count: usize) -> bool {
        self.checkpoint_interval > 0 && count > 0 && count % self.checkpoint_interval == 0
    }

    pub(crate) const fn is_notification_due(&self, count: usize) -> bool {
        self.notify_interval > 0 && count > 0 && count % self.notify_interval == 0
    }
}

impl Default for CollectionPolicy {
    fn default() -> Self {
        Self::sequential()
    }
}

/// What a `collect` invocation returns when it did not fail fatally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionOutcome {
    pub run_id: i64,
    pub status: RunStatus,
    pub stats: RunStats,
    pub processed_client_ids: BTreeSet<i64>,
    pub clients_in_scope: usize,
    pub resumed: bool,
    pub elapsed: Duration,
}

impl CollectionOutcome {
    #[must_use]
    pub fn clients_processed(&self) -> usize {
        self.processed_client_ids.len()
    }
}

/// Fatal collection errors. Everything else is isolated per client.
#[derive(Error, Debug)]
pub enum CollectionError {
    #[error("Failed to create collection run: {0:#}")]
    RunLifecycle(#[source] anyhow::Error),

    #[error("Failed to list clients: {0:#}")]
    ClientListing(#[source] anyhow::Error),
}
