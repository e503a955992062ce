//! Progress and notification hooks.
//!
//! Observers are called from whichever task finished the unit, so they must
//! be `Send + Sync`. A notifier failing never affects the run; implementations
//! log and swallow their own errors.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{error, info};

use crate::domain::{RunStats, RunStatus};

/// Snapshot handed to progress observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionProgress {
    pub run_id: i64,
    /// Clients processed so far in this run, resumed ones included
    pub processed: usize,
    pub total: usize,
    pub stats: RunStats,
    /// Only reported by the worker pool
    pub active_workers: Option<usize>,
}

impl CollectionProgress {
    #[must_use]
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let ratio = self.processed as f64 / self.total as f64;
        ratio * 100.0
    }
}

/// Final report of a run, handed to `Notifier::notify_finish`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: i64,
    pub status: RunStatus,
    pub stats: RunStats,
    pub clients_processed: usize,
    pub clients_in_scope: usize,
    pub elapsed: Duration,
}

pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, progress: &CollectionProgress);
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_start(&self, run_id: i64, clients_in_scope: usize);
    async fn notify_progress(&self, progress: &CollectionProgress);
    async fn notify_error(&self, run_id: i64, client_id: Option<i64>, message: &str);
    async fn notify_finish(&self, summary: &RunSummary);
}

/// Writes progress to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingProgressObserver;

impl ProgressObserver for LoggingProgressObserver {
    fn on_progress(&self, progress: &CollectionProgress) {
        match progress.active_workers {
            Some(active) => info!(
                "📈 Run {}: {}/{} clients ({:.1}%), {} phones, {} new, {} errors, {} active workers",
                progress.run_id,
                progress.processed,
                progress.total,
                progress.percent(),
                progress.stats.total_phone_observations,
                progress.stats.new_phones,
                progress.stats.error_count,
                active
            ),
            None => info!(
                "📈 Run {}: {}/{} clients ({:.1}%), {} phones, {} new, {} errors",
                progress.run_id,
                progress.processed,
                progress.total,
                progress.percent(),
                progress.stats.total_phone_observations,
                progress.stats.new_phones,
                progress.stats.error_count
            ),
        }
    }
}

/// Notifier that only logs. Stands in wherever no chat integration is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn notify_start(&self, run_id: i64, clients_in_scope: usize) {
        info!("🚀 Collection run {} started: {} clients in scope", run_id, clients_in_scope);
    }

    async fn notify_progress(&self, progress: &CollectionProgress) {
        info!(
            "📊 Run {} checkpoint: {}/{} clients, {} new phones",
            progress.run_id, progress.processed, progress.total, progress.stats.new_phones
        );
    }

    async fn notify_error(&self, run_id: i64, client_id: Option<i64>, message: &str) {
        match client_id {
            Some(client_id) => error!("❌ Run {} client {} failed: {}", run_id, client_id, message),
            None => error!("❌ Run {} failed: {}", run_id, message),
        }
    }

    async fn notify_finish(&self, summary: &RunSummary) {
        info!(
            "🏁 Run {} {} in {:.1}s: {}/{} clients, {} phones, {} new, {} projects, {} errors",
            summary.run_id,
            summary.status,
            summary.elapsed.as_secs_f64(),
            summary.clients_processed,
            summary.clients_in_scope,
            summary.stats.total_phone_observations,
            summary.stats.new_phones,
            summary.stats.projects_count,
            summary.stats.error_count
        );
    }
}
