//! Shared run state for the worker pool.
//!
//! Statistics and the processed-client set live behind two separate locks;
//! neither critical section ever waits on the other.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Mutex;

use crate::domain::{RunStats, UnitTally};

/// Run statistics updated from any task.
#[derive(Debug, Default)]
pub struct SharedRunStats {
    inner: Mutex<RunStats>,
}

impl SharedRunStats {
    #[must_use]
    pub fn new(initial: RunStats) -> Self {
        Self {
            inner: Mutex::new(initial),
        }
    }

    pub async fn merge_unit(&self, tally: &UnitTally) {
        self.inner.lock().await.merge_unit(tally);
    }

    pub async fn record_error(&self) {
        self.inner.lock().await.record_error();
    }

    pub async fn snapshot(&self) -> RunStats {
        *self.inner.lock().await
    }
}

/// Set of client ids whose unit of work completed.
#[derive(Debug, Default)]
pub struct ProcessedClients {
    inner: Mutex<HashSet<i64>>,
}

impl ProcessedClients {
    pub fn new(initial: impl IntoIterator<Item = i64>) -> Self {
        Self {
            inner: Mutex::new(initial.into_iter().collect()),
        }
    }

    /// Marks a client processed and returns the new set size.
    pub async fn mark(&self, client_id: i64) -> usize {
        let mut processed = self.inner.lock().await;
        processed.insert(client_id);
        processed.len()
    }

    pub async fn contains(&self, client_id: i64) -> bool {
        self.inner.lock().await.contains(&client_id)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    pub async fn snapshot(&self) -> BTreeSet<i64> {
        self.inner.lock().await.iter().copied().collect()
    }
}

/// Number of units currently holding a worker slot.
#[derive(Debug, Clone, Default)]
pub struct ActiveWorkerGauge {
    active: Arc<AtomicUsize>,
}

impl ActiveWorkerGauge {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts the caller as active until the returned guard drops.
    #[must_use]
    pub fn enter(&self) -> ActiveWorkerGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        ActiveWorkerGuard {
            active: Arc::clone(&self.active),
        }
    }

    #[must_use]
    pub fn current(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct ActiveWorkerGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for ActiveWorkerGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}
